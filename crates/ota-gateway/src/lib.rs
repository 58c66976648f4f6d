/// OTA Gateway: two-phase firmware push to embedded devices.
///
/// Provides the protocol core behind the HTTP upload endpoint:
/// - UDP invitation announcing command, port, length and MD5 of the image
/// - TCP push in 1024-byte chunks, each acknowledged with `OK`
/// - Per-device session registry with last-write-wins replacement
/// - Ordered progress relay streamed back to the uploader
/// - Expiry watchdog for devices that never connect back

pub mod command;
pub mod config;
pub mod expiry;
pub mod gateway;
pub mod invitation;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod session;
pub mod transfer;

// Re-export key types for convenience.
pub use command::CommandKind;
pub use config::{GatewayConfig, InviteConfig};
pub use gateway::{Gateway, UploadRequest};
pub use invitation::{InviteError, Invitation, send_invitation};
pub use progress::{Outcome, Progress, ProgressReceiver, ProgressSender};
pub use registry::SessionRegistry;
pub use retry::{RetryDecision, RetryPolicy, Retryable};
pub use session::{Session, SessionState};
pub use transfer::{TransferError, TransferListener, TransferReport, push_payload};
