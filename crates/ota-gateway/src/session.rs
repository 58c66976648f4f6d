use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::CommandKind;
use crate::progress::{Outcome, ProgressSender};

/// Lifecycle of one push to one device.
///
/// ```text
/// Idle → Invited → Connected → Transferring → Completed
///   │       │          │            │
///   └───────┴──────────┴────────────┴──→ Failed
///   └───────┴──→ Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, invitation in flight.
    Idle,
    /// Device acknowledged the invitation.
    Invited,
    /// Device opened the TCP connection.
    Connected,
    /// Device acknowledged the first chunk.
    Transferring,
    Completed,
    Failed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// No device connection has been accepted yet.
    pub fn awaiting_device(self) -> bool {
        matches!(self, Self::Idle | Self::Invited)
    }

    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Invited | Connected | Failed | Expired) => true,
            (Invited, Connected | Failed | Expired) => true,
            (Connected, Transferring | Completed | Failed) => true,
            (Transferring, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl From<&Outcome> for SessionState {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Completed => Self::Completed,
            Outcome::Failed(_) => Self::Failed,
            Outcome::Expired => Self::Expired,
        }
    }
}

/// Server-side state of one in-progress push to one device address.
///
/// Shared via `Arc` between the registry, the invitation task, the expiry
/// watchdog and the transfer connection. The payload never changes after
/// registration; the state only moves forward.
pub struct Session {
    id: Uuid,
    address: IpAddr,
    command: CommandKind,
    payload: Bytes,
    created_at: DateTime<Utc>,
    progress: ProgressSender,
    state: watch::Sender<SessionState>,
    inviting: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        address: IpAddr,
        command: CommandKind,
        payload: Bytes,
        progress: ProgressSender,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (inviting, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            address,
            command,
            payload,
            created_at: Utc::now(),
            progress,
            state,
            inviting,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn command(&self) -> CommandKind {
        self.command
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn progress(&self) -> &ProgressSender {
        &self.progress
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cancelled once the session reaches a terminal state.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Atomically move to `next` if the transition is legal from the
    /// current state. Returns whether the state changed.
    pub fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the device has connected or the session has ended.
    pub async fn device_claimed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| !s.awaiting_device()).await;
    }

    pub(crate) fn begin_invitation(&self) {
        self.inviting.send_replace(true);
    }

    pub(crate) fn end_invitation(&self) {
        self.inviting.send_replace(false);
    }

    /// Resolves once no invitation task is running for this session, so
    /// transfer progress never interleaves with invitation progress.
    pub async fn invitation_settled(&self) {
        let mut inviting = self.inviting.subscribe();
        let _ = inviting.wait_for(|running| !*running).await;
    }

    /// Move to `next` only if no device has connected yet.
    pub(crate) fn end_unclaimed(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.awaiting_device() && current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Fail the session only if no device has connected yet.
    pub(crate) fn supersede(&self) -> bool {
        self.end_unclaimed(SessionState::Failed)
    }

    pub async fn emit(&self, line: impl Into<String>) -> bool {
        self.progress.emit(line).await
    }

    /// Release everything tied to a session that has just reached a terminal
    /// state. Expiry closes the queue without an outcome so the reader sees
    /// the session vanish.
    pub(crate) async fn close(&self, outcome: Outcome) {
        self.cancel.cancel();
        match outcome {
            Outcome::Expired => {
                self.progress.close().await;
            }
            outcome => {
                self.progress.finish(outcome).await;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("command", &self.command)
            .field("payload_len", &self.payload.len())
            .field("created_at", &self.created_at)
            .field("state", &self.state())
            .finish()
    }
}
