use std::net::IpAddr;
use std::time::Duration;

use crate::protocol::DEVICE_PORT;
use crate::retry::RetryPolicy;

/// Per-operation deadline for invitation replies and TCP chunk I/O.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a session waits for its device to connect back.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// UDP invitation settings.
#[derive(Debug, Clone)]
pub struct InviteConfig {
    /// Port the device listens on for invitations.
    pub device_port: u16,
    /// Local IP to send invitations from. When set, the socket is bound to
    /// this IP and the advertised TCP port; otherwise to an ephemeral port.
    pub bind_ip: Option<IpAddr>,
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            device_port: DEVICE_PORT,
            bind_ip: None,
            response_timeout: IO_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Protocol timings for the whole gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub invite: InviteConfig,
    /// Deadline for each chunk write and acknowledgment read.
    pub io_timeout: Duration,
    pub session_expiry: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            invite: InviteConfig::default(),
            io_timeout: IO_TIMEOUT,
            session_expiry: SESSION_EXPIRY,
        }
    }
}
