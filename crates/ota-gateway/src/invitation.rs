//! UDP invitation handshake.
//!
//! Tells the device which image is coming, which TCP port to fetch it from,
//! how long it is and its MD5, then waits for an `OK`. Lost datagrams and
//! missed replies are retried; an explicit refusal is not.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use md5::{Digest, Md5};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandKind;
use crate::config::InviteConfig;
use crate::progress::ProgressSender;
use crate::protocol::{self, INVITE_RESPONSE_LEN};
use crate::retry::{RetryDecision, Retryable};

/// The announcement sent to the device. Built once per session so every
/// retry carries a byte-identical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    command: CommandKind,
    port: u16,
    length: usize,
    md5_hex: String,
}

impl Invitation {
    pub fn new(command: CommandKind, port: u16, payload: &[u8]) -> Self {
        Self {
            command,
            port,
            length: payload.len(),
            md5_hex: hex::encode(Md5::digest(payload)),
        }
    }

    pub fn command(&self) -> CommandKind {
        self.command
    }

    /// TCP port the device should connect back to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn md5_hex(&self) -> &str {
        &self.md5_hex
    }

    /// `<cmd> <port> <length> <md5>\n`
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.command.code(),
            self.port,
            self.length,
            self.md5_hex
        )
    }
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("invalid invitation response: {}", protocol::describe_response(.0))]
    Rejected(Vec<u8>),
    #[error("invitation failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<InviteError>,
    },
    /// The session was claimed by a device or ended while inviting.
    #[error("invitation stopped")]
    Stopped,
}

impl Retryable for InviteError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

/// Run the handshake with retries. Each failed attempt is reported on
/// `progress` as `try N/M: <error>`. Returns the number of attempts used.
///
/// Once `stop` is cancelled nothing more is sent or reported and the call
/// returns [`InviteError::Stopped`].
pub async fn send_invitation(
    config: &InviteConfig,
    device: IpAddr,
    invitation: &Invitation,
    progress: &ProgressSender,
    stop: &CancellationToken,
) -> Result<u32, InviteError> {
    let max = config.retry.max_attempts;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(InviteError::Stopped),
            r = invite_once(config, device, invitation) => r,
        };
        let err = match result {
            Ok(()) => {
                info!(
                    "Invitation for {} accepted by {} (attempt {})",
                    invitation.command(),
                    device,
                    attempt
                );
                return Ok(attempt);
            }
            Err(e) => e,
        };

        match config.retry.decide(attempt, &err) {
            RetryDecision::Fatal => {
                warn!("Invitation to {} refused: {}", device, err);
                return Err(err);
            }
            RetryDecision::GiveUp => {
                report(progress, stop, format!("try {}/{}: {}", attempt, max, err)).await?;
                warn!("Invitation to {} failed after {} attempts", device, attempt);
                return Err(InviteError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            RetryDecision::Retry { after } => {
                report(progress, stop, format!("try {}/{}: {}", attempt, max, err)).await?;
                debug!("Invitation to {} attempt {} failed: {}", device, attempt, err);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Err(InviteError::Stopped),
                    _ = tokio::time::sleep(after) => {}
                }
            }
        }
    }
}

async fn report(
    progress: &ProgressSender,
    stop: &CancellationToken,
    line: String,
) -> Result<(), InviteError> {
    if stop.is_cancelled() {
        return Err(InviteError::Stopped);
    }
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(InviteError::Stopped),
        _ = progress.emit(line) => Ok(()),
    }
}

/// One send/receive exchange.
pub async fn invite_once(
    config: &InviteConfig,
    device: IpAddr,
    invitation: &Invitation,
) -> Result<(), InviteError> {
    let socket = bind_socket(config.bind_ip, invitation.port(), device)?;
    socket.connect((device, config.device_port)).await?;
    socket.send(invitation.encode().as_bytes()).await?;

    let mut buf = [0u8; INVITE_RESPONSE_LEN];
    let n = tokio::time::timeout(config.response_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| InviteError::Timeout(config.response_timeout))??;

    if protocol::is_ok(&buf[..n]) {
        Ok(())
    } else {
        Err(InviteError::Rejected(buf[..n].to_vec()))
    }
}

fn bind_socket(bind_ip: Option<IpAddr>, port: u16, device: IpAddr) -> io::Result<UdpSocket> {
    let local = match bind_ip {
        Some(ip) => SocketAddr::new(ip, port),
        None if device.is_ipv4() => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        None => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };

    let sock = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    // Retries rebind the same port right after the previous socket closed.
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&local.into())?;
    let std_sock: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_sock)
}
