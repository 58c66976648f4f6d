//! TCP transfer listener.
//!
//! A bare TCP listener per image kind. The device connects back after
//! accepting an invitation; the peer IP selects the session, and the image
//! is pushed in 1024-byte chunks, each one acknowledged before the next is
//! written. No retries at this layer: any I/O error, timeout or non-`OK`
//! reply fails the session and the uploader has to start over.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::CommandKind;
use crate::progress::{Outcome, ProgressSender};
use crate::protocol::{self, CHUNK_ACK_LEN, CHUNK_SIZE, FINAL_ACK_LEN};
use crate::registry::SessionRegistry;
use crate::session::SessionState;

/// Which acknowledgment an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 1-based chunk number.
    Chunk(usize),
    Final,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk(n) => write!(f, "chunk {}", n),
            Self::Final => write!(f, "final confirmation"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("error writing {stage}: {source}")]
    Write { stage: Stage, source: io::Error },
    #[error("error reading acknowledgment for {stage}: {source}")]
    Read { stage: Stage, source: io::Error },
    #[error("device closed the connection before acknowledging {stage}")]
    Closed { stage: Stage },
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
    #[error("session ended before {stage}")]
    Cancelled { stage: Stage },
    #[error("Error Uploading: device rejected {stage}: {}", protocol::describe_response(.raw))]
    Rejected { stage: Stage, raw: Vec<u8> },
}

/// Summary of a completed push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub chunks: usize,
    pub bytes: usize,
}

/// Push `payload` over `stream` chunk by chunk, then wait for the final
/// confirmation. `on_ack` is called with the chunk number after each chunk
/// acknowledgment. Progress is reported at every 10% of the image. Nothing
/// is written once `cancel` fires.
pub async fn push_payload<S>(
    stream: &mut S,
    payload: &[u8],
    io_timeout: Duration,
    progress: &ProgressSender,
    cancel: &CancellationToken,
    mut on_ack: impl FnMut(usize),
) -> Result<TransferReport, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total = payload.len();
    let mut sent = 0;
    let mut chunks = 0;
    let mut reported_decile = 0;

    for chunk in payload.chunks(CHUNK_SIZE) {
        chunks += 1;
        let stage = Stage::Chunk(chunks);
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled { stage });
        }

        let write = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled { stage }),
            r = tokio::time::timeout(io_timeout, write_chunk(stream, chunk)) => r,
        };
        match write {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(TransferError::Write { stage, source }),
            Err(_) => {
                return Err(TransferError::Timeout {
                    stage,
                    after: io_timeout,
                });
            }
        }

        read_ack(stream, CHUNK_ACK_LEN, io_timeout, cancel, stage).await?;
        sent += chunk.len();
        on_ack(chunks);

        let decile = sent * 10 / total;
        if decile > reported_decile {
            reported_decile = decile;
            progress
                .emit(format!("sent {}/{} bytes ({}%)", sent, total, decile * 10))
                .await;
        }
    }

    read_ack(stream, FINAL_ACK_LEN, io_timeout, cancel, Stage::Final).await?;

    Ok(TransferReport {
        chunks,
        bytes: sent,
    })
}

async fn write_chunk<S: AsyncWrite + Unpin>(stream: &mut S, chunk: &[u8]) -> io::Result<()> {
    stream.write_all(chunk).await?;
    stream.flush().await
}

/// Single read of at most `max` bytes, which must start with `OK`.
async fn read_ack<S: AsyncRead + Unpin>(
    stream: &mut S,
    max: usize,
    io_timeout: Duration,
    cancel: &CancellationToken,
    stage: Stage,
) -> Result<(), TransferError> {
    let mut buf = [0u8; FINAL_ACK_LEN];
    let read = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled { stage }),
        r = tokio::time::timeout(io_timeout, stream.read(&mut buf[..max])) => r,
    };
    let n = match read {
        Ok(Ok(0)) => return Err(TransferError::Closed { stage }),
        Ok(Ok(n)) => n,
        Ok(Err(source)) => return Err(TransferError::Read { stage, source }),
        Err(_) => {
            return Err(TransferError::Timeout {
                stage,
                after: io_timeout,
            });
        }
    };

    if protocol::is_ok(&buf[..n]) {
        Ok(())
    } else {
        Err(TransferError::Rejected {
            stage,
            raw: buf[..n].to_vec(),
        })
    }
}

/// Accept loop for one image kind.
#[derive(Clone)]
pub struct TransferListener {
    command: CommandKind,
    registry: SessionRegistry,
    io_timeout: Duration,
}

impl TransferListener {
    pub fn new(command: CommandKind, registry: SessionRegistry, io_timeout: Duration) -> Self {
        Self {
            command,
            registry,
            io_timeout,
        }
    }

    /// Serve device connections. Runs until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("{} listener: connection from {}", self.command, addr);
                    let state = self.clone();
                    tokio::spawn(async move {
                        state.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("{} listener accept error: {}", self.command, e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip().to_canonical();

        let Some(session) = self.registry.lookup(ip).await else {
            debug!("No session for {}, dropping connection", ip);
            return;
        };

        if session.command() != self.command {
            warn!(
                "{} connected to the {} port but its session expects {}, dropping",
                ip,
                self.command,
                session.command()
            );
            return;
        }

        if !session.advance(SessionState::Connected) {
            warn!(
                "Session {} for {} is {:?}, dropping extra connection",
                session.id(),
                ip,
                session.state()
            );
            return;
        }

        if let Err(e) = socket2::SockRef::from(&stream).set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", ip, e);
        }

        // Let the invitation task wind down so its lines come first.
        session.invitation_settled().await;

        info!(
            "{} connected for session {} ({} bytes)",
            ip,
            session.id(),
            session.payload().len()
        );
        session.emit("connection established").await;

        let result = push_payload(
            &mut stream,
            session.payload(),
            self.io_timeout,
            session.progress(),
            session.cancel_token(),
            |_| {
                session.advance(SessionState::Transferring);
            },
        )
        .await;

        let outcome = match result {
            Ok(report) => {
                info!(
                    "Pushed {} bytes in {} chunks to {}",
                    report.bytes, report.chunks, ip
                );
                session.emit("flashing complete").await;
                Outcome::Completed
            }
            Err(e) => {
                warn!("Transfer to {} failed: {}", ip, e);
                Outcome::Failed(e.to_string())
            }
        };

        self.registry.conclude(&session, outcome).await;
    }
}
