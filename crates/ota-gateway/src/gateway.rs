//! Upload orchestration.
//!
//! One upload may carry a firmware image, a filesystem image, or both. Each
//! image becomes its own session: register, arm the expiry watchdog, send the
//! invitation, then wait for the transfer listener to finish the push. The
//! per-session progress is forwarded into a single sequence for the caller.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::command::CommandKind;
use crate::config::GatewayConfig;
use crate::expiry::spawn_expiry;
use crate::invitation::{InviteError, Invitation, send_invitation};
use crate::progress::{self, Outcome, Progress, ProgressReceiver, ProgressSender};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionState};
use crate::transfer::TransferListener;

/// Images to push to one device.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub device: IpAddr,
    pub firmware: Option<Bytes>,
    pub spiffs: Option<Bytes>,
}

impl UploadRequest {
    /// Sessions to run, firmware first.
    fn stages(&self) -> Vec<(CommandKind, Bytes)> {
        CommandKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let payload = match kind {
                    CommandKind::Flash => self.firmware.clone(),
                    CommandKind::SpiFs => self.spiffs.clone(),
                };
                payload.map(|p| (kind, p))
            })
            .collect()
    }
}

/// Shared handle to the running gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    registry: SessionRegistry,
    config: GatewayConfig,
    firmware_port: u16,
    spiffs_port: u16,
}

impl Gateway {
    /// Start serving device connections on the two transfer listeners.
    pub fn start(
        config: GatewayConfig,
        firmware: TcpListener,
        spiffs: TcpListener,
    ) -> io::Result<Self> {
        let firmware_port = firmware.local_addr()?.port();
        let spiffs_port = spiffs.local_addr()?.port();
        let registry = SessionRegistry::new();

        tokio::spawn(
            TransferListener::new(CommandKind::Flash, registry.clone(), config.io_timeout)
                .run(firmware),
        );
        tokio::spawn(
            TransferListener::new(CommandKind::SpiFs, registry.clone(), config.io_timeout)
                .run(spiffs),
        );

        info!(
            "Transfer listeners: firmware on {}, spiffs on {}",
            firmware_port, spiffs_port
        );

        Ok(Self {
            inner: Arc::new(GatewayInner {
                registry,
                config,
                firmware_port,
                spiffs_port,
            }),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// TCP port advertised to the device for `command`.
    pub fn port_for(&self, command: CommandKind) -> u16 {
        match command {
            CommandKind::Flash => self.inner.firmware_port,
            CommandKind::SpiFs => self.inner.spiffs_port,
        }
    }

    /// Push every image in `request` to the device, one session after the
    /// other. The returned sequence ends with `Completed` only if every
    /// session completed.
    pub fn start_upload(&self, request: UploadRequest) -> ProgressReceiver {
        let (tx, rx) = progress::channel();
        let gateway = self.clone();
        tokio::spawn(async move {
            let outcome = gateway.run_upload(request, &tx).await;
            tx.finish(outcome).await;
        });
        rx
    }

    /// Register one session and start inviting its device. The returned
    /// sequence is the session's own progress.
    pub async fn start_session(
        &self,
        device: IpAddr,
        command: CommandKind,
        payload: Bytes,
    ) -> ProgressReceiver {
        let registry = &self.inner.registry;
        let (session, rx) = registry.register(device, payload, command).await;
        session.begin_invitation();
        info!(
            "Session {} registered: {} image of {} bytes for {}",
            session.id(),
            command,
            session.payload().len(),
            device
        );

        spawn_expiry(registry.clone(), session.clone(), self.inner.config.session_expiry);

        let gateway = self.clone();
        tokio::spawn(async move { gateway.invite(session).await });

        rx
    }

    async fn run_upload(&self, request: UploadRequest, out: &ProgressSender) -> Outcome {
        let stages = request.stages();
        if stages.is_empty() {
            return Outcome::Failed("nothing to upload".into());
        }

        for (command, payload) in stages {
            let mut stage = self.start_session(request.device, command, payload).await;

            let outcome = loop {
                match stage.recv().await {
                    Some(Progress::Status(line)) => {
                        out.emit(line).await;
                    }
                    Some(Progress::Finished(outcome)) => break outcome,
                    None => break Outcome::Expired,
                }
            };

            if !outcome.is_completed() {
                warn!(
                    "{} upload to {} ended without completing: {}",
                    command, request.device, outcome
                );
                return outcome;
            }
        }

        out.emit("Thanks for using the OTA-Gateway").await;
        Outcome::Completed
    }

    async fn invite(&self, session: Arc<Session>) {
        let command = session.command();
        session.emit(format!("Sending {} Invite", command)).await;

        // A device connecting back proves it took the invitation, and a
        // session that ended needs no more of them.
        let stop = session.cancel_token().child_token();
        let claimed = {
            let session = session.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = session.device_claimed() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            })
        };

        let invitation = Invitation::new(command, self.port_for(command), session.payload());
        let result = send_invitation(
            &self.inner.config.invite,
            session.address(),
            &invitation,
            session.progress(),
            &stop,
        )
        .await;
        session.end_invitation();
        stop.cancel();
        let _ = claimed.await;

        match result {
            Ok(attempts) => {
                // No-op if the device already connected back.
                session.advance(SessionState::Invited);
                debug!(
                    "Session {} invited after {} attempt(s)",
                    session.id(),
                    attempts
                );
            }
            Err(InviteError::Stopped) => {
                debug!(
                    "Session {} stopped inviting ({:?})",
                    session.id(),
                    session.state()
                );
            }
            Err(e) => {
                // A device that connected anyway owns the outcome now.
                self.inner
                    .registry
                    .conclude_unclaimed(&session, Outcome::Failed(e.to_string()))
                    .await;
            }
        }
    }
}
