/**
 * CONTRÔLEUR ESCLAVE - Lien montant vers le maître, commandes descendantes
 *
 * RÔLE :
 * L'esclave pousse sa télémétrie au maître et applique les commandes que le
 * maître lui route.
 *
 * FONCTIONNEMENT :
 * - Un LinkClient + Outbox vers le serveur du maître
 * - MasterInitialized : drapeau levé après la première connexion réussie,
 *   les autres composants l'attendent avant d'utiliser le lien montant
 * - Commande reçue : encodage avec le registre propre de l'esclave (ou l'UID
 *   broadcast), puis file de transfert. Jamais d'écriture série directe
 */

use crate::config::{LinkConf, Topology};
use crate::logging::LogContext;
use crate::registry::NodeRegistry;
use crate::relay::TransferQueue;
use crate::transport::{ConnectionState, EnvelopeHandler, LinkClient, Outbox};
use farm_protocol::{encode_command, CommandEnvelope, Envelope, Uid};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Telemetry batches waiting for the master link.
pub const UPLINK_CAPACITY: usize = 100;

#[derive(Clone)]
pub struct SlaveController {
    uplink: Outbox,
    initialized: watch::Receiver<bool>,
    registry: NodeRegistry,
    broadcast_uid: Uid,
    log: LogContext,
}

impl SlaveController {
    /// Opens the link to the master. The `MasterInitialized` flag flips once
    /// that link first reaches `Connected`.
    pub fn start(topology: &Topology, link: &LinkConf, cancel: CancellationToken, log: LogContext) -> Self {
        let master = &topology.identities.master;
        let client = LinkClient::new(master.endpoint.clone(), link.retry_delay(), cancel, log.clone());
        let uplink = Outbox::spawn(client.clone(), UPLINK_CAPACITY);

        let (flag, initialized) = watch::channel(false);
        let watch_log = log.clone();
        tokio::spawn(log.in_span(async move {
            client.wait_connected().await;
            if client.state() == ConnectionState::Connected {
                info!(parent: watch_log.span(), endpoint = %client.endpoint(), "master initialized");
                flag.send_replace(true);
            }
        }));

        Self {
            uplink,
            initialized,
            registry: topology.local_node().registry.clone(),
            broadcast_uid: topology.broadcast_uid,
            log,
        }
    }

    pub fn master_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Resolves once the master link has connected at least once. Returns
    /// `false` if the link was shut down first.
    pub async fn wait_master_initialized(&self) -> bool {
        let mut rx = self.initialized.clone();
        let up = rx.wait_for(|up| *up).await.is_ok();
        up
    }

    pub fn uplink(&self) -> &Outbox {
        &self.uplink
    }

    /// Handler for the slave's link server: commands go to `queue`.
    pub fn command_handler(&self, queue: TransferQueue) -> Arc<dyn EnvelopeHandler> {
        Arc::new(CommandIntake {
            registry: self.registry.clone(),
            broadcast_uid: self.broadcast_uid,
            queue,
            log: self.log.clone(),
        })
    }
}

/// Turns routed command envelopes into frames for the local relay.
pub struct CommandIntake {
    registry: NodeRegistry,
    broadcast_uid: Uid,
    queue: TransferQueue,
    log: LogContext,
}

impl CommandIntake {
    async fn accept(&self, cmd: CommandEnvelope, peer: SocketAddr) {
        let uid = if cmd.system_code.is_broadcast() {
            self.broadcast_uid
        } else {
            match self.registry.uid_of(&cmd.system_code) {
                Some(uid) => uid,
                None => {
                    warn!(parent: self.log.span(), %peer, code = %cmd.system_code, action = %cmd.action, "command for unknown system code dropped");
                    return;
                }
            }
        };

        let frame = match encode_command(uid, &cmd.action, cmd.data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(parent: self.log.span(), %peer, code = %cmd.system_code, %uid, error = %e, "command dropped");
                return;
            }
        };
        debug!(parent: self.log.span(), code = %cmd.system_code, hex = %frame.hex, "command queued");
        if let Err(e) = self.queue.push(frame).await {
            warn!(parent: self.log.span(), code = %cmd.system_code, error = %e, "command not queued");
        }
    }
}

impl EnvelopeHandler for CommandIntake {
    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match envelope {
                Envelope::Command(cmd) => self.accept(cmd, peer).await,
                other => {
                    warn!(parent: self.log.span(), %peer, kind = other.kind(), "unexpected envelope on slave link, dropped");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, LocalRole};
    use crate::registry::{IdentityRegistry, Node};
    use crate::relay::transfer_queue;
    use farm_protocol::SystemCode;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn topology(master_port: u16) -> Topology {
        let node = |port: u16, code: &str, uid: u32| Node {
            endpoint: Endpoint::new("127.0.0.1", port),
            registry: NodeRegistry::from_pairs([(SystemCode::new(code), Uid::new(uid))]).unwrap(),
        };
        Topology {
            local: LocalRole::Slave(0),
            identities: IdentityRegistry::new(node(master_port, "T1", 0xC0C0_C0C0), vec![node(1, "Z1", 0xAAAA_AAAA)]),
            broadcast_uid: Uid::new(0xFFFF_FFFF),
        }
    }

    fn link() -> LinkConf {
        LinkConf { retry_delay_secs: 1, ..LinkConf::default() }
    }

    #[tokio::test]
    async fn master_initialized_after_first_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let slave = SlaveController::start(&topology(port), &link(), cancel.clone(), LogContext::disabled());

        let _conn = listener.accept().await.unwrap();
        let up = tokio::time::timeout(Duration::from_secs(5), slave.wait_master_initialized()).await.unwrap();
        assert!(up);
        assert!(slave.master_initialized());
        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_before_master_is_reported() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let cancel = CancellationToken::new();
        let slave = SlaveController::start(&topology(port), &link(), cancel.clone(), LogContext::disabled());
        assert!(!slave.master_initialized());
        cancel.cancel();
        assert!(!slave.wait_master_initialized().await);
    }

    fn intake(queue: TransferQueue) -> CommandIntake {
        CommandIntake {
            registry: NodeRegistry::from_pairs([(SystemCode::new("Z1"), Uid::new(0xAAAA_AAAA))]).unwrap(),
            broadcast_uid: Uid::new(0xFFFF_FFFF),
            queue,
            log: LogContext::disabled(),
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn commands_are_encoded_with_own_registry() {
        let (queue, mut rx) = transfer_queue(4);
        let intake = intake(queue);
        intake.handle(Envelope::command(SystemCode::new("Z1"), "led_color", 4), peer()).await;
        intake.handle(Envelope::command(SystemCode::broadcast(), "update_watchdog", 1), peer()).await;

        let frames = rx.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].hex, "01010010aaaaaaaa010500010400000000000000");
        assert_eq!(frames[1].uid, Uid::new(0xFFFF_FFFF));
    }

    #[tokio::test]
    async fn unknown_code_and_bad_value_are_dropped() {
        let (queue, mut rx) = transfer_queue(4);
        let intake = intake(queue);
        intake.handle(Envelope::command(SystemCode::new("Z9"), "on_off", 1), peer()).await;
        intake.handle(Envelope::command(SystemCode::new("Z1"), "led_color", 99), peer()).await;
        intake.handle(Envelope::CheckMessage, peer()).await;
        assert!(rx.drain().is_empty());
    }
}
