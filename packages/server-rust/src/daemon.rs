//! Process-wide daemon state and lifecycle (spec §5).
//!
//! Wires every subsystem together, dials/accepts inter-node connections,
//! runs the client Unix listener, and drives the event loop that routes
//! inbound packets by opcode. Generation fencing (spec §4.1, §8 invariant
//! 3) is enforced once, here, for every inbound packet on a migration
//! opcode before it ever reaches [`CallEngine`].

use std::path::Path;
use std::sync::Arc;

use ctdb_core::node::Pnn;
use ctdb_core::vnn::VnnMap;
use ctdb_core::wire::{CtdbCodec, Frame, Opcode, ReplyDmasterBody, ReplyRedirectBody, ReqCallBody, ReqDmasterBody};
use ctdb_core::CtdbError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::call::CallEngine;
use crate::client::{ClientSession, MessageBus};
use crate::config::DaemonConfig;
use crate::control::{ControlContext, ControlDispatcher};
use crate::db::Databases;
use crate::freeze::FreezeManager;
use crate::log_ring::LogRing;
use crate::node_table::NodeTable;
use crate::recovery::{LocalRecoverySource, RecoveryCoordinator, RecoverySource};
use crate::transport::{PeerLinks, WriteOnly};
use crate::vacuum::{LocalVacuumTransport, VacuumWorker};
use crate::vnn_state::VnnMapState;

pub struct Daemon {
    pub self_pnn: Pnn,
    pub nodes: Arc<NodeTable>,
    pub vnn: Arc<VnnMapState>,
    pub databases: Arc<Databases>,
    pub links: Arc<PeerLinks>,
    pub call_engine: Arc<CallEngine>,
    pub freeze: Arc<FreezeManager>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub log_ring: Arc<LogRing>,
    pub control: Arc<ControlDispatcher>,
    pub control_ctx: Arc<ControlContext>,
    pub message_bus: Arc<MessageBus>,
    config: DaemonConfig,
}

impl Daemon {
    /// Assembles every subsystem and attaches this node's own loopback link
    /// (spec §4.1 "the client/daemon socket uses the same framing" extended
    /// to self-addressed traffic): a locally originated call is routed
    /// through the exact same path as one arriving from a peer.
    pub fn new(config: DaemonConfig, log_ring: Arc<LogRing>) -> anyhow::Result<Arc<Self>> {
        let self_pnn = config.pnn;
        let nodes = Arc::new(if config.nodes_file.exists() {
            NodeTable::load_from_file(&config.nodes_file)?
        } else {
            warn!(path = %config.nodes_file.display(), "node list file not found, starting with an empty cluster");
            NodeTable::new()
        });
        let tunables = config.tunables();
        let vnn = Arc::new(VnnMapState::new(VnnMap::new(1, nodes.connected_pnns().as_ref().clone())));
        let databases = Arc::new(Databases::new());
        let links = Arc::new(PeerLinks::new(tunables.max_queue_depth_drop_msg));

        let (daemon_side, loopback_side) = tokio::io::duplex(1 << 20);
        links.attach(self_pnn, daemon_side);

        let freeze = Arc::new(FreezeManager::new(ctdb_core::tunables::NUM_DB_PRIORITIES));
        let call_engine = Arc::new(CallEngine::new(
            databases.clone(),
            vnn.clone(),
            links.clone(),
            tunables,
            self_pnn,
            freeze.clone(),
        ));
        let source: Arc<dyn RecoverySource> = Arc::new(LocalRecoverySource::new(databases.clone()));
        let recovery = Arc::new(RecoveryCoordinator::new(
            vnn.clone(),
            nodes.clone(),
            databases.clone(),
            freeze.clone(),
            call_engine.clone(),
            source,
            None,
        ));
        let control = Arc::new(ControlDispatcher::new());
        let control_ctx = Arc::new(ControlContext::new(
            self_pnn,
            nodes.clone(),
            vnn.clone(),
            databases.clone(),
            freeze.clone(),
            recovery.clone(),
            log_ring.clone(),
            tunables,
        ));
        let message_bus = Arc::new(MessageBus::new());

        let daemon = Arc::new(Self {
            self_pnn,
            nodes,
            vnn,
            databases,
            links,
            call_engine: call_engine.clone(),
            freeze,
            recovery,
            log_ring,
            control,
            control_ctx,
            message_bus,
            config,
        });

        let loopback_engine = daemon.clone();
        tokio::spawn(async move { loopback_engine.run_peer_dispatch_loop(loopback_side, self_pnn).await });

        Ok(daemon)
    }

    /// Runs every background task (inter-node listener/dialer, client
    /// listener, vacuum) and blocks until SIGTERM or the client listener
    /// fails fatally (spec §5 "Process-wide state" teardown).
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let vacuum = Arc::new(VacuumWorker::new(
            self.databases.clone(),
            Arc::new(LocalVacuumTransport),
            self.config.tunables(),
            self.self_pnn,
        ));
        tokio::spawn(vacuum.run_loop(self.config.vacuum_interval()));

        if let Some(listen) = self.config.listen.clone() {
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(err) = daemon.run_inter_node_listener(&listen).await {
                    error!(%err, "inter-node listener exited");
                }
            });
        }

        self.clone().dial_lower_numbered_peers();

        let client_daemon = self.clone();
        let socket_path = self.config.socket_path.clone();
        let client_task = tokio::spawn(async move { client_daemon.run_client_listener(&socket_path).await });

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
            }
            result = client_task => {
                result??;
            }
        }
        Ok(())
    }

    async fn run_client_listener(&self, socket_path: &Path) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "client socket listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let self_pnn = self.self_pnn;
            let databases = self.databases.clone();
            let call_engine = self.call_engine.clone();
            let control = self.control.clone();
            let control_ctx = self.control_ctx.clone();
            let bus = self.message_bus.clone();
            tokio::spawn(async move {
                ClientSession::run(stream, self_pnn, databases, call_engine, control, control_ctx, bus).await;
            });
        }
    }

    async fn run_inter_node_listener(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "inter-node listener bound");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(err) = daemon.accept_peer(stream).await {
                    warn!(%err, "inbound peer connection failed");
                }
            });
        }
    }

    /// Full-mesh connection rule: the higher-numbered node dials, the
    /// lower-numbered node accepts, so every pair of nodes ends up with
    /// exactly one link between them.
    fn dial_lower_numbered_peers(self: Arc<Self>) {
        for node in self.nodes.all_sorted() {
            if node.pnn >= self.self_pnn {
                continue;
            }
            let daemon = self.clone();
            let address = node.address.clone();
            let peer_pnn = node.pnn;
            tokio::spawn(async move {
                match TcpStream::connect(&address).await {
                    Ok(stream) => {
                        if let Err(err) = daemon.establish_peer(stream, peer_pnn, true).await {
                            warn!(%err, pnn = peer_pnn, "failed to establish outbound peer link");
                        }
                    }
                    Err(err) => warn!(%err, pnn = peer_pnn, %address, "could not dial peer"),
                }
            });
        }
    }

    async fn accept_peer(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        let peer_pnn = self.read_handshake_pnn(&stream).await?;
        self.write_handshake_pnn(&stream).await?;
        self.establish_peer(stream, peer_pnn, false).await
    }

    /// Exchanges a raw 4-byte pnn handshake (outside the framed protocol),
    /// then splits the socket: the write half backs a [`PeerLinks`] entry,
    /// the read half feeds [`Daemon::run_peer_dispatch_loop`].
    async fn establish_peer(self: Arc<Self>, stream: TcpStream, peer_pnn: Pnn, dialed: bool) -> anyhow::Result<()> {
        if dialed {
            self.write_handshake_pnn(&stream).await?;
            let confirmed = self.read_handshake_pnn(&stream).await?;
            if confirmed != peer_pnn {
                anyhow::bail!("peer announced pnn {confirmed}, expected {peer_pnn}");
            }
        }
        let (read_half, write_half) = stream.into_split();
        self.links.attach(peer_pnn, WriteOnly(write_half));
        debug!(pnn = peer_pnn, "peer link established");
        self.run_peer_dispatch_loop(read_half, peer_pnn).await;
        Ok(())
    }

    async fn write_handshake_pnn<W: AsyncWriteExt + Unpin>(&self, mut w: W) -> anyhow::Result<()> {
        w.write_all(&self.self_pnn.to_ne_bytes()).await?;
        Ok(())
    }

    async fn read_handshake_pnn<R: AsyncReadExt + Unpin>(&self, mut r: R) -> anyhow::Result<Pnn> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await?;
        Ok(u32::from_ne_bytes(buf))
    }

    /// Reads framed packets off `reader` (a peer connection or this node's
    /// own loopback) and dispatches each by opcode, dropping any
    /// generation-fenced migration packet whose generation no longer
    /// matches the current vnn_map (spec §4.1, §8 invariant 3).
    async fn run_peer_dispatch_loop<R>(self: Arc<Self>, reader: R, from_pnn: Pnn)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        use futures_util::StreamExt;
        let mut framed = FramedRead::new(reader, CtdbCodec);
        loop {
            match framed.next().await {
                Some(Ok(frame)) => {
                    if let Err(err) = self.dispatch_peer_frame(frame, from_pnn).await {
                        if err.is_fatal() {
                            // Spec §7: the daemon aborts rather than risk
                            // corrupting data on a confirmed protocol
                            // violation, trusting the cluster to recover
                            // around the lost node.
                            error!(%err, from_pnn, "fatal protocol violation, aborting daemon");
                            std::process::abort();
                        }
                        debug!(%err, from_pnn, "non-fatal error handling peer frame");
                    }
                }
                Some(Err(err)) => {
                    error!(%err, from_pnn, "peer connection protocol error");
                    break;
                }
                None => break,
            }
        }
        self.links.detach(from_pnn);
    }

    async fn dispatch_peer_frame(&self, frame: Frame, from_pnn: Pnn) -> Result<(), CtdbError> {
        let header = frame.header;
        if header.operation.is_generation_fenced() && header.generation != self.vnn.generation() {
            debug!(packet = header.generation, local = self.vnn.generation(), "dropping generation-mismatched packet");
            return Ok(());
        }
        match header.operation {
            Opcode::ReqCall => {
                let body = ReqCallBody::decode(&frame.body)?;
                self.call_engine.handle_req_call(header, body, from_pnn).await
            }
            Opcode::ReplyCall => {
                let body = ctdb_core::wire::ReplyCallBody::decode(&frame.body)?;
                self.call_engine.handle_reply_call(header, body);
                Ok(())
            }
            Opcode::ReplyRedirect => {
                let body = ReplyRedirectBody::decode(&frame.body)?;
                self.call_engine.handle_reply_redirect(header, body)
            }
            Opcode::ReqDmaster => {
                let body = ReqDmasterBody::decode(&frame.body)?;
                self.call_engine.handle_req_dmaster(header, body, from_pnn).await
            }
            Opcode::ReplyDmaster => {
                let body = ReplyDmasterBody::decode(&frame.body)?;
                self.call_engine.handle_reply_dmaster(header, body).await
            }
            other => {
                warn!(?other, from_pnn, "unexpected opcode on inter-node link");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[tokio::test]
    async fn loopback_call_round_trips_through_the_daemon_event_loop() {
        let config = DaemonConfig::parse_from(["ctdbd", "--pnn", "0"]);
        let daemon = Daemon::new(config, Arc::new(LogRing::default())).unwrap();

        let db_id = crate::db::db_id_for_name("test.tdb");
        daemon.databases.attach(crate::db::Database::new(db_id, "test.tdb", false, 1, "/tmp/test.tdb".into()));

        let reply = daemon
            .call_engine
            .originate(db_id, 0, b"k".to_vec(), b"v1".to_vec(), ctdb_core::wire::CallFlags::empty())
            .await
            .unwrap();
        assert_eq!(reply.status, 0);

        let fetch = daemon.call_engine.originate(db_id, 0, b"k".to_vec(), Vec::new(), ctdb_core::wire::CallFlags::empty()).await.unwrap();
        assert_eq!(fetch.data, b"v1");
    }
}
