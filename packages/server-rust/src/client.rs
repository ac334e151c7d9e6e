//! Local client socket (spec §6.2): a client obtains its pnn via
//! `CONNECT_WAIT`, attaches databases by name, registers message srvids,
//! and issues `REQ_CALL`/`REQ_MESSAGE`/`REQ_CONTROL`. On daemon exit the
//! client sees EOF and terminates; there is no reconnect handshake to
//! preserve.
//!
//! Unlike [`crate::transport::PeerLinks`], a client connection is not
//! addressed by pnn, so it gets its own small writer-loop/channel pair
//! here rather than borrowing the peer link machinery (which would need a
//! synthetic pnn per client for no benefit).

use std::sync::Arc;

use bytes::Bytes;
use ctdb_core::node::Pnn;
use ctdb_core::wire::{
    ConnectWaitReplyBody, Frame, Opcode, PacketHeader, RegisterBody, RegisterReplyBody,
    ReplyCallBody, ReplyControlBody, ReplyErrorBody, ReqCallBody, ReqControlBody, ReqMessageBody,
};
use ctdb_core::CtdbError;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::call::CallEngine;
use crate::control::{ControlContext, ControlDispatcher};
use crate::db::{db_id_for_name, Database, Databases};

/// Srvid-keyed publish/subscribe table backing `REQ_MESSAGE` (spec §6.2
/// "registers message srvids").
#[derive(Default)]
pub struct MessageBus {
    subscribers: DashMap<u64, Vec<mpsc::UnboundedSender<ReqMessageBody>>>,
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, srvid: u64, sender: mpsc::UnboundedSender<ReqMessageBody>) {
        self.subscribers.entry(srvid).or_default().push(sender);
    }

    pub fn unsubscribe(&self, srvid: u64) {
        self.subscribers.remove(&srvid);
    }

    /// Delivers to every live subscriber of `body.srvid`, pruning any whose
    /// receiver has gone away.
    pub fn publish(&self, body: ReqMessageBody) {
        if let Some(mut subs) = self.subscribers.get_mut(&body.srvid) {
            subs.retain(|tx| tx.send(body.clone()).is_ok());
        }
    }
}

/// One client connection's session state and dispatch loop.
pub struct ClientSession {
    self_pnn: Pnn,
    databases: Arc<Databases>,
    call_engine: Arc<CallEngine>,
    control: Arc<ControlDispatcher>,
    control_ctx: Arc<ControlContext>,
    bus: Arc<MessageBus>,
    subscribed_srvids: Vec<u64>,
    out_tx: mpsc::UnboundedSender<Frame>,
}

impl ClientSession {
    /// Drives one client connection to completion. Returns once the client
    /// disconnects, sends `SHUTDOWN`, or the stream errors out.
    pub async fn run<S>(
        stream: S,
        self_pnn: Pnn,
        databases: Arc<Databases>,
        call_engine: Arc<CallEngine>,
        control: Arc<ControlDispatcher>,
        control_ctx: Arc<ControlContext>,
        bus: Arc<MessageBus>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, ctdb_core::wire::CtdbCodec);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let mut session = ClientSession {
            self_pnn,
            databases,
            call_engine,
            control,
            control_ctx,
            bus,
            subscribed_srvids: Vec::new(),
            out_tx,
        };

        loop {
            tokio::select! {
                biased;
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(frame) if framed.send(frame).await.is_ok() => {}
                        _ => break,
                    }
                }
                incoming = framed.next() => {
                    let Some(incoming) = incoming else { break };
                    match incoming {
                        Ok(frame) => {
                            if !session.handle_inbound(frame).await {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "client connection protocol error");
                            break;
                        }
                    }
                }
            }
        }

        for srvid in &session.subscribed_srvids {
            session.bus.unsubscribe(*srvid);
        }
        debug!("client session ended");
    }

    fn reply(&self, header: &PacketHeader, operation: Opcode, body: Vec<u8>) {
        let out_header =
            PacketHeader::new(operation, header.generation, header.srcnode, self.self_pnn, header.reqid);
        let _ = self.out_tx.send(Frame::new(out_header, Bytes::from(body)));
    }

    /// Returns `false` once the session should end (`SHUTDOWN` or a fatal
    /// decode failure).
    async fn handle_inbound(&mut self, frame: Frame) -> bool {
        let header = frame.header;
        match header.operation {
            Opcode::ConnectWait => {
                self.reply(&header, Opcode::ConnectWait, ConnectWaitReplyBody { pnn: self.self_pnn }.encode());
            }
            Opcode::Register => {
                let Ok(body) = RegisterBody::decode(&frame.body) else {
                    warn!("malformed REGISTER body");
                    return true;
                };
                let db_id = db_id_for_name(&body.name);
                let db = self.databases.get(db_id).unwrap_or_else(|| {
                    self.databases.attach(Database::new(
                        db_id,
                        body.name.clone(),
                        body.persistent,
                        1,
                        format!("{}.tdb", body.name).into(),
                    ))
                });
                let path = db.path.to_string_lossy().into_owned();
                self.reply(&header, Opcode::Register, RegisterReplyBody { db_id, path }.encode());
            }
            Opcode::ReqCall => {
                let Ok(body) = ReqCallBody::decode(&frame.body) else {
                    warn!("malformed REQ_CALL body");
                    return true;
                };
                let call_engine = self.call_engine.clone();
                let out_tx = self.out_tx.clone();
                let self_pnn = self.self_pnn;
                tokio::spawn(async move {
                    let result = call_engine.originate(body.db_id, body.call_id, body.key, body.call_data, body.flags).await;
                    let (operation, payload) = match result {
                        Ok(reply) => (Opcode::ReplyCall, reply.encode()),
                        Err(err) => (
                            Opcode::ReplyError,
                            ReplyErrorBody { status: err.status_code(), message: err.to_string() }.encode(),
                        ),
                    };
                    let out_header =
                        PacketHeader::new(operation, header.generation, header.srcnode, self_pnn, header.reqid);
                    let _ = out_tx.send(Frame::new(out_header, Bytes::from(payload)));
                });
            }
            Opcode::ReqMessage => {
                let Ok(body) = ReqMessageBody::decode(&frame.body) else {
                    warn!("malformed REQ_MESSAGE body");
                    return true;
                };
                self.bus.publish(body);
            }
            Opcode::ReqControl => {
                let Ok(body) = ReqControlBody::decode(&frame.body) else {
                    warn!("malformed REQ_CONTROL body");
                    return true;
                };
                if body.srvid != 0 && !self.subscribed_srvids.contains(&body.srvid) {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    self.bus.subscribe(body.srvid, tx);
                    self.subscribed_srvids.push(body.srvid);
                    let out_tx = self.out_tx.clone();
                    let self_pnn = self.self_pnn;
                    let srcnode = header.srcnode;
                    tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            let out_header =
                                PacketHeader::new(Opcode::ReqMessage, header.generation, srcnode, self_pnn, 0);
                            if out_tx.send(Frame::new(out_header, Bytes::from(msg.encode()))).is_err() {
                                break;
                            }
                        }
                    });
                }
                let noreply = body.is_noreply();
                let control = self.control.clone();
                let ctx = self.control_ctx.clone();
                let out_tx = self.out_tx.clone();
                let self_pnn = self.self_pnn;
                tokio::spawn(async move {
                    let result = control.dispatch(&ctx, &body).await;
                    if noreply {
                        return;
                    }
                    let reply = match result {
                        Ok(data) => ReplyControlBody { status: 0, data, error: None },
                        Err(err) => ReplyControlBody { status: err.status_code(), data: Vec::new(), error: Some(err.to_string()) },
                    };
                    let out_header =
                        PacketHeader::new(Opcode::ReplyControl, header.generation, header.srcnode, self_pnn, header.reqid);
                    let _ = out_tx.send(Frame::new(out_header, Bytes::from(reply.encode())));
                });
            }
            Opcode::Shutdown => {
                return false;
            }
            other => {
                warn!(?other, "unexpected opcode on client socket");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use ctdb_core::node::Node;
    use ctdb_core::tunables::Tunables;
    use ctdb_core::vnn::VnnMap;
    use ctdb_core::wire::{CallFlags, CtdbCodec};

    use super::*;
    use crate::freeze::FreezeManager;
    use crate::node_table::NodeTable;
    use crate::recovery::{LocalRecoverySource, RecoveryCoordinator, RecoverySource};
    use crate::transport::PeerLinks;
    use crate::vnn_state::VnnMapState;

    fn wiring() -> (Arc<Databases>, Arc<CallEngine>, Arc<ControlDispatcher>, Arc<ControlContext>, Arc<MessageBus>) {
        let databases = Arc::new(Databases::new());
        databases.attach(Database::new(db_id_for_name("test.tdb"), "test.tdb", false, 1, "/tmp/test.tdb".into()));
        let nodes = Arc::new(NodeTable::new());
        nodes.insert(Node::new(0, "a"));
        let vnn = Arc::new(VnnMapState::new(VnnMap::new(1, vec![0])));
        let freeze = Arc::new(FreezeManager::new(3));
        let links = Arc::new(PeerLinks::new(100));
        let (loop_a, loop_b) = tokio::io::duplex(1 << 16);
        links.attach(0, loop_a);
        let call_engine =
            Arc::new(CallEngine::new(databases.clone(), vnn.clone(), links, Tunables::default(), 0, freeze.clone()));

        let dispatch_engine = call_engine.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(loop_b, CtdbCodec);
            while let Some(Ok(frame)) = framed.next().await {
                match frame.header.operation {
                    Opcode::ReqCall => {
                        let body = ReqCallBody::decode(&frame.body).unwrap();
                        let _ = dispatch_engine.handle_req_call(frame.header, body, 0).await;
                    }
                    Opcode::ReplyCall => {
                        let body = ReplyCallBody::decode(&frame.body).unwrap();
                        dispatch_engine.handle_reply_call(frame.header, body);
                    }
                    _ => {}
                }
            }
        });

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
        let control_ctx = Arc::new(ControlContext::new(
            0,
            nodes,
            vnn,
            databases.clone(),
            freeze,
            recovery,
            Arc::new(crate::log_ring::LogRing::default()),
            Tunables::default(),
        ));
        (databases, call_engine, Arc::new(ControlDispatcher::new()), control_ctx, Arc::new(MessageBus::new()))
    }

    #[tokio::test]
    async fn connect_wait_returns_self_pnn() {
        let (databases, call_engine, control, control_ctx, bus) = wiring();
        let (client_side, server_side) = tokio::io::duplex(1 << 16);

        tokio::spawn(ClientSession::run(server_side, 0, databases, call_engine, control, control_ctx, bus));

        let mut framed = Framed::new(client_side, CtdbCodec);
        let header = PacketHeader::new(Opcode::ConnectWait, 1, 0, 99, 1);
        framed.send(Frame::new(header, Bytes::new())).await.unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        let body = ConnectWaitReplyBody::decode(&reply.body).unwrap();
        assert_eq!(body.pnn, 0);
    }

    #[tokio::test]
    async fn register_attaches_a_new_database_by_name() {
        let (databases, call_engine, control, control_ctx, bus) = wiring();
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        tokio::spawn(ClientSession::run(server_side, 0, databases.clone(), call_engine, control, control_ctx, bus));

        let mut framed = Framed::new(client_side, CtdbCodec);
        let header = PacketHeader::new(Opcode::Register, 1, 0, 99, 2);
        let body = RegisterBody { persistent: false, name: "locking.tdb".into() };
        framed.send(Frame::new(header, Bytes::from(body.encode()))).await.unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        let reply_body = RegisterReplyBody::decode(&reply.body).unwrap();
        assert_eq!(reply_body.db_id, db_id_for_name("locking.tdb"));
        assert!(databases.get(reply_body.db_id).is_some());
    }

    #[tokio::test]
    async fn req_call_round_trips_through_the_call_engine() {
        let (databases, call_engine, control, control_ctx, bus) = wiring();
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        tokio::spawn(ClientSession::run(server_side, 0, databases, call_engine, control, control_ctx, bus));

        let mut framed = Framed::new(client_side, CtdbCodec);
        let db_id = db_id_for_name("test.tdb");
        let header = PacketHeader::new(Opcode::ReqCall, 1, 0, 99, 3);
        let body = ReqCallBody { flags: CallFlags::empty(), db_id, call_id: 0, hopcount: 0, key: b"k".to_vec(), call_data: b"v".to_vec() };
        framed.send(Frame::new(header, Bytes::from(body.encode()))).await.unwrap();

        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply.header.operation, Opcode::ReplyCall);
        let reply_body = ReplyCallBody::decode(&reply.body).unwrap();
        assert_eq!(reply_body.status, 0);
    }

    #[tokio::test]
    async fn shutdown_ends_the_session() {
        let (databases, call_engine, control, control_ctx, bus) = wiring();
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(ClientSession::run(server_side, 0, databases, call_engine, control, control_ctx, bus));

        let mut framed = Framed::new(client_side, CtdbCodec);
        let header = PacketHeader::new(Opcode::Shutdown, 1, 0, 99, 4);
        framed.send(Frame::new(header, Bytes::new())).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
