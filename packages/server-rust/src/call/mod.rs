//! The dmaster/lmaster migration state machine (spec §4.6) — the heart of
//! the daemon.
//!
//! Every hop of a REQ_CALL chase preserves `header.srcnode`/`header.reqid`
//! as the identity of the *original* caller (spec §4.3 "the reqid is the
//! sole means of correlating a reply to a caller"); `header.destnode` is
//! the only field that changes hop to hop. Migration always proposes the
//! original caller as the new dmaster (spec §4.6 "always the original
//! REQ_CALL sender"), so when that node is also the lmaster, it already
//! holds its own pending call in [`CallEngine::in_flight`] and can finish
//! without a network round trip. The *physical* sender of a hop (needed to
//! validate "is this really the current dmaster") comes from the
//! connection layer, not from the header, since the header's srcnode is
//! reserved for the original caller throughout.

use std::sync::Arc;

use bytes::Bytes;
use ctdb_core::node::{Pnn, INVALID_PNN};
use ctdb_core::record::{RecordFlags, RecordHeader};
use ctdb_core::tunables::Tunables;
use ctdb_core::wire::{
    CallFlags, Frame, Opcode, PacketHeader, ReplyCallBody, ReplyDmasterBody, ReplyRedirectBody,
    ReqCallBody, ReqDmasterBody,
};
use ctdb_core::CtdbError;
use tokio::sync::oneshot;

use crate::db::{Database, Databases};
use crate::freeze::FreezeManager;
use crate::reqid::ReqidRegistry;
use crate::transport::PeerLinks;
use crate::vnn_state::VnnMapState;

/// State of one outstanding REQ_CALL awaiting a reply (spec §3 "In-flight
/// call state").
pub struct InFlightCall {
    pub db_id: u32,
    pub call_id: u32,
    pub key: Vec<u8>,
    pub call_data: Vec<u8>,
    pub flags: CallFlags,
    pub generation: u32,
    pub redirect_count: u32,
    pub waiter: oneshot::Sender<Result<ReplyCallBody, CtdbError>>,
}

pub struct CallEngine {
    pub databases: Arc<Databases>,
    pub vnn: Arc<VnnMapState>,
    pub links: Arc<PeerLinks>,
    pub tunables: Tunables,
    pub self_pnn: Pnn,
    pub freeze: Arc<FreezeManager>,
    pub in_flight: ReqidRegistry<InFlightCall>,
}

impl CallEngine {
    #[must_use]
    pub fn new(
        databases: Arc<Databases>,
        vnn: Arc<VnnMapState>,
        links: Arc<PeerLinks>,
        tunables: Tunables,
        self_pnn: Pnn,
        freeze: Arc<FreezeManager>,
    ) -> Self {
        Self { databases, vnn, links, tunables, self_pnn, freeze, in_flight: ReqidRegistry::new() }
    }

    /// Originates a call on behalf of a local client (spec §4.6 "client →
    /// local daemon"): allocates a reqid, routes a REQ_CALL to self, and
    /// awaits the eventual REPLY_CALL up to the configured timeout.
    pub async fn originate(
        self: &Arc<Self>,
        db_id: u32,
        call_id: u32,
        key: Vec<u8>,
        call_data: Vec<u8>,
        flags: CallFlags,
    ) -> Result<ReplyCallBody, CtdbError> {
        let (tx, rx) = oneshot::channel();
        let generation = self.vnn.generation();
        let reqid = self
            .in_flight
            .insert(InFlightCall {
                db_id,
                call_id,
                key: key.clone(),
                call_data: call_data.clone(),
                flags,
                generation,
                redirect_count: 0,
                waiter: tx,
            })
            .ok_or_else(|| CtdbError::ResourceExhaustion("reqid space exhausted".into()))?;

        let header = PacketHeader::new(Opcode::ReqCall, generation, self.self_pnn, self.self_pnn, reqid);
        let body = ReqCallBody { flags, db_id, call_id, hopcount: 0, key, call_data };
        self.route(self.self_pnn, header, body.encode())?;

        match tokio::time::timeout(self.tunables.req_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CtdbError::Timeout),
            Err(_) => {
                self.in_flight.take(reqid);
                Err(CtdbError::Timeout)
            }
        }
    }

    /// Re-stamps every in-flight call with the current generation, assigns
    /// fresh reqids, and reissues them to self (spec §4.6 "On recovery").
    /// Late replies carrying a stale reqid fail the generation/slot check
    /// in [`ReqidRegistry`] and are dropped.
    pub fn resend_all_on_recovery(self: &Arc<Self>) {
        for (_old_reqid, call) in self.in_flight.drain() {
            let engine = self.clone();
            tokio::spawn(async move { engine.resend(call).await });
        }
    }

    async fn resend(self: Arc<Self>, call: InFlightCall) {
        let InFlightCall { db_id, call_id, key, call_data, flags, waiter, .. } = call;
        let generation = self.vnn.generation();
        let reqid = match self.in_flight.insert(InFlightCall {
            db_id,
            call_id,
            key: key.clone(),
            call_data: call_data.clone(),
            flags,
            generation,
            redirect_count: 0,
            waiter,
        }) {
            Some(reqid) => reqid,
            None => return,
        };
        let header = PacketHeader::new(Opcode::ReqCall, generation, self.self_pnn, self.self_pnn, reqid);
        let body = ReqCallBody { flags, db_id, call_id, hopcount: 0, key, call_data };
        let _ = self.route(self.self_pnn, header, body.encode());
    }

    fn route(&self, destnode: Pnn, header: PacketHeader, body: Vec<u8>) -> Result<(), CtdbError> {
        self.links.send_priority(destnode, Frame::new(header, Bytes::from(body)))
    }

    /// REQ_CALL receiver algorithm (spec §4.6 steps 1–7). `from_pnn` is the
    /// physical sender of this hop, supplied by the connection layer.
    pub async fn handle_req_call(
        &self,
        header: PacketHeader,
        mut body: ReqCallBody,
        from_pnn: Pnn,
    ) -> Result<(), CtdbError> {
        body.hopcount += 1;
        metrics::histogram!("ctdb_call_hopcount").record(f64::from(body.hopcount));

        let db = self
            .databases
            .get(body.db_id)
            .ok_or_else(|| CtdbError::Remote(format!("unknown database {}", body.db_id)))?;

        // Holds the freeze read guard for the rest of this call (spec §4.7,
        // §8 invariant 5): a held freeze write-guard on `db.priority` blocks
        // here until thaw, so the call cannot complete while frozen.
        let _freeze_guard = self.freeze.guard_call(db.priority).await;

        let guard = db.store.lock(&body.key).await;
        let (mut local_header, value) = db.store.fetch(&body.key);

        // A key nobody has ever written: the first caller to reach it
        // becomes dmaster by default.
        if local_header.is_invalid() {
            local_header.dmaster = self.self_pnn;
        }

        if local_header.dmaster != self.self_pnn {
            drop(guard);
            let target = if body.hopcount > self.tunables.max_redirect_count {
                self.vnn.lmaster_for_key(&body.key).unwrap_or(local_header.dmaster)
            } else {
                local_header.dmaster
            };
            return self.reply_redirect(&header, target);
        }

        let caller = header.srcnode;
        let wants_migration = caller != self.self_pnn
            && !db.in_transaction()
            && ((local_header.laccessor == caller && local_header.lacount >= self.tunables.max_lacount)
                || body.flags.contains(CallFlags::IMMEDIATE_MIGRATION));

        if wants_migration {
            drop(guard);
            return self.initiate_migration(&header, &body, &db, local_header, value, caller).await;
        }

        let outcome = db
            .invoke_call(body.call_id, &body.key, &value, &body.call_data)
            .ok_or_else(|| CtdbError::Remote(format!("unknown call_id {}", body.call_id)))?;
        local_header.record_access(caller);
        let final_value = if let Some(new_value) = outcome.new_value {
            local_header.advance_rsn(self.self_pnn);
            new_value
        } else {
            value
        };
        db.store.store(&body.key, local_header, final_value);
        drop(guard);
        let _ = from_pnn;
        self.reply_call(&header, outcome.status, outcome.reply_data)
    }

    fn reply_redirect(&self, header: &PacketHeader, dmaster: Pnn) -> Result<(), CtdbError> {
        let out_header =
            PacketHeader::new(Opcode::ReplyRedirect, header.generation, header.srcnode, self.self_pnn, header.reqid);
        self.route(header.srcnode, out_header, ReplyRedirectBody { dmaster }.encode())
    }

    fn reply_call(&self, header: &PacketHeader, status: i32, data: Vec<u8>) -> Result<(), CtdbError> {
        let out_header =
            PacketHeader::new(Opcode::ReplyCall, header.generation, header.srcnode, self.self_pnn, header.reqid);
        self.route(header.srcnode, out_header, ReplyCallBody { status, data }.encode())
    }

    /// Proposes `caller` (the node whose repeated access triggered
    /// migration) as the new dmaster, via REQ_DMASTER to the lmaster.
    /// `header`'s srcnode/reqid are forwarded unchanged so the lmaster can
    /// copy them onto REPLY_DMASTER.
    async fn initiate_migration(
        &self,
        header: &PacketHeader,
        body: &ReqCallBody,
        db: &Arc<Database>,
        local_header: RecordHeader,
        value: Vec<u8>,
        caller: Pnn,
    ) -> Result<(), CtdbError> {
        let lmaster = self
            .vnn
            .lmaster_for_key(&body.key)
            .ok_or_else(|| CtdbError::Remote("vnn_map not initialized".into()))?;
        let dmaster_body = ReqDmasterBody {
            db_id: body.db_id,
            dmaster: caller,
            rsn: local_header.rsn,
            flags: local_header.flags,
            key: body.key.clone(),
            value,
        };
        let out_header = PacketHeader::new(Opcode::ReqDmaster, header.generation, lmaster, header.srcnode, header.reqid);
        let _ = db;
        self.route(lmaster, out_header, dmaster_body.encode())
    }

    /// REQ_DMASTER receiver algorithm, run on the lmaster (spec §4.6).
    pub async fn handle_req_dmaster(
        &self,
        header: PacketHeader,
        body: ReqDmasterBody,
        from_pnn: Pnn,
    ) -> Result<(), CtdbError> {
        let db = self
            .databases
            .get(body.db_id)
            .ok_or_else(|| CtdbError::Remote(format!("unknown database {}", body.db_id)))?;

        let guard = db.store.lock(&body.key).await;
        let (local_header, _) = db.store.fetch(&body.key);
        if local_header.rsn != 0 && local_header.dmaster != from_pnn {
            return Err(CtdbError::ProtocolViolation(format!(
                "REQ_DMASTER for key owned by node {} arrived from non-dmaster {from_pnn}",
                local_header.dmaster
            )));
        }
        let laccessor = local_header.laccessor;
        let lacount = local_header.lacount;
        db.store.store(
            &body.key,
            RecordHeader { rsn: body.rsn, dmaster: body.dmaster, flags: body.flags, laccessor, lacount },
            body.value.clone(),
        );
        drop(guard);

        if body.dmaster == self.self_pnn {
            // The lmaster is also the proposed new dmaster, which per
            // spec §4.6 is always the node that originated the REQ_CALL —
            // so it already owns the pending in-flight call.
            if let Some(entry) = self.in_flight.get(header.reqid) {
                let call_id = entry.1.call_id;
                let call_data = entry.1.call_data.clone();
                drop(entry);
                return self
                    .become_dmaster_and_reply(&db, body.key, body.rsn, body.flags, body.value, call_id, call_data, header)
                    .await;
            }
            return Ok(());
        }

        let out_header =
            PacketHeader::new(Opcode::ReplyDmaster, header.generation, body.dmaster, header.srcnode, header.reqid);
        let reply = ReplyDmasterBody { rsn: body.rsn, db_id: body.db_id, flags: body.flags, key: body.key, value: body.value };
        self.route(body.dmaster, out_header, reply.encode())
    }

    /// REPLY_DMASTER receiver algorithm, run on the new dmaster (spec
    /// §4.6). The receiver is, by construction, the node that originated
    /// the migrating REQ_CALL.
    pub async fn handle_reply_dmaster(&self, header: PacketHeader, body: ReplyDmasterBody) -> Result<(), CtdbError> {
        let db = self
            .databases
            .get(body.db_id)
            .ok_or_else(|| CtdbError::Remote(format!("unknown database {}", body.db_id)))?;
        let Some(entry) = self.in_flight.get(header.reqid) else {
            return Ok(());
        };
        let call_id = entry.1.call_id;
        let call_data = entry.1.call_data.clone();
        drop(entry);
        self.become_dmaster_and_reply(&db, body.key, body.rsn, body.flags, body.value, call_id, call_data, header).await
    }

    async fn become_dmaster_and_reply(
        &self,
        db: &Arc<Database>,
        key: Vec<u8>,
        rsn: u64,
        flags: RecordFlags,
        value: Vec<u8>,
        call_id: u32,
        call_data: Vec<u8>,
        header: PacketHeader,
    ) -> Result<(), CtdbError> {
        let guard = db.store.lock(&key).await;
        let mut new_header = RecordHeader { rsn, dmaster: self.self_pnn, flags, laccessor: INVALID_PNN, lacount: 0 };
        let outcome = db
            .invoke_call(call_id, &key, &value, &call_data)
            .ok_or_else(|| CtdbError::Remote(format!("unknown call_id {call_id}")))?;
        new_header.record_access(header.srcnode);
        let final_value = if let Some(new_value) = outcome.new_value {
            new_header.advance_rsn(self.self_pnn);
            new_value
        } else {
            value
        };
        db.store.store(&key, new_header, final_value);
        drop(guard);
        self.reply_call(&header, outcome.status, outcome.reply_data)
    }

    /// REPLY_REDIRECT receiver algorithm: the original caller re-chases
    /// the hint, forcing to the lmaster once [`Tunables::max_redirect_count`]
    /// is exceeded (spec §4.6 "Redirect chase policy", §9 open question on
    /// recomputing the lmaster on every hop).
    pub fn handle_reply_redirect(&self, header: PacketHeader, body: ReplyRedirectBody) -> Result<(), CtdbError> {
        let mut destnode = body.dmaster;
        let max_redirect_count = self.tunables.max_redirect_count;
        let key_for_lmaster = std::cell::RefCell::new(None);
        let ok = self.in_flight.update(header.reqid, |call| {
            call.redirect_count += 1;
            if call.redirect_count > max_redirect_count {
                *key_for_lmaster.borrow_mut() = Some(call.key.clone());
            }
        });
        if !ok {
            return Ok(());
        }
        if let Some(key) = key_for_lmaster.into_inner() {
            destnode = self.vnn.lmaster_for_key(&key).unwrap_or(destnode);
        }

        let Some(entry) = self.in_flight.get(header.reqid) else {
            return Ok(());
        };
        let call = &entry.1;
        let out_header = PacketHeader::new(Opcode::ReqCall, call.generation, destnode, header.srcnode, header.reqid);
        let out_body =
            ReqCallBody { flags: call.flags, db_id: call.db_id, call_id: call.call_id, hopcount: 0, key: call.key.clone(), call_data: call.call_data.clone() };
        drop(entry);
        self.route(destnode, out_header, out_body.encode())
    }

    /// REPLY_CALL receiver algorithm: completes the originating waiter.
    pub fn handle_reply_call(&self, header: PacketHeader, body: ReplyCallBody) {
        if let Some(call) = self.in_flight.take(header.reqid) {
            let _ = call.waiter.send(Ok(body));
        }
    }

    /// Fails every in-flight call whose timeout has elapsed. Intended to be
    /// driven by a periodic sweep (spec §5 "Every in-flight call carries a
    /// timeout"); the sweep itself lives in the daemon, since it needs a
    /// clock tick, not call-engine state.
    pub fn fail_timed_out(&self, reqid: u32) {
        if let Some(call) = self.in_flight.take(reqid) {
            let _ = call.waiter.send(Err(CtdbError::Timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ctdb_core::vnn::VnnMap;

    use super::*;
    use crate::db::Database;

    fn engine(self_pnn: Pnn) -> Arc<CallEngine> {
        let databases = Arc::new(Databases::new());
        databases.attach(Database::new(1, "test.tdb", false, 1, PathBuf::from("/tmp/test.tdb")));
        let vnn = Arc::new(VnnMapState::new(VnnMap::new(1, vec![0])));
        let links = Arc::new(PeerLinks::new(100));
        let freeze = Arc::new(FreezeManager::new(ctdb_core::tunables::NUM_DB_PRIORITIES));
        Arc::new(CallEngine::new(databases, vnn, links, Tunables::default(), self_pnn, freeze))
    }

    #[tokio::test]
    async fn call_completes_locally_without_network() {
        let engine = engine(0);
        let (daemon_side, loopback_side) = tokio::io::duplex(1 << 16);
        engine.links.attach(0, daemon_side);

        let dispatch_engine = engine.clone();
        tokio::spawn(async move {
            use ctdb_core::wire::CtdbCodec;
            use futures_util::StreamExt;
            use tokio_util::codec::Framed;
            let mut framed = Framed::new(loopback_side, CtdbCodec);
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

        let reply = engine
            .originate(1, 0, b"k".to_vec(), b"v1".to_vec(), CallFlags::empty())
            .await
            .unwrap();
        assert_eq!(reply.status, 0);

        let fetch = engine.originate(1, 0, b"k".to_vec(), Vec::new(), CallFlags::empty()).await.unwrap();
        assert_eq!(fetch.data, b"v1");
    }

    #[tokio::test]
    async fn req_call_blocks_on_a_frozen_priority_until_thaw() {
        let engine = engine(0);
        assert!(engine.freeze.freeze(1).await);

        let header = PacketHeader::new(Opcode::ReqCall, 1, 0, 0, 1);
        let body = ReqCallBody { flags: CallFlags::empty(), db_id: 1, call_id: 0, hopcount: 0, key: b"k".to_vec(), call_data: Vec::new() };
        let frozen_engine = engine.clone();
        let handle = tokio::spawn(async move { frozen_engine.handle_req_call(header, body, 0).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        assert!(engine.freeze.thaw(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
    }
}
