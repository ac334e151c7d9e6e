//! Control-plane dispatch (spec §4.10): a table keyed by [`ControlOpcode`]
//! rather than one large match, per the dynamic-dispatch note. Each handler
//! gets a shared [`ControlContext`] and the raw opcode data blob, and
//! returns either an output blob or a [`CtdbError`] to surface as a failing
//! `REPLY_CONTROL`.
//!
//! IP takeover, tcp-tickle bookkeeping, eventscripts, and the notify
//! registry are external collaborators (spec §1 "out of scope"); their
//! opcodes are wired into the table so `ctdb-tool` gets a uniform error
//! rather than an unknown-opcode protocol violation, but carry no logic
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use ctdb_core::node::{NodeFlags, Pnn};
use ctdb_core::tunables::Tunables;
use ctdb_core::vnn::VnnMap;
use ctdb_core::wire::{ControlOpcode, ReqControlBody};
use ctdb_core::CtdbError;

use crate::db::Databases;
use crate::freeze::FreezeManager;
use crate::log_ring::LogRing;
use crate::node_table::NodeTable;
use crate::recovery::RecoveryCoordinator;
use crate::vnn_state::VnnMapState;

pub struct ControlContext {
    pub self_pnn: Pnn,
    pub nodes: Arc<NodeTable>,
    pub vnn: Arc<VnnMapState>,
    pub databases: Arc<Databases>,
    pub freeze: Arc<FreezeManager>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub log_ring: Arc<LogRing>,
    pub tunables: ArcSwap<Tunables>,
}

impl ControlContext {
    #[must_use]
    pub fn new(
        self_pnn: Pnn,
        nodes: Arc<NodeTable>,
        vnn: Arc<VnnMapState>,
        databases: Arc<Databases>,
        freeze: Arc<FreezeManager>,
        recovery: Arc<RecoveryCoordinator>,
        log_ring: Arc<LogRing>,
        tunables: Tunables,
    ) -> Self {
        Self { self_pnn, nodes, vnn, databases, freeze, recovery, log_ring, tunables: ArcSwap::from_pointee(tunables) }
    }
}

#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError>;
}

fn out_of_scope(name: &str) -> Result<Vec<u8>, CtdbError> {
    Err(CtdbError::Remote(format!("{name} is handled by an external collaborator, not the core daemon")))
}

macro_rules! stub_handler {
    ($name:ident, $label:literal) => {
        struct $name;
        #[async_trait]
        impl ControlHandler for $name {
            async fn handle(&self, _ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
                out_of_scope($label)
            }
        }
    };
}

stub_handler!(TakeoverIpHandler, "takeover_ip");
stub_handler!(ReleaseIpHandler, "release_ip");
stub_handler!(RegisterServerIdHandler, "register_server_id");
stub_handler!(GetTcpTickleListHandler, "get_tcp_tickle_list");
stub_handler!(SetTcpTickleListHandler, "set_tcp_tickle_list");
stub_handler!(DumpMemoryHandler, "dump_memory");
stub_handler!(RunEventscriptsHandler, "run_eventscripts");
stub_handler!(RegisterNotifyHandler, "register_notify");
stub_handler!(DeregisterNotifyHandler, "deregister_notify");
stub_handler!(ProcessExistsHandler, "process_exists");

struct PingHandler;
#[async_trait]
impl ControlHandler for PingHandler {
    async fn handle(&self, _ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        Ok(Vec::new())
    }
}

struct StatusHandler;
#[async_trait]
impl ControlHandler for StatusHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let status = if ctx.recovery.is_recovery_active() { "RECOVERY" } else { "NORMAL" };
        Ok(format!("pnn={} status={status} generation={}", ctx.self_pnn, ctx.vnn.generation()).into_bytes())
    }
}

struct StatisticsHandler;
#[async_trait]
impl ControlHandler for StatisticsHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let num_dbs = ctx.databases.all().len();
        let connected = ctx.nodes.connected_pnns().len();
        Ok(format!("num_databases={num_dbs} connected_nodes={connected}").into_bytes())
    }
}

struct GetVnnMapHandler;
#[async_trait]
impl ControlHandler for GetVnnMapHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let map = ctx.vnn.current();
        let mut out = Vec::with_capacity(4 + map.map.len() * 4);
        out.extend_from_slice(&map.generation.to_ne_bytes());
        for pnn in &map.map {
            out.extend_from_slice(&pnn.to_ne_bytes());
        }
        Ok(out)
    }
}

struct SetVnnMapHandler;
#[async_trait]
impl ControlHandler for SetVnnMapHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        if data.len() < 4 || (data.len() - 4) % 4 != 0 {
            return Err(CtdbError::ProtocolViolation("malformed setvnnmap payload".into()));
        }
        let generation = u32::from_ne_bytes(data[0..4].try_into().unwrap());
        let map: Vec<Pnn> = data[4..].chunks_exact(4).map(|c| u32::from_ne_bytes(c.try_into().unwrap())).collect();
        ctx.vnn.install(VnnMap::new(generation, map));
        Ok(Vec::new())
    }
}

struct GetDbMapHandler;
#[async_trait]
impl ControlHandler for GetDbMapHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let names: Vec<String> =
            ctx.databases.all().iter().map(|db| format!("{}:{}:{}", db.id, db.name, u32::from(db.persistent))).collect();
        Ok(names.join(",").into_bytes())
    }
}

struct GetDbPathHandler;
#[async_trait]
impl ControlHandler for GetDbPathHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let db_id = u32::from_ne_bytes(data.try_into().map_err(|_| CtdbError::ProtocolViolation("bad db_id".into()))?);
        let db = ctx.databases.get(db_id).ok_or_else(|| CtdbError::Remote(format!("unknown database {db_id}")))?;
        Ok(db.path.to_string_lossy().into_owned().into_bytes())
    }
}

struct GetNodeMapHandler;
#[async_trait]
impl ControlHandler for GetNodeMapHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let lines: Vec<String> =
            ctx.nodes.all_sorted().iter().map(|n| format!("{}:{}:{:#x}", n.pnn, n.address, n.flags.bits())).collect();
        Ok(lines.join("\n").into_bytes())
    }
}

fn priority_from(data: &[u8]) -> Result<u32, CtdbError> {
    data.try_into().map(u32::from_ne_bytes).map_err(|_| CtdbError::ProtocolViolation("bad priority".into()))
}

struct FreezeHandler;
#[async_trait]
impl ControlHandler for FreezeHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        ctx.freeze.freeze(priority_from(data)?).await;
        Ok(Vec::new())
    }
}

struct ThawHandler;
#[async_trait]
impl ControlHandler for ThawHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        ctx.freeze.thaw(priority_from(data)?);
        Ok(Vec::new())
    }
}

struct GetRecModeHandler;
#[async_trait]
impl ControlHandler for GetRecModeHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        Ok(vec![u8::from(ctx.recovery.is_recovery_active())])
    }
}

/// `setrecmode` with `ACTIVE` triggers a recovery run (spec §4.8); the
/// reply is sent once recovery completes, not merely once it starts, so a
/// client blocking on this control observes the new generation.
struct SetRecModeHandler;
#[async_trait]
impl ControlHandler for SetRecModeHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let active = data.first().copied().unwrap_or(0) != 0;
        if active {
            let generation = ctx.recovery.run_recovery().await?;
            Ok(generation.to_ne_bytes().to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}

struct BanHandler;
#[async_trait]
impl ControlHandler for BanHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let pnn = priority_from(data)?;
        let mut flags = ctx.nodes.get(pnn).map(|n| n.flags).unwrap_or_default();
        flags.insert(NodeFlags::BANNED);
        ctx.nodes.set_flags(pnn, flags);
        Ok(Vec::new())
    }
}

struct UnbanHandler;
#[async_trait]
impl ControlHandler for UnbanHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let pnn = priority_from(data)?;
        let mut flags = ctx.nodes.get(pnn).map(|n| n.flags).unwrap_or_default();
        flags.remove(NodeFlags::BANNED);
        ctx.nodes.set_flags(pnn, flags);
        Ok(Vec::new())
    }
}

struct StopHandler;
#[async_trait]
impl ControlHandler for StopHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let mut flags = ctx.nodes.get(ctx.self_pnn).map(|n| n.flags).unwrap_or_default();
        flags.insert(NodeFlags::STOPPED);
        ctx.nodes.set_flags(ctx.self_pnn, flags);
        Ok(Vec::new())
    }
}

struct ContinueHandler;
#[async_trait]
impl ControlHandler for ContinueHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let mut flags = ctx.nodes.get(ctx.self_pnn).map(|n| n.flags).unwrap_or_default();
        flags.remove(NodeFlags::STOPPED);
        ctx.nodes.set_flags(ctx.self_pnn, flags);
        Ok(Vec::new())
    }
}

struct GetTunableHandler;
#[async_trait]
impl ControlHandler for GetTunableHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let name = String::from_utf8_lossy(data);
        let t = ctx.tunables.load();
        let value = match name.as_ref() {
            "MaxRedirectCount" => t.max_redirect_count,
            "MaxLACount" => t.max_lacount,
            "MaxQueueDepthDropMsg" => t.max_queue_depth_drop_msg as u32,
            "VacuumRepackThreshold" => t.vacuum_repack_threshold as u32,
            other => return Err(CtdbError::Remote(format!("unknown tunable {other}"))),
        };
        Ok(value.to_ne_bytes().to_vec())
    }
}

struct SetTunableHandler;
#[async_trait]
impl ControlHandler for SetTunableHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        if data.len() < 4 {
            return Err(CtdbError::ProtocolViolation("malformed settunable payload".into()));
        }
        let value = u32::from_ne_bytes(data[..4].try_into().unwrap());
        let name = String::from_utf8_lossy(&data[4..]);
        let mut t = **ctx.tunables.load();
        match name.as_ref() {
            "MaxRedirectCount" => t.max_redirect_count = value,
            "MaxLACount" => t.max_lacount = value,
            "MaxQueueDepthDropMsg" => t.max_queue_depth_drop_msg = value as usize,
            "VacuumRepackThreshold" => t.vacuum_repack_threshold = u64::from(value),
            other => return Err(CtdbError::Remote(format!("unknown tunable {other}"))),
        }
        ctx.tunables.store(Arc::new(t));
        Ok(Vec::new())
    }
}

struct ListTunablesHandler;
#[async_trait]
impl ControlHandler for ListTunablesHandler {
    async fn handle(&self, _ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        Ok(b"MaxRedirectCount,MaxLACount,MaxQueueDepthDropMsg,VacuumRepackThreshold".to_vec())
    }
}

struct GetLogHandler;
#[async_trait]
impl ControlHandler for GetLogHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        Ok(ctx.log_ring.snapshot().join("\n").into_bytes())
    }
}

struct ClearLogHandler;
#[async_trait]
impl ControlHandler for ClearLogHandler {
    async fn handle(&self, ctx: &ControlContext, _data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        ctx.log_ring.clear();
        Ok(Vec::new())
    }
}

struct WipeDatabaseHandler;
#[async_trait]
impl ControlHandler for WipeDatabaseHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        let db_id = u32::from_ne_bytes(data.try_into().map_err(|_| CtdbError::ProtocolViolation("bad db_id".into()))?);
        let db = ctx.databases.get(db_id).ok_or_else(|| CtdbError::Remote(format!("unknown database {db_id}")))?;
        db.store.wipe_all();
        Ok(Vec::new())
    }
}

struct DeleteRecordHandler;
#[async_trait]
impl ControlHandler for DeleteRecordHandler {
    async fn handle(&self, ctx: &ControlContext, data: &[u8]) -> Result<Vec<u8>, CtdbError> {
        if data.len() < 4 {
            return Err(CtdbError::ProtocolViolation("malformed delete_record payload".into()));
        }
        let db_id = u32::from_ne_bytes(data[..4].try_into().unwrap());
        let db = ctx.databases.get(db_id).ok_or_else(|| CtdbError::Remote(format!("unknown database {db_id}")))?;
        let guard = db.store.lock(&data[4..]).await;
        db.store.delete(&data[4..]);
        drop(guard);
        Ok(Vec::new())
    }
}

/// Table-driven dispatch over [`ControlOpcode`] (spec §9 "Dynamic
/// dispatch").
pub struct ControlDispatcher {
    handlers: HashMap<ControlOpcode, Arc<dyn ControlHandler>>,
}

impl ControlDispatcher {
    #[must_use]
    pub fn new() -> Self {
        let mut handlers: HashMap<ControlOpcode, Arc<dyn ControlHandler>> = HashMap::new();
        handlers.insert(ControlOpcode::Status, Arc::new(StatusHandler));
        handlers.insert(ControlOpcode::Statistics, Arc::new(StatisticsHandler));
        handlers.insert(ControlOpcode::GetVnnMap, Arc::new(GetVnnMapHandler));
        handlers.insert(ControlOpcode::SetVnnMap, Arc::new(SetVnnMapHandler));
        handlers.insert(ControlOpcode::GetDbMap, Arc::new(GetDbMapHandler));
        handlers.insert(ControlOpcode::GetDbPath, Arc::new(GetDbPathHandler));
        handlers.insert(ControlOpcode::GetNodeMap, Arc::new(GetNodeMapHandler));
        handlers.insert(ControlOpcode::Freeze, Arc::new(FreezeHandler));
        handlers.insert(ControlOpcode::Thaw, Arc::new(ThawHandler));
        handlers.insert(ControlOpcode::SetRecMode, Arc::new(SetRecModeHandler));
        handlers.insert(ControlOpcode::GetRecMode, Arc::new(GetRecModeHandler));
        handlers.insert(ControlOpcode::Ping, Arc::new(PingHandler));
        handlers.insert(ControlOpcode::Ban, Arc::new(BanHandler));
        handlers.insert(ControlOpcode::Unban, Arc::new(UnbanHandler));
        handlers.insert(ControlOpcode::Stop, Arc::new(StopHandler));
        handlers.insert(ControlOpcode::Continue, Arc::new(ContinueHandler));
        handlers.insert(ControlOpcode::GetTunable, Arc::new(GetTunableHandler));
        handlers.insert(ControlOpcode::SetTunable, Arc::new(SetTunableHandler));
        handlers.insert(ControlOpcode::ListTunables, Arc::new(ListTunablesHandler));
        handlers.insert(ControlOpcode::GetLog, Arc::new(GetLogHandler));
        handlers.insert(ControlOpcode::ClearLog, Arc::new(ClearLogHandler));
        handlers.insert(ControlOpcode::DeleteRecord, Arc::new(DeleteRecordHandler));
        handlers.insert(ControlOpcode::WipeDatabase, Arc::new(WipeDatabaseHandler));
        handlers.insert(ControlOpcode::TakeoverIp, Arc::new(TakeoverIpHandler));
        handlers.insert(ControlOpcode::ReleaseIp, Arc::new(ReleaseIpHandler));
        handlers.insert(ControlOpcode::RegisterServerId, Arc::new(RegisterServerIdHandler));
        handlers.insert(ControlOpcode::ProcessExists, Arc::new(ProcessExistsHandler));
        handlers.insert(ControlOpcode::GetTcpTickleList, Arc::new(GetTcpTickleListHandler));
        handlers.insert(ControlOpcode::SetTcpTickleList, Arc::new(SetTcpTickleListHandler));
        handlers.insert(ControlOpcode::DumpMemory, Arc::new(DumpMemoryHandler));
        handlers.insert(ControlOpcode::RunEventscripts, Arc::new(RunEventscriptsHandler));
        handlers.insert(ControlOpcode::RegisterNotify, Arc::new(RegisterNotifyHandler));
        handlers.insert(ControlOpcode::DeregisterNotify, Arc::new(DeregisterNotifyHandler));
        Self { handlers }
    }

    pub async fn dispatch(&self, ctx: &ControlContext, body: &ReqControlBody) -> Result<Vec<u8>, CtdbError> {
        let opcode = ControlOpcode::try_from_u32(body.opcode)?;
        let handler = self
            .handlers
            .get(&opcode)
            .ok_or_else(|| CtdbError::ProtocolViolation(format!("no handler registered for {opcode:?}")))?;
        metrics::counter!("ctdb_control_total", "opcode" => format!("{opcode:?}")).increment(1);
        handler.handle(ctx, &body.data).await
    }
}

impl Default for ControlDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ctdb_core::node::Node;
    use ctdb_core::tunables::Tunables as CoreTunables;
    use ctdb_core::wire::ReqControlBody;

    use super::*;
    use crate::call::CallEngine;
    use crate::db::Database;
    use crate::recovery::{LocalRecoverySource, RecoveryCoordinator, RecoverySource};
    use crate::transport::PeerLinks;

    fn context() -> ControlContext {
        let databases = Arc::new(Databases::new());
        databases.attach(Database::new(1, "test.tdb", false, 1, "/tmp/test.tdb".into()));
        let nodes = Arc::new(NodeTable::new());
        nodes.insert(Node::new(0, "a"));
        let vnn = Arc::new(VnnMapState::new(VnnMap::new(1, vec![0])));
        let freeze = Arc::new(FreezeManager::new(3));
        let links = Arc::new(PeerLinks::new(100));
        let call_engine = Arc::new(CallEngine::new(
            databases.clone(),
            vnn.clone(),
            links,
            CoreTunables::default(),
            0,
            freeze.clone(),
        ));
        let source: Arc<dyn RecoverySource> = Arc::new(LocalRecoverySource::new(databases.clone()));
        let recovery = Arc::new(RecoveryCoordinator::new(
            vnn.clone(),
            nodes.clone(),
            databases.clone(),
            freeze.clone(),
            call_engine,
            source,
            None,
        ));
        ControlContext::new(0, nodes, vnn, databases, freeze, recovery, Arc::new(LogRing::default()), CoreTunables::default())
    }

    fn req(opcode: ControlOpcode, data: Vec<u8>) -> ReqControlBody {
        ReqControlBody { opcode: opcode.as_u32(), srvid: 0, flags: 0, data }
    }

    #[tokio::test]
    async fn ping_succeeds() {
        let ctx = context();
        let dispatcher = ControlDispatcher::new();
        assert!(dispatcher.dispatch(&ctx, &req(ControlOpcode::Ping, vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn freeze_then_status_reports_normal_until_recovery() {
        let ctx = context();
        let dispatcher = ControlDispatcher::new();
        dispatcher.dispatch(&ctx, &req(ControlOpcode::Freeze, 1u32.to_ne_bytes().to_vec())).await.unwrap();
        assert!(ctx.freeze.is_frozen(1));
        let status = dispatcher.dispatch(&ctx, &req(ControlOpcode::Status, vec![])).await.unwrap();
        assert!(String::from_utf8_lossy(&status).contains("NORMAL"));
    }

    #[tokio::test]
    async fn takeover_ip_reports_out_of_scope() {
        let ctx = context();
        let dispatcher = ControlDispatcher::new();
        let err = dispatcher.dispatch(&ctx, &req(ControlOpcode::TakeoverIp, vec![])).await.unwrap_err();
        assert!(matches!(err, CtdbError::Remote(_)));
    }

    #[tokio::test]
    async fn set_then_get_tunable_roundtrips() {
        let ctx = context();
        let dispatcher = ControlDispatcher::new();
        let mut payload = 9u32.to_ne_bytes().to_vec();
        payload.extend_from_slice(b"MaxLACount");
        dispatcher.dispatch(&ctx, &req(ControlOpcode::SetTunable, payload)).await.unwrap();
        let got = dispatcher.dispatch(&ctx, &req(ControlOpcode::GetTunable, b"MaxLACount".to_vec())).await.unwrap();
        assert_eq!(u32::from_ne_bytes(got.try_into().unwrap()), 9);
    }

    #[tokio::test]
    async fn setrecmode_active_runs_recovery_and_bumps_generation() {
        let ctx = context();
        let dispatcher = ControlDispatcher::new();
        let reply = dispatcher.dispatch(&ctx, &req(ControlOpcode::SetRecMode, vec![1])).await.unwrap();
        let generation = u32::from_ne_bytes(reply.try_into().unwrap());
        assert_eq!(generation, 2);
        assert_eq!(ctx.vnn.generation(), 2);
    }
}
