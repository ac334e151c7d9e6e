//! `ctdb-tool` — the administrative CLI (spec §6.4): a thin client of the
//! control plane over the local socket, never a core subsystem in its own
//! right (spec §1).

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use ctdb_core::node::CURRENT_NODE;
use ctdb_core::wire::{
    ConnectWaitReplyBody, ControlOpcode, CtdbCodec, Frame, Opcode, PacketHeader, RegisterBody,
    RegisterReplyBody, ReplyControlBody, ReqControlBody,
};
use ctdb_core::CtdbError;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Exit codes matching the original tool's convention (spec §6.4).
const EXIT_SUCCESS: i32 = 0;
const EXIT_COMMAND_FAILURE: i32 = 10;
const EXIT_TIMEOUT: i32 = 20;
const EXIT_UNKNOWN_NODE: i32 = 21;
const EXIT_DISCONNECTED_NODE: i32 = 22;

#[derive(Debug, Parser)]
#[command(name = "ctdb-tool", version, about = "Administrative CLI for ctdbd")]
struct Cli {
    /// Local client socket to connect to (spec §6.2).
    #[arg(long, default_value = "/tmp/ctdb.socket")]
    socket: PathBuf,

    /// Control reply timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print this node's recovery status and generation.
    Status,
    /// Print this node's pnn, as seen by the local daemon.
    Pnn,
    /// Print the current vnn_map generation and hash-bucket table.
    GetVnnMap,
    /// Install a new vnn_map: generation followed by one pnn per bucket.
    SetVnnMap { generation: u32, map: Vec<u32> },
    /// List attached databases.
    GetDbMap,
    /// Attach a database by name, creating it if not already attached.
    Attach {
        name: String,
        #[arg(long)]
        persistent: bool,
    },
    /// Print the attached-database table (record-level dump is out of
    /// scope for this build's in-memory store).
    CatDb { name: String },
    /// Round-trip a no-op control.
    Ping,
    /// Freeze all databases of a priority.
    Freeze { priority: u32 },
    /// Thaw all databases of a priority.
    Thaw { priority: u32 },
    /// Set recovery mode: pass `active` to trigger a recovery run.
    SetRecMode { mode: RecMode },
    /// Print whether a recovery is currently active.
    GetRecMode,
    /// Trigger a recovery run and print the resulting generation.
    Recover,
    /// Mark a node banned.
    Ban { pnn: u32 },
    /// Clear a node's banned flag.
    Unban { pnn: u32 },
    /// Administratively stop this node.
    Stop,
    /// Clear this node's administratively-stopped flag.
    Continue,
    /// Wipe a database's contents.
    WipeDb { name: String },
    /// Read a tunable.
    GetVar { name: String },
    /// Set a tunable.
    SetVar { name: String, value: u32 },
    /// List tunable names.
    ListVars,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum RecMode {
    Normal,
    Active,
}

struct Client {
    framed: Framed<UnixStream, CtdbCodec>,
    next_reqid: u32,
    timeout: Duration,
}

impl Client {
    async fn connect(socket: &PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Self { framed: Framed::new(stream, CtdbCodec), next_reqid: 1, timeout })
    }

    fn reqid(&mut self) -> u32 {
        let id = self.next_reqid;
        self.next_reqid += 1;
        id
    }

    async fn roundtrip(&mut self, operation: Opcode, body: Vec<u8>) -> anyhow::Result<Frame> {
        let reqid = self.reqid();
        let header = PacketHeader::new(operation, 0, CURRENT_NODE, 0, reqid);
        self.framed.send(Frame::new(header, Bytes::from(body))).await?;
        let reply = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| CliError::Timeout)?
            .ok_or(CliError::Timeout)??;
        Ok(reply)
    }

    async fn control(&mut self, opcode: ControlOpcode, data: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let body = ReqControlBody { opcode: opcode.as_u32(), srvid: 0, flags: 0, data };
        let reply = self.roundtrip(Opcode::ReqControl, body.encode()).await?;
        let body = ReplyControlBody::decode(&reply.body)?;
        if body.status != 0 {
            anyhow::bail!(CliError::Remote(body.error.unwrap_or_default(), body.status));
        }
        Ok(body.data)
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("{0}")]
    Remote(String, i32),
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Timeout => EXIT_TIMEOUT,
            CliError::Remote(message, _) if message.contains("unknown node") || message.contains("unknown database") => {
                EXIT_UNKNOWN_NODE
            }
            CliError::Remote(message, _) if message.contains("disconnected") => EXIT_DISCONNECTED_NODE,
            CliError::Remote(..) => EXIT_COMMAND_FAILURE,
        };
    }
    if let Some(ctdb_err) = err.downcast_ref::<CtdbError>() {
        return match ctdb_err {
            CtdbError::Timeout => EXIT_TIMEOUT,
            _ => EXIT_COMMAND_FAILURE,
        };
    }
    EXIT_COMMAND_FAILURE
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(err) => {
            eprintln!("ctdb-tool: {err}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut client = Client::connect(&cli.socket, timeout).await?;

    match cli.command {
        Command::Status => {
            let data = client.control(ControlOpcode::Status, Vec::new()).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Pnn => {
            let reply = client.roundtrip(Opcode::ConnectWait, Vec::new()).await?;
            let body = ConnectWaitReplyBody::decode(&reply.body)?;
            println!("{}", body.pnn);
        }
        Command::GetVnnMap => {
            let data = client.control(ControlOpcode::GetVnnMap, Vec::new()).await?;
            if data.len() < 4 || (data.len() - 4) % 4 != 0 {
                anyhow::bail!("malformed getvnnmap reply");
            }
            let generation = u32::from_ne_bytes(data[..4].try_into().unwrap());
            let map: Vec<u32> = data[4..].chunks_exact(4).map(|c| u32::from_ne_bytes(c.try_into().unwrap())).collect();
            println!("generation: {generation}");
            for (bucket, pnn) in map.iter().enumerate() {
                println!("hash bucket {bucket} -> lmaster {pnn}");
            }
        }
        Command::SetVnnMap { generation, map } => {
            let mut data = generation.to_ne_bytes().to_vec();
            for pnn in map {
                data.extend_from_slice(&pnn.to_ne_bytes());
            }
            client.control(ControlOpcode::SetVnnMap, data).await?;
            println!("vnn_map installed at generation {generation}");
        }
        Command::GetDbMap => {
            let data = client.control(ControlOpcode::GetDbMap, Vec::new()).await?;
            for entry in String::from_utf8_lossy(&data).split(',').filter(|e| !e.is_empty()) {
                println!("{entry}");
            }
        }
        Command::Attach { name, persistent } => {
            let body = RegisterBody { persistent, name: name.clone() };
            let reply = client.roundtrip(Opcode::Register, body.encode()).await?;
            let body = RegisterReplyBody::decode(&reply.body)?;
            println!("{name}: db_id={} path={}", body.db_id, body.path);
        }
        Command::CatDb { name } => {
            let data = client.control(ControlOpcode::GetDbMap, Vec::new()).await?;
            let found = String::from_utf8_lossy(&data).split(',').any(|entry| entry.split(':').next() == Some(name.as_str()))
                || String::from_utf8_lossy(&data).contains(&name);
            if found {
                println!("{name}: attached (per-record dump not exposed by this build's control plane)");
            } else {
                anyhow::bail!(CliError::Remote(format!("unknown database {name}"), -3));
            }
        }
        Command::Ping => {
            client.control(ControlOpcode::Ping, Vec::new()).await?;
            println!("pong");
        }
        Command::Freeze { priority } => {
            client.control(ControlOpcode::Freeze, priority.to_ne_bytes().to_vec()).await?;
            println!("priority {priority} frozen");
        }
        Command::Thaw { priority } => {
            client.control(ControlOpcode::Thaw, priority.to_ne_bytes().to_vec()).await?;
            println!("priority {priority} thawed");
        }
        Command::SetRecMode { mode } => {
            let active = matches!(mode, RecMode::Active);
            let data = client.control(ControlOpcode::SetRecMode, vec![u8::from(active)]).await?;
            if active && data.len() == 4 {
                println!("recovery complete, generation {}", u32::from_ne_bytes(data.try_into().unwrap()));
            } else {
                println!("recmode set");
            }
        }
        Command::GetRecMode => {
            let data = client.control(ControlOpcode::GetRecMode, Vec::new()).await?;
            println!("{}", if data.first().copied().unwrap_or(0) != 0 { "RECOVERY" } else { "NORMAL" });
        }
        Command::Recover => {
            let data = client.control(ControlOpcode::SetRecMode, vec![1]).await?;
            let generation = u32::from_ne_bytes(data.try_into().map_err(|_| anyhow::anyhow!("malformed recover reply"))?);
            println!("recovery complete, generation {generation}");
        }
        Command::Ban { pnn } => {
            client.control(ControlOpcode::Ban, pnn.to_ne_bytes().to_vec()).await?;
            println!("node {pnn} banned");
        }
        Command::Unban { pnn } => {
            client.control(ControlOpcode::Unban, pnn.to_ne_bytes().to_vec()).await?;
            println!("node {pnn} unbanned");
        }
        Command::Stop => {
            client.control(ControlOpcode::Stop, Vec::new()).await?;
            println!("node stopped");
        }
        Command::Continue => {
            client.control(ControlOpcode::Continue, Vec::new()).await?;
            println!("node continued");
        }
        Command::WipeDb { name } => {
            let body = RegisterBody { persistent: false, name: name.clone() };
            let reply = client.roundtrip(Opcode::Register, body.encode()).await?;
            let body = RegisterReplyBody::decode(&reply.body)?;
            client.control(ControlOpcode::WipeDatabase, body.db_id.to_ne_bytes().to_vec()).await?;
            println!("{name}: wiped");
        }
        Command::GetVar { name } => {
            let data = client.control(ControlOpcode::GetTunable, name.clone().into_bytes()).await?;
            let value = u32::from_ne_bytes(data.try_into().map_err(|_| anyhow::anyhow!("malformed getvar reply"))?);
            println!("{name} = {value}");
        }
        Command::SetVar { name, value } => {
            let mut data = value.to_ne_bytes().to_vec();
            data.extend_from_slice(name.as_bytes());
            client.control(ControlOpcode::SetTunable, data).await?;
            println!("{name} = {value}");
        }
        Command::ListVars => {
            let data = client.control(ControlOpcode::ListTunables, Vec::new()).await?;
            for name in String::from_utf8_lossy(&data).split(',') {
                println!("{name}");
            }
        }
    }
    Ok(())
}
