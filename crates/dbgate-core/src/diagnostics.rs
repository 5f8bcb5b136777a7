//! Text and JSON dumps of servers, pools and DCBs.
//!
//! Every function here only reads; none of them changes pool membership,
//! counters or the zombie queue.

use std::fmt::Write;
use std::time::Instant;

use serde::Serialize;

use crate::manager::DcbManager;
use crate::registry::ServerRegistry;
use crate::server::{Server, ServerStatus};

/// One server in the JSON dump.
///
/// Scalar values are rendered as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    /// Address.
    pub server: String,
    /// Rendered status.
    pub status: String,
    /// Protocol module.
    pub protocol: String,
    /// Port.
    pub port: String,
    /// Version string, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Node id.
    pub node_id: String,
    /// Master node id.
    pub master_id: String,
    /// Slave node ids, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_ids: Option<Vec<i64>>,
    /// Replication depth.
    pub repl_depth: String,
    /// Replication lag, for slaves with a measured lag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_delay: Option<String>,
    /// Last replication heartbeat, when seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_repl_heartbeat: Option<String>,
    /// Connections opened since start.
    pub total_connections: String,
    /// Connections in use.
    pub current_connections: String,
    /// Operations in progress.
    pub current_ops: String,
}

impl ServerSummary {
    /// Summarize one server.
    #[must_use]
    pub fn of(server: &Server) -> Self {
        let status = server.status();
        let repl = server.replication();
        let stats = server.stats();
        let is_slave = status.intersects(ServerStatus::SLAVE | ServerStatus::RELAY_MASTER);

        Self {
            server: server.address(),
            status: status.to_string(),
            protocol: server.protocol(),
            port: server.port().to_string(),
            version: server.version_string(),
            node_id: repl.node_id.to_string(),
            master_id: repl.master_id.to_string(),
            slave_ids: (!repl.slave_ids.is_empty()).then(|| repl.slave_ids.clone()),
            repl_depth: repl.depth.to_string(),
            slave_delay: (is_slave && repl.lag >= 0).then(|| repl.lag.to_string()),
            last_repl_heartbeat: (repl.last_heartbeat > 0).then(|| repl.last_heartbeat.to_string()),
            total_connections: stats.n_connections.to_string(),
            current_connections: stats.n_current.to_string(),
            current_ops: stats.n_current_ops.to_string(),
        }
    }
}

/// Every registered server as a pretty-printed JSON array.
pub fn servers_json(registry: &ServerRegistry) -> serde_json::Result<String> {
    let servers: Vec<_> = registry
        .snapshot()
        .iter()
        .map(|s| ServerSummary::of(s))
        .collect();
    serde_json::to_string_pretty(&servers)
}

const TABLE_RULE: &str =
    "-------------------+-----------------+-------+-------------+--------------------";

/// Tabular server list.
#[must_use]
pub fn server_table(registry: &ServerRegistry) -> String {
    let servers = registry.snapshot();
    let mut out = String::new();
    if servers.is_empty() {
        return out;
    }

    let _ = writeln!(out, "Servers.");
    let _ = writeln!(out, "{TABLE_RULE}");
    let _ = writeln!(
        out,
        "{:<18} | {:<15} | Port  | Connections | {:<20}",
        "Server", "Address", "Status"
    );
    let _ = writeln!(out, "{TABLE_RULE}");
    for server in servers {
        let _ = writeln!(
            out,
            "{:<18} | {:<15} | {:>5} | {:>11} | {}",
            server.unique_name(),
            server.address(),
            server.port(),
            server.stats().n_current,
            server.status()
        );
    }
    let _ = writeln!(out, "{TABLE_RULE}");
    out
}

/// Detailed description of one server, including its pool.
#[must_use]
pub fn server_detail(server: &Server) -> String {
    let status = server.status();
    let repl = server.replication();
    let stats = server.stats();
    let mut out = String::new();

    let _ = writeln!(out, "Server {}", server.unique_name());
    let _ = writeln!(out, "\tServer:                              {}", server.address());
    let _ = writeln!(out, "\tStatus:                              {status}");
    let _ = writeln!(out, "\tProtocol:                            {}", server.protocol());
    let _ = writeln!(out, "\tPort:                                {}", server.port());
    if let Some(version) = server.version_string() {
        let _ = writeln!(out, "\tServer Version:                      {version}");
    }
    let _ = writeln!(out, "\tNode Id:                             {}", repl.node_id);
    let _ = writeln!(out, "\tMaster Id:                           {}", repl.master_id);
    if !repl.slave_ids.is_empty() {
        let ids: Vec<_> = repl.slave_ids.iter().map(i64::to_string).collect();
        let _ = writeln!(out, "\tSlave Ids:                           {}", ids.join(", "));
    }
    let _ = writeln!(out, "\tRepl Depth:                          {}", repl.depth);
    if status.intersects(ServerStatus::SLAVE | ServerStatus::RELAY_MASTER) && repl.lag >= 0 {
        let _ = writeln!(out, "\tSlave delay:                         {}", repl.lag);
    }
    if repl.last_heartbeat > 0 {
        let _ = writeln!(out, "\tLast Repl Heartbeat:                 {}", repl.last_heartbeat);
    }
    let parameters = server.parameters();
    if !parameters.is_empty() {
        let _ = writeln!(out, "\tServer Parameters:");
        for (name, value) in &parameters {
            let _ = writeln!(out, "\t                                       {name}\t{value}");
        }
    }
    let _ = writeln!(out, "\tNumber of connections:               {}", stats.n_connections);
    let _ = writeln!(out, "\tCurrent no. of conns:                {}", stats.n_current);
    let _ = writeln!(out, "\tCurrent no. of operations:           {}", stats.n_current_ops);
    if server.persist_pool_max() > 0 {
        let measured = server.pool_clean(false, Instant::now()).live;
        let _ = writeln!(out, "\tPersistent pool size:                {}", stats.n_persistent);
        let _ = writeln!(out, "\tPersistent measured pool size:       {measured}");
        let _ = writeln!(out, "\tPersistent actual size max:          {}", server.pool_max_observed());
        let _ = writeln!(out, "\tPersistent pool size limit:          {}", server.persist_pool_max());
        let _ = writeln!(
            out,
            "\tPersistent max time (secs):          {}",
            server.persist_max_time().as_secs()
        );
    }
    out
}

/// Live DCBs, one per line.
#[must_use]
pub fn dcb_table(manager: &DcbManager) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "DCBs.");
    let _ = writeln!(
        out,
        "{:>6} | {:<24} | {:<24} | {:>5} | {:<16} | {}",
        "Id", "Role", "State", "Fd", "Protocol", "User"
    );
    for dcb in manager.dcbs() {
        let _ = writeln!(
            out,
            "{:>6} | {:<24} | {:<24} | {:>5} | {:<16} | {}",
            dcb.id(),
            dcb.role(),
            dcb.state(),
            dcb.fd(),
            dcb.protocol_name().unwrap_or("-"),
            dcb.user().unwrap_or_default()
        );
    }
    out
}

/// Retired DCBs that have not been released yet.
#[must_use]
pub fn zombie_table(manager: &DcbManager) -> String {
    let zombies = manager.zombie_list();
    let mut out = String::new();
    let _ = writeln!(out, "Zombie DCBs: {}", zombies.len());
    for z in zombies {
        let _ = writeln!(
            out,
            "{:>6} | {:<24} | epoch {:>8} | workers {:#018x}",
            z.id, z.role, z.epoch, z.workers
        );
    }
    out
}
