//! Node registry: one record per worker host sharing the queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::quiet::QuietPeriod;

/// Liveness state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Suspended,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "suspended" => Ok(NodeStatus::Suspended),
            other => Err(format!("unknown node status '{}'", other)),
        }
    }
}

impl ToSql for NodeStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for NodeStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Static hardware details captured when a node is first registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub cpu_threads: u32,
    pub cpu_details: String,
}

impl NodeMetadata {
    /// Detects the logical CPU count and CPU brand of this host.
    pub fn detect() -> Self {
        use sysinfo::System;

        let mut sys = System::new();
        sys.refresh_cpu_all();

        let cpu_details = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            cpu_threads: num_cpus::get() as u32,
            cpu_details,
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub status: NodeStatus,
    pub became_online_at: Option<DateTime<Utc>>,
    pub became_offline_at: Option<DateTime<Utc>>,
    pub cpu_threads: u32,
    pub cpu_details: String,
    pub quiet_periods: Vec<QuietPeriod>,
}

impl Node {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let periods: Option<String> = row.get("quiet_periods")?;
        let quiet_periods = match periods {
            Some(text) => serde_json::from_str(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            id: row.get("id")?,
            hostname: row.get("hostname")?,
            status: row.get("status")?,
            became_online_at: row.get("became_online_at")?,
            became_offline_at: row.get("became_offline_at")?,
            cpu_threads: row.get::<_, i64>("cpu_threads")? as u32,
            cpu_details: row.get("cpu_details")?,
            quiet_periods,
        })
    }

    /// Moves to `status`, stamping the matching liveness timestamp.
    ///
    /// ONLINE and OFFLINE each set their own timestamp and clear the other;
    /// SUSPENDED leaves both alone.
    fn apply_status(&mut self, status: NodeStatus, now: DateTime<Utc>) {
        self.status = status;
        match status {
            NodeStatus::Online => {
                self.became_online_at = Some(now);
                self.became_offline_at = None;
            }
            NodeStatus::Offline => {
                self.became_offline_at = Some(now);
                self.became_online_at = None;
            }
            NodeStatus::Suspended => {}
        }
    }
}

/// Lookup key for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKey {
    ById(String),
    ByHostname(String),
}

impl NodeKey {
    fn clause(&self) -> &'static str {
        match self {
            NodeKey::ById(_) => "id = ?1",
            NodeKey::ByHostname(_) => "hostname = ?1",
        }
    }

    fn value(&self) -> &str {
        match self {
            NodeKey::ById(v) | NodeKey::ByHostname(v) => v,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::ById(id) => write!(f, "node {}", id),
            NodeKey::ByHostname(host) => write!(f, "node on host {}", host),
        }
    }
}

const NODE_COLUMNS: &str = "id, hostname, status, became_online_at, became_offline_at, \
                            cpu_threads, cpu_details, quiet_periods";

fn find_node(conn: &Connection, key: &NodeKey) -> Result<Option<Node>, StoreError> {
    let sql = format!("SELECT {} FROM nodes WHERE {} LIMIT 1", NODE_COLUMNS, key.clause());
    Ok(conn
        .query_row(&sql, params![key.value()], Node::from_row)
        .optional()?)
}

fn require_node(conn: &Connection, key: &NodeKey) -> Result<Node, StoreError> {
    find_node(conn, key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))
}

fn write_status(conn: &Connection, node: &Node) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE nodes SET status = ?2, became_online_at = ?3, became_offline_at = ?4
         WHERE id = ?1",
        params![node.id, node.status, node.became_online_at, node.became_offline_at],
    )?;
    Ok(())
}

/// Handle to the `nodes` table.
#[derive(Clone)]
pub struct NodeRegistry {
    db: Database,
}

impl NodeRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers `hostname` with `status`, detecting metadata for new records.
    pub fn upsert(&self, id: &str, hostname: &str, status: NodeStatus) -> Result<Node, StoreError> {
        self.upsert_with_metadata(id, hostname, status, NodeMetadata::detect)
    }

    /// Like [`upsert`](Self::upsert) with a caller-supplied metadata source.
    ///
    /// `metadata` is only called when no record exists for `hostname`. An
    /// existing record keeps its original id and metadata.
    pub fn upsert_with_metadata<F>(
        &self,
        id: &str,
        hostname: &str,
        status: NodeStatus,
        metadata: F,
    ) -> Result<Node, StoreError>
    where
        F: FnOnce() -> NodeMetadata,
    {
        let key = NodeKey::ByHostname(hostname.to_string());
        self.db.exclusive(|tx| {
            let now = Utc::now();
            if let Some(mut node) = find_node(tx, &key)? {
                node.apply_status(status, now);
                write_status(tx, &node)?;
                return Ok(node);
            }

            let meta = metadata();
            let mut node = Node {
                id: id.to_string(),
                hostname: hostname.to_string(),
                status,
                became_online_at: None,
                became_offline_at: None,
                cpu_threads: meta.cpu_threads,
                cpu_details: meta.cpu_details,
                quiet_periods: Vec::new(),
            };
            node.apply_status(status, now);

            tx.execute(
                "INSERT INTO nodes (id, hostname, status, became_online_at, became_offline_at,
                 cpu_threads, cpu_details, quiet_periods)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    node.id,
                    node.hostname,
                    node.status,
                    node.became_online_at,
                    node.became_offline_at,
                    node.cpu_threads as i64,
                    node.cpu_details,
                ],
            )?;
            tracing::info!(node = %node.id, hostname = %node.hostname, "Registered node");
            Ok(node)
        })
    }

    /// Sets the status of an existing node.
    pub fn set_status(&self, key: &NodeKey, status: NodeStatus) -> Result<Node, StoreError> {
        self.db.exclusive(|tx| {
            let mut node = require_node(tx, key)?;
            node.apply_status(status, Utc::now());
            write_status(tx, &node)?;
            Ok(node)
        })
    }

    /// Deletes a node. With `safe`, only an OFFLINE node may be removed.
    pub fn remove(&self, key: &NodeKey, safe: bool) -> Result<Node, StoreError> {
        self.db.exclusive(|tx| {
            let node = require_node(tx, key)?;
            if safe && node.status != NodeStatus::Offline {
                return Err(StoreError::InvalidState(format!(
                    "{} is {}, only offline nodes can be removed",
                    key, node.status
                )));
            }
            tx.execute("DELETE FROM nodes WHERE id = ?1", params![node.id])?;
            Ok(node)
        })
    }

    pub fn set_quiet_periods(
        &self,
        key: &NodeKey,
        periods: &[QuietPeriod],
    ) -> Result<Node, StoreError> {
        let encoded = serde_json::to_string(periods)?;
        self.db.exclusive(|tx| {
            let mut node = require_node(tx, key)?;
            tx.execute(
                "UPDATE nodes SET quiet_periods = ?2 WHERE id = ?1",
                params![node.id, encoded],
            )?;
            node.quiet_periods = periods.to_vec();
            Ok(node)
        })
    }

    pub fn quiet_periods(&self, key: &NodeKey) -> Result<Vec<QuietPeriod>, StoreError> {
        self.db
            .with_conn(|conn| Ok(require_node(conn, key)?.quiet_periods))
    }

    pub fn clear_quiet_periods(&self, key: &NodeKey) -> Result<Node, StoreError> {
        self.db.exclusive(|tx| {
            let mut node = require_node(tx, key)?;
            tx.execute(
                "UPDATE nodes SET quiet_periods = NULL WHERE id = ?1",
                params![node.id],
            )?;
            node.quiet_periods.clear();
            Ok(node)
        })
    }

    /// Any node, optionally restricted to one status.
    pub fn peek(&self, status: Option<NodeStatus>) -> Result<Option<Node>, StoreError> {
        self.db.with_conn(|conn| {
            let node = match status {
                Some(status) => conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM nodes WHERE status = ?1 ORDER BY rowid LIMIT 1",
                            NODE_COLUMNS
                        ),
                        params![status],
                        Node::from_row,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &format!("SELECT {} FROM nodes ORDER BY rowid LIMIT 1", NODE_COLUMNS),
                        [],
                        Node::from_row,
                    )
                    .optional()?,
            };
            Ok(node)
        })
    }

    pub fn get(&self, key: &NodeKey) -> Result<Option<Node>, StoreError> {
        self.db.with_conn(|conn| find_node(conn, key))
    }

    pub fn list(&self) -> Result<Vec<Node>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM nodes ORDER BY hostname",
                NODE_COLUMNS
            ))?;
            let nodes = stmt
                .query_map([], Node::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Database::open_in_memory().unwrap())
    }

    fn meta() -> NodeMetadata {
        NodeMetadata {
            cpu_threads: 8,
            cpu_details: "Test CPU".to_string(),
        }
    }

    fn register(registry: &NodeRegistry, id: &str, host: &str) -> Node {
        registry
            .upsert_with_metadata(id, host, NodeStatus::Online, meta)
            .unwrap()
    }

    #[test]
    fn test_status_strings() {
        for status in [NodeStatus::Online, NodeStatus::Offline, NodeStatus::Suspended] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("gone".parse::<NodeStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&NodeStatus::Suspended).unwrap(),
            "\"suspended\""
        );
    }

    #[test]
    fn test_detect_metadata_reports_threads() {
        let meta = NodeMetadata::detect();
        assert!(meta.cpu_threads >= 1);
        assert!(!meta.cpu_details.is_empty());
    }

    #[test]
    fn test_upsert_creates_online_node() {
        let registry = registry();
        let node = register(&registry, "n1", "host-a");

        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.became_online_at.is_some());
        assert!(node.became_offline_at.is_none());
        assert_eq!(node.cpu_threads, 8);
        assert_eq!(node.cpu_details, "Test CPU");
        assert!(node.quiet_periods.is_empty());

        let stored = registry.get(&NodeKey::ById("n1".into())).unwrap().unwrap();
        assert_eq!(stored, node);
    }

    #[test]
    fn test_upsert_timestamps_follow_transitions() {
        let registry = registry();
        register(&registry, "n1", "host-a");

        let offline = registry
            .upsert_with_metadata("n2", "host-a", NodeStatus::Offline, meta)
            .unwrap();
        // Existing hostname keeps the original id.
        assert_eq!(offline.id, "n1");
        assert_eq!(offline.status, NodeStatus::Offline);
        assert!(offline.became_offline_at.is_some());
        assert!(offline.became_online_at.is_none());

        let online = registry
            .upsert_with_metadata("n3", "host-a", NodeStatus::Online, || {
                panic!("metadata must not be re-detected for a known host")
            })
            .unwrap();
        assert!(online.became_online_at.is_some());
        assert!(online.became_offline_at.is_none());

        let suspended = registry
            .set_status(&NodeKey::ByHostname("host-a".into()), NodeStatus::Suspended)
            .unwrap();
        assert_eq!(suspended.status, NodeStatus::Suspended);
        assert_eq!(suspended.became_online_at, online.became_online_at);
        assert!(suspended.became_offline_at.is_none());

        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn test_set_status_unknown_node() {
        let registry = registry();
        assert!(matches!(
            registry.set_status(&NodeKey::ById("nope".into()), NodeStatus::Offline),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_safe_requires_offline() {
        let registry = registry();
        register(&registry, "n1", "host-a");
        let key = NodeKey::ById("n1".into());

        assert!(matches!(
            registry.remove(&key, true),
            Err(StoreError::InvalidState(_))
        ));

        registry.set_status(&key, NodeStatus::Offline).unwrap();
        let removed = registry.remove(&key, true).unwrap();
        assert_eq!(removed.hostname, "host-a");
        assert!(registry.is_empty().unwrap());

        assert!(matches!(registry.remove(&key, false), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_remove_unsafe_deletes_online_node() {
        let registry = registry();
        register(&registry, "n1", "host-a");
        registry
            .remove(&NodeKey::ByHostname("host-a".into()), false)
            .unwrap();
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn test_quiet_periods_round_trip() {
        let registry = registry();
        register(&registry, "n1", "host-a");
        let key = NodeKey::ById("n1".into());

        let periods: Vec<QuietPeriod> = vec![
            "22:00-23:00".parse().unwrap(),
            "01:30-02:00".parse().unwrap(),
        ];
        let node = registry.set_quiet_periods(&key, &periods).unwrap();
        assert_eq!(node.quiet_periods, periods);
        assert_eq!(registry.quiet_periods(&key).unwrap(), periods);

        registry.clear_quiet_periods(&key).unwrap();
        assert!(registry.quiet_periods(&key).unwrap().is_empty());

        let missing = NodeKey::ById("nope".into());
        assert!(matches!(
            registry.quiet_periods(&missing),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            registry.set_quiet_periods(&missing, &periods),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_peek_and_list() {
        let registry = registry();
        assert!(registry.peek(None).unwrap().is_none());

        register(&registry, "n1", "host-b");
        register(&registry, "n2", "host-a");
        registry
            .set_status(&NodeKey::ById("n2".into()), NodeStatus::Suspended)
            .unwrap();

        assert_eq!(registry.peek(None).unwrap().unwrap().id, "n1");
        assert_eq!(
            registry.peek(Some(NodeStatus::Suspended)).unwrap().unwrap().id,
            "n2"
        );
        assert!(registry.peek(Some(NodeStatus::Offline)).unwrap().is_none());

        let hosts: Vec<String> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|n| n.hostname)
            .collect();
        assert_eq!(hosts, vec!["host-a", "host-b"]);
    }
}
