//! Keel persistence: last-applied signature cache.
//! Memory-backed by default, SQLite when a path is configured.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use keel_core::{NodeId, ObjectKind};

/// Rows kept per object; older ones are rotated out on insert.
pub const KEEP_PER_OBJECT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub namespace: String,
    pub node: NodeId,
    pub signature: String,
    pub resource_version: String,
    pub ts: i64,
}

impl AppliedRecord {
    pub fn new(namespace: &str, node: &NodeId, signature: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            node: node.clone(),
            signature: signature.into(),
            resource_version: resource_version.into(),
            ts: now_ts(),
        }
    }
}

/// What the reconciler last wrote, per object.
///
/// A record whose signature is the desired one and whose resource version is
/// still the live one vouches for the live body, so the reconciler skips
/// re-comparing it. Any other record is history only.
pub trait SignatureCache: Send + Sync {
    fn put(&self, rec: AppliedRecord) -> Result<()>;
    /// Newest first, at most `limit` (default [`KEEP_PER_OBJECT`]).
    fn history(&self, namespace: &str, node: &NodeId, limit: Option<usize>) -> Result<Vec<AppliedRecord>>;

    fn last(&self, namespace: &str, node: &NodeId) -> Result<Option<AppliedRecord>> {
        Ok(self.history(namespace, node, Some(1))?.into_iter().next())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    rows: Mutex<BTreeMap<(String, NodeId), Vec<AppliedRecord>>>,
}

impl MemoryCache {
    pub fn new() -> Self { Self::default() }
}

impl SignatureCache for MemoryCache {
    fn put(&self, rec: AppliedRecord) -> Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let slot = rows.entry((rec.namespace.clone(), rec.node.clone())).or_default();
        slot.insert(0, rec);
        slot.truncate(KEEP_PER_OBJECT);
        Ok(())
    }

    fn history(&self, namespace: &str, node: &NodeId, limit: Option<usize>) -> Result<Vec<AppliedRecord>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let cap = limit.unwrap_or(KEEP_PER_OBJECT);
        Ok(rows
            .get(&(namespace.to_string(), node.clone()))
            .map(|v| v.iter().take(cap).cloned().collect())
            .unwrap_or_default())
    }
}

/// SQLite-backed cache. Synchronous; calls are short and infrequent.
pub struct SqliteCache {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteCache {
    /// Open at `KEEL_DB_PATH`, or `~/.keel/keel.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS applied_signature (
                namespace TEXT NOT NULL,
                kind      TEXT NOT NULL,
                name      TEXT NOT NULL,
                signature TEXT NOT NULL,
                rv        TEXT NOT NULL,
                ts        INTEGER NOT NULL
            )",
            [],
        )
        .context("creating applied_signature table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_applied_signature_obj_ts ON applied_signature(namespace, kind, name, ts DESC)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "signature cache opened");
        Ok(Self { db: Mutex::new(db) })
    }
}

fn kind_from_str(s: &str) -> Option<ObjectKind> { ObjectKind::ALL.into_iter().find(|k| k.as_str() == s) }

impl SignatureCache for SqliteCache {
    fn put(&self, rec: AppliedRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let tx = db.transaction()?;
        let kind = rec.node.kind.as_str();
        tx.execute(
            "INSERT INTO applied_signature(namespace, kind, name, signature, rv, ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&rec.namespace, kind, &rec.node.name, &rec.signature, &rec.resource_version, rec.ts),
        )?;
        tx.execute(
            "DELETE FROM applied_signature
             WHERE namespace = ?1 AND kind = ?2 AND name = ?3
               AND rowid NOT IN (
                   SELECT rowid FROM applied_signature
                   WHERE namespace = ?1 AND kind = ?2 AND name = ?3
                   ORDER BY ts DESC, rowid DESC LIMIT ?4
               )",
            (&rec.namespace, kind, &rec.node.name, KEEP_PER_OBJECT as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn history(&self, namespace: &str, node: &NodeId, limit: Option<usize>) -> Result<Vec<AppliedRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(KEEP_PER_OBJECT);
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT kind, signature, rv, ts FROM applied_signature
             WHERE namespace = ?1 AND kind = ?2 AND name = ?3
             ORDER BY ts DESC, rowid DESC LIMIT ?4",
        )?;
        let mut rows = stmt.query((namespace, node.kind.as_str(), &node.name, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            if kind_from_str(&kind) != Some(node.kind) {
                warn!(kind, "unexpected kind in signature cache row");
                continue;
            }
            out.push(AppliedRecord {
                namespace: namespace.to_string(),
                node: node.clone(),
                signature: row.get(1)?,
                resource_version: row.get(2)?,
                ts: row.get(3)?,
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn rec(i: i64) -> AppliedRecord {
        AppliedRecord { ts: i, ..AppliedRecord::new("ns", &NodeId::secret("db-creds"), format!("sig-{}", i), format!("rv-{}", i)) }
    }

    #[test]
    fn sqlite_put_history_rotates() {
        let path = temp_db();
        let s = SqliteCache::open(&path).unwrap();
        for i in 0..5 {
            s.put(rec(i)).unwrap();
        }
        let rows = s.history("ns", &NodeId::secret("db-creds"), None).unwrap();
        assert_eq!(rows.iter().map(|r| r.signature.as_str()).collect::<Vec<_>>(), ["sig-4", "sig-3", "sig-2"]);
        assert_eq!(s.last("ns", &NodeId::secret("db-creds")).unwrap().unwrap().resource_version, "rv-4");
        assert!(s.history("other", &NodeId::secret("db-creds"), None).unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn memory_cache_keeps_newest_first() {
        let c = MemoryCache::new();
        for i in 0..4 {
            c.put(rec(i)).unwrap();
        }
        let rows = c.history("ns", &NodeId::secret("db-creds"), None).unwrap();
        assert_eq!(rows.len(), KEEP_PER_OBJECT);
        assert_eq!(rows[0].signature, "sig-3");
        assert!(c.last("ns", &NodeId::config("db-creds")).unwrap().is_none());
    }
}
