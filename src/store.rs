// Shoal - Centralized-directory peer-to-peer file sharing over a length-prefixed JSON protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::ShoalResult;
use crate::protocol::{FileEntry, RegisterOutcome, SharedFile};

/// Persistent peer×file index.
///
/// One row per `(fname, hostname, ip, port)`; a republish under the same key
/// updates `lname`, `file_size` and `last_modified` in place. Rows survive
/// server restarts; every operation runs inside SQLite's transactional
/// guarantees and returns a fully materialized result.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the index at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> ShoalResult<Self> {
        let store = Self::from_connection(Connection::open(path.as_ref())?)?;

        info!("Metadata store ready at {}", path.as_ref().display());

        Ok(store)
    }

    /// In-memory index, used by tests and throwaway servers.
    pub fn open_in_memory() -> ShoalResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> ShoalResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_index (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                fname         TEXT NOT NULL,
                hostname      TEXT NOT NULL,
                ip            TEXT NOT NULL,
                port          INTEGER NOT NULL,
                lname         TEXT,
                file_size     INTEGER,
                last_modified TEXT,
                UNIQUE(fname, hostname, ip, port)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Recover the connection even if a previous holder panicked.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upserts an entry by its `(fname, hostname, ip, port)` key.
    pub fn register(&self, entry: &FileEntry) -> ShoalResult<RegisterOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existed = tx
            .query_row(
                "SELECT 1 FROM file_index
                 WHERE fname = ?1 AND hostname = ?2 AND ip = ?3 AND port = ?4",
                params![entry.fname, entry.hostname, entry.ip, entry.port],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO file_index (fname, hostname, ip, port, lname, file_size, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(fname, hostname, ip, port) DO UPDATE SET
                 lname = excluded.lname,
                 file_size = excluded.file_size,
                 last_modified = excluded.last_modified",
            params![
                entry.fname,
                entry.hostname,
                entry.ip,
                entry.port,
                entry.lname,
                entry.file_size.map(|s| s as i64),
                entry.last_modified,
            ],
        )?;

        tx.commit()?;

        Ok(if existed {
            RegisterOutcome::Updated
        } else {
            RegisterOutcome::Inserted
        })
    }

    /// Looks up the entry registered under the exact key, if any.
    pub fn get(
        &self,
        fname: &str,
        hostname: &str,
        ip: &str,
        port: u16,
    ) -> ShoalResult<Option<FileEntry>> {
        let conn = self.conn();

        let entry = conn
            .query_row(
                "SELECT fname, hostname, ip, port, lname, file_size, last_modified
                 FROM file_index
                 WHERE fname = ?1 AND hostname = ?2 AND ip = ?3 AND port = ?4",
                params![fname, hostname, ip, port],
                entry_from_row,
            )
            .optional()?;

        Ok(entry)
    }

    /// All peers advertising an alias, ordered by `(hostname, ip, port)`.
    pub fn list_peers_for(&self, fname: &str) -> ShoalResult<Vec<FileEntry>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT fname, hostname, ip, port, lname, file_size, last_modified
             FROM file_index
             WHERE fname = ?1
             ORDER BY hostname, ip, port",
        )?;

        let entries = stmt
            .query_map(params![fname], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Per-alias summary across all peers, ordered by alias.
    ///
    /// `file_size` and `last_modified` are the maxima across the advertising
    /// peers; they exist for display only.
    pub fn list_all_shared(&self) -> ShoalResult<Vec<SharedFile>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT fname,
                    COUNT(*) AS peer_count,
                    MAX(file_size) AS file_size,
                    MAX(last_modified) AS last_modified
             FROM file_index
             GROUP BY fname
             ORDER BY fname",
        )?;

        let files = stmt
            .query_map([], |row| {
                Ok(SharedFile {
                    fname: row.get(0)?,
                    peer_count: row.get::<_, i64>(1)? as u64,
                    file_size: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
                    last_modified: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(files)
    }

    /// Distinct aliases published by a hostname, ordered.
    pub fn list_files_by_hostname(&self, hostname: &str) -> ShoalResult<Vec<String>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT DISTINCT fname FROM file_index WHERE hostname = ?1 ORDER BY fname",
        )?;

        let fnames = stmt
            .query_map(params![hostname], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(fnames)
    }

    /// Removes every row advertised by the identity and reports the removed
    /// aliases with per-alias counts.
    ///
    /// Select-then-delete inside one transaction stands in for a RETURNING
    /// clause, which older SQLite builds lack.
    pub fn delete_entries_for_peer(
        &self,
        hostname: &str,
        ip: &str,
        port: u16,
    ) -> ShoalResult<HashMap<String, u64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut removed: HashMap<String, u64> = HashMap::new();

        {
            let mut stmt = tx.prepare(
                "SELECT fname FROM file_index
                 WHERE hostname = ?1 AND ip = ?2 AND port = ?3",
            )?;

            let fnames = stmt.query_map(params![hostname, ip, port], |row| {
                row.get::<_, String>(0)
            })?;

            for fname in fnames {
                *removed.entry(fname?).or_insert(0) += 1;
            }
        }

        tx.execute(
            "DELETE FROM file_index WHERE hostname = ?1 AND ip = ?2 AND port = ?3",
            params![hostname, ip, port],
        )?;

        tx.commit()?;

        Ok(removed)
    }

    /// Every row in the index, ordered by `(fname, hostname, ip, port)`.
    pub fn fetch_all(&self) -> ShoalResult<Vec<FileEntry>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT fname, hostname, ip, port, lname, file_size, last_modified
             FROM file_index
             ORDER BY fname, hostname, ip, port",
        )?;

        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        fname: row.get(0)?,
        hostname: row.get(1)?,
        ip: row.get(2)?,
        port: row.get::<_, i64>(3)? as u16,
        lname: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        file_size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
        last_modified: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fname: &str, hostname: &str, port: u16, lname: &str) -> FileEntry {
        FileEntry {
            fname: fname.into(),
            hostname: hostname.into(),
            ip: "127.0.0.1".into(),
            port,
            lname: lname.into(),
            file_size: Some(12),
            last_modified: Some("2024-11-04T00:00:00Z".into()),
        }
    }

    #[test]
    fn register_inserts_then_updates() {
        let store = Store::open_in_memory().unwrap();

        let first = entry("a.txt", "alpha", 4000, "/tmp/a.txt");
        assert_eq!(store.register(&first).unwrap(), RegisterOutcome::Inserted);

        let mut second = first.clone();
        second.lname = "/srv/a.txt".into();
        second.file_size = Some(99);
        assert_eq!(store.register(&second).unwrap(), RegisterOutcome::Updated);

        // One row per key, carrying the latest metadata.
        let peers = store.list_peers_for("a.txt").unwrap();
        assert_eq!(peers, vec![second]);
    }

    #[test]
    fn get_returns_exact_key_only() {
        let store = Store::open_in_memory().unwrap();
        store.register(&entry("a.txt", "alpha", 4000, "/tmp/a.txt")).unwrap();

        assert!(store.get("a.txt", "alpha", "127.0.0.1", 4000).unwrap().is_some());
        assert!(store.get("a.txt", "alpha", "127.0.0.1", 4001).unwrap().is_none());
        assert!(store.get("b.txt", "alpha", "127.0.0.1", 4000).unwrap().is_none());
        assert!(store.get("a.txt", "beta", "127.0.0.1", 4000).unwrap().is_none());
    }

    #[test]
    fn peers_ordered_by_hostname_ip_port() {
        let store = Store::open_in_memory().unwrap();
        store.register(&entry("a.txt", "beta", 5000, "/b")).unwrap();
        store.register(&entry("a.txt", "alpha", 4001, "/a1")).unwrap();
        store.register(&entry("a.txt", "alpha", 4000, "/a0")).unwrap();

        let peers = store.list_peers_for("a.txt").unwrap();
        let keys: Vec<_> = peers.iter().map(|p| (p.hostname.clone(), p.port)).collect();
        assert_eq!(
            keys,
            vec![
                ("alpha".to_string(), 4000),
                ("alpha".to_string(), 4001),
                ("beta".to_string(), 5000),
            ],
        );

        // Stable across identical calls.
        assert_eq!(store.list_peers_for("a.txt").unwrap(), peers);
    }

    #[test]
    fn shared_summary_groups_by_alias() {
        let store = Store::open_in_memory().unwrap();

        let mut a = entry("a.txt", "alpha", 4000, "/a");
        a.file_size = Some(10);
        a.last_modified = Some("2024-11-03T00:00:00Z".into());
        store.register(&a).unwrap();

        let mut b = entry("a.txt", "beta", 5000, "/b");
        b.file_size = Some(20);
        b.last_modified = Some("2024-11-04T00:00:00Z".into());
        store.register(&b).unwrap();

        store.register(&entry("z.txt", "alpha", 4000, "/z")).unwrap();

        let files = store.list_all_shared().unwrap();
        assert_eq!(files.len(), 2);

        assert_eq!(files[0].fname, "a.txt");
        assert_eq!(files[0].peer_count, 2);
        assert_eq!(files[0].file_size, Some(20));
        assert_eq!(files[0].last_modified.as_deref(), Some("2024-11-04T00:00:00Z"));

        assert_eq!(files[1].fname, "z.txt");
        assert_eq!(files[1].peer_count, 1);
    }

    #[test]
    fn delete_reports_per_alias_counts() {
        let store = Store::open_in_memory().unwrap();
        store.register(&entry("a.txt", "alpha", 4000, "/a")).unwrap();
        store.register(&entry("b.txt", "alpha", 4000, "/b")).unwrap();
        store.register(&entry("a.txt", "alpha", 4001, "/a")).unwrap();
        store.register(&entry("a.txt", "beta", 5000, "/a")).unwrap();

        let removed = store.delete_entries_for_peer("alpha", "127.0.0.1", 4000).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed["a.txt"], 1);
        assert_eq!(removed["b.txt"], 1);

        // Only the matching identity is gone.
        let remaining = store.fetch_all().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| !(e.hostname == "alpha" && e.port == 4000)));

        // Deleting again removes nothing.
        assert!(store.delete_entries_for_peer("alpha", "127.0.0.1", 4000).unwrap().is_empty());
    }

    #[test]
    fn files_by_hostname_distinct_and_ordered() {
        let store = Store::open_in_memory().unwrap();
        store.register(&entry("z.txt", "alpha", 4000, "/z")).unwrap();
        store.register(&entry("a.txt", "alpha", 4000, "/a")).unwrap();
        store.register(&entry("a.txt", "alpha", 4001, "/a")).unwrap();
        store.register(&entry("m.txt", "beta", 5000, "/m")).unwrap();

        assert_eq!(
            store.list_files_by_hostname("alpha").unwrap(),
            vec!["a.txt".to_string(), "z.txt".to_string()],
        );
        assert!(store.list_files_by_hostname("gamma").unwrap().is_empty());
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let store = Store::open(&path).unwrap();
            store.register(&entry("a.txt", "alpha", 4000, "/a")).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.fetch_all().unwrap().len(), 1);
    }
}
