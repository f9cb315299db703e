//! SQLite-backed durable store behind the `db` capability.
//!
//! Schema: `peers(ip, port, state, os, version, clock)` unique on
//! `(ip, port)`, and `peers_dapp(peer_id, dappid)` as the many-to-many
//! association. Everything outside this module talks `Peer`, never SQL.

use crate::error::{NetworkError, Result};
use crate::peer::{Peer, PeerState};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

/// Columns `getByFilter`/the management API may sort by. Anything else
/// is rejected rather than interpolated into SQL.
pub const SORTABLE_COLUMNS: &[&str] = &["ip", "port", "state", "os", "version", "clock"];

pub struct PeerStore {
    conn: Mutex<Connection>,
}

impl PeerStore {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| NetworkError::Storage {
            op: "open",
            source: e,
        })?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| NetworkError::Storage {
            op: "open",
            source: e,
        })?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peers (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                ip       TEXT NOT NULL,
                port     INTEGER NOT NULL,
                state    INTEGER NOT NULL,
                os       TEXT NOT NULL,
                version  TEXT NOT NULL,
                clock    INTEGER,
                UNIQUE(ip, port)
            );
            CREATE TABLE IF NOT EXISTS peers_dapp (
                peer_id  INTEGER NOT NULL REFERENCES peers(id) ON DELETE CASCADE,
                dappid   TEXT NOT NULL,
                UNIQUE(peer_id, dappid)
            );",
        )
        .map_err(|e| NetworkError::Storage {
            op: "migrate",
            source: e,
        })
    }

    fn row_to_peer(conn: &Connection, id: i64, row: PeerRow) -> Result<Peer> {
        let mut stmt = conn
            .prepare("SELECT dappid FROM peers_dapp WHERE peer_id = ?1")
            .map_err(|e| NetworkError::Storage {
                op: "dapps",
                source: e,
            })?;
        let dapps: HashSet<String> = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))
            .map_err(|e| NetworkError::Storage {
                op: "dapps",
                source: e,
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(Peer {
            ip: Some(row.ip),
            port: row.port as u16,
            state: PeerState::from_i64(row.state),
            os: row.os,
            version: row.version,
            clock: row.clock,
            dapps,
        })
    }

    /// Upserts a peer by `(ip, port)`. `state` is written only when
    /// `Some`; on insert it otherwise defaults to DISCONNECTED, on
    /// update it is left untouched.
    pub fn upsert(&self, peer: &Peer) -> Result<i64> {
        let ip = peer.ip.clone().unwrap_or_default();
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM peers WHERE ip = ?1 AND port = ?2",
                params![ip, peer.port as i64],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| NetworkError::Storage {
                op: "upsert",
                source: e,
            })?;

        let id = if let Some(id) = existing {
            if let Some(state) = peer.state {
                conn.execute(
                    "UPDATE peers SET state = ?1, os = ?2, version = ?3, clock = ?4 WHERE id = ?5",
                    params![state as i64, peer.os, peer.version, peer.clock, id],
                )
            } else {
                conn.execute(
                    "UPDATE peers SET os = ?1, version = ?2 WHERE id = ?3",
                    params![peer.os, peer.version, id],
                )
            }
            .map_err(|e| NetworkError::Storage {
                op: "upsert",
                source: e,
            })?;
            id
        } else {
            let state = peer.state.unwrap_or(PeerState::Disconnected);
            conn.execute(
                "INSERT INTO peers (ip, port, state, os, version, clock) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ip, peer.port as i64, state as i64, peer.os, peer.version, peer.clock],
            )
            .map_err(|e| NetworkError::Storage {
                op: "upsert",
                source: e,
            })?;
            conn.last_insert_rowid()
        };

        if !peer.dapps.is_empty() {
            for dappid in &peer.dapps {
                conn.execute(
                    "INSERT OR IGNORE INTO peers_dapp (peer_id, dappid) VALUES (?1, ?2)",
                    params![id, dappid],
                )
                .map_err(|e| NetworkError::Storage {
                    op: "add_dapp",
                    source: e,
                })?;
            }
        }
        Ok(id)
    }

    pub fn get(&self, ip: &str, port: u16) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, ip, port, state, os, version, clock FROM peers WHERE ip = ?1 AND port = ?2",
                params![ip, port as i64],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        PeerRow {
                            ip: r.get(1)?,
                            port: r.get(2)?,
                            state: r.get(3)?,
                            os: r.get(4)?,
                            version: r.get(5)?,
                            clock: r.get(6)?,
                        },
                    ))
                },
            )
            .optional()
            .map_err(|e| NetworkError::Storage {
                op: "get",
                source: e,
            })?;
        match row {
            Some((id, row)) => Ok(Some(Self::row_to_peer(&conn, id, row)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, ip: &str, port: u16) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "DELETE FROM peers WHERE ip = ?1 AND port = ?2",
                params![ip, port as i64],
            )
            .map_err(|e| NetworkError::Storage {
                op: "remove",
                source: e,
            })?;
        Ok(n > 0)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM peers", [], |r| r.get(0))
            .map_err(|e| NetworkError::Storage {
                op: "count",
                source: e,
            })
    }

    pub fn set_state(&self, ip: &str, port: u16, state: PeerState, clock: Option<i64>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE peers SET state = ?1, clock = ?2 WHERE ip = ?3 AND port = ?4",
                params![state as i64, clock, ip, port as i64],
            )
            .map_err(|e| NetworkError::Storage {
                op: "setState",
                source: e,
            })?;
        Ok(n > 0)
    }

    pub fn add_dapp(&self, ip: &str, port: u16, dappid: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM peers WHERE ip = ?1 AND port = ?2",
                params![ip, port as i64],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| NetworkError::Storage {
                op: "add_dapp",
                source: e,
            })?;
        let Some(id) = id else { return Ok(false) };
        conn.execute(
            "INSERT OR IGNORE INTO peers_dapp (peer_id, dappid) VALUES (?1, ?2)",
            params![id, dappid],
        )
        .map_err(|e| NetworkError::Storage {
            op: "add_dapp",
            source: e,
        })?;
        Ok(true)
    }

    /// Clears `clock` and restores `state` to DISCONNECTED for every
    /// peer whose `clock <= now_ms`. Returns the affected `(ip, port)`.
    pub fn expire_bans(&self, now_ms: i64) -> Result<Vec<(String, u16)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT ip, port FROM peers WHERE clock IS NOT NULL AND clock <= ?1")
            .map_err(|e| NetworkError::Storage {
                op: "banManager",
                source: e,
            })?;
        let expired: Vec<(String, u16)> = stmt
            .query_map(params![now_ms], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u16))
            })
            .map_err(|e| NetworkError::Storage {
                op: "banManager",
                source: e,
            })?
            .filter_map(|r| r.ok())
            .collect();
        conn.execute(
            "UPDATE peers SET state = ?1, clock = NULL WHERE clock IS NOT NULL AND clock <= ?2",
            params![PeerState::Disconnected as i64, now_ms],
        )
        .map_err(|e| NetworkError::Storage {
            op: "banManager",
            source: e,
        })?;
        Ok(expired)
    }

    /// All non-banned peers, optionally restricted to a dapp.
    pub fn list_non_banned(&self, dappid: Option<&str>) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let ids_and_rows: Vec<(i64, PeerRow)> = if let Some(dappid) = dappid {
            let mut stmt = conn
                .prepare(
                    "SELECT p.id, p.ip, p.port, p.state, p.os, p.version, p.clock
                     FROM peers p JOIN peers_dapp d ON d.peer_id = p.id
                     WHERE p.state != ?1 AND d.dappid = ?2",
                )
                .map_err(|e| NetworkError::Storage { op: "list", source: e })?;
            let rows: Vec<(i64, PeerRow)> = stmt
                .query_map(params![PeerState::Banned as i64, dappid], Self::map_row)
                .map_err(|e| NetworkError::Storage { op: "list", source: e })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        } else {
            let mut stmt = conn
                .prepare("SELECT id, ip, port, state, os, version, clock FROM peers WHERE state != ?1")
                .map_err(|e| NetworkError::Storage { op: "list", source: e })?;
            let rows: Vec<(i64, PeerRow)> = stmt
                .query_map(params![PeerState::Banned as i64], Self::map_row)
                .map_err(|e| NetworkError::Storage { op: "list", source: e })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        ids_and_rows
            .into_iter()
            .map(|(id, row)| Self::row_to_peer(&conn, id, row))
            .collect()
    }

    fn map_row(r: &rusqlite::Row) -> rusqlite::Result<(i64, PeerRow)> {
        Ok((
            r.get(0)?,
            PeerRow {
                ip: r.get(1)?,
                port: r.get(2)?,
                state: r.get(3)?,
                os: r.get(4)?,
                version: r.get(5)?,
                clock: r.get(6)?,
            },
        ))
    }

    /// `getByFilter`: any subset of `{state, os, version, ip, port}`,
    /// ordered by a caller-supplied column constrained to
    /// [`SORTABLE_COLUMNS`].
    pub fn filter(&self, query: &FilterQuery) -> Result<Vec<Peer>> {
        let order_by = query.order_by.as_deref().unwrap_or("ip");
        if !SORTABLE_COLUMNS.contains(&order_by) {
            return Err(NetworkError::Schema(format!(
                "invalid orderBy field: {order_by}"
            )));
        }
        let mut clauses = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ip) = &query.ip {
            clauses.push("ip = ?");
            values.push(Box::new(ip.clone()));
        }
        if let Some(port) = query.port {
            clauses.push("port = ?");
            values.push(Box::new(port as i64));
        }
        if let Some(state) = query.state {
            clauses.push("state = ?");
            values.push(Box::new(state as i64));
        }
        if let Some(os) = &query.os {
            clauses.push("os = ?");
            values.push(Box::new(os.clone()));
        }
        if let Some(version) = &query.version {
            clauses.push("version = ?");
            values.push(Box::new(version.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, ip, port, state, os, version, clock FROM peers {where_sql} ORDER BY {order_by} LIMIT ? OFFSET ?"
        );
        values.push(Box::new(query.limit));
        values.push(Box::new(query.offset));

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| NetworkError::Storage { op: "getByFilter", source: e })?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows: Vec<(i64, PeerRow)> = stmt
            .query_map(param_refs.as_slice(), Self::map_row)
            .map_err(|e| NetworkError::Storage { op: "getByFilter", source: e })?
            .filter_map(|r| r.ok())
            .collect();
        rows.into_iter()
            .map(|(id, row)| Self::row_to_peer(&conn, id, row))
            .collect()
    }
}

struct PeerRow {
    ip: String,
    port: i64,
    state: i64,
    os: String,
    version: String,
    clock: Option<i64>,
}

/// Query parameters for `getByFilter`. `limit`/`offset` are already
/// absolute-valued and clamped by the caller (see [`FilterQuery::normalize`]).
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub state: Option<PeerState>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub order_by: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl FilterQuery {
    /// `limit` defaults to 100, hard-caps at 100, and both `limit`
    /// and `offset` are absolute-valued (a negative input is treated as
    /// its magnitude, not rejected).
    pub fn normalize(mut self) -> Result<Self> {
        if self.limit == 0 {
            self.limit = 100;
        }
        self.limit = self.limit.abs();
        self.offset = self.offset.abs();
        if self.limit > 100 {
            return Err(NetworkError::Schema("limit must be <= 100".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str, port: u16, state: PeerState) -> Peer {
        Peer {
            ip: Some(ip.to_string()),
            port,
            state: Some(state),
            os: "linux".into(),
            version: "1.0.0".into(),
            clock: None,
            dapps: HashSet::new(),
        }
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("1.2.3.4", 8000, PeerState::Connected)).unwrap();
        let p = store.get("1.2.3.4", 8000).unwrap().unwrap();
        assert_eq!(p.state, Some(PeerState::Connected));
    }

    #[test]
    fn upsert_is_keyed_on_ip_and_port() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("1.2.3.4", 8000, PeerState::Disconnected)).unwrap();
        store.upsert(&peer("1.2.3.4", 8000, PeerState::Connected)).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        let p = store.get("1.2.3.4", 8000).unwrap().unwrap();
        assert_eq!(p.state, Some(PeerState::Connected));
    }

    #[test]
    fn update_without_state_leaves_state_untouched() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("1.2.3.4", 8000, PeerState::Connected)).unwrap();
        let mut p = peer("1.2.3.4", 8000, PeerState::Connected);
        p.state = None;
        p.os = "windows".into();
        store.upsert(&p).unwrap();
        let got = store.get("1.2.3.4", 8000).unwrap().unwrap();
        assert_eq!(got.state, Some(PeerState::Connected));
        assert_eq!(got.os, "windows");
    }

    #[test]
    fn expire_bans_clears_clock_and_restores_disconnected() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("9.9.9.9", 8000, PeerState::Banned)).unwrap();
        store.set_state("9.9.9.9", 8000, PeerState::Banned, Some(100)).unwrap();
        let expired = store.expire_bans(200).unwrap();
        assert_eq!(expired, vec![("9.9.9.9".to_string(), 8000)]);
        let p = store.get("9.9.9.9", 8000).unwrap().unwrap();
        assert_eq!(p.state, Some(PeerState::Disconnected));
        assert_eq!(p.clock, None);
    }

    #[test]
    fn list_non_banned_excludes_banned_peers() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("1.1.1.1", 8000, PeerState::Connected)).unwrap();
        store.upsert(&peer("2.2.2.2", 8000, PeerState::Banned)).unwrap();
        let listed = store.list_non_banned(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn add_dapp_associates_existing_peer_and_is_idempotent() {
        let store = PeerStore::open_in_memory().unwrap();
        store.upsert(&peer("1.2.3.4", 8000, PeerState::Connected)).unwrap();

        assert!(store.add_dapp("1.2.3.4", 8000, "dapp1").unwrap());
        assert!(store.add_dapp("1.2.3.4", 8000, "dapp1").unwrap());

        let listed = store.list_non_banned(Some("dapp1")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn add_dapp_on_unknown_peer_is_a_noop() {
        let store = PeerStore::open_in_memory().unwrap();
        assert!(!store.add_dapp("9.9.9.9", 8000, "dapp1").unwrap());
    }

    #[test]
    fn filter_rejects_unknown_order_by() {
        let store = PeerStore::open_in_memory().unwrap();
        let q = FilterQuery {
            order_by: Some("DROP TABLE peers".into()),
            limit: 10,
            ..Default::default()
        };
        assert!(store.filter(&q).is_err());
    }

    #[test]
    fn filter_query_normalizes_limit_and_offset() {
        let q = FilterQuery { limit: -10, offset: -5, ..Default::default() }.normalize().unwrap();
        assert_eq!(q.limit, 10);
        assert_eq!(q.offset, 5);

        let err = FilterQuery { limit: 150, ..Default::default() }.normalize();
        assert!(err.is_err());
    }
}
