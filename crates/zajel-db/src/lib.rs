//! # zajel-db
//!
//! Persisted client state (`spec.md` §6): the identity key pair, the
//! trusted-peer list, and transfer-history metadata. Everything else a
//! client might want to store (message bodies, UI preferences) is
//! explicitly out of this spec's scope — this crate stores only the
//! shapes §6 names.
//!
//! Backed by a single SQLite database at `$data_dir/zajel.db`, WAL mode,
//! foreign keys enforced, schema version stored in `PRAGMA user_version`.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use zajel_types::identity::{ConnectionState, Peer};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("schema version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the Zajel database at the given path.
///
/// Configures WAL mode, foreign keys, and applies the schema if the
/// database is fresh.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    apply_schema(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    apply_schema(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Apply `schema::SCHEMA_V1` to a fresh database. A single schema version
/// exists today; once a second one is needed this gains the forward-only
/// migration loop the rest of this codebase uses.
fn apply_schema(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current == 0 {
        tracing::info!("initializing zajel-db schema v{SCHEMA_VERSION}");
        conn.execute_batch(schema::SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if current > SCHEMA_VERSION {
        return Err(DbError::UnsupportedVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

/// A persisted identity row (`spec.md` §3 "Identity").
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
    pub pairing_code: String,
    pub created_at: u64,
}

/// Persist the identity. There is exactly one identity row per database
/// (`id = 1`); calling this again replaces it.
pub fn save_identity(conn: &Connection, identity: &StoredIdentity) -> Result<()> {
    conn.execute(
        "INSERT INTO identity (id, public_key, secret_key, pairing_code, created_at)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            public_key = excluded.public_key,
            secret_key = excluded.secret_key,
            pairing_code = excluded.pairing_code,
            created_at = excluded.created_at",
        params![
            identity.public_key.to_vec(),
            identity.secret_key.to_vec(),
            identity.pairing_code,
            identity.created_at,
        ],
    )?;
    Ok(())
}

/// Load the persisted identity, if `initialize()` has run before on this
/// database (`spec.md` §4.1).
pub fn load_identity(conn: &Connection) -> Result<Option<StoredIdentity>> {
    conn.query_row(
        "SELECT public_key, secret_key, pairing_code, created_at FROM identity WHERE id = 1",
        [],
        |row| {
            let pk: Vec<u8> = row.get(0)?;
            let sk: Vec<u8> = row.get(1)?;
            Ok(StoredIdentity {
                public_key: to_array(pk),
                secret_key: to_array(sk),
                pairing_code: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(DbError::from)
}

/// Upsert a trusted peer, e.g. on first successful pairing (TOFU) or on
/// any field update (last seen, display name, block state).
pub fn upsert_trusted_peer(conn: &Connection, peer: &Peer) -> Result<()> {
    conn.execute(
        "INSERT INTO trusted_peers
            (peer_id, public_key, display_name, alias, trusted_since, last_seen, is_blocked)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(peer_id) DO UPDATE SET
            public_key = excluded.public_key,
            display_name = excluded.display_name,
            alias = excluded.alias,
            trusted_since = COALESCE(trusted_peers.trusted_since, excluded.trusted_since),
            last_seen = excluded.last_seen,
            is_blocked = excluded.is_blocked",
        params![
            peer.peer_id,
            peer.public_key.to_vec(),
            peer.display_name,
            peer.alias,
            peer.trusted_since,
            peer.last_seen,
            peer.is_blocked,
        ],
    )?;
    Ok(())
}

/// Rebind a trusted peer's stable identifier to a new pairing code after
/// trusted-peer migration (`spec.md` §3: re-pairing under the same `pk`
/// with a different code). The row's primary key (`peer_id`) is derived
/// from the public key, not the code, so this is a no-op on the schema
/// itself; callers use this to bump `last_seen` atomically with the
/// migration event.
pub fn touch_trusted_peer(conn: &Connection, peer_id: &str, now: u64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE trusted_peers SET last_seen = ?1 WHERE peer_id = ?2",
        params![now, peer_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("trusted peer {peer_id}")));
    }
    Ok(())
}

pub fn get_trusted_peer(conn: &Connection, peer_id: &str) -> Result<Option<Peer>> {
    conn.query_row(
        "SELECT peer_id, public_key, display_name, alias, trusted_since, last_seen, is_blocked
         FROM trusted_peers WHERE peer_id = ?1",
        params![peer_id],
        row_to_peer,
    )
    .optional()
    .map_err(DbError::from)
}

pub fn list_trusted_peers(conn: &Connection) -> Result<Vec<Peer>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, public_key, display_name, alias, trusted_since, last_seen, is_blocked
         FROM trusted_peers ORDER BY last_seen DESC",
    )?;
    let rows = stmt.query_map([], row_to_peer)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
}

pub fn set_peer_blocked(conn: &Connection, peer_id: &str, blocked: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE trusted_peers SET is_blocked = ?1 WHERE peer_id = ?2",
        params![blocked, peer_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("trusted peer {peer_id}")));
    }
    Ok(())
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    let public_key: Vec<u8> = row.get(1)?;
    Ok(Peer {
        peer_id: row.get(0)?,
        public_key: to_array(public_key),
        connection_state: ConnectionState::Disconnected,
        display_name: row.get(2)?,
        alias: row.get(3)?,
        trusted_since: row.get(4)?,
        last_seen: row.get(5)?,
        is_blocked: row.get(6)?,
    })
}

/// One completed (or failed/cancelled) file transfer, recorded for
/// resumability bookkeeping (`spec.md` §3 "File transfer context").
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub file_id: String,
    pub peer_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub direction: TransferDirection,
    pub final_state: String,
    pub file_hash: Option<[u8; 32]>,
    pub started_at: u64,
    pub finished_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

impl TransferDirection {
    fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Send => "send",
            TransferDirection::Receive => "receive",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "send" => Ok(TransferDirection::Send),
            "receive" => Ok(TransferDirection::Receive),
            other => Err(DbError::Serialization(format!("unknown transfer direction {other}"))),
        }
    }
}

pub fn record_transfer(conn: &Connection, record: &TransferRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO transfer_history
            (file_id, peer_id, file_name, total_size, direction, final_state, file_hash, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(file_id) DO UPDATE SET
            final_state = excluded.final_state,
            file_hash = excluded.file_hash,
            finished_at = excluded.finished_at",
        params![
            record.file_id,
            record.peer_id,
            record.file_name,
            record.total_size,
            record.direction.as_str(),
            record.final_state,
            record.file_hash.map(|h| h.to_vec()),
            record.started_at,
            record.finished_at,
        ],
    )?;
    Ok(())
}

pub fn list_transfers_for_peer(conn: &Connection, peer_id: &str) -> Result<Vec<TransferRecord>> {
    let mut stmt = conn.prepare(
        "SELECT file_id, peer_id, file_name, total_size, direction, final_state, file_hash, started_at, finished_at
         FROM transfer_history WHERE peer_id = ?1 ORDER BY finished_at DESC",
    )?;
    let rows = stmt.query_map(params![peer_id], |row| {
        let direction: String = row.get(4)?;
        let hash: Option<Vec<u8>> = row.get(6)?;
        Ok(TransferRecord {
            file_id: row.get(0)?,
            peer_id: row.get(1)?,
            file_name: row.get(2)?,
            total_size: row.get(3)?,
            direction: TransferDirection::parse(&direction)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            final_state: row.get(5)?,
            file_hash: hash.map(to_array),
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
}

fn to_array(bytes: Vec<u8>) -> [u8; 32] {
    let mut arr = [0u8; 32];
    let len = bytes.len().min(32);
    arr[..len].copy_from_slice(&bytes[..len]);
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_memory_applies_schema() {
        let conn = open_memory().expect("open in-memory db");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("get user_version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn identity_roundtrip() {
        let conn = open_memory().expect("open");
        let identity = StoredIdentity {
            public_key: [0x11; 32],
            secret_key: [0x22; 32],
            pairing_code: "A2B3C4".to_string(),
            created_at: 1_000,
        };
        save_identity(&conn, &identity).expect("save");
        let loaded = load_identity(&conn).expect("load").expect("present");
        assert_eq!(loaded.public_key, identity.public_key);
        assert_eq!(loaded.pairing_code, "A2B3C4");
    }

    #[test]
    fn load_identity_returns_none_before_initialize() {
        let conn = open_memory().expect("open");
        assert!(load_identity(&conn).expect("load").is_none());
    }

    #[test]
    fn save_identity_replaces_previous() {
        let conn = open_memory().expect("open");
        save_identity(
            &conn,
            &StoredIdentity {
                public_key: [0x01; 32],
                secret_key: [0x02; 32],
                pairing_code: "AAAAAA".to_string(),
                created_at: 1,
            },
        )
        .expect("save first");
        save_identity(
            &conn,
            &StoredIdentity {
                public_key: [0x03; 32],
                secret_key: [0x04; 32],
                pairing_code: "BBBBBB".to_string(),
                created_at: 2,
            },
        )
        .expect("save second");
        let loaded = load_identity(&conn).expect("load").expect("present");
        assert_eq!(loaded.pairing_code, "BBBBBB");
    }

    #[test]
    fn trusted_peer_upsert_preserves_trusted_since() {
        let conn = open_memory().expect("open");
        let mut peer = Peer::new([0x42; 32], "peer-1".to_string(), 100);
        peer.trusted_since = Some(100);
        upsert_trusted_peer(&conn, &peer).expect("insert");

        let mut updated = peer.clone();
        updated.last_seen = 200;
        updated.trusted_since = None; // caller doesn't re-derive this
        upsert_trusted_peer(&conn, &updated).expect("update");

        let loaded = get_trusted_peer(&conn, "peer-1").expect("get").expect("present");
        assert_eq!(loaded.trusted_since, Some(100));
        assert_eq!(loaded.last_seen, 200);
    }

    #[test]
    fn list_trusted_peers_orders_by_last_seen_desc() {
        let conn = open_memory().expect("open");
        upsert_trusted_peer(&conn, &Peer::new([0x01; 32], "older".to_string(), 100)).expect("insert");
        upsert_trusted_peer(&conn, &Peer::new([0x02; 32], "newer".to_string(), 200)).expect("insert");

        let peers = list_trusted_peers(&conn).expect("list");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].peer_id, "newer");
    }

    #[test]
    fn set_peer_blocked_on_unknown_peer_fails() {
        let conn = open_memory().expect("open");
        assert!(matches!(set_peer_blocked(&conn, "ghost", true), Err(DbError::NotFound(_))));
    }

    #[test]
    fn transfer_history_roundtrip() {
        let conn = open_memory().expect("open");
        record_transfer(
            &conn,
            &TransferRecord {
                file_id: "file-1".to_string(),
                peer_id: "peer-1".to_string(),
                file_name: "report.pdf".to_string(),
                total_size: 48 * 1024,
                direction: TransferDirection::Send,
                final_state: "complete".to_string(),
                file_hash: Some([0x55; 32]),
                started_at: 1_000,
                finished_at: 1_010,
            },
        )
        .expect("record");

        let transfers = list_transfers_for_peer(&conn, "peer-1").expect("list");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].final_state, "complete");
        assert_eq!(transfers[0].file_hash, Some([0x55; 32]));
    }
}
