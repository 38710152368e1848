//! SQL schema for the client's persisted state (`spec.md` §6).
//!
//! Exactly the three tables §6's "Persisted state" paragraph names:
//! the identity key pair, the trusted-peer list, and per-transfer
//! history metadata for resumability bookkeeping. No message-content
//! history table — message bodies are this spec's concern only at the
//! wire-format level, never as a persistence feature.

/// Complete schema for the Zajel client database, version 1.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Identity (`spec.md` §3 "Identity", §4.1 initialize())
-- ============================================================

CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    public_key BLOB NOT NULL,
    secret_key BLOB NOT NULL,
    pairing_code TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- ============================================================
-- Trusted peers (`spec.md` §3 "Peer", §6 "Persisted state")
-- ============================================================

CREATE TABLE IF NOT EXISTS trusted_peers (
    peer_id TEXT PRIMARY KEY,
    public_key BLOB NOT NULL,
    display_name TEXT,
    alias TEXT,
    trusted_since INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    is_blocked INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_trusted_peers_last_seen ON trusted_peers(last_seen);

-- ============================================================
-- Transfer history (`spec.md` §3 "File transfer context")
--
-- Resumability bookkeeping only: one row per transfer that reached a
-- terminal state. No chunk-level table — in-flight chunk state lives
-- in memory for the duration of a transfer (`zajel-filetransfer`).
-- ============================================================

CREATE TABLE IF NOT EXISTS transfer_history (
    file_id TEXT PRIMARY KEY,
    peer_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    direction TEXT NOT NULL,
    final_state TEXT NOT NULL,
    file_hash BLOB,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transfer_history_peer ON transfer_history(peer_id);
"#;
