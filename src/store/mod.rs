//! Typed access to accounts, tenant keys, upstream credentials, presets,
//! regex rules, and the audit log.
//!
//! Grounded on `db.rs`'s connection/pragma setup: a WAL-mode SQLite
//! database opened fresh per call rather than pooled, matching the
//! teacher's own choice for a workload this size.

pub mod model;

use rusqlite::{params, Connection};

pub use model::*;

use crate::error::{AppError, AppResult};

pub fn open_conn(db_path: &str) -> AppResult<Connection> {
    let conn = Connection::open(db_path)?;
    optimize_connection(&conn);
    Ok(conn)
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
}

pub fn init(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS presets (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tenant_keys (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            key_hash TEXT NOT NULL UNIQUE,
            display_name TEXT,
            preset_id INTEGER REFERENCES presets(id) ON DELETE SET NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            apply_regex INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS upstream_credentials (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            label TEXT NOT NULL,
            secret TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            score INTEGER NOT NULL DEFAULT 100,
            cooldown_until TEXT,
            last_status TEXT NOT NULL DEFAULT 'active',
            last_used_at TEXT,
            total_uses INTEGER NOT NULL DEFAULT 0,
            total_errors INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS preset_items (
            id INTEGER PRIMARY KEY,
            preset_id INTEGER NOT NULL REFERENCES presets(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            role TEXT,
            content TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS regex_rules (
            id INTEGER PRIMARY KEY,
            scope TEXT NOT NULL,
            account_id INTEGER REFERENCES accounts(id),
            preset_id INTEGER REFERENCES presets(id) ON DELETE CASCADE,
            phase TEXT NOT NULL,
            pattern TEXT NOT NULL,
            replacement TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY,
            tenant_key_id INTEGER REFERENCES tenant_keys(id),
            model TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            synthetic_status TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            ttft_ms INTEGER,
            stream INTEGER NOT NULL,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            total_tokens INTEGER,
            tokens_estimated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_regex_rules_preset ON regex_rules(preset_id, phase, sort_order);
        CREATE INDEX IF NOT EXISTS idx_regex_rules_account ON regex_rules(account_id, phase, sort_order);
        CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);
        CREATE INDEX IF NOT EXISTS idx_tenant_keys_hash ON tenant_keys(key_hash);
        ",
    )?;
    Ok(())
}

pub fn find_tenant_key_by_hash(conn: &Connection, key_hash: &str) -> AppResult<Option<TenantKey>> {
    conn.query_row(
        "SELECT id, account_id, key_hash, display_name, preset_id, enabled, apply_regex, created_at
         FROM tenant_keys WHERE key_hash = ?1",
        params![key_hash],
        |row| {
            Ok(TenantKey {
                id: row.get(0)?,
                account_id: row.get(1)?,
                key_hash: row.get(2)?,
                display_name: row.get(3)?,
                preset_id: row.get(4)?,
                enabled: row.get::<_, i64>(5)? != 0,
                apply_regex: row.get::<_, i64>(6)? != 0,
                created_at: row.get(7)?,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(AppError::from(other)),
    })
}

pub fn enabled_credentials_for_account(
    conn: &Connection,
    account_id: i64,
) -> AppResult<Vec<UpstreamCredential>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, label, secret, enabled, score, cooldown_until,
                last_status, last_used_at, total_uses, total_errors, total_tokens, created_at
         FROM upstream_credentials WHERE account_id = ?1 AND enabled = 1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![account_id], map_credential_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn map_credential_row(row: &rusqlite::Row) -> rusqlite::Result<UpstreamCredential> {
    Ok(UpstreamCredential {
        id: row.get(0)?,
        account_id: row.get(1)?,
        label: row.get(2)?,
        secret: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        score: row.get(5)?,
        cooldown_until: row.get(6)?,
        last_status: row.get(7)?,
        last_used_at: row.get(8)?,
        total_uses: row.get(9)?,
        total_errors: row.get(10)?,
        total_tokens: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Persists the result of one settled lease: score/cooldown, the rolling
/// counters (`total_uses`/`total_errors`/`total_tokens`), `last_status`, and
/// `last_used_at`. `tokens` is the sum of input+output tokens consumed by
/// this attempt (zero for a failed attempt that never got a usage report).
#[allow(clippy::too_many_arguments)]
pub fn record_credential_settlement(
    conn: &Connection,
    credential_id: i64,
    score: i64,
    cooldown_until: Option<&str>,
    last_status: &str,
    is_error: bool,
    tokens: i64,
    now: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE upstream_credentials
         SET score = ?1, cooldown_until = ?2, last_status = ?3, last_used_at = ?4,
             total_uses = total_uses + 1,
             total_errors = total_errors + ?5,
             total_tokens = total_tokens + ?6
         WHERE id = ?7",
        params![
            score,
            cooldown_until,
            last_status,
            now,
            is_error as i64,
            tokens,
            credential_id
        ],
    )?;
    Ok(())
}

pub fn disable_credential(conn: &Connection, credential_id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE upstream_credentials SET enabled = 0 WHERE id = ?1",
        params![credential_id],
    )?;
    Ok(())
}

pub fn find_preset(conn: &Connection, preset_id: i64) -> AppResult<Option<Preset>> {
    conn.query_row(
        "SELECT id, account_id, name, created_at FROM presets WHERE id = ?1",
        params![preset_id],
        |row| {
            Ok(Preset {
                id: row.get(0)?,
                account_id: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(AppError::from(other)),
    })
}

pub fn preset_items(conn: &Connection, preset_id: i64) -> AppResult<Vec<PresetItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, preset_id, kind, role, content, enabled, sort_order
         FROM preset_items WHERE preset_id = ?1 ORDER BY sort_order ASC",
    )?;
    let rows = stmt.query_map(params![preset_id], |row| {
        let kind_str: String = row.get(2)?;
        Ok(PresetItem {
            id: row.get(0)?,
            preset_id: row.get(1)?,
            kind: PresetItemKind::from_str(&kind_str).unwrap_or(PresetItemKind::Normal),
            role: row.get(3)?,
            content: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
            sort_order: row.get(6)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Regex rules for a phase, account rules first then preset rules, both
/// ascending by `sort_order` within their own group. `apply_account_rules`
/// is the authenticating tenant key's `apply_regex` flag: when false, the
/// account-level group is skipped entirely but preset-level rules (if any)
/// still run, since that flag only toggles the account-wide pipeline.
pub fn regex_rules_for_phase(
    conn: &Connection,
    account_id: i64,
    preset_id: Option<i64>,
    phase: RegexPhase,
    apply_account_rules: bool,
) -> AppResult<Vec<RegexRule>> {
    let mut rules = Vec::new();

    if apply_account_rules {
        let mut stmt = conn.prepare(
            "SELECT id, scope, account_id, preset_id, phase, pattern, replacement, sort_order, enabled
             FROM regex_rules
             WHERE scope = 'account' AND account_id = ?1 AND phase = ?2 AND enabled = 1
             ORDER BY sort_order ASC",
        )?;
        let account_rows = stmt.query_map(params![account_id, phase.as_str()], map_regex_row)?;
        rules.extend(account_rows.filter_map(|r| r.ok()));
    }

    if let Some(preset_id) = preset_id {
        let mut stmt = conn.prepare(
            "SELECT id, scope, account_id, preset_id, phase, pattern, replacement, sort_order, enabled
             FROM regex_rules
             WHERE scope = 'preset' AND preset_id = ?1 AND phase = ?2 AND enabled = 1
             ORDER BY sort_order ASC",
        )?;
        let preset_rows = stmt.query_map(params![preset_id, phase.as_str()], map_regex_row)?;
        rules.extend(preset_rows.filter_map(|r| r.ok()));
    }

    Ok(rules)
}

fn map_regex_row(row: &rusqlite::Row) -> rusqlite::Result<RegexRule> {
    let scope_str: String = row.get(1)?;
    let phase_str: String = row.get(4)?;
    Ok(RegexRule {
        id: row.get(0)?,
        scope: RegexScope::from_str(&scope_str).unwrap_or(RegexScope::Account),
        account_id: row.get(2)?,
        preset_id: row.get(3)?,
        phase: RegexPhase::from_str(&phase_str).unwrap_or(RegexPhase::Pre),
        pattern: row.get(5)?,
        replacement: row.get(6)?,
        sort_order: row.get(7)?,
        enabled: row.get::<_, i64>(8)? != 0,
    })
}

pub fn insert_log(conn: &Connection, entry: &LogEntry) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO logs (tenant_key_id, model, status_code, synthetic_status, latency_ms,
            ttft_ms, stream, prompt_tokens, completion_tokens, total_tokens, tokens_estimated,
            created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            entry.tenant_key_id,
            entry.model,
            entry.status_code,
            entry.synthetic_status,
            entry.latency_ms,
            entry.ttft_ms,
            entry.stream as i64,
            entry.prompt_tokens,
            entry.completion_tokens,
            entry.total_tokens,
            entry.tokens_estimated as i64,
            entry.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn
    }

    #[test]
    fn tenant_key_lookup_round_trips() {
        let conn = memory_store();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at) VALUES (1, 'acme', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tenant_keys (id, account_id, key_hash, enabled, created_at)
             VALUES (1, 1, 'hash-abc', 1, '2026-01-01')",
            [],
        )
        .unwrap();

        let found = find_tenant_key_by_hash(&conn, "hash-abc").unwrap().unwrap();
        assert_eq!(found.account_id, 1);
        assert!(find_tenant_key_by_hash(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn regex_rules_order_account_before_preset() {
        let conn = memory_store();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at) VALUES (1, 'acme', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO presets (id, account_id, name, created_at) VALUES (1, 1, 'p', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO regex_rules (scope, account_id, phase, pattern, replacement, sort_order, enabled)
             VALUES ('account', 1, 'pre', 'a', 'A', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO regex_rules (scope, preset_id, phase, pattern, replacement, sort_order, enabled)
             VALUES ('preset', 1, 'pre', 'b', 'B', 0, 1)",
            [],
        )
        .unwrap();

        let rules = regex_rules_for_phase(&conn, 1, Some(1), RegexPhase::Pre, true).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern, "a");
        assert_eq!(rules[1].pattern, "b");
    }

    #[test]
    fn apply_regex_false_skips_account_rules_but_keeps_preset_rules() {
        let conn = memory_store();
        conn.execute(
            "INSERT INTO accounts (id, name, created_at) VALUES (1, 'acme', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO presets (id, account_id, name, created_at) VALUES (1, 1, 'p', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO regex_rules (scope, account_id, phase, pattern, replacement, sort_order, enabled)
             VALUES ('account', 1, 'pre', 'a', 'A', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO regex_rules (scope, preset_id, phase, pattern, replacement, sort_order, enabled)
             VALUES ('preset', 1, 'pre', 'b', 'B', 0, 1)",
            [],
        )
        .unwrap();

        let rules = regex_rules_for_phase(&conn, 1, Some(1), RegexPhase::Pre, false).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "b");
    }
}
