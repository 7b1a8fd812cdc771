//! Credential lease/settle bookkeeping.
//!
//! Grounded on `forward/limits.rs`'s `LIMIT_STATE`: a single process-global
//! `Lazy<Arc<Mutex<PoolState>>>` holding the one piece of contested mutable
//! state in the system. Unlike `LimitGuard`, settlement here is explicit and
//! two-phase rather than `Drop`-driven, since a lease can end in several
//! distinct outcomes that each need different bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::AppResult;
use crate::store::{self, UpstreamCredential};

pub static POOL: Lazy<Arc<Mutex<PoolState>>> = Lazy::new(|| Arc::new(Mutex::new(PoolState::default())));

/// Upper bound on how long [`lease`] will wait for a credential to come off
/// cooldown before giving up and returning the best-effort choice (§4.5).
pub const LEASE_WAIT_CAP: Duration = Duration::from_secs(2);
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    score: i64,
    cooldown_until: Option<DateTime<Utc>>,
}

/// The process-global mutable state the pool guards: per-credential
/// score/cooldown, plus the set of credentials currently leased out to some
/// in-flight upstream attempt anywhere in the process. The `in_flight` set is
/// what makes "no credential is leased to two callers at once" (§4.5, §8) an
/// actual invariant rather than just a per-request one: two *concurrent*
/// requests racing `lease()` must not walk away with the same credential.
#[derive(Debug, Default)]
pub struct PoolState {
    entries: HashMap<i64, PoolEntry>,
    in_flight: HashSet<i64>,
}

impl PoolState {
    fn entry(&mut self, id: i64, initial_score: i64) -> &mut PoolEntry {
        self.entries.entry(id).or_insert(PoolEntry {
            score: initial_score,
            cooldown_until: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    RateLimited,
    ServerError,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Unauthorized,
    Forbidden,
    /// The upstream declared the request itself permanently invalid (e.g. an
    /// HTTP 400 carrying a non-retryable reason). The credential is disabled
    /// the same as any other fatal kind, but the orchestrator does not retry
    /// on a different credential since the request, not the credential, is
    /// at fault.
    PermanentInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `tokens_in`/`tokens_out` as reported (or estimated) by the upstream
    /// call this lease covered; rolled into the credential's running
    /// `total_tokens` counter (§3, §4.5).
    Ok { tokens_in: i64, tokens_out: i64 },
    Retryable(RetryableKind),
    Fatal(FatalKind),
}

fn backoff_for(kind: RetryableKind) -> ChronoDuration {
    let mut rng = rand::thread_rng();
    match kind {
        RetryableKind::RateLimited => ChronoDuration::seconds(60),
        RetryableKind::ServerError => {
            ChronoDuration::seconds(10) + ChronoDuration::milliseconds(rng.gen_range(0..1000))
        }
        RetryableKind::Transport => {
            ChronoDuration::seconds(5) + ChronoDuration::milliseconds(rng.gen_range(0..1000))
        }
    }
}

/// Pick the highest-scoring eligible credential: enabled, not excluded by the
/// caller's own per-request retry history, not currently in flight elsewhere
/// in the process, and not under cooldown. Ties break by ascending id so
/// results are deterministic in tests.
fn pick_eligible(
    state: &PoolState,
    candidates: &[UpstreamCredential],
    excluded: &HashSet<i64>,
    now: DateTime<Utc>,
) -> Option<UpstreamCredential> {
    let mut best: Option<(&UpstreamCredential, i64)> = None;
    for cred in candidates {
        if !cred.enabled || excluded.contains(&cred.id) || state.in_flight.contains(&cred.id) {
            continue;
        }
        if let Some(entry) = state.entries.get(&cred.id) {
            if let Some(cooldown) = entry.cooldown_until {
                if cooldown > now {
                    continue;
                }
            }
        }
        let score = state.entries.get(&cred.id).map(|e| e.score).unwrap_or(cred.score);
        best = match best {
            None => Some((cred, score)),
            Some((best_cred, best_score))
                if score > best_score || (score == best_score && cred.id < best_cred.id) =>
            {
                Some((cred, score))
            }
            other => other,
        };
    }
    best.map(|(c, _)| c.clone())
}

/// Among enabled, non-excluded, non-in-flight credentials (regardless of
/// cooldown), the one whose cooldown expires soonest — the best-effort
/// fallback once [`LEASE_WAIT_CAP`] has elapsed and nothing is free (§4.5).
fn pick_soonest_available(
    state: &PoolState,
    candidates: &[UpstreamCredential],
    excluded: &HashSet<i64>,
) -> Option<UpstreamCredential> {
    candidates
        .iter()
        .filter(|c| c.enabled && !excluded.contains(&c.id) && !state.in_flight.contains(&c.id))
        .min_by_key(|c| state.entries.get(&c.id).and_then(|e| e.cooldown_until))
        .cloned()
}

/// Leases one credential for the duration of a single upstream attempt.
/// Blocks up to [`LEASE_WAIT_CAP`] if every enabled credential is currently
/// under cooldown or leased elsewhere, polling for one to free up; if the
/// wait cap is crossed it returns the best-effort choice (soonest cooldown
/// expiry) rather than failing the request outright. Returns `None` only
/// when no enabled, non-excluded credential exists at all.
pub async fn lease(
    pool: &Mutex<PoolState>,
    candidates: &[UpstreamCredential],
    excluded: &HashSet<i64>,
) -> Option<UpstreamCredential> {
    let deadline = tokio::time::Instant::now() + LEASE_WAIT_CAP;
    loop {
        let mut guard = pool.lock().await;
        if let Some(cred) = pick_eligible(&guard, candidates, excluded, Utc::now()) {
            guard.in_flight.insert(cred.id);
            return Some(cred);
        }
        drop(guard);

        if tokio::time::Instant::now() >= deadline {
            let mut guard = pool.lock().await;
            let fallback = pick_soonest_available(&guard, candidates, excluded);
            if let Some(ref cred) = fallback {
                guard.in_flight.insert(cred.id);
            }
            return fallback;
        }

        tokio::time::sleep(LEASE_POLL_INTERVAL.min(deadline.saturating_duration_since(tokio::time::Instant::now())))
            .await;
    }
}

/// Record the outcome of a settled lease: update in-memory score/cooldown,
/// release the credential from `in_flight`, and persist the new state
/// (score, cooldown, counters, `last_status`) to the store.
pub async fn settle(
    pool: &Mutex<PoolState>,
    conn: &Connection,
    credential: &UpstreamCredential,
    outcome: Outcome,
) -> AppResult<()> {
    let (score, cooldown_until, disable, last_status, is_error, tokens) = {
        let mut guard = pool.lock().await;
        guard.in_flight.remove(&credential.id);
        let entry = guard.entry(credential.id, credential.score);
        let (last_status, is_error, tokens) = match outcome {
            Outcome::Ok { tokens_in, tokens_out } => {
                entry.score = (entry.score + 1).min(100);
                entry.cooldown_until = None;
                ("active".to_string(), false, tokens_in + tokens_out)
            }
            Outcome::Retryable(kind) => {
                entry.score = (entry.score - 10).max(0);
                entry.cooldown_until = Some(Utc::now() + backoff_for(kind));
                (format!("retryable:{:?}", kind), true, 0)
            }
            Outcome::Fatal(kind) => {
                entry.score = 0;
                entry.cooldown_until = None;
                (format!("auto_disabled:{:?}", kind), true, 0)
            }
        };
        (
            entry.score,
            entry.cooldown_until,
            matches!(outcome, Outcome::Fatal(_)),
            last_status,
            is_error,
            tokens,
        )
    };

    let cooldown_str = cooldown_until.map(|c| c.to_rfc3339());
    let now = Utc::now().to_rfc3339();
    let persisted_status = if disable { "auto_disabled".to_string() } else { last_status };
    store::record_credential_settlement(
        conn,
        credential.id,
        score,
        cooldown_str.as_deref(),
        &persisted_status,
        is_error,
        tokens,
        &now,
    )?;
    if disable {
        store::disable_credential(conn, credential.id)?;
    }
    Ok(())
}
