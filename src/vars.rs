//! Hand-written `{{...}}` directive scanner.
//!
//! Deliberately not a general templating engine: the directive set is
//! closed (`roll`, `random`, `setvar`, `getvar`, `date`, `time`, `#comment`)
//! and evaluation is left-to-right, innermost-first, matching the way the
//! teacher hand-parses SSE framing in `forward/client.rs` rather than
//! reaching for a parsing crate it doesn't already depend on.

use chrono::Utc;
use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand::rngs::StdRng;
use std::collections::HashMap;

pub trait RngSource: Send {
    fn next_u64(&mut self) -> u64;
}

pub struct OsRngSource;

impl RngSource for OsRngSource {
    fn next_u64(&mut self) -> u64 {
        OsRng.next_u64()
    }
}

pub struct SeededRngSource(StdRng);

impl SeededRngSource {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RngSource for SeededRngSource {
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
}

/// Per-request evaluation scope: its own variable map and its own PRNG.
pub struct VarScope {
    rng: Box<dyn RngSource>,
    vars: HashMap<String, String>,
}

impl VarScope {
    pub fn new(rng: Box<dyn RngSource>) -> Self {
        Self {
            rng,
            vars: HashMap::new(),
        }
    }

    pub fn from_seed_override(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::new(Box::new(SeededRngSource::new(seed))),
            None => Self::new(Box::new(OsRngSource)),
        }
    }

    fn roll(&mut self, count: u32, sides: u32) -> i64 {
        let mut total: i64 = 0;
        for _ in 0..count.max(1) {
            let r = self.rng.next_u64();
            total += (r % sides.max(1) as u64) as i64 + 1;
        }
        total
    }

    fn pick<'a>(&mut self, options: &'a [&'a str]) -> &'a str {
        if options.is_empty() {
            return "";
        }
        let idx = (self.rng.next_u64() % options.len() as u64) as usize;
        options[idx]
    }
}

/// Expand every `{{...}}` directive in `input`, evaluating left-to-right,
/// innermost-first.
///
/// `search_from` is a scan cursor rather than a restart-at-zero loop: an
/// unrecognized directive is left verbatim (§4.2) and the cursor is advanced
/// past it so the same unresolved `}}` is never re-found, which is what
/// guarantees this terminates instead of looping forever on a typo'd or
/// stray `{{...}}`.
pub fn expand(input: &str, scope: &mut VarScope) -> String {
    let mut s = input.to_string();
    let mut search_from = 0usize;
    loop {
        let Some(rel_close) = s[search_from..].find("}}") else { break };
        let close = search_from + rel_close;
        let Some(open) = s[..close].rfind("{{") else {
            search_from = close + 2;
            continue;
        };
        let directive = s[open + 2..close].to_string();
        match eval_directive(&directive, scope) {
            Some(replacement) => {
                search_from = open + replacement.len();
                s.replace_range(open..close + 2, &replacement);
            }
            None => {
                search_from = close + 2;
            }
        }
    }
    s
}

/// `None` means "unrecognized directive, leave the original text verbatim"
/// (§4.2); the caller advances its scan cursor past it without touching `s`.
fn eval_directive(directive: &str, scope: &mut VarScope) -> Option<String> {
    let trimmed = directive.trim();

    if let Some(rest) = trimmed.strip_prefix('#') {
        let _ = rest;
        return Some(String::new());
    }

    let lower = trimmed.to_ascii_lowercase();

    if lower == "date" {
        return Some(Utc::now().format("%Y-%m-%d").to_string());
    }

    if lower == "time" {
        return Some(Utc::now().format("%H:%M:%S").to_string());
    }

    if lower.starts_with("roll")
        && lower.as_bytes().get(4).map_or(true, |b| b.is_ascii_whitespace())
    {
        let rest = trimmed[4..].trim();
        if !rest.is_empty() {
            return Some(eval_roll(rest, scope));
        }
    }

    if lower.starts_with("random::") {
        let rest = &trimmed["random::".len()..];
        let options: Vec<&str> = rest.split("::").collect();
        return Some(scope.pick(&options).to_string());
    }

    if lower.starts_with("setvar::") {
        let rest = &trimmed["setvar::".len()..];
        if let Some((name, value)) = rest.split_once("::") {
            scope.vars.insert(name.trim().to_string(), value.to_string());
        }
        return Some(String::new());
    }

    if lower.starts_with("getvar::") {
        let name = trimmed["getvar::".len()..].trim();
        return Some(scope.vars.get(name).cloned().unwrap_or_default());
    }

    None
}

fn eval_roll(spec: &str, scope: &mut VarScope) -> String {
    if let Some((count, sides)) = spec.split_once('d') {
        let count: u32 = count.trim().parse().unwrap_or(1);
        let sides: u32 = sides.trim().parse().unwrap_or(1);
        return scope.roll(count, sides).to_string();
    }
    let sides: u32 = spec.trim().parse().unwrap_or(1);
    scope.roll(1, sides).to_string()
}
