//! Data-model types persisted by [`super`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantKey {
    pub id: i64,
    pub account_id: i64,
    pub key_hash: String,
    pub display_name: Option<String>,
    pub preset_id: Option<i64>,
    pub enabled: bool,
    /// Whether the account-level regex pipeline runs for requests
    /// authenticated by this key. Preset-level rules always run regardless.
    pub apply_regex: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCredential {
    pub id: i64,
    pub account_id: i64,
    pub label: String,
    pub secret: String,
    pub enabled: bool,
    pub score: i64,
    pub cooldown_until: Option<String>,
    /// Last observed status: an HTTP/transport status code as a string, or
    /// one of the synthetic states `active` / `auto_disabled`.
    pub last_status: String,
    pub last_used_at: Option<String>,
    pub total_uses: i64,
    pub total_errors: i64,
    pub total_tokens: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetItemKind {
    Normal,
    UserInput,
    History,
}

impl PresetItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresetItemKind::Normal => "normal",
            PresetItemKind::UserInput => "user_input",
            PresetItemKind::History => "history",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(PresetItemKind::Normal),
            "user_input" => Some(PresetItemKind::UserInput),
            "history" => Some(PresetItemKind::History),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetItem {
    pub id: i64,
    pub preset_id: i64,
    pub kind: PresetItemKind,
    pub role: Option<String>,
    pub content: Option<String>,
    pub enabled: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexScope {
    Account,
    Preset,
}

impl RegexScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegexScope::Account => "account",
            RegexScope::Preset => "preset",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "account" => Some(RegexScope::Account),
            "preset" => Some(RegexScope::Preset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexPhase {
    Pre,
    Post,
}

impl RegexPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegexPhase::Pre => "pre",
            RegexPhase::Post => "post",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(RegexPhase::Pre),
            "post" => Some(RegexPhase::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexRule {
    pub id: i64,
    pub scope: RegexScope,
    pub account_id: Option<i64>,
    pub preset_id: Option<i64>,
    pub phase: RegexPhase,
    pub pattern: String,
    pub replacement: String,
    pub sort_order: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogEntry {
    pub id: i64,
    pub tenant_key_id: Option<i64>,
    pub model: String,
    pub status_code: u16,
    pub synthetic_status: String,
    pub latency_ms: i64,
    pub ttft_ms: Option<i64>,
    pub stream: bool,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub tokens_estimated: bool,
    pub created_at: String,
}
