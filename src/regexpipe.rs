//! Ordered pre/post rewrite-rule application.
//!
//! Rule ordering (account rules before preset rules, both ascending by
//! `sort_order`) is decided by [`crate::store::regex_rules_for_phase`]; this
//! module only applies whatever order it is handed.

use crate::store::RegexRule;
use regex::Regex;

/// Apply `rules` in order to `text`. A rule whose pattern fails to compile,
/// or whose match produces no change, is skipped rather than aborting the
/// whole pipeline — one bad rule must not take the request down with it.
pub fn apply(rules: &[RegexRule], text: &str) -> String {
    let mut current = text.to_string();
    for rule in rules {
        match Regex::new(&rule.pattern) {
            Ok(re) => {
                current = re.replace_all(&current, rule.replacement.as_str()).into_owned();
            }
            Err(err) => {
                tracing::warn!(
                    rule_id = rule.id,
                    pattern = %rule.pattern,
                    error = %err,
                    "skipping regex rule with invalid pattern"
                );
            }
        }
    }
    current
}
