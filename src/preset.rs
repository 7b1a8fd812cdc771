//! Turns a preset document plus the inbound client messages into the final
//! message list sent downstream, expanding `{{...}}` directives along the way.

use crate::store::{Preset, PresetItem, PresetItemKind};
use crate::vars::{self, VarScope};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Expand `preset` against `inbound` messages, or pass `inbound` through
/// unchanged when there is no bound preset.
pub fn expand(
    preset: Option<(&Preset, &[PresetItem])>,
    inbound: &[ChatMessage],
    scope: &mut VarScope,
) -> Vec<ChatMessage> {
    let Some((_preset, items)) = preset else {
        return inbound.to_vec();
    };

    let last_user_index = inbound.iter().rposition(|m| m.role == "user");
    let mut saw_user_input_item = false;
    let mut out = Vec::new();

    for item in items.iter().filter(|i| i.enabled) {
        match item.kind {
            PresetItemKind::Normal => {
                let role = item.role.clone().unwrap_or_else(|| "system".to_string());
                let content = item.content.as_deref().unwrap_or("");
                out.push(ChatMessage::new(role, vars::expand(content, scope)));
            }
            PresetItemKind::UserInput => {
                saw_user_input_item = true;
                if let Some(idx) = last_user_index {
                    out.push(inbound[idx].clone());
                }
            }
            PresetItemKind::History => {
                for (idx, msg) in inbound.iter().enumerate() {
                    if Some(idx) == last_user_index {
                        continue;
                    }
                    out.push(msg.clone());
                }
            }
        }
    }

    if !saw_user_input_item {
        if let Some(idx) = last_user_index {
            out.push(inbound[idx].clone());
        }
    }

    out
}
