use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    domain::{ConversationInfo, SenderInfo, UserId},
    errors::Error,
    ports::IdentityResolver,
    Result,
};

/// Identity resolution from a fixed `sender -> user` table.
///
/// Keys may be a sender id or a phone number; the id is tried first. Phone
/// numbers are compared with formatting stripped so `+1 (555) 0001` matches
/// `+15550001`.
#[derive(Clone, Debug, Default)]
pub struct StaticIdentityResolver {
    by_key: HashMap<String, UserId>,
}

impl StaticIdentityResolver {
    pub fn new(map: &HashMap<String, String>) -> Self {
        let by_key = map
            .iter()
            .map(|(k, v)| (normalize_key(k), UserId(v.clone())))
            .collect();
        Self { by_key }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve_user(
        &self,
        sender: &SenderInfo,
        conversation: &ConversationInfo,
    ) -> Result<UserId> {
        let candidates = std::iter::once(sender.id.as_str()).chain(sender.phone.as_deref());
        for key in candidates {
            if let Some(user) = self.by_key.get(&normalize_key(key)) {
                return Ok(user.clone());
            }
        }
        Err(Error::UserResolution(format!(
            "no user mapped for sender {} in conversation {}",
            sender.id, conversation.id
        )))
    }
}

fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    let looks_like_phone = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
    if looks_like_phone && trimmed.chars().any(|c| c.is_ascii_digit()) {
        return trimmed
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
    }
    trimmed.to_string()
}
