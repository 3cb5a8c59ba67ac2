use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GLOBAL_SCOPE;

/// Owner of persisted cache data: a signed-in user within one scope
/// (typically a school). Records written under one namespace are never read
/// back under another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub user_id: String,
    pub scope_id: String,
}

impl Namespace {
    pub fn new(user_id: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scope_id: scope_id.into(),
        }
    }

    pub fn global(user_id: impl Into<String>) -> Self {
        Self::new(user_id, GLOBAL_SCOPE)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.scope_id)
    }
}
