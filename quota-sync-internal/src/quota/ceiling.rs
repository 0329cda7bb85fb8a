use serde::{Deserialize, Serialize};

use crate::identity::IdentityKind;

/// Maps the identity kind to its prompt ceiling. Never read from the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CeilingPolicy {
    #[serde(default = "default_anonymous_ceiling")]
    pub anonymous: u32,
    #[serde(default = "default_authenticated_ceiling")]
    pub authenticated: u32,
}

fn default_anonymous_ceiling() -> u32 {
    5
}

fn default_authenticated_ceiling() -> u32 {
    8
}

impl Default for CeilingPolicy {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous_ceiling(),
            authenticated: default_authenticated_ceiling(),
        }
    }
}

impl CeilingPolicy {
    pub fn ceiling_for(&self, kind: IdentityKind) -> u32 {
        match kind {
            IdentityKind::Anonymous => self.anonymous,
            IdentityKind::Authenticated => self.authenticated,
        }
    }
}
