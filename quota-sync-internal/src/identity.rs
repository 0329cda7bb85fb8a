use serde::{Deserialize, Serialize};

/// Raw identity inputs as the identity provider hands them over.
///
/// Any field may change independently (a fingerprint resolving late, a session expiring);
/// the tracker treats every change as a new identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInput {
    pub fingerprint: Option<String>,
    pub account_id: Option<String>,
    #[serde(default)]
    pub session_valid: bool,
}

impl IdentityInput {
    pub fn anonymous(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: Some(fingerprint.into()),
            account_id: None,
            session_valid: false,
        }
    }

    pub fn authenticated(account_id: impl Into<String>) -> Self {
        Self {
            fingerprint: None,
            account_id: Some(account_id.into()),
            session_valid: true,
        }
    }

    /// Attach a device fingerprint, e.g. a signed-in account on a known browser
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Resolve the inputs into the identity that should be tracked.
    ///
    /// A signed-in account wins over the device fingerprint, but only while its session is valid.
    /// Empty strings count as absent. `None` means there is nothing to track yet.
    pub fn resolve(&self) -> Option<Identity> {
        let account_id = self.account_id.as_deref().filter(|id| !id.is_empty());
        let fingerprint = self.fingerprint.as_deref().filter(|fp| !fp.is_empty());

        match (account_id, fingerprint) {
            (Some(account_id), _) if self.session_valid => Some(Identity::Authenticated {
                account_id: account_id.to_string(),
                session_valid: true,
            }),
            (_, Some(fingerprint)) => Some(Identity::Anonymous {
                fingerprint: fingerprint.to_string(),
            }),
            _ => None,
        }
    }
}

/// The identity quota is tracked for. Exactly one variant is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Anonymous {
        fingerprint: String,
    },
    Authenticated {
        account_id: String,
        session_valid: bool,
    },
}

impl Identity {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Identity::Anonymous { .. } => IdentityKind::Anonymous,
            Identity::Authenticated { .. } => IdentityKind::Authenticated,
        }
    }

    /// The opaque value the counter row is keyed by
    pub fn value(&self) -> &str {
        match self {
            Identity::Anonymous { fingerprint } => fingerprint,
            Identity::Authenticated { account_id, .. } => account_id,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Anonymous { fingerprint } => write!(f, "guest `{fingerprint}`"),
            Identity::Authenticated { account_id, .. } => write!(f, "account `{account_id}`"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Anonymous,
    Authenticated,
}
