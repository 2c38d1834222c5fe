//! Credential layering: operator override wins over the build-time default

use std::fmt;

/// Access token for the text-generation service. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// `None` for blank input
    pub fn new(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// The two credential layers, resolved per turn
#[derive(Debug, Clone, Default)]
pub struct CredentialSource {
    pub override_token: Option<Credential>,
    pub default_token: Option<Credential>,
}

impl CredentialSource {
    pub fn new(override_token: Option<Credential>, default_token: Option<Credential>) -> Self {
        Self {
            override_token,
            default_token,
        }
    }

    pub fn resolve(&self) -> Option<&Credential> {
        self.override_token.as_ref().or(self.default_token.as_ref())
    }
}
