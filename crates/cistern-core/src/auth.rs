//! Credentials used to partition pools

use serde::{Deserialize, Serialize};

/// Immutable `(username, password)` pair.
///
/// Equal auths share one physical sub-pool. The default auth (no user, no
/// password) means "use whatever credentials the driver was configured with".
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbAuth {
    user: Option<String>,
    password: Option<String>,
}

impl DbAuth {
    /// Create an auth for the given user and password
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }

    /// The default (driver-configured) credentials
    pub fn default_auth() -> Self {
        Self::default()
    }

    /// Build an auth, treating empty strings as absent
    pub fn from_parts(user: Option<&str>, password: Option<&str>) -> Self {
        Self {
            user: user.filter(|u| !u.is_empty()).map(str::to_string),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether this is the default auth
    pub fn is_default(&self) -> bool {
        self.user.is_none() && self.password.is_none()
    }
}

impl std::fmt::Debug for DbAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbAuth")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "******"))
            .finish()
    }
}

impl std::fmt::Display for DbAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user.as_deref().unwrap_or("<default>"))
    }
}
