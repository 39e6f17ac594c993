//! Credential validation and permission checks.
//!
//! Token issuance lives elsewhere; this module only decides whether a
//! presented credential names a known principal, and whether that
//! principal may perform an action on a target.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::UserConfig;
use crate::target::Target;

/// A login credential. Also the shape of the first WebSocket message:
/// `{"type": "Jwt", "params": {"jwt": ...}}` or
/// `{"type": "ApiKeys", "params": {"key": ..., "secret": ...}}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Credential {
    Jwt { jwt: String },
    ApiKeys { key: String, secret: String },
}

/// The first message a client sends on a terminal socket.
pub type WsLoginMessage = Credential;

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Jwt { .. } => f.write_str("Credential::Jwt(..)"),
            Credential::ApiKeys { key, .. } => write!(f, "Credential::ApiKeys({key}, ..)"),
        }
    }
}

impl Credential {
    pub fn jwt(jwt: impl Into<String>) -> Self {
        Credential::Jwt { jwt: jwt.into() }
    }

    pub fn api_keys(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential::ApiKeys {
            key: key.into(),
            secret: secret.into(),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// List terminals.
    Read,
    /// Open, create, delete terminals and run commands.
    Terminal,
    /// Bulk operations across servers.
    Admin,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
}

/// Validates credentials.
pub trait Authenticator: Send + Sync {
    fn validate(&self, credential: &Credential) -> Result<Principal, AuthError>;
}

/// Yes/no gate consulted before every terminal operation.
pub trait PermissionChecker: Send + Sync {
    fn check(&self, principal: &Principal, target: Option<&Target>, action: Action) -> bool;
}

/// Users from the config file. Implements both collaborator traits.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    users: Vec<UserConfig>,
}

impl StaticAuth {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }

    fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }
}

fn secure_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

impl Authenticator for StaticAuth {
    fn validate(&self, credential: &Credential) -> Result<Principal, AuthError> {
        // Scan every user so timing does not depend on which one matched.
        let mut matched = None;
        for user in &self.users {
            let ok = match credential {
                Credential::Jwt { jwt } => user.jwt.as_deref().is_some_and(|j| secure_eq(j, jwt)),
                Credential::ApiKeys { key, secret } => {
                    let key_ok = user.api_key.as_deref().is_some_and(|k| secure_eq(k, key));
                    let secret_ok = user.api_secret.as_deref().is_some_and(|s| secure_eq(s, secret));
                    key_ok & secret_ok
                }
            };
            if ok && matched.is_none() {
                matched = Some(user.name.clone());
            }
        }
        matched
            .map(|name| Principal { name })
            .ok_or(AuthError::InvalidCredential)
    }
}

impl PermissionChecker for StaticAuth {
    fn check(&self, principal: &Principal, _target: Option<&Target>, action: Action) -> bool {
        let Some(user) = self.user(&principal.name) else {
            return false;
        };
        match action {
            Action::Read => true,
            Action::Terminal => user.terminal || user.admin,
            Action::Admin => user.admin,
        }
    }
}
