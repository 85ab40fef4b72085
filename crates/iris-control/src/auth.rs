//! Control-channel authentication and service authorization.
//!
//! The engine consumes authenticators through the [`Authenticator`]
//! trait; [`SimpleAuthenticator`] is the bundled credential-table
//! implementation, suitable for tooling and tests rather than serious
//! deployments.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// How an account's allow/disallow lists are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPriority {
    /// Specific allows win over general disallows.
    #[default]
    AllowFirst,
    /// Specific disallows win over general allows.
    DisallowFirst,
}

/// An authenticated control-channel identity.
#[derive(Debug, Clone)]
pub struct Account {
    /// The account id.
    pub id: String,
    /// Service names (or `"*"`) this account may manage.
    pub services_allowed: Vec<String>,
    /// Service names this account must not manage.
    pub services_disallowed: Vec<String>,
    /// List combination mode.
    pub priority: AccessPriority,
}

/// Credential and authorization checks for control clients.
pub trait Authenticator: Send + Sync + 'static {
    /// Check an AUTH payload; `Some(account)` on success.
    fn authenticate(&self, payload: &Value) -> Option<Account>;

    /// Whether the account may manage the named service, or the whole
    /// server when `service` is `None`.
    fn authorize_service(&self, service: Option<&str>, account: &Account) -> bool;
}

/// How a stored secret is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretAlgo {
    /// Plain string comparison.
    #[default]
    Plain,
    /// The stored secret is the hex SHA-256 of the cleartext.
    Sha256,
}

#[derive(Debug, Clone)]
struct AccountRecord {
    secret: String,
    algo: SecretAlgo,
    services_allowed: Vec<String>,
    services_disallowed: Vec<String>,
    priority: AccessPriority,
}

/// A toy in-memory credential table.
///
/// Ships with a single `admin`/`password` account granted every service,
/// mirroring what the bundled examples expect; replace the accounts (or
/// the whole authenticator) in anything real.
pub struct SimpleAuthenticator {
    accounts: RwLock<HashMap<String, AccountRecord>>,
}

impl Default for SimpleAuthenticator {
    fn default() -> Self {
        let auth = Self {
            accounts: RwLock::new(HashMap::new()),
        };
        auth.add_account(
            "admin",
            "password",
            SecretAlgo::Plain,
            vec!["*".to_string()],
            Vec::new(),
            AccessPriority::AllowFirst,
        );
        auth
    }
}

impl SimpleAuthenticator {
    /// Create the default table (`admin`/`password`, all services).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table.
    pub fn empty() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Add an account. Returns `false` when the id is already taken.
    pub fn add_account(
        &self,
        id: impl Into<String>,
        secret: impl Into<String>,
        algo: SecretAlgo,
        services_allowed: Vec<String>,
        services_disallowed: Vec<String>,
        priority: AccessPriority,
    ) -> bool {
        let id = id.into();
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&id) {
            return false;
        }
        accounts.insert(
            id,
            AccountRecord {
                secret: secret.into(),
                algo,
                services_allowed,
                services_disallowed,
                priority,
            },
        );
        true
    }

    /// Remove an account. Returns whether it existed.
    pub fn remove_account(&self, id: &str) -> bool {
        self.accounts.write().remove(id).is_some()
    }
}

impl Authenticator for SimpleAuthenticator {
    fn authenticate(&self, payload: &Value) -> Option<Account> {
        let id = payload.get("id")?.as_str()?;
        let secret = payload.get("secret")?.as_str()?;

        let accounts = self.accounts.read();
        let record = accounts.get(id)?;

        let presented = match record.algo {
            SecretAlgo::Plain => secret.to_string(),
            SecretAlgo::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(secret.as_bytes());
                hex_encode(&hasher.finalize())
            }
        };

        if presented == record.secret {
            debug!(account = id, "authenticated");
            Some(Account {
                id: id.to_string(),
                services_allowed: record.services_allowed.clone(),
                services_disallowed: record.services_disallowed.clone(),
                priority: record.priority,
            })
        } else {
            warn!(account = id, "auth failed");
            None
        }
    }

    fn authorize_service(&self, service: Option<&str>, account: &Account) -> bool {
        let wildcard = account.services_allowed.iter().any(|s| s == "*");

        let Some(service) = service else {
            // whole-server scope needs the wildcard grant
            return wildcard;
        };

        let allowed = account.services_allowed.iter().any(|s| s == service);
        let disallowed = account.services_disallowed.iter().any(|s| s == service);

        match account.priority {
            AccessPriority::AllowFirst => {
                if allowed {
                    true
                } else {
                    wildcard && !disallowed
                }
            }
            AccessPriority::DisallowFirst => {
                if disallowed {
                    false
                } else {
                    wildcard || allowed
                }
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
