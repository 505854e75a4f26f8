//! Login checks performed before an avatar is created.

use std::collections::HashMap;

/// Decides whether a username/password pair may log in.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Fixed table of accounts.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    accounts: HashMap<String, String>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an account.
    pub fn with_account(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.insert(username, password);
        self
    }

    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.accounts.insert(username.into(), password.into());
    }

    /// Parse `user:password`. The password may itself contain colons.
    pub fn parse_entry(entry: &str) -> Option<(String, String)> {
        let (user, password) = entry.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), password.to_string()))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Authenticator for CredentialTable {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.accounts
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

/// Accepts every login. Only sensible on a trusted network.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnyone;

impl Authenticator for AllowAnyone {
    fn authenticate(&self, _username: &str, _password: &str) -> bool {
        true
    }
}
