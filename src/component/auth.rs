//! Local inbound authentication.
//!
//! # Responsibilities
//! - Parse `user:password` entries into an authenticator
//! - Hold the authenticator and the auth-skip prefixes used by listeners
//!
//! # Design Decisions
//! - No users means no authenticator (`None`), i.e. authentication disabled
//! - Swapped wholesale with `ArcSwapOption`; listeners read without locking

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use ipnet::IpNet;
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user: String,
    pub pass: String,
}

impl AuthUser {
    /// Parse `user:password`. The password may itself contain `:`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (user, pass) = entry.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }
}

pub struct Authenticator {
    storage: HashMap<String, String>,
    users: Vec<String>,
}

impl Authenticator {
    pub fn new(users: &[AuthUser]) -> Option<Self> {
        if users.is_empty() {
            return None;
        }
        let storage: HashMap<_, _> = users
            .iter()
            .map(|u| (u.user.clone(), u.pass.clone()))
            .collect();
        let users = users.iter().map(|u| u.user.clone()).collect();
        Some(Self { storage, users })
    }

    pub fn verify(&self, user: &str, pass: &str) -> bool {
        self.storage.get(user).is_some_and(|p| p == pass)
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }
}

#[derive(Default)]
pub struct AuthStore {
    authenticator: ArcSwapOption<Authenticator>,
    skip_prefixes: RwLock<Vec<IpNet>>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_authenticator(&self, auth: Option<Authenticator>) {
        self.authenticator.store(auth.map(Arc::new));
    }

    pub fn authenticator(&self) -> Option<Arc<Authenticator>> {
        self.authenticator.load_full()
    }

    pub fn set_skip_prefixes(&self, prefixes: Vec<IpNet>) {
        *self.skip_prefixes.write() = prefixes;
    }

    pub fn skip_prefixes(&self) -> Vec<IpNet> {
        self.skip_prefixes.read().clone()
    }

    /// Whether a client from `addr` must authenticate.
    pub fn requires_auth(&self, addr: IpAddr) -> bool {
        if self.authenticator.load().is_none() {
            return false;
        }
        !self.skip_prefixes.read().iter().any(|p| p.contains(&addr))
    }
}
