//! Session credential and authentication headers
//!
//! The credential is acquired and refreshed elsewhere (REST login flow).
//! This crate only reads it when an endpoint is connected.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Cookie carrying the session token
pub const COOKIE_HEADER: &str = "Cookie";
/// Account id header attached next to the cookie
pub const ACCOUNT_ID_HEADER: &str = "X-Grvt-Account-Id";
/// Cookie name of the session token
const SESSION_COOKIE: &str = "gravity";

/// Session token plus the account it belongs to
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub token: String,
    pub account_id: Option<String>,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>, account_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            account_id,
        }
    }
}

// Token stays out of Debug output so credentials never reach the logs
impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Read side of whatever owns the session credential
pub trait CredentialSource: Send + Sync {
    /// Current credential, if a session exists
    fn current(&self) -> Option<SessionCredential>;
}

/// Shared credential slot written by the login/refresh flow
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<SessionCredential>>>,
}

impl SharedCredential {
    /// Empty slot (no session yet)
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot holding a credential
    pub fn with_credential(credential: SessionCredential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(credential))),
        }
    }

    /// Replace the credential (after login or refresh)
    pub fn set(&self, credential: SessionCredential) {
        *self.inner.write() = Some(credential);
    }

    /// Drop the credential (logout or expiry)
    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl CredentialSource for SharedCredential {
    fn current(&self) -> Option<SessionCredential> {
        self.inner.read().clone()
    }
}

/// Auxiliary handshake headers derived from the session credential
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders {
    headers: Vec<(&'static str, String)>,
}

impl AuthHeaders {
    /// Build headers from an optional credential
    ///
    /// No credential gives an empty set. The account id header is only
    /// added when the id is present and non-empty.
    pub fn from_credential(credential: Option<&SessionCredential>) -> Self {
        let Some(credential) = credential else {
            return Self::default();
        };

        let mut headers = Vec::with_capacity(2);
        headers.push((COOKIE_HEADER, format!("{}={}", SESSION_COOKIE, credential.token)));
        if let Some(account_id) = credential.account_id.as_deref().filter(|id| !id.is_empty()) {
            headers.push((ACCOUNT_ID_HEADER, account_id.to_string()));
        }
        Self { headers }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Header value by case-insensitive name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.headers.iter().map(|(key, value)| (*key, value.as_str()))
    }

    /// Log-safe rendering: cookie value redacted, account id kept
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .headers
            .iter()
            .map(|(key, value)| {
                if *key == COOKIE_HEADER {
                    format!("{}={}=<redacted>", key, SESSION_COOKIE)
                } else {
                    format!("{}={}", key, value)
                }
            })
            .collect();
        format!("{{{}}}", parts.join(", "))
    }
}

impl fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}
