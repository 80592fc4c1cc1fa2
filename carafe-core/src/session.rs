// Session handling: per-request session data and the store contract

use crate::{Error, HttpRequest, HttpResponse};
use async_trait::async_trait;
use carafe_log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Session data opened for one request.
///
/// Values are JSON, keyed by string. The session tracks whether it was
/// modified so the store can skip writing untouched sessions back to the
/// client.
#[derive(Debug, Default)]
pub struct Session {
    data: RwLock<HashMap<String, serde_json::Value>>,
    dirty: AtomicBool,
}

impl Session {
    /// Create a new empty session
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session from previously persisted data
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// Get a value from the session
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .read()
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a value in the session
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), Error> {
        let value = serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.data.write().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove a value from the session
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.data.write().remove(key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Remove and return a typed value, like a map `pop`
    pub fn take<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.remove(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Check if a key exists in the session
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Clear all session data
    pub fn clear(&self) {
        let mut data = self.data.write();
        if !data.is_empty() {
            self.dirty.store(true, Ordering::Release);
        }
        data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Whether the session was modified since it was opened
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Snapshot of the session data
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        self.data.read().clone()
    }
}

/// The store contract the dispatch core consumes: open once at the start
/// of a request, save at most once into the outgoing response.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open the session for a request. `None` means the application runs
    /// without sessions (e.g. no secret key is configured).
    async fn open(&self, request: &HttpRequest) -> Result<Option<Session>, Error>;

    /// Write the session into the response, e.g. as a cookie.
    async fn save(&self, session: &Session, response: &mut HttpResponse) -> Result<(), Error>;
}

/// Default store: the session data map travels as JSON in a cookie held by
/// the client. Opening requires a configured secret key; cryptographic
/// signing of the cookie payload is the deployment's concern, not the
/// dispatch core's.
pub struct CookieSessionStore {
    cookie_name: String,
    secret_key: Option<String>,
}

impl CookieSessionStore {
    pub fn new(cookie_name: impl Into<String>, secret_key: Option<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            secret_key,
        }
    }
}

#[async_trait]
impl SessionStore for CookieSessionStore {
    async fn open(&self, request: &HttpRequest) -> Result<Option<Session>, Error> {
        if self.secret_key.is_none() {
            return Ok(None);
        }

        let session = match request.cookie(&self.cookie_name) {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(data) => Session::from_map(data),
                Err(_) => {
                    // A stale or tampered cookie degrades to a fresh
                    // session instead of failing the request.
                    warn!(cookie = %self.cookie_name, "discarding unreadable session cookie");
                    Session::new()
                }
            },
            None => Session::new(),
        };

        Ok(Some(session))
    }

    async fn save(&self, session: &Session, response: &mut HttpResponse) -> Result<(), Error> {
        if !session.is_dirty() {
            return Ok(());
        }
        let payload = serde_json::to_string(&session.to_map())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        response.set_cookie(&self.cookie_name, &payload);
        Ok(())
    }
}
