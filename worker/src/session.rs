use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use membrane_rpc::{Frame, Interceptor, MethodId};
use serde_json::Value;
use uuid::Uuid;

/// Payload field carrying the session token.
pub const SESSION_FIELD: &str = "session";

pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Decides whether a credential pair may open a session.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, secret: &str) -> bool;
}

/// Accepts any pair where both parts are non-empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonEmptyCredentials;

impl Authenticator for NonEmptyCredentials {
    fn authenticate(&self, user: &str, secret: &str) -> bool {
        !user.trim().is_empty() && !secret.is_empty()
    }
}

/// Worker-side table of issued session tokens. Holds at most `max_sessions`
/// tokens; issuing past that evicts the oldest.
#[derive(Debug)]
pub(crate) struct SessionStore {
    max_sessions: usize,
    inner: Mutex<Sessions>,
}

#[derive(Debug, Default)]
struct Sessions {
    users: HashMap<String, String>,
    /// Tokens in issue order.
    order: VecDeque<String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            inner: Mutex::default(),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn issue(&self, user: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions();
        while sessions.users.len() >= self.max_sessions {
            let Some(oldest) = sessions.order.pop_front() else {
                break;
            };
            if let Some(owner) = sessions.users.remove(&oldest) {
                tracing::debug!(user = %owner, "Evicted oldest session");
            }
        }
        sessions.users.insert(token.clone(), user.to_string());
        sessions.order.push_back(token.clone());
        token
    }

    /// User that owns the session named in `payload`, if any.
    pub(crate) fn user_for(&self, payload: &Value) -> Option<String> {
        let token = token_in(payload)?;
        self.sessions().users.get(token).cloned()
    }

    /// Forget the session named in `payload`. Returns its user.
    pub(crate) fn revoke(&self, payload: &Value) -> Option<String> {
        let token = token_in(payload)?;
        let mut sessions = self.sessions();
        let user = sessions.users.remove(token)?;
        sessions.order.retain(|issued| issued != token);
        Some(user)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions().users.len()
    }
}

fn token_in(payload: &Value) -> Option<&str> {
    payload.get(SESSION_FIELD)?.as_str()
}

/// Client-side interceptor stamping the current session token onto every
/// outgoing request except authentication itself.
#[derive(Debug, Default)]
pub struct SessionInterceptor {
    token: Mutex<Option<String>>,
}

impl SessionInterceptor {
    pub fn set(&self, token: impl Into<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Interceptor for SessionInterceptor {
    fn name(&self) -> &str {
        "session"
    }

    fn on_request(&self, frame: &mut Frame) {
        if frame.method() == Some(MethodId::Authenticate) {
            return;
        }
        let Some(token) = self.token() else {
            return;
        };
        if let Value::Object(fields) = &mut frame.payload {
            fields
                .entry(SESSION_FIELD)
                .or_insert_with(|| Value::String(token));
        }
    }
}
