use std::collections::HashMap;

use parking_lot::Mutex;

/// Authentication and authorization backend.
///
/// Backends answer for one named scope (a tenant domain, or the context
/// name for single-tenant embedders). `recognize` exists for domain
/// probing: it must answer whether the credentials belong to this scope
/// without performing any side effect.
pub trait AuthBackend: Send + Sync {
    /// Whether the peer may connect with these credentials.
    fn authenticate(
        &self,
        domain: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool;

    /// Whether the client may subscribe to the topic filter.
    fn authorize_subscribe(&self, _domain: &str, _client_id: &str, _filter: &str) -> bool {
        true
    }

    /// Whether the client may publish to the topic.
    fn authorize_publish(&self, _domain: &str, _client_id: &str, _topic: &str) -> bool {
        true
    }

    /// Whether this backend recognizes the credential triple at all.
    fn recognize(
        &self,
        domain: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let _ = (domain, client_id, username, password);
        false
    }
}

/// A user/password table held in memory.
#[derive(Debug, Default)]
pub struct MemoryAuth {
    users: Mutex<HashMap<String, Vec<u8>>>,
    allow_anonymous: bool,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts connections that carry no username at all.
    pub fn with_anonymous() -> Self {
        MemoryAuth {
            users: Mutex::new(HashMap::new()),
            allow_anonymous: true,
        }
    }

    pub fn add_user<U: Into<String>, P: Into<Vec<u8>>>(&self, username: U, password: P) {
        self.users.lock().insert(username.into(), password.into());
    }
}

impl AuthBackend for MemoryAuth {
    fn authenticate(
        &self,
        _domain: &str,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        match username {
            Some(username) => self
                .users
                .lock()
                .get(username)
                .map_or(false, |stored| password.map_or(false, |given| stored == given)),
            None => self.allow_anonymous,
        }
    }

    fn recognize(
        &self,
        domain: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        username.is_some() && self.authenticate(domain, client_id, username, password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_auth() {
        let auth = MemoryAuth::new();

        assert!(!auth.authenticate("d", "client", Some("user"), Some(b"pass")));

        auth.add_user("user", &b"pass"[..]);

        assert!(auth.authenticate("d", "client", Some("user"), Some(b"pass")));
        assert!(!auth.authenticate("d", "client", Some("user"), Some(b"wrong")));
        assert!(!auth.authenticate("d", "client", None, None));

        assert!(auth.recognize("d", "client", Some("user"), Some(b"pass")));
        assert!(!auth.recognize("d", "client", None, None));
    }

    #[test]
    fn test_anonymous_auth() {
        let auth = MemoryAuth::with_anonymous();

        assert!(auth.authenticate("d", "client", None, None));
        assert!(!auth.recognize("d", "client", None, None));
    }
}
