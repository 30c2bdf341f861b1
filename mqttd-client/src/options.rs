use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use mqttd_core::{Protocol, QoS};
use mqttd_proto::{ConnOptions, Will};

/// Options accepted by [`crate::Client::connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub protocol: Protocol,
    pub connect_timeout: Duration,
    /// Default window blocking operations wait for their acknowledgment.
    pub operation_timeout: Duration,
    /// Re-run the connect path whenever the connection drops
    /// unexpectedly. The password is retained in memory only when this
    /// is enabled.
    pub reconnect: bool,
}

impl ClientOptions {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        ClientOptions {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            protocol: Protocol::V311,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
            reconnect: false,
        }
    }

    /// Options with a host-derived random client id, for callers that do
    /// not care which id they get.
    pub fn anonymous() -> Self {
        Self::new(generated_client_id())
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn credentials<U: Into<String>, P: Into<Vec<u8>>>(mut self, username: U, password: P) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn will<T: Into<String>, M: Into<Vec<u8>>>(
        mut self,
        topic: T,
        message: M,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will = Some(Will {
            topic: topic.into(),
            message: message.into(),
            qos,
            retain,
        });
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub(crate) fn to_conn_options(&self) -> ConnOptions {
        let mut opts = ConnOptions::new(self.client_id.clone());
        opts.clean_session = self.clean_session;
        opts.keep_alive = self.keep_alive;
        opts.username = self.username.clone();
        opts.password = self.password.clone();
        opts.will = self.will.clone();
        opts.protocol = self.protocol;
        opts.connect_timeout = self.connect_timeout;
        opts.reconnect = self.reconnect;
        opts
    }
}

fn generated_client_id() -> String {
    let host = hostname::get_hostname().unwrap_or_else(|| "mqttd".to_owned());
    let suffix: String = thread_rng().sample_iter(&Alphanumeric).take(8).collect();

    // the restricted 3.1.1 charset caps client ids at 23 bytes
    let mut id = format!("{}-{}", host, suffix);
    id.truncate(23);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids() {
        let a = generated_client_id();
        let b = generated_client_id();

        assert!(!a.is_empty());
        assert!(a.len() <= 23);
        assert_ne!(a, b);
    }

    #[test]
    fn test_options_mapping() {
        let opts = ClientOptions::new("c1")
            .clean_session(false)
            .keep_alive(30)
            .credentials("user", &b"pass"[..])
            .reconnect(true);

        let conn = opts.to_conn_options();
        assert_eq!(conn.client_id, "c1");
        assert!(!conn.clean_session);
        assert_eq!(conn.keep_alive, 30);
        assert_eq!(conn.username.as_deref(), Some("user"));
        assert!(conn.reconnect);
    }
}
