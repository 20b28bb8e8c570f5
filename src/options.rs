//! Connection endpoint identity and per-connection settings.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Identifies a logical MySQL endpoint.
///
/// Two keys compare equal when every field matches, including the password;
/// a pool keyed by `ConnectionKey` therefore never hands a session opened
/// with stale credentials to a caller holding fresh ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
}

impl ConnectionKey {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// The same endpoint with different session credentials, as left behind
    /// by a successful `CHANGE_USER`.
    pub(crate) fn with_credentials(&self, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            database: database.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    /// Formats as `user@host:port/database`. The password never appears.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// TLS material for the initial handshake.
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub verify_server_cert: bool,
}

/// Per-connection settings consumed at connect time and by every operation
/// issued on the resulting connection.
///
/// A zero duration means "no timeout" for all three timeout fields.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    connect_timeout: Duration,
    query_timeout: Duration,
    total_timeout: Duration,
    ssl: Option<SslOptions>,
    reset_conn_before_close: bool,
    delayed_reset_conn: bool,
    client_flags: u64,
    attributes: HashMap<String, String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            query_timeout: Duration::ZERO,
            total_timeout: Duration::ZERO,
            ssl: None,
            reset_conn_before_close: false,
            delayed_reset_conn: false,
            client_flags: 0,
            attributes: HashMap::new(),
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Budget for an entire multi-query operation, across all of its
    /// statements. Falls back to the per-query timeout when zero.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Send `COM_RESET_CONNECTION` before recycling a dying connection.
    pub fn reset_conn_before_close(mut self, enable: bool) -> Self {
        self.reset_conn_before_close = enable;
        self
    }

    /// When a connection dies on the reactor thread, defer the reset to the
    /// pool instead of running it inline.
    pub fn delayed_reset_conn(mut self, enable: bool) -> Self {
        self.delayed_reset_conn = enable;
        self
    }

    pub fn client_flags(mut self, flags: u64) -> Self {
        self.client_flags = flags;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn get_total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn get_ssl(&self) -> Option<&SslOptions> {
        self.ssl.as_ref()
    }

    pub fn get_reset_conn_before_close(&self) -> bool {
        self.reset_conn_before_close
    }

    pub fn get_delayed_reset_conn(&self) -> bool {
        self.delayed_reset_conn
    }

    pub fn get_client_flags(&self) -> u64 {
        self.client_flags
    }

    pub fn get_attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// The timeout budget for a multi-query operation.
    pub(crate) fn multi_query_timeout(&self) -> Duration {
        if self.total_timeout.is_zero() {
            self.query_timeout
        } else {
            self.total_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &ConnectionKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn key_equality_covers_every_field() {
        let base = ConnectionKey::new("db1", 3306, "test", "u", "p");
        assert_eq!(base, ConnectionKey::new("db1", 3306, "test", "u", "p"));
        assert_eq!(hash_of(&base), hash_of(&base.clone()));

        assert_ne!(base, ConnectionKey::new("db2", 3306, "test", "u", "p"));
        assert_ne!(base, ConnectionKey::new("db1", 3307, "test", "u", "p"));
        assert_ne!(base, ConnectionKey::new("db1", 3306, "prod", "u", "p"));
        assert_ne!(base, ConnectionKey::new("db1", 3306, "test", "v", "p"));
        assert_ne!(base, ConnectionKey::new("db1", 3306, "test", "u", "q"));
    }

    #[test]
    fn display_hides_the_password() {
        let key = ConnectionKey::new("db1", 3306, "test", "u", "hunter2");
        let shown = key.to_string();
        assert_eq!(shown, "u@db1:3306/test");
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn multi_query_timeout_prefers_total() {
        let opts = ConnectionOptions::new()
            .query_timeout(Duration::from_secs(1))
            .total_timeout(Duration::from_secs(5));
        assert_eq!(opts.multi_query_timeout(), Duration::from_secs(5));

        let opts = ConnectionOptions::new().query_timeout(Duration::from_secs(1));
        assert_eq!(opts.multi_query_timeout(), Duration::from_secs(1));
    }
}
