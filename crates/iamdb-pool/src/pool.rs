//! Bounded MySQL connection pool with a hot-swappable credential slot.
//!
//! A thin layer over [`sqlx::MySqlPool`]. One pool serves one target
//! `(host, port, database, user)`. New physical connections always
//! authenticate with whatever token is currently in the pool's connect
//! options, so rotating it never touches connections that are already open.
//!
//! # Architecture
//!
//! ```text
//! checkout()
//!   → sqlx acquire (bounded by max_size, waits up to connect_timeout)
//!     → idle connection available → ping, reuse
//!     → otherwise → TLS connect + mysql_clear_password with the current token
//!
//! set_password(token) → replaces the pool's connect options
//! close()             → rejects checkouts, drains borrowers, closes idle
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::MySql;

use crate::error::{PoolError, PoolResult};
use crate::token::AuthToken;
use crate::trust::TlsProperties;

/// A borrowed connection. Dropping it returns the connection to the pool.
pub type Connection = PoolConnection<MySql>;

/// Who and where a pool connects to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub user: String,
    /// Dial this address instead of `host:port`.
    pub dial: Option<SocketAddr>,
}

impl ConnectTarget {
    pub fn new(host: &str, port: u16, database: Option<&str>, user: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.map(str::to_string),
            user: user.to_string(),
            dial: None,
        }
    }

    /// Builder method: connect through `addr` (tunnels, proxies).
    pub fn with_dial(self, addr: Option<SocketAddr>) -> Self {
        Self { dial: addr, ..self }
    }
}

/// Configuration for a connection pool.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections, idle plus borrowed (default: 10).
    pub max_size: u32,
    /// Connections kept open even when idle (default: 0).
    pub min_idle: u32,
    /// Idle connections older than this are closed (default: 300s).
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Connections older than this are retired on return (default: 30m).
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    /// Maximum time a checkout waits, connecting included (default: 5s).
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long `close()` waits for borrowed connections (default: 30s).
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 0,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently borrowed.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Total connections (active + idle).
    pub total: usize,
    /// Number of checkouts that timed out.
    pub wait_count: u64,
    /// Number of credential rotations since the pool opened.
    pub credential_rotations: u64,
}

/// Connect options for `target` that only ever speak verified TLS, trusting
/// the CA file behind `tls`. The password is left for the pool to fill in.
///
/// With a dial override the server certificate is checked against the trust
/// store but not against the dialed name, which a tunnel cannot match.
pub fn connect_options(target: &ConnectTarget, tls: &TlsProperties) -> PoolResult<MySqlConnectOptions> {
    if !tls.require_tls {
        return Err(PoolError::Config("TLS is required for token authentication".into()));
    }
    if !tls.verify_server_certificate {
        return Err(PoolError::Config(
            "TLS without server certificate verification is not supported".into(),
        ));
    }
    let ca_file = tls.trust_store_path()?;

    let (host, port, ssl_mode) = match target.dial {
        Some(addr) => (addr.ip().to_string(), addr.port(), MySqlSslMode::VerifyCa),
        None => (target.host.clone(), target.port, MySqlSslMode::VerifyIdentity),
    };

    let mut options = MySqlConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&target.user)
        .ssl_mode(ssl_mode)
        .ssl_ca(&ca_file)
        .enable_cleartext_plugin(true);
    if let Some(database) = &target.database {
        options = options.database(database);
    }
    Ok(options)
}

/// Bounded pool of connections to a single target.
pub struct ConnectionPool {
    target: ConnectTarget,
    config: PoolConfig,
    options: MySqlConnectOptions,
    pool: MySqlPool,
    wait_count: AtomicU64,
    rotations: AtomicU64,
}

impl ConnectionPool {
    /// Open a pool. No physical connection is made until the first checkout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: PoolConfig,
        target: ConnectTarget,
        options: MySqlConnectOptions,
        credential: &AuthToken,
    ) -> Self {
        // sqlx builds its rustls client from the process-wide provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_size)
            .min_connections(config.min_idle)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .test_before_acquire(true)
            .connect_lazy_with(options.clone().password(credential.as_str()));

        tracing::info!(
            host = %target.host,
            port = target.port,
            user = %target.user,
            max_size = config.max_size,
            "connection pool opened"
        );

        Self {
            target,
            config,
            options,
            pool,
            wait_count: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Replace the credential used for new physical connections.
    pub fn set_password(&self, token: &AuthToken) {
        self.pool
            .set_connect_options(self.options.clone().password(token.as_str()));
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Borrow a connection, reusing an idle one when possible.
    pub async fn checkout(&self) -> PoolResult<Connection> {
        match self.pool.acquire().await {
            Ok(conn) => {
                tracing::debug!(host = %self.target.host, "checked out connection");
                Ok(conn)
            }
            Err(sqlx::Error::PoolClosed) => Err(PoolError::Closed),
            Err(sqlx::Error::PoolTimedOut) => {
                self.wait_count.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Connection(format!(
                    "no connection to {}:{} within {:?}",
                    self.target.host, self.target.port, self.config.connect_timeout
                )))
            }
            Err(e) => Err(PoolError::Connection(e.to_string())),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.pool.size() as usize;
        let idle = self.pool.num_idle();
        PoolStats {
            active: total.saturating_sub(idle),
            idle,
            total,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            credential_rotations: self.rotations.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting checkouts, wait up to `drain_timeout` for borrowers,
    /// then close every idle connection.
    ///
    /// Returns the number of connections still open when the drain ended;
    /// those are closed as soon as they are returned.
    pub async fn close(&self) -> usize {
        if self.pool.is_closed() {
            return 0;
        }
        tracing::info!(drain_timeout = ?self.config.drain_timeout, "connection pool draining started");

        match tokio::time::timeout(self.config.drain_timeout, self.pool.close()).await {
            Ok(()) => {
                tracing::info!(host = %self.target.host, "connection pool closed");
                0
            }
            Err(_) => {
                let outstanding = self.pool.size() as usize;
                tracing::warn!(
                    remaining = outstanding,
                    "drain timeout expired, borrowed connections close on return"
                );
                outstanding
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
