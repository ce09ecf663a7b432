//! The authenticating pool: lazy, one-time setup of trust store, token and
//! connection pool, followed by background credential rotation.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──first get_connection()──▶ Initializing ──ok──▶ Running
//!                                                │                   │
//!                                                └──err──▶ Failed    │
//!        any state ──close()──▶ Closed ◀─────────────────────────────┘
//! ```
//!
//! Transitions never go back. Callers that arrive while another caller is
//! initializing wait for it and then observe its outcome; a failed
//! initialization is replayed to every later caller as the same
//! [`PoolError::Init`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::certificate::{CertificateLoader, CertificateSource, TrustAnchor};
use crate::config::{CredentialSettings, RefreshSettings, Settings};
use crate::credentials::{AwsCredentials, CredentialSource};
use crate::endpoint::Endpoint;
use crate::error::{PoolError, PoolResult};
use crate::pool::{connect_options, ConnectTarget, Connection, ConnectionPool, PoolConfig, PoolStats};
use crate::refresh::{RefreshHandle, RefreshStats};
use crate::token::TokenGenerator;
use crate::trust::{build_tls_properties, TlsProperties};

/// Observable lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolStatus {
    Uninitialized,
    Initializing,
    Running,
    Failed,
    Closed,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolStatus::Uninitialized => "uninitialized",
            PoolStatus::Initializing => "initializing",
            PoolStatus::Running => "running",
            PoolStatus::Failed => "failed",
            PoolStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Running {
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    refresh: RefreshHandle,
    trust: TrustAnchor,
}

enum Lifecycle {
    Uninitialized,
    Running(Running),
    Failed(PoolError),
    Closed,
}

/// Everything initialization produces before the refresh task starts.
struct Started {
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    trust: TrustAnchor,
    generator: TokenGenerator,
}

/// A connection pool that authenticates with short-lived IAM tokens.
pub struct AuthenticatingPool {
    url: String,
    username: String,
    refresh: RefreshSettings,
    pool_config: PoolConfig,
    trust_store_password: String,
    connect_address: Option<SocketAddr>,
    certificates: Arc<dyn CertificateSource>,
    credentials: Arc<dyn CredentialSource>,
    lifecycle: RwLock<Lifecycle>,
    init_guard: Mutex<()>,
    initializing: AtomicBool,
}

impl AuthenticatingPool {
    /// Build a pool with the production collaborators for `settings`.
    /// Nothing is loaded or dialed until the first `get_connection`.
    pub fn new(settings: Settings) -> PoolResult<Self> {
        Self::builder(settings).build()
    }

    pub fn builder(settings: Settings) -> AuthenticatingPoolBuilder {
        AuthenticatingPoolBuilder {
            settings,
            certificates: None,
            credentials: None,
        }
    }

    /// Borrow a connection, initializing the pool on first use.
    pub async fn get_connection(&self) -> PoolResult<Connection> {
        let pool = match self.running_pool().await? {
            Some(pool) => pool,
            None => self.initialize().await?,
        };
        pool.checkout().await
    }

    async fn running_pool(&self) -> PoolResult<Option<Arc<ConnectionPool>>> {
        match &*self.lifecycle.read().await {
            Lifecycle::Running(running) => Ok(Some(Arc::clone(&running.pool))),
            Lifecycle::Failed(err) => Err(err.clone()),
            Lifecycle::Closed => Err(PoolError::Closed),
            Lifecycle::Uninitialized => Ok(None),
        }
    }

    async fn initialize(&self) -> PoolResult<Arc<ConnectionPool>> {
        let _guard = self.init_guard.lock().await;
        // Another caller may have finished while we waited.
        if let Some(pool) = self.running_pool().await? {
            return Ok(pool);
        }

        self.initializing.store(true, Ordering::Release);
        let started = self.start().await;
        let mut lifecycle = self.lifecycle.write().await;
        self.initializing.store(false, Ordering::Release);

        match started {
            Ok(started) => {
                let pool = Arc::clone(&started.pool);
                let refresh = RefreshHandle::spawn(
                    self.refresh.interval,
                    started.generator,
                    started.endpoint.clone(),
                    self.username.clone(),
                    Arc::clone(&pool),
                );
                info!(endpoint = %started.endpoint, user = %self.username, "authenticating pool running");
                *lifecycle = Lifecycle::Running(Running {
                    endpoint: started.endpoint,
                    pool: Arc::clone(&pool),
                    refresh,
                    trust: started.trust,
                });
                Ok(pool)
            }
            Err(cause) => {
                let err = PoolError::init(cause);
                error!(error = %err, "authenticating pool initialization failed");
                *lifecycle = Lifecycle::Failed(err.clone());
                Err(err)
            }
        }
    }

    async fn start(&self) -> PoolResult<Started> {
        let endpoint = Endpoint::parse(&self.url)?;
        info!(endpoint = %endpoint, user = %self.username, "initializing authenticating pool");

        let generator = TokenGenerator::configure(endpoint.region.clone(), Arc::clone(&self.credentials));
        let (trust, tls) = self.build_trust().await?;

        let target = ConnectTarget::new(
            &endpoint.host,
            endpoint.port,
            endpoint.database.as_deref(),
            &self.username,
        )
        .with_dial(self.connect_address);
        let options = connect_options(&target, &tls)?;

        let token = generator
            .generate(&endpoint.host, endpoint.port, &self.username)
            .await?;
        let pool = ConnectionPool::open(self.pool_config.clone(), target, options, &token);

        Ok(Started {
            endpoint,
            pool: Arc::new(pool),
            trust,
            generator,
        })
    }

    /// Load the root certificate and write the trust store, off the runtime.
    async fn build_trust(&self) -> PoolResult<(TrustAnchor, TlsProperties)> {
        let certificates = Arc::clone(&self.certificates);
        let password = self.trust_store_password.clone();
        tokio::task::spawn_blocking(move || {
            let certificate = certificates.load_root_certificate()?;
            let trust = certificates.build_trust_store(&certificate, &password)?;
            let tls = build_tls_properties(&trust.store_uri()?, trust.password());
            tls.verify_store()?;
            Ok((trust, tls))
        })
        .await
        .map_err(|e| PoolError::KeyStore(format!("trust store task failed: {e}")))?
    }

    /// Stop rotation, drain the pool and delete the trust store. Idempotent.
    ///
    /// New `get_connection` calls fail with [`PoolError::Closed`] as soon as
    /// closing starts.
    pub async fn close(&self) {
        let _guard = self.init_guard.lock().await;
        let previous = std::mem::replace(&mut *self.lifecycle.write().await, Lifecycle::Closed);
        let Lifecycle::Running(Running {
            endpoint,
            pool,
            refresh,
            trust,
        }) = previous
        else {
            debug!("authenticating pool closed before it was running");
            return;
        };

        info!(endpoint = %endpoint, "closing authenticating pool");
        refresh.shutdown(self.refresh.shutdown_timeout).await;

        let outstanding = pool.close().await;
        if outstanding > 0 {
            warn!(outstanding = outstanding, "connections still borrowed after drain");
        }

        if let Err(e) = trust.remove() {
            error!(error = %e, "failed to remove trust store");
        }
        info!(endpoint = %endpoint, "authenticating pool closed");
    }

    pub async fn state(&self) -> PoolStatus {
        match &*self.lifecycle.read().await {
            Lifecycle::Uninitialized if self.initializing.load(Ordering::Acquire) => {
                PoolStatus::Initializing
            }
            Lifecycle::Uninitialized => PoolStatus::Uninitialized,
            Lifecycle::Running(_) => PoolStatus::Running,
            Lifecycle::Failed(_) => PoolStatus::Failed,
            Lifecycle::Closed => PoolStatus::Closed,
        }
    }

    /// The parsed endpoint once running.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        match &*self.lifecycle.read().await {
            Lifecycle::Running(running) => Some(running.endpoint.clone()),
            _ => None,
        }
    }

    pub async fn stats(&self) -> Option<PoolStats> {
        match &*self.lifecycle.read().await {
            Lifecycle::Running(running) => Some(running.pool.stats()),
            _ => None,
        }
    }

    pub async fn refresh_stats(&self) -> Option<RefreshStats> {
        match &*self.lifecycle.read().await {
            Lifecycle::Running(running) => Some(running.refresh.stats()),
            _ => None,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for AuthenticatingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatingPool")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Drop for AuthenticatingPool {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = self.lifecycle.get_mut() {
            running.refresh.abort();
            debug!(endpoint = %running.endpoint, "authenticating pool dropped without close");
        }
    }
}

/// Overrides collaborators; unset ones come from the settings.
pub struct AuthenticatingPoolBuilder {
    settings: Settings,
    certificates: Option<Arc<dyn CertificateSource>>,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl AuthenticatingPoolBuilder {
    pub fn certificate_source(mut self, source: Arc<dyn CertificateSource>) -> Self {
        self.certificates = Some(source);
        self
    }

    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn build(self) -> PoolResult<AuthenticatingPool> {
        let settings = self.settings;
        settings.validate()?;

        let certificates: Arc<dyn CertificateSource> = match (self.certificates, &settings.tls.ca_file) {
            (Some(source), _) => source,
            (None, Some(path)) => Arc::new(CertificateLoader::from_file(path)),
            (None, None) => Arc::new(CertificateLoader::embedded()),
        };
        let credentials = match self.credentials {
            Some(source) => source,
            None => credential_source(&settings.credentials),
        };

        Ok(AuthenticatingPool {
            url: settings.url,
            username: settings.username,
            refresh: settings.refresh,
            pool_config: settings.pool,
            trust_store_password: settings.tls.trust_store_password,
            connect_address: settings.connect_address,
            certificates,
            credentials,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            init_guard: Mutex::new(()),
            initializing: AtomicBool::new(false),
        })
    }
}

/// The AWS default chain, reading the configured profile when one is named.
pub fn credential_source(settings: &CredentialSettings) -> Arc<dyn CredentialSource> {
    match &settings.profile {
        Some(profile) => Arc::new(AwsCredentials::with_profile(profile.clone())),
        None => Arc::new(AwsCredentials::default_chain()),
    }
}
