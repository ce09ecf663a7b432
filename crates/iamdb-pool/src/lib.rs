//! iamdb-pool: a TLS-enforcing MySQL connection pool that authenticates
//! with self-refreshing RDS IAM tokens.
//!
//! Nothing happens at construction. The first `get_connection` parses the
//! endpoint, writes a trust store holding the root CA, signs a token and
//! opens the pool; a background task then re-signs the token every refresh
//! interval and swaps it into the pool's credential slot.
//!
//! # Architecture
//!
//! ```text
//! AuthenticatingPool
//!   ├── Endpoint::parse(url)            host, port, region
//!   ├── CertificateSource               root CA → TrustAnchor (temp file)
//!   ├── build_tls_properties()          require TLS, verify server cert
//!   ├── TokenGenerator                  SigV4 presigned rds-db connect
//!   │   └── CredentialSource            AWS default provider chain
//!   ├── ConnectionPool                  sqlx MySqlPool, hot-swappable credential
//!   └── RefreshHandle                   background rotation task
//! ```

pub mod auth_pool;
pub mod certificate;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod token;
pub mod trust;

pub use auth_pool::{AuthenticatingPool, AuthenticatingPoolBuilder, PoolStatus};
pub use certificate::{CertificateLoader, CertificateSource, TrustAnchor, TrustStore};
pub use config::Settings;
pub use credentials::{AwsCredentials, CredentialSource, Credentials, StaticCredentials};
pub use endpoint::Endpoint;
pub use error::{PoolError, PoolResult};
pub use pool::{Connection, ConnectionPool, PoolConfig, PoolStats};
pub use refresh::{RefreshHandle, RefreshStats};
pub use token::{AuthToken, TokenGenerator};
pub use trust::{build_tls_properties, TlsProperties};
