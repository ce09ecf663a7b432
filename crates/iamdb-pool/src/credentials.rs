//! Ambient cloud credentials used to sign authentication tokens.
//!
//! Production lookups go through the AWS SDK's default provider chain:
//! environment variables, the shared config and credentials files (including
//! SSO and `credential_process`), web identity, ECS container credentials and
//! the EC2 instance profile.

use std::fmt;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{PoolError, PoolResult};

/// A signing identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Builder method: attach a temporary session token.
    pub fn with_session_token(self, token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
            ..self
        }
    }
}

impl From<aws_credential_types::Credentials> for Credentials {
    fn from(credentials: aws_credential_types::Credentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().map(str::to_string),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials on demand. Called once per token generation, so
/// implementations may rotate what they return.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> PoolResult<Credentials>;
}

/// Fixed credentials.
#[derive(Clone, Debug)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self) -> PoolResult<Credentials> {
        Ok(self.0.clone())
    }
}

/// Credentials from an AWS SDK provider.
///
/// The default chain is resolved on first use, so building one never
/// touches the environment, the filesystem or the network.
pub struct AwsCredentials {
    profile: Option<String>,
    provider: OnceCell<SharedCredentialsProvider>,
}

impl AwsCredentials {
    /// The SDK default chain.
    pub fn default_chain() -> Self {
        Self {
            profile: None,
            provider: OnceCell::new(),
        }
    }

    /// The default chain, reading `profile` from the shared files.
    pub fn with_profile(profile: impl Into<String>) -> Self {
        Self {
            profile: Some(profile.into()),
            provider: OnceCell::new(),
        }
    }

    /// Wrap an already-built provider.
    pub fn from_provider(provider: impl ProvideCredentials + 'static) -> Self {
        Self {
            profile: None,
            provider: OnceCell::from(SharedCredentialsProvider::new(provider)),
        }
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    async fn load_provider(&self) -> PoolResult<SharedCredentialsProvider> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &self.profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;
        debug!(profile = ?self.profile, "loaded aws credential provider chain");
        sdk_config
            .credentials_provider()
            .ok_or_else(|| PoolError::Auth("no aws credential provider configured".into()))
    }
}

impl Default for AwsCredentials {
    fn default() -> Self {
        Self::default_chain()
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("profile", &self.profile)
            .field("loaded", &self.provider.initialized())
            .finish()
    }
}

#[async_trait]
impl CredentialSource for AwsCredentials {
    async fn credentials(&self) -> PoolResult<Credentials> {
        let provider = self
            .provider
            .get_or_try_init(|| self.load_provider())
            .await?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| PoolError::Auth(format!("aws credentials unavailable: {e}")))?;
        Ok(credentials.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::provider::error::CredentialsError;
    use aws_credential_types::provider::future;

    #[derive(Debug)]
    struct NoCredentials;

    impl ProvideCredentials for NoCredentials {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            future::ProvideCredentials::ready(Err(CredentialsError::not_loaded("no source in chain")))
        }
    }

    fn sdk_credentials(session: Option<&str>) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI",
            session.map(str::to_string),
            None,
            "test",
        )
    }

    #[tokio::test]
    async fn static_credentials_are_returned_as_is() {
        let source = StaticCredentials::new(Credentials::new("A", "B"));
        assert_eq!(source.credentials().await.unwrap(), Credentials::new("A", "B"));
    }

    #[tokio::test]
    async fn sdk_provider_credentials_are_converted() {
        let source = AwsCredentials::from_provider(sdk_credentials(Some("session")));
        let creds = source.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert_eq!(creds.secret_access_key, "wJalrXUtnFEMI");
        assert_eq!(creds.session_token.as_deref(), Some("session"));
    }

    #[tokio::test]
    async fn provider_failure_is_auth_error() {
        let source = AwsCredentials::from_provider(NoCredentials);
        let err = source.credentials().await.unwrap_err();
        assert!(matches!(err, PoolError::Auth(_)), "got {err}");
        assert!(err.to_string().contains("aws credentials unavailable"));
    }

    #[test]
    fn default_chain_is_lazy() {
        let source = AwsCredentials::with_profile("deploy");
        assert_eq!(source.profile(), Some("deploy"));
        assert!(format!("{source:?}").contains("loaded: false"));
        assert!(AwsCredentials::from_provider(NoCredentials).provider.initialized());
    }

    #[test]
    fn conversion_without_session_token() {
        let creds = Credentials::from(sdk_credentials(None));
        assert_eq!(creds.session_token, None);
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::new("AKID", "topsecret").with_session_token("sess");
        let debug = format!("{creds:?}");
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("topsecret"));
        assert!(!debug.contains("sess\""));
    }
}
