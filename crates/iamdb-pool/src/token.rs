//! RDS IAM authentication token generation.
//!
//! A token is an AWS Signature Version 4 presigned `connect` request for the
//! `rds-db` service, with the scheme stripped:
//!
//! ```text
//! host:port/?Action=connect&DBUser=svc&X-Amz-Algorithm=AWS4-HMAC-SHA256
//!   &X-Amz-Credential=...&X-Amz-Date=...&X-Amz-Expires=900
//!   &X-Amz-SignedHeaders=host&X-Amz-Signature=...
//! ```
//!
//! The server validates the signature; nothing about the token is tracked
//! locally beyond the pool's credential slot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::credentials::{CredentialSource, Credentials};
use crate::error::{PoolError, PoolResult};

type HmacSha256 = Hmac<Sha256>;

/// How long the server accepts a freshly signed token.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(900);

const SERVICE: &str = "rds-db";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TERMINATOR: &str = "aws4_request";

/// A signed, short-lived database password.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(<{} bytes>)", self.0.len())
    }
}

/// Signs tokens for one region with a bound credential source.
#[derive(Clone)]
pub struct TokenGenerator {
    region: String,
    credentials: Arc<dyn CredentialSource>,
}

impl fmt::Debug for TokenGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGenerator")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl TokenGenerator {
    /// Bind a region and credential source for all later `generate` calls.
    pub fn configure(region: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            region: region.into(),
            credentials,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Sign a token for `username` at `host:port`, valid from now.
    pub async fn generate(&self, host: &str, port: u16, username: &str) -> PoolResult<AuthToken> {
        if host.is_empty() || username.is_empty() {
            return Err(PoolError::Auth("host and username are required to sign a token".into()));
        }
        let credentials = self.credentials.credentials().await?;
        self.sign(&credentials, host, port, username, Utc::now())
    }

    /// Sign a token with already-resolved credentials as of `now`.
    pub fn sign(
        &self,
        credentials: &Credentials,
        host: &str,
        port: u16,
        username: &str,
        now: DateTime<Utc>,
    ) -> PoolResult<AuthToken> {
        if host.is_empty() || username.is_empty() {
            return Err(PoolError::Auth("host and username are required to sign a token".into()));
        }
        let token = presign(credentials, &self.region, host, port, username, now)?;
        tracing::debug!(
            host = %host,
            port = port,
            user = %username,
            region = %self.region,
            token_len = token.len(),
            "generated authentication token"
        );
        Ok(token)
    }
}

fn presign(
    credentials: &Credentials,
    region: &str,
    host: &str,
    port: u16,
    username: &str,
    now: DateTime<Utc>,
) -> PoolResult<AuthToken> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{SERVICE}/{TERMINATOR}");
    let authority = format!("{host}:{port}");

    let mut params: BTreeMap<&str, String> = BTreeMap::new();
    params.insert("Action", "connect".to_string());
    params.insert("DBUser", username.to_string());
    params.insert("X-Amz-Algorithm", ALGORITHM.to_string());
    params.insert(
        "X-Amz-Credential",
        format!("{}/{scope}", credentials.access_key_id),
    );
    params.insert("X-Amz-Date", amz_date.clone());
    params.insert("X-Amz-Expires", TOKEN_LIFETIME.as_secs().to_string());
    params.insert("X-Amz-SignedHeaders", "host".to_string());
    if let Some(session) = &credentials.session_token {
        params.insert("X-Amz-Security-Token", session.clone());
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n/\n{query}\nhost:{authority}\n\nhost\n{}",
        hex::encode(Sha256::digest(b""))
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, TERMINATOR.as_bytes())?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(AuthToken(format!(
        "{authority}/?{query}&X-Amz-Signature={signature}"
    )))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> PoolResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PoolError::Auth(format!("signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 URI encoding: everything but `A-Z a-z 0-9 - _ . ~` is percent-encoded.
fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
