//! Connection URL parsing: host, port and region discovery.
//!
//! RDS host names carry the region as their third label:
//!
//! ```text
//! cluster.mydb.eu-west-1.rds.amazonaws.com
//!         ^^^^ ^^^^^^^^^
//!         id   region
//! ```

use std::fmt;
use std::net::IpAddr;

use url::Url;

use crate::error::{PoolError, PoolResult};

/// Standard MySQL port, used when the URL does not name one.
pub const DEFAULT_PORT: u16 = 3306;

/// Position of the region label within an RDS host name.
const REGION_LABEL_INDEX: usize = 2;

/// Database endpoint derived from the configured connection URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub region: String,
    /// Default schema from the URL path, if any.
    pub database: Option<String>,
}

impl Endpoint {
    /// Parse a connection URL such as `mysql://host.id.region.rds.amazonaws.com:3306/db`.
    ///
    /// A leading `jdbc:` prefix is accepted and ignored.
    pub fn parse(raw: &str) -> PoolResult<Self> {
        let trimmed = raw.trim();
        let without_prefix = trimmed.strip_prefix("jdbc:").unwrap_or(trimmed);

        let url = Url::parse(without_prefix)
            .map_err(|e| PoolError::UrlParse(format!("{trimmed}: {e}")))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::UrlParse(format!("{trimmed}: missing host")))?
            .to_string();

        let region = region_from_host(&host)?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let database = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|db| !db.is_empty())
            .map(str::to_string);

        Ok(Self {
            host,
            port,
            region,
            database,
        })
    }

    /// `host:port`, as used for signing and socket resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.region)
    }
}

/// Extract the region label from an RDS host name.
pub fn region_from_host(host: &str) -> PoolResult<String> {
    if host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok() {
        return Err(PoolError::UrlParse(format!(
            "{host}: an IP address carries no region"
        )));
    }

    host.split('.')
        .nth(REGION_LABEL_INDEX)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PoolError::UrlParse(format!("{host}: no region label in host name")))
}
