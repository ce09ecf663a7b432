use std::path::Path;

use anyhow::Context;
use iamdb_pool::auth_pool::credential_source;
use iamdb_pool::{Endpoint, Settings, TokenGenerator};

pub async fn token(config: &Path, url: Option<String>, username: Option<String>) -> anyhow::Result<()> {
    let mut settings = Settings::from_file(config)?;
    if let Some(url) = url {
        settings.url = url;
    }
    if let Some(username) = username {
        settings.username = username;
    }
    settings.validate()?;

    let endpoint = Endpoint::parse(&settings.url)?;
    let generator = TokenGenerator::configure(
        endpoint.region.clone(),
        credential_source(&settings.credentials),
    );
    let token = generator
        .generate(&endpoint.host, endpoint.port, &settings.username)
        .await
        .with_context(|| format!("signing token for {}@{endpoint}", settings.username))?;

    println!("{}", token.as_str());
    Ok(())
}
