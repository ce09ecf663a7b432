use std::path::Path;

use anyhow::Context;
use iamdb_pool::{AuthenticatingPool, Settings};
use sqlx::Connection as _;

pub async fn check(config: &Path) -> anyhow::Result<()> {
    let settings = Settings::from_file(config)?;
    let username = settings.username.clone();
    let pool = AuthenticatingPool::new(settings)?;

    let result = round_trip(&pool).await;
    pool.close().await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("✗ Check failed for {username}: {e}");
            Err(e)
        }
    }
}

async fn round_trip(pool: &AuthenticatingPool) -> anyhow::Result<()> {
    let mut conn = pool.get_connection().await?;
    let alive = conn.ping().await;
    drop(conn);

    if let Some(endpoint) = pool.endpoint().await {
        println!("  Endpoint: {endpoint}");
    }
    if let Some(stats) = pool.stats().await {
        println!(
            "  Pool:     {} total, {} idle, {} active",
            stats.total, stats.idle, stats.active
        );
    }
    alive.context("server did not answer ping")?;
    println!("✓ Authenticated as {} over TLS", pool.username());
    Ok(())
}
