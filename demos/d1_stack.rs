//! Example: a traced, cached layer stack over Cloudflare D1
//!
//! ## Prerequisites
//!
//! 1. Create a D1 database in the Cloudflare dashboard
//! 2. Create an API token with D1 permissions
//! 3. Set the required environment variables:
//!    - `CF_ACCOUNT_ID`: Your Cloudflare account ID
//!    - `CF_DATABASE_ID`: Your D1 database ID
//!    - `CF_API_TOKEN`: Your Cloudflare API token
//!
//! ## Running
//!
//! ```bash
//! cargo run --example d1_stack --features http
//! ```

use std::env;

use sql_layers::{
    BaseDatabase, CachedDatabase, D1HttpConfig, D1HttpDriver, Database, Queryer,
    StatementCacheConfig, TracedDatabase, TracingConfig, TxOptions,
};
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let config = D1HttpConfig::new(
        env::var("CF_ACCOUNT_ID")?,
        env::var("CF_DATABASE_ID")?,
        env::var("CF_API_TOKEN")?,
    );

    let db = BaseDatabase::new(D1HttpDriver::new(config)?);
    let db = CachedDatabase::new(db, StatementCacheConfig::builder().max_entries(64).build());
    let db = TracedDatabase::new(db, TracingConfig::default());

    db.ping().await?;
    println!("Connected to D1 database via HTTP API");

    db.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL
        )",
        &[],
    )
    .await?;

    // Writes inside a transaction are sent together on commit
    let tx = db.begin(TxOptions::default()).await?;
    for (name, email) in [("Alice", "alice@example.com"), ("Bob", "bob@example.com")] {
        tx.execute(
            "INSERT INTO users (name, email) VALUES (?, ?)",
            &[name.into(), email.into()],
        )
        .await?;
    }
    tx.commit().await?;

    // The second lookup reuses the statement prepared by the first
    for name in ["Alice", "Bob"] {
        match db
            .query_row("SELECT id, email FROM users WHERE name = ?", &[name.into()])
            .await?
        {
            Some(row) => println!("{name}: {:?}", row.values()),
            None => println!("{name}: not found"),
        }
    }

    let stats = db.inner().cache().stats();
    println!(
        "Statement cache: {} hits, {} misses ({:.0}% hit rate)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );

    db.close().await?;
    Ok(())
}
