//! campuscache - operator CLI for the campus data cache.
//!
//! Runs cached queries and searches against a PostgREST-style backend and
//! inspects the persisted offline store.

mod cli;

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use campuscache_core::persist::PersistentStore;
use campuscache_core::stats::Telemetry;
use campuscache_core::{
    CacheClient, CacheSettings, FilterSpec, HttpRemote, Namespace, QueryOptions, SearchOptions,
};

use cli::{Backend, Cli, Commands};

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing();

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Query {
            ref resource,
            ref filters,
            ref order_by,
            limit,
            refresh,
            stale_on_error,
            repeat,
            ref backend,
        } => {
            let client = connect(&cli, &settings, backend)?;
            let mut filter = parse_filters(filters)?;
            if let Some(order) = order_by {
                filter = filter.order_by(order);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }

            let mut options = QueryOptions::new().filters(filter);
            if refresh {
                options = options.force_refresh();
            }
            if stale_on_error {
                options = options.stale_on_error();
            }

            for _ in 0..repeat.max(1) {
                let result = client
                    .query(resource, options.clone())
                    .await
                    .with_context(|| format!("Failed to query {}", resource))?;
                eprintln!(
                    "{}: {}{}",
                    resource,
                    if result.from_cache { "cache" } else { "remote" },
                    if result.stale { " (stale)" } else { "" }
                );
                println!("{}", serde_json::to_string_pretty(result.data.as_ref())?);
            }
            print_stats(&cli, &client)?;
        }
        Commands::Search {
            ref resource,
            ref field,
            ref query,
            ref backend,
        } => {
            let client = connect(&cli, &settings, backend)?;
            let results = client
                .search(resource, field, query, SearchOptions::default())
                .await
                .with_context(|| format!("Failed to search {}", resource))?;
            println!("{}", serde_json::to_string_pretty(results.as_ref())?);
            print_stats(&cli, &client)?;
        }
        Commands::Records => {
            let user = require_user(&cli)?;
            let store = open_store(&settings)?;
            let records = store.records(user).await;
            if records.is_empty() {
                eprintln!("No persisted records for {}", user);
            }
            for record in records {
                println!(
                    "{:<12} {:<10} {}  [{}]",
                    record.scope_id,
                    record.age_display,
                    record.key,
                    record.tags.join(", ")
                );
            }
        }
        Commands::Clear => {
            let user = require_user(&cli)?;
            let store = open_store(&settings)?;
            if !store.clear_user_cache(user).await {
                anyhow::bail!("Failed to clear persisted cache for {}", user);
            }
            info!(user = %user, "Cleared persisted cache");
            eprintln!("Cleared persisted cache for {}", user);
        }
        Commands::Config { init } => {
            if init {
                let path = match cli.config {
                    Some(ref path) => path.clone(),
                    None => CacheSettings::config_path()?,
                };
                settings.save(&path)?;
                eprintln!("Wrote {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<CacheSettings> {
    match path {
        Some(path) => CacheSettings::load_from(path),
        None => CacheSettings::load(),
    }
}

fn require_user(cli: &Cli) -> Result<&str> {
    cli.user
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("No user given. Pass --user or set CAMPUSCACHE_USER."))
}

fn open_store(settings: &CacheSettings) -> Result<PersistentStore> {
    let root = settings.cache_dir()?;
    Ok(PersistentStore::new(
        root,
        settings.persist.max_records,
        Arc::new(Telemetry::new()),
    ))
}

fn connect(cli: &Cli, settings: &CacheSettings, backend: &Backend) -> Result<CacheClient> {
    let mut remote = HttpRemote::new(&backend.url)?;
    if let Some(ref key) = backend.api_key {
        remote = remote.with_api_key(key);
    }
    if let Some(ref token) = backend.token {
        remote = remote.with_token(token);
    }

    let client = CacheClient::new(settings, Arc::new(remote))?;
    if let Some(ref user) = cli.user {
        let scope = cli
            .scope
            .clone()
            .unwrap_or_else(|| campuscache_core::config::GLOBAL_SCOPE.to_string());
        client.sign_in(Namespace::new(user.clone(), scope));
    }
    client.set_offline(backend.offline);
    Ok(client)
}

/// Parse `field=value` pairs. Values that read as JSON (numbers, booleans,
/// `null`) keep their type; anything else is a string.
fn parse_filters(raw: &[String]) -> Result<FilterSpec> {
    raw.iter().try_fold(FilterSpec::new(), |filter, pair| {
        let (field, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid filter '{}', expected FIELD=VALUE", pair))?;
        let value = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|v| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| Value::String(value.to_string()));
        Ok(filter.eq(field, value))
    })
}

fn print_stats(cli: &Cli, client: &CacheClient) -> Result<()> {
    if cli.stats {
        let stats = client.stats();
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
        eprintln!("hit rate: {:.1}%", stats.hit_rate() * 100.0);
    }
    Ok(())
}
