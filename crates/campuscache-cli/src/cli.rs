use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "campuscache")]
#[command(about = "Cached reads against a school-management backend", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Cache settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Signed-in user whose persisted cache is used
    #[arg(short, long, global = true, env = "CAMPUSCACHE_USER")]
    pub user: Option<String>,

    /// Default scope (school) for queries
    #[arg(short, long, global = true, env = "CAMPUSCACHE_SCOPE")]
    pub scope: Option<String>,

    /// Print cache statistics to stderr when done
    #[arg(long, global = true)]
    pub stats: bool,
}

#[derive(Args)]
pub struct Backend {
    /// Backend base URL
    #[arg(long, env = "CAMPUSCACHE_URL")]
    pub url: String,

    /// Project API key
    #[arg(long, env = "CAMPUSCACHE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// User access token
    #[arg(long, env = "CAMPUSCACHE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Answer from cache only, accepting stale records
    #[arg(long)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a resource through the cache
    Query {
        resource: String,

        /// Equality filter, repeatable (e.g. --eq grade=5)
        #[arg(long = "eq", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        #[arg(long)]
        order_by: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Bypass both cache tiers
        #[arg(long)]
        refresh: bool,

        /// Serve the persisted copy if the backend fails
        #[arg(long)]
        stale_on_error: bool,

        /// Run the query this many times in one session
        #[arg(long, default_value = "1")]
        repeat: usize,

        #[command(flatten)]
        backend: Backend,
    },

    /// Free-text search on one field of a resource
    Search {
        resource: String,
        field: String,
        query: String,

        #[command(flatten)]
        backend: Backend,
    },

    /// List the user's persisted records with their age
    Records,

    /// Delete the user's persisted records
    Clear,

    /// Print the effective cache settings
    Config {
        /// Write the defaults to the settings file
        #[arg(long)]
        init: bool,
    },
}
