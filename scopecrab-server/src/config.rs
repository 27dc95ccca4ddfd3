//! Server configuration and CLI argument parsing
//!
//! Process-level settings come from CLI arguments with `SCOPECRAB_*`
//! environment fallbacks (CLI > env > defaults). Per-scope rate limit
//! settings live in a separate settings file read by
//! [`SettingsSource`](crate::source::SettingsSource).
//!
//! # Example Usage
//!
//! ```bash
//! # Using CLI arguments
//! scopecrab --port 9090 --settings /etc/scopecrab.toml
//!
//! # Using environment variables
//! export SCOPECRAB_PORT=9090
//! export SCOPECRAB_SETTINGS=/etc/scopecrab.toml
//! scopecrab
//! ```

use crate::loader::Backoff;
use anyhow::{Result, anyhow};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    /// Rate limit settings file; `None` reads settings from the environment only
    pub settings: Option<PathBuf>,
    /// Scope used for requests without scope headers
    pub default_website: u32,
    pub default_store: u32,
    /// Scopes without settings of their own remembered as aliases of their owner
    pub max_aliases: usize,
    /// Per-call timeout of the Redis store
    pub redis_timeout: Duration,
    /// Give up on a configuration load after this long
    pub load_timeout: Duration,
    pub load_backoff: Backoff,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl HttpConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow!("invalid listen address {}:{}: {e}", self.host, self.port))
    }
}

/// Command-line arguments for the server
///
/// All arguments can also be set via environment variables with the
/// SCOPECRAB_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "scopecrab",
    about = "Scope-hierarchical admission control service",
    long_about = "Gates HTTP requests per website/store scope with lazily loaded GCRA rate limits.\n\nEnvironment variables with SCOPECRAB_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "SCOPECRAB_HOST"
    )]
    pub host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 8080,
        env = "SCOPECRAB_PORT"
    )]
    pub port: u16,

    #[arg(
        long,
        value_name = "PATH",
        help = "TOML file with per-scope rate limit settings",
        env = "SCOPECRAB_SETTINGS"
    )]
    pub settings: Option<PathBuf>,

    #[arg(
        long,
        value_name = "ID",
        help = "Website for requests without X-Website-Id",
        default_value_t = 0,
        env = "SCOPECRAB_DEFAULT_WEBSITE"
    )]
    pub default_website: u32,
    #[arg(
        long,
        value_name = "ID",
        help = "Store for requests without X-Store-Id",
        default_value_t = 0,
        env = "SCOPECRAB_DEFAULT_STORE"
    )]
    pub default_store: u32,
    #[arg(
        long,
        value_name = "COUNT",
        help = "Most scopes without settings of their own to remember",
        default_value_t = crate::cache::DEFAULT_MAX_ALIASES,
        env = "SCOPECRAB_MAX_SCOPE_ALIASES"
    )]
    pub max_scope_aliases: usize,

    #[arg(
        long,
        value_name = "MS",
        help = "Timeout of a single Redis call (milliseconds)",
        default_value_t = 250,
        env = "SCOPECRAB_REDIS_TIMEOUT_MS"
    )]
    pub redis_timeout_ms: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Timeout of a configuration load (milliseconds)",
        default_value_t = 5_000,
        env = "SCOPECRAB_LOAD_TIMEOUT_MS"
    )]
    pub load_timeout_ms: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Wait after the first failed load before retrying (milliseconds, 0 retries every request)",
        default_value_t = 1_000,
        env = "SCOPECRAB_LOAD_RETRY_INITIAL_MS"
    )]
    pub load_retry_initial_ms: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Upper bound of the failed load retry wait (milliseconds)",
        default_value_t = 60_000,
        env = "SCOPECRAB_LOAD_RETRY_MAX_MS"
    )]
    pub load_retry_max_ms: u64,

    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "SCOPECRAB_LOG_LEVEL"
    )]
    pub log_level: String,

    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range or inconsistent.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        let config = Self::from_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_args(args: Args) -> Self {
        Config {
            http: HttpConfig {
                host: args.host,
                port: args.port,
            },
            settings: args.settings,
            default_website: args.default_website,
            default_store: args.default_store,
            max_aliases: args.max_scope_aliases,
            redis_timeout: Duration::from_millis(args.redis_timeout_ms),
            load_timeout: Duration::from_millis(args.load_timeout_ms),
            load_backoff: Backoff {
                initial: Duration::from_millis(args.load_retry_initial_ms),
                max: Duration::from_millis(args.load_retry_max_ms),
            },
            log_level: args.log_level,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.http.addr()?;

        if self.default_store != 0 && self.default_website == 0 {
            return Err(anyhow!(
                "--default-store {} needs a --default-website to belong to",
                self.default_store
            ));
        }
        if self.redis_timeout.is_zero() {
            return Err(anyhow!("--redis-timeout-ms must be positive"));
        }
        if self.load_timeout.is_zero() {
            return Err(anyhow!("--load-timeout-ms must be positive"));
        }
        if self.load_backoff.max < self.load_backoff.initial {
            return Err(anyhow!(
                "--load-retry-max-ms ({:?}) is below --load-retry-initial-ms ({:?})",
                self.load_backoff.max,
                self.load_backoff.initial
            ));
        }
        if !["error", "warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "invalid log level {:?}; expected error, warn, info, debug or trace",
                self.log_level
            ));
        }

        Ok(())
    }

    fn print_env_vars() {
        println!("ScopeCrab Environment Variables");
        println!("===============================");
        println!();
        println!("All environment variables use the SCOPECRAB_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Server:");
        println!("  SCOPECRAB_HOST=<host>                  HTTP host [default: 127.0.0.1]");
        println!("  SCOPECRAB_PORT=<port>                  HTTP port [default: 8080]");
        println!("  SCOPECRAB_SETTINGS=<path>              Rate limit settings file (TOML)");
        println!("  SCOPECRAB_DEFAULT_WEBSITE=<id>         Website without X-Website-Id [default: 0]");
        println!("  SCOPECRAB_DEFAULT_STORE=<id>           Store without X-Store-Id [default: 0]");
        println!("  SCOPECRAB_MAX_SCOPE_ALIASES=<count>    Scopes sharing a parent config to remember [default: 10000]");
        println!();

        println!("Backends and loading:");
        println!("  SCOPECRAB_REDIS_TIMEOUT_MS=<ms>        Redis call timeout [default: 250]");
        println!("  SCOPECRAB_LOAD_TIMEOUT_MS=<ms>         Configuration load timeout [default: 5000]");
        println!("  SCOPECRAB_LOAD_RETRY_INITIAL_MS=<ms>   First retry wait after a failed load [default: 1000]");
        println!("  SCOPECRAB_LOAD_RETRY_MAX_MS=<ms>       Longest retry wait [default: 60000]");
        println!();

        println!("General:");
        println!(
            "  SCOPECRAB_LOG_LEVEL=<level>            Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Rate limit settings (override the settings file, \"__\" separates levels):");
        println!("  SCOPECRAB__DEFAULT__RATELIMIT__REQUESTS=100");
        println!("  SCOPECRAB__DEFAULT__RATELIMIT__DURATION=i");
        println!("  SCOPECRAB__WEBSITES__2__RATELIMIT__BURST=20");
        println!("  SCOPECRAB__STORES__5__RATELIMIT__DISABLED=true");
    }
}
