//! Configuration (§6): a `Config` struct built once from environment
//! variables at startup, never consulted ad hoc afterward. Grounded on the
//! teacher's own env-var bootstrap in `main()` (`PORT`, `RUST_LOG`), widened
//! here into a typed struct since this gateway has many more knobs than the
//! teacher's single `PORT` read.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {name} has an invalid value: {detail}")]
    Invalid { name: &'static str, detail: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub tak_server_url: String,
    pub queue_path: PathBuf,
    pub audit_path: PathBuf,
    pub bearer_public_key_pem: Vec<u8>,
    pub api_key_store_path: Option<PathBuf>,
    pub rate_limit_authenticated: u32,
    pub rate_limit_anonymous: u32,
    pub queue_capacity: usize,
    pub push_concurrency: usize,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, detail: format!("could not parse {raw:?}") }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Reads and validates every setting listed in §6. Fails fast — any
    /// missing or malformed variable aborts startup rather than falling
    /// back silently for anything security- or durability-relevant.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr_raw = env_var_or("LISTEN_ADDR", "0.0.0.0:8000");
        let listen_addr = listen_addr_raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "LISTEN_ADDR", detail: listen_addr_raw.clone() })?;

        let tak_server_url = env_var("TAK_SERVER_URL")?;
        let queue_path = PathBuf::from(env_var("QUEUE_PATH")?);
        let audit_path = PathBuf::from(env_var("AUDIT_PATH")?);

        let bearer_public_key_path = env_var("BEARER_PUBLIC_KEY")?;
        let bearer_public_key_pem = std::fs::read(&bearer_public_key_path)
            .map_err(|e| ConfigError::Invalid { name: "BEARER_PUBLIC_KEY", detail: e.to_string() })?;

        let api_key_store_path = std::env::var("API_KEY_STORE_PATH").ok().map(PathBuf::from);

        let rate_limit_authenticated = parse_env("RATE_LIMIT_AUTHENTICATED", 100u32)?;
        let rate_limit_anonymous = parse_env("RATE_LIMIT_ANONYMOUS", 10u32)?;
        let queue_capacity = parse_env("QUEUE_CAPACITY", 10_000usize)?;
        let push_concurrency = parse_env("PUSH_CONCURRENCY", 8usize)?;

        Ok(Self {
            listen_addr,
            tak_server_url,
            queue_path,
            audit_path,
            bearer_public_key_pem,
            api_key_store_path,
            rate_limit_authenticated,
            rate_limit_anonymous,
            queue_capacity,
            push_concurrency,
        })
    }
}
