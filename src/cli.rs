use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "clearance-mirror",
    version,
    about = "Credential-caching mirror proxy for Cloudflare-protected origins"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "MIRROR_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Base URL of the challenge-solving service
    #[arg(long, env = "MIRROR_SOLVER_URL")]
    pub solver_url: Url,

    /// Attempts the solving service spends per challenge
    #[arg(long, env = "MIRROR_SOLVER_RETRIES", default_value_t = 5)]
    pub solver_retries: u8,

    /// Upper bound for a single solve, in seconds
    #[arg(long, env = "MIRROR_SOLVER_TIMEOUT_SECS", default_value_t = 60)]
    pub solver_timeout_secs: u64,

    /// Path of the persisted clearance cache
    #[arg(long, env = "MIRROR_CACHE_FILE", default_value = "cf_cookie_cache.json")]
    pub cache_file: PathBuf,

    /// Keep the clearance cache in memory only
    #[arg(long, env = "MIRROR_NO_PERSIST")]
    pub no_persist: bool,

    /// Lifetime of a cached clearance, in seconds
    #[arg(long, env = "MIRROR_CREDENTIAL_TTL_SECS", default_value_t = 7200)]
    pub credential_ttl_secs: u64,

    /// Retries after a 403 or transport failure
    #[arg(long, env = "MIRROR_MAX_RETRIES", default_value_t = 2)]
    pub max_retries: u32,

    /// Pause before each retry, in milliseconds
    #[arg(long, env = "MIRROR_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Share one solve between concurrent misses on the same origin
    #[arg(long, env = "MIRROR_SINGLE_FLIGHT")]
    pub single_flight: bool,

    /// Pooled outbound sessions kept at most (0 = unbounded)
    #[arg(long, env = "MIRROR_SESSION_CAPACITY", default_value_t = 256)]
    pub session_capacity: usize,

    /// Interval between sweeps of expired cache entries, in seconds (0 = never)
    #[arg(long, env = "MIRROR_PRUNE_INTERVAL_SECS", default_value_t = 600)]
    pub prune_interval_secs: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "MIRROR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
