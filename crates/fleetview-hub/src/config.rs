use anyhow::{bail, Context, Result};
use clap::Parser;
use fleetview_core::{SyncConfig, DEFAULT_MAX_FRAME_BYTES};
use std::time::Duration;
use url::Url;

const DEFAULT_ADDR: &str = "127.0.0.1:42180";
const DEFAULT_FLEET_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_LOG_DIR: &str = ".fleetview/logs";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub fleet_url: Url,
    pub session_id: String,
    pub debug: bool,
    pub sync: SyncConfig,
    pub reconnect_max: Duration,
    pub max_frame_bytes: usize,
    pub slots: usize,
    pub log_dir: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_max_bytes: u64,
}

#[derive(Parser, Debug)]
#[command(name = "fleetview-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// WebSocket endpoint of the fleet server.
    #[arg(long, default_value = "")]
    fleet_url: String,
    /// Viewer token forwarded to the fleet server as the `token` query parameter.
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10_000)]
    grace_ms: u64,
    #[arg(long, default_value_t = fleetview_core::sync::DEFAULT_MAX_ORPHANS)]
    max_orphans: usize,
    #[arg(long, default_value_t = fleetview_core::sync::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 30)]
    reconnect_max: u64,
    #[arg(long, default_value_t = 6)]
    slots: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    log_level: String,
    /// Rotate the session log once it reaches this size; 0 keeps one file forever.
    #[arg(long, default_value_t = 16)]
    log_max_mb: u64,
}

pub fn load_config() -> Result<Config> {
    from_args(Args::parse())
}

pub fn from_args(args: Args) -> Result<Config> {
    let session_id = if !args.session.trim().is_empty() {
        args.session
    } else {
        resolve_session_id()
    };
    let fleet_url = resolve_value(&args.fleet_url, "FLEETVIEW_FLEET_URL", DEFAULT_FLEET_URL);
    let token = resolve_value(&args.token, "FLEETVIEW_TOKEN", "");
    let fleet_url = fleet_endpoint(&fleet_url, &token)?;
    if args.reconnect_max == 0 {
        bail!("--reconnect-max must be at least 1 second");
    }
    let debug = args.debug || env_true("FLEETVIEW_DEBUG");
    let log_level = if debug {
        "debug".to_string()
    } else {
        resolve_value(&args.log_level, "FLEETVIEW_LOG_LEVEL", DEFAULT_LOG_LEVEL)
    };
    Ok(Config {
        addr: resolve_value(&args.addr, "FLEETVIEW_ADDR", DEFAULT_ADDR),
        fleet_url,
        session_id,
        debug,
        sync: SyncConfig {
            grace_window: Duration::from_millis(args.grace_ms),
            max_orphans: args.max_orphans,
            queue_capacity: args.queue_capacity.max(1),
        },
        reconnect_max: Duration::from_secs(args.reconnect_max),
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        slots: args.slots,
        log_dir: resolve_value(&args.log_dir, "FLEETVIEW_LOG_DIR", DEFAULT_LOG_DIR),
        log_level,
        log_max_bytes: args.log_max_mb.saturating_mul(1024 * 1024),
    })
}

/// Builds the upstream URL, carrying the viewer token as a query parameter.
pub fn fleet_endpoint(base: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(base.trim()).with_context(|| format!("invalid fleet url '{base}'"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("fleet url must use ws or wss, got '{other}'"),
    }
    if !token.trim().is_empty() {
        url.query_pairs_mut().append_pair("token", token.trim());
    }
    Ok(url)
}

/// Flag, then environment, then default.
fn resolve_value(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_session_id() -> String {
    if let Ok(value) = std::env::var("FLEETVIEW_SESSION_ID") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    format!("pid-{}", std::process::id())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
