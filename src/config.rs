//! Daemon configuration: layered CLI (`clap`) + env + defaults, following
//! the same override order documented in `trunk-rs-trunk/src/config/mod.rs`
//! (CLI overrides > env > defaults) — narrowed to the engine's own startup
//! flags, since there is no on-disk engine configuration file to layer
//! underneath them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use crate::logs::DEFAULT_LOG_RING_CAPACITY;

/// Default per-call timeout when a `/load` request's config doesn't supply
/// a `TIMEOUT_MILLIS` override.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 5_000;

/// `ignition-engine` — the long-lived daemon behind the control socket.
#[derive(Parser, Debug, Clone)]
#[command(about, author, version)]
pub struct EngineArgs {
    /// Root directory for blobs, metadata, and the control socket.
    /// Defaults to `$IGNITION_ROOT`, falling back to `$HOME/.ignition`.
    #[arg(long, env = "IGNITION_ROOT")]
    pub root: Option<PathBuf>,

    /// Path to the control socket. Defaults to `<root>/engine.sock`.
    #[arg(long, env = "IGNITION_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Per-function log ring capacity.
    #[arg(long, env = "IGNITION_LOG_RING_CAPACITY", default_value_t = DEFAULT_LOG_RING_CAPACITY)]
    pub log_ring_capacity: usize,

    /// Default per-call timeout in milliseconds, used unless a load's config
    /// supplies its own `TIMEOUT_MILLIS`.
    #[arg(long, env = "IGNITION_DEFAULT_TIMEOUT_MILLIS", default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    pub default_timeout_millis: u64,

    /// Provide a `RUST_LOG`-style filter directly, overriding `-v`/`-q`.
    #[arg(long, env = "RUST_LOG")]
    pub log: Option<String>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all but warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl EngineArgs {
    pub fn tracing_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(directives) = &self.log {
            return tracing_subscriber::EnvFilter::new(directives);
        }
        let directives = match (self.verbose, self.quiet) {
            (_, true) => "error,ignition=warn",
            (0, false) => "error,ignition=info",
            (1, false) => "error,ignition=debug",
            (_, false) => "error,ignition=trace",
        };
        tracing_subscriber::EnvFilter::new(directives)
    }
}

/// Resolved, filesystem-ready engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub socket_path: PathBuf,
    pub content_root: PathBuf,
    pub metadata_path: PathBuf,
    pub log_ring_capacity: usize,
    pub default_timeout_millis: u64,
}

impl EngineConfig {
    pub fn resolve(args: &EngineArgs) -> Result<Self> {
        let root = match &args.root {
            Some(root) => root.clone(),
            None => default_root()?,
        };
        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| root.join("engine.sock"));

        Ok(Self {
            content_root: root.clone(),
            metadata_path: root.join("registry.db"),
            socket_path,
            root,
            log_ring_capacity: args.log_ring_capacity,
            default_timeout_millis: args.default_timeout_millis,
        })
    }

    /// Create `root` and remove a stale socket file left over from an
    /// unclean shutdown.
    pub async fn prepare_filesystem(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("error creating ignition root at {:?}", self.root))?;
        remove_stale_socket(&self.socket_path).await?;
        Ok(())
    }
}

fn default_root() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .context("error locating home directory")?
        .home_dir()
        .to_path_buf();
    Ok(home.join(".ignition"))
}

async fn remove_stale_socket(path: &Path) -> Result<()> {
    if tokio::fs::metadata(path).await.is_ok() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("error removing stale socket at {path:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_defaults_under_root() {
        let args = EngineArgs {
            root: Some(PathBuf::from("/tmp/ignition-test-root")),
            socket: None,
            log_ring_capacity: DEFAULT_LOG_RING_CAPACITY,
            default_timeout_millis: DEFAULT_TIMEOUT_MILLIS,
            log: None,
            verbose: 0,
            quiet: false,
        };
        let config = EngineConfig::resolve(&args).unwrap();
        assert_eq!(
            config.socket_path,
            PathBuf::from("/tmp/ignition-test-root/engine.sock")
        );
    }

    #[test]
    fn explicit_socket_overrides_default() {
        let args = EngineArgs {
            root: Some(PathBuf::from("/tmp/ignition-test-root")),
            socket: Some(PathBuf::from("/tmp/custom.sock")),
            log_ring_capacity: DEFAULT_LOG_RING_CAPACITY,
            default_timeout_millis: DEFAULT_TIMEOUT_MILLIS,
            log: None,
            verbose: 0,
            quiet: false,
        };
        let config = EngineConfig::resolve(&args).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
    }
}
