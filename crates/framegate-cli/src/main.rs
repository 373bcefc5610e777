//! # Framegate Entry Point
//!
//! Main binary for the framegate application server. Starts the fast and
//! slow worker pools, the event hub and the HTTP front.
//!
//! ## Usage
//!
//! ```bash
//! # Serve a PHP application with 4 fast and 2 slow workers
//! framegate -b 0.0.0.0:8080 --fast-workers 4 --slow-workers 2
//!
//! # A different interpreter and entry script
//! framegate --program python3 --entry app/worker.py --root-marker pyproject.toml
//!
//! # Map asset prefixes to directories under the project root
//! framegate --static-rule /assets/=public/assets --static-rule /css/=public/css
//!
//! # Relay everything under /stream/ with the streaming worker protocol
//! framegate --stream-prefix /stream/
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;

use framegate_server::worker::project_root;
use framegate_server::{
    Dispatcher, EventHub, HttpConfig, HttpServer, StaticRule, WorkerConfig,
};

/// framegate - an app server that fronts pools of interpreter workers
#[derive(FromArgs)]
struct Cli {
    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// number of workers in the fast pool
    #[argh(option, default = "4")]
    fast_workers: usize,

    /// number of workers in the slow pool
    ///
    /// Slow requests (reports, analytics, big uploads, PUT/DELETE) are
    /// isolated here so they cannot starve the fast pool.
    #[argh(option, default = "2")]
    slow_workers: usize,

    /// requests a worker serves before being recycled (0 disables)
    #[argh(option, default = "500")]
    max_requests: u64,

    /// per-request (and per-stream) timeout in milliseconds
    #[argh(option, default = "30000")]
    timeout_ms: u64,

    /// interpreter binary to run workers with
    #[argh(option, default = "\"php\".into()")]
    program: String,

    /// worker entry script, relative to the project root
    #[argh(option, default = "\"php/worker.php\".into()")]
    entry: String,

    /// file marking the project root while walking up from the current
    /// directory
    #[argh(option, default = "\"composer.json\".into()")]
    root_marker: String,

    /// static rule as prefix=dir, repeatable; defaults cover the usual
    /// public asset prefixes
    #[argh(option, long = "static-rule")]
    static_rules: Vec<String>,

    /// path prefix served with the streaming worker protocol, repeatable
    #[argh(option, long = "stream-prefix")]
    stream_prefixes: Vec<String>,
}

/// Parses `prefix=dir` into a static rule.
fn parse_static_rule(raw: &str) -> Result<StaticRule> {
    let (prefix, dir) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid static rule '{}', expected prefix=dir", raw))?;
    if !prefix.starts_with('/') {
        anyhow::bail!("static rule prefix '{}' must start with /", prefix);
    }
    Ok(StaticRule {
        prefix: prefix.to_string(),
        dir: PathBuf::from(dir),
    })
}

fn default_static_rules() -> Vec<StaticRule> {
    [
        ("/assets/", "public/assets"),
        ("/build/", "public/build"),
        ("/css/", "public/css"),
        ("/js/", "public/js"),
        ("/images/", "public/images"),
        ("/img/", "public/img"),
    ]
    .into_iter()
    .map(|(prefix, dir)| StaticRule {
        prefix: prefix.to_string(),
        dir: PathBuf::from(dir),
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default log level INFO, overridable via RUST_LOG.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let static_rules = if cli.static_rules.is_empty() {
        default_static_rules()
    } else {
        cli.static_rules
            .iter()
            .map(|raw| parse_static_rule(raw))
            .collect::<Result<Vec<_>>>()?
    };

    let worker_config = WorkerConfig {
        program: cli.program,
        args: Vec::new(),
        entry: Some(PathBuf::from(cli.entry)),
        root_marker: cli.root_marker.clone(),
        max_requests: cli.max_requests,
        request_timeout: Duration::from_millis(cli.timeout_ms),
    };

    let root = project_root(&cli.root_marker);
    tracing::info!("project root: {}", root.display());
    tracing::info!(
        "fast workers: {} | slow workers: {}",
        cli.fast_workers,
        cli.slow_workers
    );
    for rule in &static_rules {
        tracing::info!("static rule: {} -> {}", rule.prefix, root.join(&rule.dir).display());
    }

    let dispatcher = Arc::new(Dispatcher::new(
        cli.fast_workers,
        cli.slow_workers,
        worker_config,
    )?);
    let hub = Arc::new(EventHub::new());

    let http_config = HttpConfig {
        project_root: root,
        static_rules,
        stream_prefixes: cli.stream_prefixes,
    };

    let addr: SocketAddr = cli
        .bind
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid bind address {}: {}", cli.bind, err))?;

    HttpServer::new(dispatcher, hub, http_config).run(addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli: Cli = Cli::from_args(&["framegate"], &[]).unwrap();
        assert_eq!(cli.bind, "0.0.0.0:8080");
        assert_eq!(cli.fast_workers, 4);
        assert_eq!(cli.slow_workers, 2);
        assert_eq!(cli.max_requests, 500);
        assert_eq!(cli.timeout_ms, 30000);
        assert_eq!(cli.program, "php");
        assert_eq!(cli.entry, "php/worker.php");
        assert_eq!(cli.root_marker, "composer.json");
        assert!(cli.static_rules.is_empty());
        assert!(cli.stream_prefixes.is_empty());
    }

    #[test]
    fn test_cli_parse_pools_and_bind() {
        let cli: Cli = Cli::from_args(
            &["framegate"],
            &[
                "-b",
                "127.0.0.1:9090",
                "--fast-workers",
                "8",
                "--slow-workers",
                "3",
            ],
        )
        .unwrap();
        assert_eq!(cli.bind, "127.0.0.1:9090");
        assert_eq!(cli.fast_workers, 8);
        assert_eq!(cli.slow_workers, 3);
    }

    #[test]
    fn test_cli_parse_repeated_options() {
        let cli: Cli = Cli::from_args(
            &["framegate"],
            &[
                "--static-rule",
                "/assets/=public/assets",
                "--static-rule",
                "/img/=public/img",
                "--stream-prefix",
                "/stream/",
            ],
        )
        .unwrap();
        assert_eq!(cli.static_rules.len(), 2);
        assert_eq!(cli.stream_prefixes, vec!["/stream/".to_string()]);
    }

    #[test]
    fn test_parse_static_rule() {
        let rule = parse_static_rule("/assets/=public/assets").unwrap();
        assert_eq!(rule.prefix, "/assets/");
        assert_eq!(rule.dir, PathBuf::from("public/assets"));
    }

    #[test]
    fn test_parse_static_rule_rejects_bad_input() {
        assert!(parse_static_rule("no-equals-sign").is_err());
        assert!(parse_static_rule("assets=public/assets").is_err());
    }

    #[test]
    fn test_default_static_rules_cover_asset_prefixes() {
        let rules = default_static_rules();
        assert!(rules.iter().any(|r| r.prefix == "/assets/"));
        assert!(rules.iter().all(|r| r.prefix.starts_with('/')));
    }
}
