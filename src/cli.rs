//! # CLI
//!
//! Command-line surface of the hydros binary:
//!
//! ```bash
//! hydros apply manifests/ --period 5m
//! hydros build -f images.yaml
//! hydros takeover -f sync.yaml --repo-dir ~/src/hydros-hydrated
//! hydros clone --repo 'https://github.com/jlewi/hydros.git?ref=main' --work-dir /tmp/x
//! hydros serve --port 8080 --webhook-secret file:///etc/hydros/webhook \
//!   --app-id 1234 --private-key gcpsecretmanager://projects/p/secrets/key/versions/latest
//! ```
//!
//! Secret-valued flags take URIs resolved through the secret resolver.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Hydros: a GitOps automation engine.
#[derive(Debug, Parser)]
#[command(name = "hydros", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Base directory for repository checkouts.
    #[arg(long, global = true, default_value = "/tmp/hydros")]
    pub work_dir: PathBuf,

    /// GitHub App id used to mint installation tokens.
    #[arg(long, global = true)]
    pub app_id: Option<u64>,

    /// URI of the GitHub App private key (PEM).
    #[arg(long, global = true)]
    pub private_key: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load resources from YAML files and reconcile each one.
    Apply {
        /// Files or directories of resource YAML.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Re-reconcile forever at this interval (e.g. `5m`, `300s`).
        #[arg(long, value_parser = parse_duration)]
        period: Option<Duration>,

        /// Reconcile even when hydros believes nothing changed.
        #[arg(long)]
        force: bool,
    },

    /// Build the Image resources in a file.
    Build {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Push the local working tree as-is and run a single ManifestSync.
    Takeover {
        #[arg(short, long)]
        file: PathBuf,

        /// Local clone to push; defaults to the current directory.
        #[arg(long)]
        repo_dir: Option<PathBuf>,
    },

    /// Idempotently clone a list of repositories.
    Clone {
        /// Clone URIs, `https://{host}/{owner}/{repo}.git?ref=...&sha=...`.
        #[arg(long = "repo", required = true)]
        repos: Vec<String>,
    },

    /// Run the webhook HTTP server.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// URI of the webhook HMAC secret.
        #[arg(long)]
        webhook_secret: String,

        /// RepoConfig YAML files eligible for webhook-triggered renders.
        #[arg(long = "config")]
        configs: Vec<PathBuf>,

        /// Worker pool size.
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Resync every reconciler at this interval (e.g. `1h`).
        #[arg(long, value_parser = parse_duration)]
        resync: Option<Duration>,
    },

    /// Print version and build information.
    Version,
}

/// Parse `300`, `300s`, `5m`, `2h`, or `1d` into a duration.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return Err(format!("unknown duration unit {unit:?} in {raw:?}")),
    };
    if seconds == 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::parse_from([
            "hydros", "apply", "manifests/", "--period", "5m", "--force",
        ]);
        match cli.command {
            Commands::Apply {
                paths,
                period,
                force,
            } => {
                assert_eq!(paths, vec![PathBuf::from("manifests/")]);
                assert_eq!(period, Some(Duration::from_secs(300)));
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_clone() {
        let cli = Cli::parse_from([
            "hydros",
            "clone",
            "--repo",
            "https://github.com/jlewi/hydros.git?ref=main",
            "--work-dir",
            "/tmp/x",
        ]);
        assert_eq!(cli.work_dir, PathBuf::from("/tmp/x"));
        match cli.command {
            Commands::Clone { repos } => assert_eq!(repos.len(), 1),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
