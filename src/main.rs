//! Hydros binary: parses the CLI, wires the reconcilers, and runs the
//! requested command. Exit code 0 on success, 1 on unrecoverable error.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use hydros::api::{load_resources, RepoConfig};
use hydros::cli::{Cli, Commands};
use hydros::controller::{Manager, Registry, ResourceDispatcher};
use hydros::git::Cloner;
use hydros::github::TransportPool;
use hydros::observability;
use hydros::reconcilers::{
    ImageReconciler, ManifestSyncReconciler, ReleaserReconciler, RenderEvent,
    RepoConfigReconciler, ReplicatedImageReconciler,
};
use hydros::secrets;
use hydros::server::{start_server, ServerState};

fn main() {
    let cli = Cli::parse();
    observability::init_tracing("info");

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        error!(error = %format!("{e:#}"), "hydros failed");
        std::process::exit(1);
    }
}

/// Build the transport pool from the App credentials, when configured.
async fn transport_pool(
    app_id: Option<u64>,
    private_key_uri: Option<&str>,
) -> anyhow::Result<Option<Arc<TransportPool>>> {
    let (Some(app_id), Some(uri)) = (app_id, private_key_uri) else {
        return Ok(None);
    };
    let pem = secrets::read(uri)
        .await
        .context("failed to read the GitHub App private key")?;
    let pool = TransportPool::new(app_id, &pem)?;
    Ok(Some(Arc::new(pool)))
}

fn require_pool(pool: Option<Arc<TransportPool>>) -> anyhow::Result<Arc<TransportPool>> {
    pool.context("GitHub App credentials required: pass --app-id and --private-key")
}

/// Registry with every reconciler hydros ships.
fn build_registry(
    pool: &Option<Arc<TransportPool>>,
    base_dir: &Path,
    force: bool,
) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    registry.register(Arc::new(
        ReplicatedImageReconciler::new(pool.clone()),
    ))?;
    registry.register(Arc::new(
        ImageReconciler::new(pool.clone(), base_dir).with_force(force),
    ))?;
    if let Some(pool) = pool {
        registry.register(Arc::new(RepoConfigReconciler::new(
            Arc::clone(pool),
            base_dir,
        )))?;
        registry.register(Arc::new(ManifestSyncReconciler::new(
            Arc::clone(pool),
            base_dir,
        )))?;
        registry.register(Arc::new(ReleaserReconciler::new(Arc::clone(pool))))?;
    }
    Ok(registry)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = transport_pool(cli.app_id, cli.private_key.as_deref()).await?;
    let base_dir = cli.work_dir.clone();

    match cli.command {
        Commands::Apply {
            paths,
            period,
            force,
        } => {
            let registry = build_registry(&pool, &base_dir, force)?;
            let dispatcher = ResourceDispatcher::new(registry);
            match period {
                Some(period) => dispatcher.run_periodically(&paths, period).await,
                None => {
                    let applied = dispatcher
                        .apply_paths(&paths)
                        .await
                        .map_err(|e| anyhow::anyhow!("{e}"))?;
                    info!(applied, "apply finished");
                    Ok(())
                }
            }
        }

        Commands::Build { file } => {
            let registry = build_registry(&pool, &base_dir, false)?;
            let dispatcher = ResourceDispatcher::new(registry);
            let applied = dispatcher
                .apply_paths(std::slice::from_ref(&file))
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            info!(applied, "build finished");
            Ok(())
        }

        Commands::Takeover { file, repo_dir } => {
            let pool = require_pool(pool)?;
            let repo_dir = match repo_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let reconciler = ManifestSyncReconciler::new(Arc::clone(&pool), &base_dir);
            let resources = load_resources(&file)?;
            let mut ran = false;
            for resource in &resources {
                if resource.gvk.kind != "ManifestSync" {
                    continue;
                }
                let sync = resource.decode()?;
                reconciler.takeover(&sync, &repo_dir).await?;
                ran = true;
            }
            anyhow::ensure!(ran, "no ManifestSync found in {}", file.display());
            Ok(())
        }

        Commands::Clone { repos } => {
            let mut cloner = Cloner::new(&base_dir);
            if let Some(pool) = &pool {
                cloner = cloner.with_transports(Arc::clone(pool));
            }
            let dirs = cloner.run(&repos).await?;
            for dir in dirs {
                info!(dir = %dir.display(), "cloned");
            }
            Ok(())
        }

        Commands::Serve {
            port,
            webhook_secret,
            configs,
            workers,
            resync,
        } => {
            let pool = require_pool(pool)?;
            let webhook_secret = secrets::read(&webhook_secret)
                .await
                .context("failed to read the webhook secret")?;

            let mut repo_configs: Vec<RepoConfig> = Vec::new();
            for path in &configs {
                for resource in load_resources(path)? {
                    if resource.gvk.kind == "RepoConfig" {
                        let config: RepoConfig = resource.decode()?;
                        config.validate()?;
                        repo_configs.push(config);
                    }
                }
            }
            info!(configs = repo_configs.len(), "serving webhook renders");

            let manager: Arc<Manager<RenderEvent>> = Arc::new(Manager::new());
            manager.start(workers, resync).await;

            let state = Arc::new(ServerState {
                webhook_secret,
                pool,
                manager: Arc::clone(&manager),
                base_dir,
                configs: repo_configs,
            });
            let server = tokio::spawn(start_server(port, state));

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            server.abort();
            manager.shutdown(std::time::Duration::from_secs(30)).await;
            Ok(())
        }

        Commands::Version => {
            println!(
                "hydros {} ({} built {})",
                env!("CARGO_PKG_VERSION"),
                env!("BUILD_GIT_HASH"),
                env!("BUILD_DATETIME"),
            );
            Ok(())
        }
    }
}
