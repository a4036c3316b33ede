mod args;
mod init;

use std::sync::Arc;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use modhost::host_config::HostConfig;
use modhost::{BinaryCache, Manager, ManagerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = HostConfig::load()?;
    init::initialize_logging(&config);

    match cli.command {
        Some(Commands::Genmanifest { binary, outfile }) => cmd_genmanifest(binary, outfile),
        None => {
            let modules_dir = init::resolve_modules_dir(cli.modules_dir.clone(), &config);
            cmd_run(cli, config, modules_dir).await
        }
    }
}

fn cmd_genmanifest(binary: std::path::PathBuf, outfile: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let loader = BinaryCache::new();
    let manifest = Manager::module_manifest(&loader, &binary)
        .with_context(|| format!("Failed to read manifest of {}", binary.display()))?;
    let content = manifest.to_toml()?;

    match outfile {
        Some(path) => std::fs::write(&path, content)
            .with_context(|| format!("Failed to write manifest to {}", path.display()))?,
        None => print!("{content}"),
    }
    Ok(())
}

async fn cmd_run(cli: Cli, config: HostConfig, modules_dir: std::path::PathBuf) -> anyhow::Result<()> {
    let manager = Manager::new(ManagerConfig::new(modules_dir));

    let mut by_names = config.start_modules;
    by_names.extend(cli.modules);
    let mut by_services = config.start_services;
    by_services.extend(cli.services);

    spawn_interrupt_handler(Arc::clone(&manager));

    let launcher = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            manager.wait_state(modhost::WorkState::Started).await;
            launch(&manager, by_names, by_services, cli.run, cli.run_n).await;
        }
    });

    let result = manager.run().await;
    launcher.abort();
    result.context("Manager run failed")
}

async fn launch(
    manager: &Arc<Manager>,
    by_names: Vec<String>,
    by_services: Vec<String>,
    run: Vec<String>,
    run_n: Vec<String>,
) {
    if !manager.start_modules(&by_names, &by_services).await {
        tracing::error!("Modules start failed, stopping");
        manager.stop();
        return;
    }

    for value in run {
        let argv = args::split_argv(&value);
        if argv.is_empty() {
            tracing::error!("--run must specify daemon name");
            continue;
        }
        let daemon = manager.run_daemon(&argv);
        tokio::spawn(async move {
            if let Err(e) = daemon.await {
                tracing::error!(argv = ?argv, "Daemon run failed: {:#}", anyhow::Error::new(e));
            }
        });
    }

    for value in run_n {
        let argv = args::split_argv(&value);
        if argv.len() < 2 {
            tracing::error!("--run-n must specify daemons amount and daemon name");
            continue;
        }
        let daemons = manager.run_daemons(&argv);
        tokio::spawn(async move {
            if let Err(e) = daemons.await {
                tracing::error!(argv = ?argv, "Daemons run failed: {:#}", anyhow::Error::new(e));
            }
        });
    }
}

/// First Ctrl-C stops the manager; later ones only report progress.
fn spawn_interrupt_handler(manager: Arc<Manager>) {
    let mut interrupted = manager.subscribe_interrupted();

    tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                manager.interrupt();
            }
        }
    });

    tokio::spawn(async move {
        let mut stopping = false;
        while interrupted.recv().await.is_ok() {
            if stopping {
                tracing::warn!("Interrupted, await previous stopping");
                continue;
            }
            stopping = true;
            tracing::info!("Interrupted, stopping");
            manager.stop();
        }
    });
}
