use anyhow::{Context, Result};
use hydra::cli::{Args, ExecutionMode, RunConfig};
use hydra::config::HydraConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let verbose = matches!(&mode, ExecutionMode::Run(RunConfig { verbose: true, .. }));
    let default_filter = if verbose { "hydra=debug" } else { "hydra=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match mode {
        ExecutionMode::Run(config) => run(config).await,
        ExecutionMode::Validate { file } => {
            let config = load_validated(file.as_deref())?;
            println!(
                "{}: ok ({} containers, {} prestart, {} programs)",
                config.stack.name,
                config.stack.containers.len(),
                config.stack.prestart.len(),
                config.services.programs.len()
            );
            Ok(())
        }
        ExecutionMode::Show { file } => {
            let config = load_validated(file.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config.stack)?);
            Ok(())
        }
    }
}

fn load_validated(file: Option<&Path>) -> Result<HydraConfig> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut config = HydraConfig::discover(file, &cwd).context("Failed to load config")?;
    config
        .stack
        .validate()
        .with_context(|| format!("Stack {:?} is invalid", config.stack.name))?;
    Ok(config)
}

async fn run(run_config: RunConfig) -> Result<()> {
    let config = load_validated(run_config.file.as_deref())?;
    let stack = Arc::new(config.stack);
    let services = Arc::new(config.services);

    services
        .initialize()
        .context("Failed to start supervised programs")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping stack");
                cancel.cancel();
            }
        });
    }

    if run_config.follow_logs {
        for name in stack.container_names() {
            let Some(container) = stack.container(&name) else {
                continue;
            };
            tokio::spawn(async move {
                let tail = container.tail();
                while let Some(line) = tail.recv().await {
                    println!(
                        "{} [{}] {}",
                        line.timestamp.format("%H:%M:%S%.3f"),
                        line.source,
                        line.message
                    );
                }
            });
        }
    }

    info!(stack = %stack.id, name = %stack.name, "Running stack");
    let result = stack.run(cancel).await;

    if let Err(e) = &result {
        error!("Stack run failed: {}", e);
        // Containers that did start are still up after a failed start phase.
        if let Err(e) = stack.stop().await {
            warn!("Cleanup after failed start: {}", e);
        }
    }

    services.stop(false);
    services.wait().await;

    result.context("Stack exited with an error")?;
    info!("Stack stopped");
    Ok(())
}
