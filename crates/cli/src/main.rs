use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use recipes_docker::{CredentialStore, DockerCli};
use recipes_pipeline::{BatchError, BuildConfig, Coordinator, HttpProbe, SubprocessTool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "recipes_pipeline=info,recipes_docker=info,container_recipes=info";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match BuildConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The build log lives in the build directory, so it must exist first.
    let manifests_dir = config.manifests_dir();
    if let Err(e) = std::fs::create_dir_all(&manifests_dir) {
        eprintln!("Unable to create {}: {e}", manifests_dir.display());
        return ExitCode::FAILURE;
    }
    let log_path = config.log_path();
    let log_file = match std::fs::File::create(&log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Unable to create {}: {e}", log_path.display());
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();

    tracing::info!(
        deployment_type = %config.deployment_type,
        tag = %config.tag,
        build_dir = %config.build_dir().display(),
        workers = config.workers,
        "Starting container build",
    );

    let credentials = if config.deployment_type.is_single() {
        CredentialStore::new(std::path::PathBuf::new())
    } else {
        match CredentialStore::user_default() {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "Unable to locate registry credentials");
                return ExitCode::FAILURE;
            }
        }
    };

    let coordinator = Coordinator::new(
        config,
        Arc::new(DockerCli::default()),
        Arc::new(SubprocessTool::default()),
        Arc::new(HttpProbe::default()),
        credentials,
    );

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping the batch");
            cancel.cancel();
        }
    });

    match coordinator.run().await {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(BatchError::PartialFailure(summary)) => {
            println!("{summary}");
            tracing::error!(failed = summary.failed_count(), "Some units failed to build or push");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
