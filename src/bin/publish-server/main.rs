use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use publish::{
    GitCli, PublishPipeline, PublishService, Settings, SubmitOutcome, Upload, VersionControlClient,
    WorkspaceConfig,
};

use crate::args::{Backend, OutputFormat, ValidatedCommand};
use crate::error::AppError;

mod args;
mod error;
mod progress;

const DEFAULT_LOG_FILTER: &str = "publish=info,publish_server=info,tower_http=info";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("   caused by: {cause}");
                source = std::error::Error::source(cause);
            }
            err.into()
        }
    }
}

fn run() -> Result<(), AppError> {
    let args = args::parse()?;
    match args.command {
        ValidatedCommand::Serve {
            settings,
            addr,
            backend,
        } => {
            init_tracing(DEFAULT_LOG_FILTER);
            serve(settings, addr, backend)
        }
        ValidatedCommand::Publish {
            archive,
            settings,
            backend,
        } => {
            // Keep the log quiet unless asked so it doesn't fight with the spinner
            init_tracing("warn");
            publish_one(&archive, settings, backend)
        }
        ValidatedCommand::Check { settings, format } => check(settings, format),
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn make_client(backend: Backend, config: &WorkspaceConfig) -> Box<dyn VersionControlClient> {
    match backend {
        #[cfg(feature = "libgit2")]
        Backend::Libgit2 => Box::new(publish::Git2Client::new()),
        _ => Box::new(GitCli::new(config.git_timeout)),
    }
}

fn serve(settings: Settings, addr: std::net::SocketAddr, backend: Backend) -> Result<(), AppError> {
    tracing::info!("Starting upload server...");
    let service = match settings.workspace() {
        Ok(config) => {
            tracing::info!(
                "Configured to push to: {} on branch {}",
                config.display_url(),
                config.branch
            );
            tracing::info!(
                "Application source will be placed in: {}",
                config.scope_dir().display()
            );
            let client = make_client(backend, &config);
            PublishService::new(PublishPipeline::new(config, client))
        }
        Err(err) => {
            tracing::error!(
                "CRITICAL WARNING: {err}. Every upload will be rejected until the configuration is fixed."
            );
            PublishService::unconfigured(err)
        }
    }
    .with_uploads_dir(settings.uploads_dir.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
        .map_err(AppError::server)?;
    runtime
        .block_on(async {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind to {addr}"))?;
            publish::server::serve(listener, Arc::new(service))
                .await
                .context("server stopped with an error")
        })
        .map_err(AppError::server)
}

fn publish_one(
    archive: &std::path::Path,
    settings: Settings,
    backend: Backend,
) -> Result<(), AppError> {
    let config = settings.workspace().map_err(AppError::config)?;
    let upload = Upload::from_path(archive).map_err(AppError::input)?;
    println!(
        "📦 Publishing {} to {} ({}, {})",
        archive.display(),
        config.display_url(),
        config.branch,
        config.scope
    );
    let spinner = progress::make_progress_spinner();
    let client = make_client(backend, &config);
    let pipeline = PublishPipeline::new(config, client).with_observer(progress::observer(spinner.clone()));
    let service = PublishService::new(pipeline).with_uploads_dir(settings.uploads_dir);
    let outcome = service.submit(Some(upload));
    spinner.finish_and_clear();
    match outcome {
        SubmitOutcome::Success(result) => {
            println!("✅ {}", result.message);
            if let Some(message) = result.commit_message {
                println!("🔗 {message}");
            }
            Ok(())
        }
        other => {
            eprintln!("{}", other.message());
            Err(AppError::publish())
        }
    }
}

/// The effective configuration, as printed by `check`.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct EffectiveConfig {
    remote_url: String,
    branch: String,
    target_subdir: String,
    local_path: std::path::PathBuf,
    preserved_entries: Vec<String>,
    git_timeout_secs: u64,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploads_dir: Option<std::path::PathBuf>,
}

fn check(settings: Settings, format: Option<OutputFormat>) -> Result<(), AppError> {
    let config = settings.workspace().map_err(AppError::config)?;
    let effective = EffectiveConfig {
        remote_url: config.display_url(),
        target_subdir: match &config.scope {
            publish::SyncScope::Root => ".".to_string(),
            publish::SyncScope::Subdir(subdir) => subdir.display().to_string(),
        },
        local_path: config.local_path,
        preserved_entries: config.preserved_entries.into_iter().collect(),
        git_timeout_secs: config.git_timeout.as_secs(),
        port: settings.port(),
        uploads_dir: settings.uploads_dir,
        branch: config.branch,
    };
    let rendered = match format.unwrap_or(OutputFormat::Toml) {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&effective).map_err(|err| AppError::render("JSON", err))?
        }
        OutputFormat::Toml => {
            toml::to_string_pretty(&effective).map_err(|err| AppError::render("TOML", err))?
        }
    };
    println!("{rendered}");
    Ok(())
}
