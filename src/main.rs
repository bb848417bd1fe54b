use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

use experiment_store::{
    config::{AppConfig, Args, StorageBackend},
    handlers::{Authenticator, BackendAuthenticator, ListOptions, RequestHandler, TrustedIdentity},
    services::{
        HttpBucketClient, LocalStorage, MetadataStore, RemoteStorage, Storage, TemplateLibrary,
    },
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Experiment and model storage administration")]
struct Cli {
    #[command(flatten)]
    args: Args,

    /// Token of the acting user. The admin tools treat it as the user id.
    #[arg(long, global = true, default_value = "admin")]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the metadata schema and exit
    Migrate,
    /// Reconcile metadata with the experiments present in storage
    Scan,
    /// Clone a template experiment
    #[command(name = "clone")]
    CloneTemplate {
        /// Template folder, optionally followed by its configuration file
        template: String,
        /// Display name written into the cloned configuration
        #[arg(long)]
        name: Option<String>,
    },
    /// Import a zipped experiment with a single root folder
    Import { archive: PathBuf },
    /// Write an experiment to a zip archive
    Export {
        experiment: String,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// List the experiments visible to the acting user
    List {
        /// Only show the experiment with this name
        #[arg(long)]
        filter: Option<String>,
        /// Include a summary of each experiment's configuration
        #[arg(long)]
        decorate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env_and_args(cli.args.clone())?;
    tracing::info!("Starting experiment-store with config: {:?}", cfg);

    let token = cli.token.as_str();
    match cli.command {
        Command::Migrate => migrate(&cfg).await,
        Command::Scan => {
            let handler = build_handler(&cfg).await?;
            print_json(&handler.scan_storage(token).await?)
        }
        Command::CloneTemplate { template, name } => {
            let handler = build_handler(&cfg).await?;
            let id = handler
                .clone_experiment(token, &template, name.as_deref())
                .await
                .with_context(|| format!("cloning template `{template}`"))?;
            print_json(&id)
        }
        Command::Import { archive } => {
            let data = tokio::fs::read(&archive)
                .await
                .with_context(|| format!("reading {}", archive.display()))?;
            let handler = build_handler(&cfg).await?;
            print_json(&handler.register_zipped_experiment(token, Bytes::from(data)).await?)
        }
        Command::Export { experiment, output } => {
            let handler = build_handler(&cfg).await?;
            let data = handler.zip_experiment(token, &experiment).await?;
            tokio::fs::write(&output, &data)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(
                experiment = %experiment,
                output = %output.display(),
                bytes = data.len(),
                "exported experiment"
            );
            Ok(())
        }
        Command::List { filter, decorate } => {
            let handler = build_handler(&cfg).await?;
            let options = ListOptions { filter, decorate };
            print_json(&handler.list_experiments(token, &options).await?)
        }
    }
}

/// Run the bundled SQLite migrations for the local backend.
async fn migrate(cfg: &AppConfig) -> Result<()> {
    if cfg.backend != StorageBackend::Local {
        bail!("migrations only apply to the local backend");
    }
    match &cfg.database_url {
        Some(url) => MetadataStore::connect(url).await?.migrate().await?,
        // Opening the default layout creates and migrates its database.
        None => {
            LocalStorage::open(&cfg.storage_dir, cfg.user_data_dir.clone(), None).await?;
        }
    }
    tracing::info!("Database migration complete.");
    Ok(())
}

async fn build_handler(cfg: &AppConfig) -> Result<RequestHandler> {
    let (storage, authenticator): (Arc<dyn Storage>, Arc<dyn Authenticator>) = match cfg.backend {
        StorageBackend::Local => {
            let storage = LocalStorage::open(
                &cfg.storage_dir,
                cfg.user_data_dir.clone(),
                cfg.database_url.as_deref(),
            )
            .await
            .with_context(|| format!("opening local storage at {}", cfg.storage_dir.display()))?;
            (Arc::new(storage), Arc::new(TrustedIdentity))
        }
        StorageBackend::Remote => {
            let (api_url, bucket) = cfg.remote_target()?;
            let client = HttpBucketClient::new(api_url, bucket, cfg.request_timeout)?;
            (
                Arc::new(RemoteStorage::new(Arc::new(client))),
                Arc::new(BackendAuthenticator),
            )
        }
    };

    let templates = TemplateLibrary::new(&cfg.templates_dir, &cfg.models_dir);
    Ok(RequestHandler::new(storage, authenticator, Arc::new(TrustedIdentity))
        .with_templates(templates))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
