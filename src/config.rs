use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Which [`Storage`](crate::services::Storage) implementation to run against.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageBackend {
    #[default]
    Local,
    Remote,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => bail!("unknown storage backend `{other}`, expected local or remote"),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: StorageBackend,
    pub storage_dir: PathBuf,
    pub user_data_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub templates_dir: PathBuf,
    pub models_dir: PathBuf,
    pub bucket_api_url: Option<String>,
    pub bucket: Option<String>,
    pub request_timeout: Duration,
}

/// Command-line configuration, shared by every subcommand.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct Args {
    /// Storage backend (overrides EXPERIMENT_STORE_BACKEND)
    #[arg(long, value_enum, global = true)]
    pub backend: Option<StorageBackend>,

    /// Directory holding one folder per experiment (overrides EXPERIMENT_STORE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Directory holding custom model archives (overrides EXPERIMENT_STORE_USER_DATA_DIR)
    #[arg(long, global = true)]
    pub user_data_dir: Option<PathBuf>,

    /// Metadata database URL (overrides EXPERIMENT_STORE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Template experiments to clone from (overrides EXPERIMENT_STORE_TEMPLATES_DIR)
    #[arg(long, global = true)]
    pub templates_dir: Option<PathBuf>,

    /// Shared model library (overrides EXPERIMENT_STORE_MODELS_DIR)
    #[arg(long, global = true)]
    pub models_dir: Option<PathBuf>,

    /// Bucket API base URL (overrides EXPERIMENT_STORE_BUCKET_API_URL)
    #[arg(long, global = true)]
    pub bucket_api_url: Option<String>,

    /// Bucket id (overrides EXPERIMENT_STORE_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Per-request timeout in seconds (overrides EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub request_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Merge parsed CLI args with the process environment.
    pub fn from_env_and_args(args: Args) -> Result<Self> {
        Self::resolve(args, |key| env::var(key))
    }

    /// CLI wins over env, env over defaults.
    fn resolve<F>(args: Args, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let lookup = |key: &str| -> Result<Option<String>> {
            match var(key) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {key}")),
            }
        };

        // --- Environment fallback ---
        let env_backend = match lookup("EXPERIMENT_STORE_BACKEND")? {
            Some(value) => value
                .parse::<StorageBackend>()
                .with_context(|| format!("parsing EXPERIMENT_STORE_BACKEND value `{value}`"))?,
            None => StorageBackend::default(),
        };
        let env_timeout = match lookup("EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS")? {
            Some(value) => value.parse::<u64>().with_context(|| {
                format!("parsing EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS value `{value}`")
            })?,
            None => 30,
        };
        let env_storage = lookup("EXPERIMENT_STORE_STORAGE_DIR")?
            .unwrap_or_else(|| "./data/experiments".into());
        let env_templates = lookup("EXPERIMENT_STORE_TEMPLATES_DIR")?
            .unwrap_or_else(|| "./data/templates".into());
        let env_models =
            lookup("EXPERIMENT_STORE_MODELS_DIR")?.unwrap_or_else(|| "./data/models".into());

        // --- Merge ---
        let cfg = Self {
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or_else(|| env_storage.into()),
            user_data_dir: args
                .user_data_dir
                .or(lookup("EXPERIMENT_STORE_USER_DATA_DIR")?.map(PathBuf::from)),
            database_url: args
                .database_url
                .or(lookup("EXPERIMENT_STORE_DATABASE_URL")?),
            templates_dir: args.templates_dir.unwrap_or_else(|| env_templates.into()),
            models_dir: args.models_dir.unwrap_or_else(|| env_models.into()),
            bucket_api_url: args
                .bucket_api_url
                .or(lookup("EXPERIMENT_STORE_BUCKET_API_URL")?),
            bucket: args.bucket.or(lookup("EXPERIMENT_STORE_BUCKET")?),
            request_timeout: Duration::from_secs(args.request_timeout_secs.unwrap_or(env_timeout)),
        };

        if cfg.backend == StorageBackend::Remote {
            cfg.remote_target()?;
        }
        Ok(cfg)
    }

    /// Bucket API URL and bucket id, both required by the remote backend.
    pub fn remote_target(&self) -> Result<(&str, &str)> {
        let api_url = self
            .bucket_api_url
            .as_deref()
            .context(
                "the remote backend needs EXPERIMENT_STORE_BUCKET_API_URL or --bucket-api-url",
            )?;
        let bucket = self
            .bucket
            .as_deref()
            .context("the remote backend needs EXPERIMENT_STORE_BUCKET or --bucket")?;
        Ok((api_url, bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.backend, StorageBackend::Local);
        assert_eq!(cfg.storage_dir, PathBuf::from("./data/experiments"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn cli_wins_over_env() {
        let env = env_of(&[
            ("EXPERIMENT_STORE_STORAGE_DIR", "/env/exps"),
            ("EXPERIMENT_STORE_DATABASE_URL", "sqlite://env.db"),
            ("EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS", "5"),
        ]);
        let args = Args {
            storage_dir: Some("/cli/exps".into()),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.storage_dir, PathBuf::from("/cli/exps"));
        assert_eq!(cfg.database_url.as_deref(), Some("sqlite://env.db"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = AppConfig::resolve(
            Args::default(),
            env_of(&[("EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS", "soon")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("EXPERIMENT_STORE_REQUEST_TIMEOUT_SECS"));

        let err = AppConfig::resolve(
            Args::default(),
            env_of(&[("EXPERIMENT_STORE_BACKEND", "remote")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("BUCKET_API_URL"));
    }
}
