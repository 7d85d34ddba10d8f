use crate::{
    models::sizes::SizeCatalog,
    services::transform::{DEFAULT_PROGRAM, DEFAULT_TIMEOUT},
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub sizes: SizeCatalog,
    pub convert: String,
    pub transform_timeout: Duration,
    pub delete_unlabeled: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resizes uploaded images into fixed-width derivatives")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_RESIZER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_RESIZER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides IMAGE_RESIZER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_RESIZER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Comma separated target widths, e.g. `320,640` (overrides IMAGE_RESIZER_SIZES)
    #[arg(long)]
    pub sizes: Option<String>,

    /// Resize program invoked as `<program> - -resize <width>x -` (overrides IMAGE_RESIZER_CONVERT)
    #[arg(long)]
    pub convert: Option<String>,

    /// Seconds a single resize may run (overrides IMAGE_RESIZER_TRANSFORM_TIMEOUT_SECS)
    #[arg(long)]
    pub transform_timeout_secs: Option<u64>,

    /// Delete a derivative whose resize marker could not be written; accepts
    /// an optional `true`/`false` (overrides IMAGE_RESIZER_DELETE_UNLABELED)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub delete_unlabeled: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over environment values over defaults.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = env("IMAGE_RESIZER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_env::<u16>(&env, "IMAGE_RESIZER_PORT")?.unwrap_or(8080);
        let env_storage =
            env("IMAGE_RESIZER_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = env("IMAGE_RESIZER_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/image_resizer.db".into());
        let env_convert = env("IMAGE_RESIZER_CONVERT").unwrap_or_else(|| DEFAULT_PROGRAM.into());
        let env_timeout = parse_env::<u64>(&env, "IMAGE_RESIZER_TRANSFORM_TIMEOUT_SECS")?;
        let env_delete = env("IMAGE_RESIZER_DELETE_UNLABELED")
            .map(|value| {
                parse_bool(&value).with_context(|| {
                    format!("parsing IMAGE_RESIZER_DELETE_UNLABELED value `{}`", value)
                })
            })
            .transpose()?;

        let sizes = match args.sizes.or_else(|| env("IMAGE_RESIZER_SIZES")) {
            Some(raw) => raw
                .parse::<SizeCatalog>()
                .with_context(|| format!("parsing size catalog `{}`", raw))?,
            None => SizeCatalog::default(),
        };

        let transform_timeout = match args.transform_timeout_secs.or(env_timeout) {
            Some(0) => bail!("transform timeout must be at least one second"),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            sizes,
            convert: args.convert.unwrap_or(env_convert),
            transform_timeout,
            delete_unlabeled: args.delete_unlabeled.or(env_delete).unwrap_or(false),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", key, value))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("`{}` is not a boolean", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(argv: &[&str], vars: &[(&str, &str)]) -> Result<AppConfig> {
        let args = Args::parse_from(std::iter::once("image-resizer").chain(argv.iter().copied()));
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_sources(args, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[], &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.sizes.widths(), &[320, 640]);
        assert_eq!(cfg.convert, "convert");
        assert_eq!(cfg.transform_timeout, Duration::from_secs(60));
        assert!(!cfg.delete_unlabeled);
    }

    #[test]
    fn cli_overrides_env() {
        let cfg = config(
            &["--port", "9000", "--sizes", "100,200,400"],
            &[
                ("IMAGE_RESIZER_PORT", "7000"),
                ("IMAGE_RESIZER_SIZES", "50"),
                ("IMAGE_RESIZER_CONVERT", "magick"),
                ("IMAGE_RESIZER_DELETE_UNLABELED", "true"),
                ("IMAGE_RESIZER_TRANSFORM_TIMEOUT_SECS", "5"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.sizes.widths(), &[100, 200, 400]);
        assert_eq!(cfg.convert, "magick");
        assert_eq!(cfg.transform_timeout, Duration::from_secs(5));
        assert!(cfg.delete_unlabeled);
    }

    #[test]
    fn delete_unlabeled_flag_overrides_env_both_ways() {
        let enabled = [("IMAGE_RESIZER_DELETE_UNLABELED", "true")];
        assert!(config(&[], &enabled).unwrap().delete_unlabeled);
        assert!(!config(&["--delete-unlabeled=false"], &enabled)
            .unwrap()
            .delete_unlabeled);
        assert!(!config(&["--delete-unlabeled", "false"], &enabled)
            .unwrap()
            .delete_unlabeled);

        let disabled = [("IMAGE_RESIZER_DELETE_UNLABELED", "false")];
        assert!(config(&["--delete-unlabeled"], &disabled).unwrap().delete_unlabeled);
        assert!(config(&["--delete-unlabeled", "true"], &[]).unwrap().delete_unlabeled);
        assert!(!config(&[], &[]).unwrap().delete_unlabeled);
    }

    #[test]
    fn invalid_values_are_startup_errors() {
        assert!(config(&[], &[("IMAGE_RESIZER_PORT", "http")]).is_err());
        assert!(config(&["--sizes", "320,320"], &[]).is_err());
        assert!(config(&["--transform-timeout-secs", "0"], &[]).is_err());
        assert!(config(&[], &[("IMAGE_RESIZER_DELETE_UNLABELED", "maybe")]).is_err());
    }
}
