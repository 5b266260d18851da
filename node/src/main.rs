use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use rehost_core::{LinkerConfig, Rehoster, RehosterConfig};
use rehost_rpc::{bind_listener, serve, AppState};
use rehost_storage::{MemorySourceStore, SledKeysetIndex, SwarmStats};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, REHOST_VERSION};

#[derive(Debug, Clone, PartialEq)]
struct AppConfig {
    config_path: Option<PathBuf>,
    host: String,
    port: u16,
    storage_dir: String,
    index_name: String,
    swarm_port: u16,
    expose_swarm: bool,
    bootstrap: Vec<String>,
    keys_path: Option<PathBuf>,
    sync_interval_hours: Option<f64>,
    summary_interval_secs: u64,
    detailed_metrics: bool,
    link_timeout_secs: u64,
    link_attempts: u32,
    log_level: String,
    log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            storage_dir: "./rehoster-storage".to_string(),
            index_name: "rehoster-keyset".to_string(),
            swarm_port: 0,
            expose_swarm: false,
            bootstrap: Vec::new(),
            keys_path: None,
            sync_interval_hours: None,
            summary_interval_secs: 60,
            detailed_metrics: false,
            link_timeout_secs: 30,
            link_attempts: 3,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then `REHOST_*` environment variables.
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("REHOST"));
        let config = builder.build()?;

        let defaults = Self::default();
        Ok(Self {
            config_path: resolved_path,
            host: get_string_value(&config, &["host"]).unwrap_or(defaults.host),
            port: get_parsed_value(&config, &["port"])?.unwrap_or(defaults.port),
            storage_dir: get_string_value(&config, &["storage_dir"])
                .unwrap_or(defaults.storage_dir),
            index_name: get_string_value(&config, &["index_name"]).unwrap_or(defaults.index_name),
            swarm_port: get_parsed_value(&config, &["swarm_port"])?.unwrap_or(defaults.swarm_port),
            expose_swarm: get_bool_value(&config, &["expose_swarm"], defaults.expose_swarm),
            bootstrap: get_string_value(&config, &["bootstrap"])
                .map(|raw| {
                    raw.split(',')
                        .map(|peer| peer.trim().to_string())
                        .filter(|peer| !peer.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.bootstrap),
            keys_path: get_string_value(&config, &["keys_path"]).map(PathBuf::from),
            sync_interval_hours: get_parsed_value(&config, &["sync_interval_hours"])?,
            summary_interval_secs: get_parsed_value(&config, &["summary_interval_secs"])?
                .unwrap_or(defaults.summary_interval_secs),
            detailed_metrics: get_bool_value(
                &config,
                &["detailed_metrics"],
                defaults.detailed_metrics,
            ),
            link_timeout_secs: get_parsed_value(&config, &["link_timeout_secs"])?
                .unwrap_or(defaults.link_timeout_secs),
            link_attempts: get_parsed_value(&config, &["link_attempts"])?
                .unwrap_or(defaults.link_attempts),
            log_level: get_string_value(&config, &["log_level"]).unwrap_or(defaults.log_level),
            log_format: get_string_value(&config, &["log_format"]).unwrap_or(defaults.log_format),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("STORAGE_DIR must not be empty");
        }
        if self.index_name.trim().is_empty() {
            anyhow::bail!("INDEX_NAME must not be empty");
        }
        if self.link_attempts == 0 {
            anyhow::bail!("LINK_ATTEMPTS must be at least 1");
        }
        if self.summary_interval_secs == 0 {
            anyhow::bail!("SUMMARY_INTERVAL_SECS must be greater than zero");
        }
        if let Some(hours) = self.sync_interval_hours {
            if !(hours.is_finite() && hours > 0.0) {
                anyhow::bail!("SYNC_INTERVAL_HOURS must be a positive number of hours");
            }
            if Duration::try_from_secs_f64(hours * 60.0 * 60.0).is_err() {
                anyhow::bail!("SYNC_INTERVAL_HOURS is too large: {}", hours);
            }
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json'");
        }
        Ok(())
    }

    fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn index_path(&self) -> PathBuf {
        Path::new(&self.storage_dir).join("index")
    }

    fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_hours
            .and_then(|hours| Duration::try_from_secs_f64(hours * 60.0 * 60.0).ok())
    }

    fn linker_config(&self) -> LinkerConfig {
        LinkerConfig {
            link_timeout: Duration::from_secs(self.link_timeout_secs),
            attempts: self.link_attempts,
            ..LinkerConfig::default()
        }
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.trim().to_lowercase().parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_parsed_value<T>(config: &Config, keys: &[&str]) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match keys
        .iter()
        .find_map(|key| get_string_value(config, &[*key]).map(|raw| (*key, raw)))
    {
        Some((key, raw)) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid value {raw:?} for {key}: {err}")),
        None => Ok(None),
    }
}

fn build_cli() -> Command {
    Command::new("rehost-node")
        .version(REHOST_VERSION)
        .about("Hosts a declared set of keys and serves their replication state")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("HTTP bind host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("HTTP port (0 picks a free port)"),
        )
        .arg(
            Arg::new("storage-dir")
                .short('d')
                .long("storage-dir")
                .value_name("DIR")
                .help("Directory holding the registry index"),
        )
        .arg(
            Arg::new("keys-path")
                .long("keys-path")
                .value_name("FILE")
                .help("Declared-state document to apply at startup and on sync"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("detailed-metrics")
                .long("detailed-metrics")
                .action(ArgAction::SetTrue)
                .help("Export per-source gauges on /metrics"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if let Some(storage_dir) = matches.get_one::<String>("storage-dir") {
        config.storage_dir = storage_dir.clone();
    }

    if let Some(keys_path) = matches.get_one::<String>("keys-path") {
        config.keys_path = Some(PathBuf::from(keys_path));
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("detailed-metrics") {
        config.detailed_metrics = true;
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

fn spawn_summary_logger(
    rehoster: Arc<Rehoster>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    info!("{}", rehoster.inventory().await.summary());
                }
            }
        }
    })
}

fn spawn_periodic_sync(
    rehoster: Arc<Rehoster>,
    keys_path: PathBuf,
    period: Duration,
    hours: f64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    info!("Starting scheduled sync (running every {} hours)", hours);
                    match rehoster.sync_from_path(&keys_path).await {
                        Ok(outcome) if outcome.is_success() => info!("Finished scheduled sync"),
                        Ok(outcome) => warn!(
                            "Scheduled sync finished with {} failed keys",
                            outcome.failures.len()
                        ),
                        Err(err) => warn!("Scheduled sync failed: {}", err),
                    }
                    info!("{}", rehoster.inventory().await.summary());
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    info!(
        "Starting rehost-node {} (commit {})",
        REHOST_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    std::fs::create_dir_all(&config.storage_dir)
        .with_context(|| format!("failed to create storage directory {}", config.storage_dir))?;
    let index = Arc::new(
        SledKeysetIndex::open(config.index_path(), &config.index_name).with_context(|| {
            format!(
                "failed to open registry index at {}",
                config.index_path().display()
            )
        })?,
    );

    let store = Arc::new(MemorySourceStore::new());
    info!(
        "Using the local replication store (swarm port {}, exposed: {}, {} bootstrap peers)",
        config.swarm_port,
        config.expose_swarm,
        config.bootstrap.len()
    );

    let rehoster = Arc::new(Rehoster::new(
        store,
        index,
        Arc::new(SwarmStats::new()),
        RehosterConfig {
            linker: config.linker_config(),
        },
    ));

    info!("Setting up rehoster");
    rehoster
        .ready()
        .await
        .context("failed to load the rehoster registry")?;

    if let Some(path) = &config.keys_path {
        match rehoster.sync_from_path(path).await {
            Ok(outcome) => info!(
                "Applied declared state from {} ({} operations, {} failed)",
                path.display(),
                outcome.operations(),
                outcome.failures.len()
            ),
            Err(err) => warn!("Could not apply declared state: {}", err),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![spawn_summary_logger(
        rehoster.clone(),
        Duration::from_secs(config.summary_interval_secs),
        shutdown_rx.clone(),
    )];

    match (config.sync_interval(), config.sync_interval_hours, &config.keys_path) {
        (Some(period), Some(hours), Some(path)) => {
            background.push(spawn_periodic_sync(
                rehoster.clone(),
                path.clone(),
                period,
                hours,
                shutdown_rx.clone(),
            ));
            info!(
                "Set up an automatic sync which will run once every {} hours",
                hours
            );
        }
        (Some(_), _, None) => warn!("A sync interval is configured but no keys path; not syncing"),
        _ => info!("Not setting up any automatic sync"),
    }

    let listener = bind_listener(&config.http_addr()).await?;
    let state = AppState {
        rehoster: rehoster.clone(),
        keys_path: config.keys_path.clone(),
        detailed_metrics: config.detailed_metrics,
        start_time: Instant::now(),
    };
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(serve(listener, state, async move {
        let _ = server_shutdown.changed().await;
    }));

    info!("Setup completed");
    info!("{}", rehoster.inventory().await.summary());

    tokio::signal::ctrl_c().await?;
    info!("Closing down rehoster and server");

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("HTTP server stopped with error: {err:?}"),
        Err(err) => warn!("HTTP server task failed: {err}"),
    }
    for task in background {
        if let Err(err) = task.await {
            warn!("Background task failed: {err}");
        }
    }

    rehoster.close().await?;
    info!("Closed down successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.http_addr(), "127.0.0.1:0");
        assert!(config.sync_interval().is_none());
    }

    #[test]
    fn loads_values_from_file() {
        let file = config_file(
            r#"
host = "0.0.0.0"
port = 40000
storage_dir = "/tmp/rehost"
keys_path = "/etc/rehost/keys.json"
sync_interval_hours = 0.5
detailed_metrics = true
bootstrap = "a.example:49737, b.example:49737"
link_attempts = 5
"#,
        );
        let config = AppConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.http_addr(), "0.0.0.0:40000");
        assert_eq!(config.storage_dir, "/tmp/rehost");
        assert_eq!(config.keys_path, Some(PathBuf::from("/etc/rehost/keys.json")));
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(1800)));
        assert!(config.detailed_metrics);
        assert_eq!(config.bootstrap.len(), 2);
        assert_eq!(config.linker_config().attempts, 5);
        assert_eq!(config.index_name, "rehoster-keyset");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let file = config_file("port = \"not-a-port\"\n");
        let err = AppConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let config = AppConfig {
            link_attempts: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            summary_interval_secs: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            sync_interval_hours: Some(-1.0),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_sync_interval_is_rejected() {
        let config = AppConfig {
            sync_interval_hours: Some(1e16),
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert_eq!(config.sync_interval(), None);

        let config = AppConfig {
            sync_interval_hours: Some(0.5),
            ..AppConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(30 * 60)));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let matches = build_cli()
            .try_get_matches_from([
                "rehost-node",
                "--host",
                "0.0.0.0",
                "--port",
                "8080",
                "--keys-path",
                "keys.json",
                "--log-format",
                "json",
                "--detailed-metrics",
            ])
            .unwrap();
        let mut config = AppConfig::default();
        apply_overrides(&matches, &mut config);

        assert_eq!(config.http_addr(), "0.0.0.0:8080");
        assert_eq!(config.keys_path, Some(PathBuf::from("keys.json")));
        assert_eq!(config.log_format, "json");
        assert!(config.detailed_metrics);
        config.validate().unwrap();
    }
}
