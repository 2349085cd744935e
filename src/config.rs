//! Process configuration: CLI flags, environment variables and an optional
//! JSON config file. Command-line / environment values override the file.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
#[command(name = "canaria", about = "Earthquake bulletin aggregation and signed fan-out engine")]
pub struct Config {
    #[clap(long, env = "CANARIA_PORT", default_value_t = 8787)]
    pub port: u16,

    #[clap(long, env = "CANARIA_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CANARIA_DB_PATH", default_value = "./canaria.db")]
    pub db_path: PathBuf,

    #[clap(long, env = "CANARIA_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "CANARIA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Bearer token for the admin surface.
    #[clap(long, env = "ADMIN_SECRET", default_value = "development-secret")]
    pub admin_secret: String,

    /// Bearer token for the upstream poller; falls back to the admin secret.
    #[clap(long, env = "CANARIA_INGEST_SECRET")]
    pub ingest_secret: Option<String>,

    /// Blob destination for the backup projection; uploads are disabled when
    /// unset.
    #[clap(long, env = "CANARIA_BACKUP_URL")]
    pub backup_url: Option<String>,

    #[clap(long, env = "CANARIA_WOLFX_WS_URL", default_value = "wss://ws-api.wolfx.jp/jma_eew")]
    pub wolfx_ws_url: String,

    #[clap(long, env = "CANARIA_WOLFX_HISTORY_URL", default_value = "https://api.wolfx.jp/jma_eew_list.json")]
    pub wolfx_history_url: String,

    #[clap(long, env = "CANARIA_P2P_WS_URL", default_value = "wss://api.p2pquake.net/v2/ws")]
    pub p2p_ws_url: String,

    #[clap(long, env = "CANARIA_P2P_HISTORY_URL", default_value = "https://api.p2pquake.net/v2/history?codes=551&limit=100")]
    pub p2p_history_url: String,

    /// Skip spawning the upstream connectors (poller-only deployments).
    #[clap(long, env = "CANARIA_DISABLE_FEEDS", default_value_t = false)]
    pub disable_feeds: bool,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// The secret the poller must present on `POST /v1/events`.
    pub fn effective_ingest_secret(&self) -> &str {
        self.ingest_secret.as_deref().unwrap_or(&self.admin_secret)
    }
}

pub fn load_config() -> Config {
    let cli_config = Config::parse();

    let config_from_file = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str::<Config>(&c).ok())
    });

    if let Some(file_config) = config_from_file {
        // Command-line arguments and environment override file configuration;
        // optional fields fall back to the file.
        Config {
            port: cli_config.port,
            config_path: cli_config.config_path,
            db_path: cli_config.db_path,
            log_dir: cli_config.log_dir,
            log_level: cli_config.log_level,
            admin_secret: cli_config.admin_secret,
            ingest_secret: cli_config.ingest_secret.or(file_config.ingest_secret),
            backup_url: cli_config.backup_url.or(file_config.backup_url),
            wolfx_ws_url: cli_config.wolfx_ws_url,
            wolfx_history_url: cli_config.wolfx_history_url,
            p2p_ws_url: cli_config.p2p_ws_url,
            p2p_history_url: cli_config.p2p_history_url,
            disable_feeds: cli_config.disable_feeds,
            tls_cert_path: cli_config.tls_cert_path.or(file_config.tls_cert_path),
            tls_key_path: cli_config.tls_key_path.or(file_config.tls_key_path),
        }
    } else {
        cli_config
    }
}
