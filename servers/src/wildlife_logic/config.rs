use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Wildlife camera track lifecycle server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "WILDLIFE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "WILDLIFE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WILDLIFE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "WILDLIFE_LOG_LEVEL", help = "Logging level (debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "WILDLIFE_GRACE_PERIOD_SECONDS", help = "Seconds a track stays active after its last detection.")]
    pub grace_period_seconds: Option<u64>,

    #[clap(long, env = "WILDLIFE_ENABLE_ENRICHMENT", help = "Whether to run background species identification.")]
    pub enable_enrichment: Option<bool>,

    #[clap(long, env = "WILDLIFE_ENRICHMENT_TIMEOUT_SECONDS", help = "Timeout in seconds for one identification lookup.")]
    pub enrichment_timeout_seconds: Option<u64>,

    #[clap(long, env = "WILDLIFE_HISTORY_LIMIT", help = "Recent identified sightings passed as lookup context.")]
    pub history_limit: Option<usize>,

    #[clap(long, env = "WILDLIFE_JPEG_QUALITY", help = "JPEG quality (0-100) for track thumbnails.")]
    pub jpeg_quality: Option<u8>,

    #[clap(long, env = "WILDLIFE_VLM_MODE", help = "Initial identification backend: local or cloud.")]
    pub vlm_mode: Option<String>,

    #[clap(long, env = "WILDLIFE_OLLAMA_URL", help = "Base URL of the local Ollama instance.")]
    pub ollama_url: Option<String>,

    #[clap(long, env = "WILDLIFE_OLLAMA_MODEL", help = "Vision model served by the local Ollama instance.")]
    pub ollama_model: Option<String>,

    #[clap(long, env = "WILDLIFE_OPENROUTER_URL", help = "OpenRouter chat completions endpoint.")]
    pub openrouter_url: Option<String>,

    #[clap(long, env = "WILDLIFE_OPENROUTER_MODEL", help = "Model identifier for cloud identification.")]
    pub openrouter_model: Option<String>,

    #[clap(long, env = "OPENROUTER_API_KEY", help = "API key for the cloud identification backend.")]
    pub openrouter_api_key: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            grace_period_seconds: other.grace_period_seconds.or(self.grace_period_seconds),
            enable_enrichment: other.enable_enrichment.or(self.enable_enrichment),
            enrichment_timeout_seconds: other
                .enrichment_timeout_seconds
                .or(self.enrichment_timeout_seconds),
            history_limit: other.history_limit.or(self.history_limit),
            jpeg_quality: other.jpeg_quality.or(self.jpeg_quality),
            vlm_mode: other.vlm_mode.or(self.vlm_mode),
            ollama_url: other.ollama_url.or(self.ollama_url),
            ollama_model: other.ollama_model.or(self.ollama_model),
            openrouter_url: other.openrouter_url.or(self.openrouter_url),
            openrouter_model: other.openrouter_model.or(self.openrouter_model),
            openrouter_api_key: other.openrouter_api_key.or(self.openrouter_api_key),
        }
    }
}

pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        port: Some(8000),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        grace_period_seconds: Some(10),
        enable_enrichment: Some(true),
        enrichment_timeout_seconds: Some(30),
        history_limit: Some(2),
        jpeg_quality: Some(85),
        vlm_mode: Some("cloud".to_string()),
        ollama_url: Some("http://127.0.0.1:11434".to_string()),
        ollama_model: Some("llava:13b".to_string()),
        openrouter_url: Some("https://openrouter.ai/api/v1/chat/completions".to_string()),
        openrouter_model: Some("google/gemini-2.0-flash-001".to_string()),
        ..Default::default()
    };

    // 2. Load from config file (server_wildlife.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args_for_path = Config::parse();

    let config_file_path = cli_args_for_path
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_wildlife.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!(
                    "Failed to parse config file: {}. Falling back to other sources.",
                    config_file_path.display()
                );
            }
        } else {
            log::warn!(
                "Failed to read config file: {}. Falling back to other sources.",
                config_file_path.display()
            );
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments.
    //    clap::Parser handles env vars and CLI args in one pass.
    current_config.merge(cli_args_for_path)
}
