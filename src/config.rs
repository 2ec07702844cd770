use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

/// Prefix of environment variables read by the `config` layer, e.g.
/// `ORCH_SERVER__PORT=8000`.
pub const ENV_PREFIX: &str = "ORCH";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Enable rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,

    /// Disable timeout middleware
    #[arg(long, env = "TIMEOUT_DISABLED")]
    pub timeout_disabled: Option<bool>,

    /// Base URL of the Agent Execution Service
    #[arg(long, env = "AGENT_SERVICE_URL")]
    pub agent_service_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub resilience: ResilienceConfig,
    pub agent_service: AgentServiceConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    pub rate_limit_enabled: bool,
    pub timeout_disabled: bool,
    pub requests_per_second: f64,
    pub burst_size: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentServiceConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// Overall bound on one upstream request, stream included. Unset means
    /// a run may stream for as long as the agent keeps it open.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `memory` or `surrealdb`.
    pub provider: String,
    #[serde(default)]
    pub database_url: String,
    pub key_prefix: String,
    /// Retention applied to a run's log and metadata after every write.
    pub ttl_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Priority: CLI flag > CLI env var > `ORCH_` env > config file > defaults.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("security.jwt_required", false)?
            .set_default("security.jwt_secret", "")?
            .set_default("resilience.rate_limit_enabled", false)?
            .set_default("resilience.timeout_disabled", false)?
            .set_default("resilience.requests_per_second", 20.0)?
            .set_default("resilience.burst_size", 40.0)?
            .set_default("agent_service.base_url", "http://127.0.0.1:8001")?
            .set_default("agent_service.connect_timeout_secs", 10)?
            .set_default("store.provider", "memory")?
            .set_default("store.database_url", "")?
            .set_default("store.key_prefix", "agent-run")?
            .set_default("store.ttl_secs", 86_400)?;

        // Explicit file first, then ./config.yaml when present.
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(required) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", required)?;
        }
        if let Some(rl) = cli.rate_limit_enabled {
            builder = builder.set_override("resilience.rate_limit_enabled", rl)?;
        }
        if let Some(td) = cli.timeout_disabled {
            builder = builder.set_override("resilience.timeout_disabled", td)?;
        }
        if let Some(url) = cli.agent_service_url {
            builder = builder.set_override("agent_service.base_url", url)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.security.jwt_required && self.security.jwt_secret.is_empty() {
            return Err(config::ConfigError::Message(
                "security.jwt_secret must be set when security.jwt_required is true".into(),
            ));
        }
        match self.store.provider.as_str() {
            "memory" => {}
            "surrealdb" if !self.store.database_url.is_empty() => {}
            "surrealdb" => {
                return Err(config::ConfigError::Message(
                    "store.database_url is required for the surrealdb provider".into(),
                ));
            }
            other => {
                return Err(config::ConfigError::Message(format!(
                    "unknown store.provider '{other}' (expected memory or surrealdb)"
                )));
            }
        }
        if self.store.ttl_secs == 0 {
            return Err(config::ConfigError::Message(
                "store.ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
