use anyhow::Result;
use config;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub link: LinkConfig,
    pub web: WebConfig,
    pub cloud: CloudConfig,
    pub analytics: AnalyticsConfig,
    pub logbook: LogbookConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    /// Empty string disables the event sink.
    pub collector_url: String,
    pub write_key: String,
    pub env: String,
    pub flush_interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogbookConfig {
    pub dir: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_path = format!("config/{}.toml", env);
        let fallback_path = format!("/etc/fleetlink/{}.toml", env);

        let mut builder = config::Config::builder()
            .set_default("general.log_level", "info")?
            .set_default("link.host", "0.0.0.0")?
            .set_default("link.port", 4002_i64)?
            .set_default("web.host", "0.0.0.0")?
            .set_default("web.port", 8080_i64)?
            .set_default("cloud.base_url", "http://localhost:4000")?
            .set_default("analytics.collector_url", "")?
            .set_default("analytics.write_key", "")?
            .set_default("analytics.env", "production")?
            .set_default("analytics.flush_interval", 10_i64)?
            .set_default("logbook.dir", "logs")?;

        if std::path::Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::with_name(&config_path));
        } else if std::path::Path::new(&fallback_path).exists() {
            builder = builder.add_source(config::File::with_name(&fallback_path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("FLEETLINK").separator("__"))
            .build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Configuration for tests and embedding: defaults only, no files or env.
    pub fn default_for_tests() -> Self {
        Self {
            general: GeneralConfig {
                log_level: "debug".into(),
            },
            link: LinkConfig {
                host: "127.0.0.1".into(),
                port: 0,
            },
            web: WebConfig {
                host: "127.0.0.1".into(),
                port: 0,
            },
            cloud: CloudConfig {
                base_url: "http://localhost:4000".into(),
            },
            analytics: AnalyticsConfig {
                collector_url: String::new(),
                write_key: String::new(),
                env: "test".into(),
                flush_interval: 10,
            },
            logbook: LogbookConfig {
                dir: std::env::temp_dir()
                    .join("fleetlink-logs")
                    .to_string_lossy()
                    .into_owned(),
            },
        }
    }
}
