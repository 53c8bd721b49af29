//! Environment configuration.

use std::time::Duration;

use anyhow::{Context, bail};

use genstream::{
    BroadcastConfig, IngestConfig, PollConfig, ProgressPolicy, ServiceConfig, StreamConfig,
    transport::ServerConfig,
};

const DEFAULT_DATABASE_URL: &str = "sqlite:genstream.db?mode=rwc";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// SQLite URL, or `memory` for a process-local store.
    pub database_url: String,
    pub imagine_api_base: String,
    pub imagine_api_token: String,
    pub storage_endpoint: String,
    pub storage_public_url: String,
    pub storage_token: Option<String>,
    pub service: ServiceConfig,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).with_context(|| format!("{key} must be set"));

        let mut server = ServerConfig::default();
        if let Some(host) = get("GENSTREAM_HOST") {
            server.host = host;
        }
        if let Some(port) = get("GENSTREAM_PORT") {
            server.port = port
                .parse()
                .with_context(|| format!("invalid GENSTREAM_PORT: {port}"))?;
        }

        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match get(key) {
                None => Ok(default),
                Some(v) => {
                    let n: u64 = v.parse().with_context(|| format!("invalid {key}: {v}"))?;
                    if n == 0 {
                        bail!("{key} must be greater than zero");
                    }
                    Ok(Duration::from_secs(n))
                }
            }
        };

        let poll_defaults = PollConfig::default();
        let poll = PollConfig {
            interval: secs("POLL_INTERVAL_SECS", poll_defaults.interval)?,
            max_duration: secs("POLL_MAX_SECS", poll_defaults.max_duration)?,
        };

        let stream_defaults = StreamConfig::default();
        let stream = StreamConfig {
            heartbeat: secs("STREAM_HEARTBEAT_SECS", stream_defaults.heartbeat)?,
            max_duration: secs("STREAM_MAX_SECS", stream_defaults.max_duration)?,
            ..stream_defaults
        };

        let progress_policy = match get("PROGRESS_POLICY") {
            Some(v) => v.parse::<ProgressPolicy>().map_err(anyhow::Error::msg)?,
            None => ProgressPolicy::default(),
        };

        Ok(Self {
            server,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            imagine_api_base: required("IMAGINE_API_BASE")?,
            imagine_api_token: required("IMAGINE_API_TOKEN")?,
            storage_endpoint: required("STORAGE_ENDPOINT")?,
            storage_public_url: required("STORAGE_PUBLIC_URL")?,
            storage_token: get("STORAGE_TOKEN"),
            service: ServiceConfig {
                ingest: IngestConfig {
                    progress_policy,
                    ..IngestConfig::default()
                },
                poll,
                stream,
                broadcast: BroadcastConfig::default(),
                webhook_secret: get("IMAGINE_WEBHOOK_SECRET"),
                poll_on_submit: true,
            },
        })
    }
}
