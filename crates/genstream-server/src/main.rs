//! genstream server binary.

mod settings;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use genstream::{
    GenerationService, HttpObjectStore, ImagineClient, JobStore, MemoryStore, SqliteStore,
    VersionInfo, transport::serve,
};

use crate::settings::Settings;

/// Initialize tracing with GENSTREAM_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("GENSTREAM_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "genstream={level},genstream_server={level},sqlx=warn",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn open_store(database_url: &str) -> anyhow::Result<(Arc<dyn JobStore>, &'static str)> {
    if database_url == "memory" {
        tracing::warn!("Using in-memory store, jobs will not survive a restart");
        return Ok((Arc::new(MemoryStore::new()), "memory"));
    }
    let store = SqliteStore::connect(database_url).await?;
    Ok((Arc::new(store), "sqlite"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env()?;
    info!(
        host = %settings.server.host,
        port = settings.server.port,
        provider = %settings.imagine_api_base,
        "Configuration loaded"
    );

    let (store, store_name) = open_store(&settings.database_url).await?;
    let provider = Arc::new(ImagineClient::new(
        &settings.imagine_api_base,
        &settings.imagine_api_token,
    )?);
    let objects = Arc::new(HttpObjectStore::new(
        &settings.storage_endpoint,
        &settings.storage_public_url,
        settings.storage_token.as_deref(),
    )?);

    let service = GenerationService::new(store, provider, objects, settings.service)
        .with_version(VersionInfo::new().with_store(store_name));

    serve(settings.server, Arc::new(service)).await
}
