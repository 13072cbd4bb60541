mod agent;
mod config;
mod error;
mod model;
mod runtime;
#[cfg(test)]
mod testutil;
mod web;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web::Data, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};

use agent::{ManagedAgent, RestConnector};
use config::{ConfigStore, Credentials, LlmSettings, RestConfigProvider};
use model::{CompletionBackend, CompletionModel};
use runtime::BackgroundRuntime;
use web::routes;

// How often the remote configuration is re-fetched at most.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
// Bound on the shutdown drain of the managed agent.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

// Shared per-process state handed to every handler.
struct AppState {
    config: Arc<ConfigStore>,
    completion: Arc<dyn CompletionBackend>,
    agent: Arc<ManagedAgent>,
    bridge: Arc<BackgroundRuntime>,
}

async fn load_configuration(
    credentials: &Credentials,
) -> anyhow::Result<(Arc<ConfigStore>, Arc<dyn CompletionBackend>)> {
    let endpoint =
        env::var("APP_CONFIG_ENDPOINT").context("APP_CONFIG_ENDPOINT is not set")?;
    let provider = Arc::new(RestConfigProvider::new(endpoint, credentials));
    let config = Arc::new(
        ConfigStore::load(provider, REFRESH_INTERVAL)
            .await
            .context("initial configuration load failed")?,
    );
    let settings = LlmSettings::from_snapshot(&config.snapshot())
        .context("completion model configuration is incomplete")?;
    let completion: Arc<dyn CompletionBackend> =
        Arc::new(CompletionModel::new(settings, credentials));
    Ok((config, completion))
}

fn cors() -> Cors {
    Cors::default()
        .allowed_origin("http://localhost:5173")
        .allowed_origin("http://127.0.0.1:5173")
        .allow_any_method()
        .allow_any_header()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting chat-relay");

    let credentials = Credentials::from_env();
    let (config, completion) = match load_configuration(&credentials).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to initialize configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let bridge = Arc::new(BackgroundRuntime::new());
    if let Err(e) = bridge.start() {
        error!("Failed to start background runtime: {e}");
        std::process::exit(1);
    }

    let agent = Arc::new(ManagedAgent::new(Arc::new(RestConnector::new(&credentials))));

    let app_state = Data::new(AppState {
        config,
        completion,
        agent: agent.clone(),
        bridge: bridge.clone(),
    });

    let result = HttpServer::new(move || {
        App::new()
            .wrap(cors())
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(("127.0.0.1", 8080))?
    .run()
    .await;

    // The server has drained; give the managed agent a bounded chance to
    // delete its remote session before the bridge goes away.
    info!("Server stopped, cleaning up managed agent");
    let cleanup = {
        let agent = agent.clone();
        async move { agent.cleanup().await }
    };
    if let Err(e) = bridge.submit_and_wait(cleanup, CLEANUP_TIMEOUT) {
        error!("Agent cleanup did not complete: {e}");
    }
    bridge.stop();

    result
}
