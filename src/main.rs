use gitlab_build_bridge::logging::{FileLogger, setup_logging};
use gitlab_build_bridge::{AppState, api, load_config};
use std::sync::Arc;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "gitlab_build_bridge.toml";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Ok(bind_address) = std::env::var("BIND_ADDRESS") {
        config.server.bind_address = bind_address;
    }

    let file_logger = config.logging.directory.clone().map(FileLogger::new);
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    let bind_address = config.server.bind_address.clone();
    let webhook_path = config.server.webhook_path.clone();
    let state = match AppState::from_config(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("Startup error: {}", e);
            std::process::exit(1);
        }
    };

    let app = api::router(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    info!("Accepting GitLab webhooks on {}", webhook_path);
    let listener = tokio::net::TcpListener::bind(&bind_address).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
