//! Main entry point for the dispatch service.
//! Sets up the HTTP server, configures logging, and initializes the service with
//! environment-based configuration.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};

use dispatch::api;
use dispatch::config::DispatchConfig;
use dispatch::service::DispatchService;

/// # Environment Variables
/// - RUST_LOG: log filter for env_logger (the audit trail logs under the `audit` target)
/// - PORT: listen port (default: 8080)
/// - DISPATCH_*: see [`DispatchConfig`]
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    // Falls back to defaults if env vars not set
    let config = DispatchConfig::from_env_or_default();
    log::info!("Starting dispatch service with configuration: {:?}", config);

    let service = DispatchService::with_log_audit(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let _sweeper = service.start_sweeper();
    let service = web::Data::new(service);

    let port = match std::env::var("PORT") {
        Ok(value) => value.parse::<u16>().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("PORT must be a valid port number, got {:?}", value),
            )
        })?,
        Err(_) => 8080,
    };

    log::info!("Starting server on port {}", port);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(service.clone()) // Share service state across workers
            .configure(api::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
