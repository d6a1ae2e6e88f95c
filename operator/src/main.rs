pub use controller::*;
use clap::Parser;
use controller::config::Config;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup tracing layers
    let (json, plain) = if config.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::Other(e.to_string()))?;
    let collector = Registry::default().with(json).with(plain).with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector).map_err(|e| Error::Other(e.to_string()))?;

    // Start kubernetes controller
    let (manager, controller) = Manager::new(&config).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&config.bind)
    .map_err(|e| Error::Other(format!("Can not bind to {}: {e}", config.bind)))?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controller => tracing::warn!("Valkey controller exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
