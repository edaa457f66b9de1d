mod config;
mod densenet;
mod imaging;
mod model;
mod pipeline;
mod routes;
#[cfg(test)]
mod test_support;

use actix_web::{App, HttpServer, middleware, web};
use config::Settings;
use model::{Classifier, Model};
use routes::{configure_routes, cors};
use shared::NUM_FINDINGS;
use std::env;
use std::sync::Arc;
use tch::Device;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let settings = Settings::from_env().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let device = Device::cuda_if_available();
    log::info!("Using device: {:?}", device);
    log::info!("Loading model weights from {}", settings.weights_path.display());

    let model = Model::load(&settings.weights_path, NUM_FINDINGS, device).map_err(|e| {
        log::error!("Failed to load model at startup: {}", e);
        std::io::Error::other(format!("Model loading failed: {}", e))
    })?;
    log::info!("{} ready on {:?}", model.name(), model.device());

    let classifier: Arc<dyn Classifier> = Arc::new(model);
    let classifier = web::Data::from(classifier);

    let bind_address = settings.bind_address();
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(cors())
            .wrap(middleware::Logger::default())
            .app_data(classifier.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
