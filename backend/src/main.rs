mod auth;
mod config;
mod detect;
mod error;
mod routes;
mod storage;
mod task;
mod video;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use std::sync::Arc;

use config::{ModelRegistry, Settings};
use detect::cache::{DetectorCache, TorchLoader};
use routes::configure_routes;
use storage::results_store::ResultsStore;
use task::registry::TaskRegistry;
use task::worker::{WorkerContext, WorkerPool};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    let settings = Arc::new(Settings::from_env());
    settings.ensure_directories()?;

    let models = ModelRegistry::load(&settings)
        .map_err(|e| std::io::Error::other(format!("model registry: {e}")))?;
    log::info!(
        "registered models: [{}], default '{}'",
        models
            .models
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        models.default_model
    );
    let models = Arc::new(models);

    let registry = Arc::new(TaskRegistry::new(settings.max_concurrent_tasks));
    let store = Arc::new(
        ResultsStore::open(&settings.results_dir)
            .await
            .map_err(|e| std::io::Error::other(format!("results store: {e}")))?,
    );
    let detectors = Arc::new(DetectorCache::new(Arc::new(TorchLoader::new(
        settings.models_dir.clone(),
    ))));

    let pool = WorkerPool::start(WorkerContext {
        settings: settings.clone(),
        registry: registry.clone(),
        detectors: detectors.clone(),
        store: store.clone(),
    });
    log::info!(
        "worker pool started: {} workers, ceiling {} tasks",
        settings.worker_count,
        settings.max_concurrent_tasks
    );

    // Retention sweeper: terminal records age out of the registry.
    {
        let registry = registry.clone();
        let max_age = settings.retention_max_age;
        let mut ticker = tokio::time::interval(settings.retention_sweep_interval);
        actix_web::rt::spawn(async move {
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_finished(max_age);
                if evicted > 0 {
                    log::info!("evicted {evicted} finished tasks from the registry");
                }
            }
        });
    }

    let api_key = settings.api_key.clone();
    if api_key.is_some() {
        log::info!("API key authentication enabled for /api");
    } else {
        log::warn!("API_KEY not set, /api is open");
    }

    let bind_address = format!("{}:{}", settings.host, settings.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        let require_key = api_key.is_some();
        let mut app = App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(web::Data::from(settings.clone()))
            .app_data(web::Data::from(models.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(store.clone()))
            .app_data(web::Data::from(detectors.clone()))
            .app_data(web::Data::new(pool.clone()));
        if let Some(key) = api_key.clone() {
            app = app.app_data(web::Data::new(auth::ApiKey(key)));
        }
        app.configure(|cfg| configure_routes(cfg, require_key))
    })
    .bind(&bind_address)?
    .run()
    .await
}
