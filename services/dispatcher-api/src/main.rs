use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use shared::broadcaster::Broadcaster;
use shared::config::Settings;
use tracing::info;

mod db;
mod matcher;
mod routes;
mod store;

use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub broadcaster: Broadcaster,
}

async fn health() -> impl Responder {
    HttpResponse::Ok().finish()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!(%e, "failed to load settings, using defaults");
        Settings::new().expect("settings must be constructible from defaults alone")
    });

    let pool = db::init_pool(&settings.database_url).await;
    db::init_schema(&pool).await;

    let state = AppState {
        store: Store::new(pool),
        broadcaster: Broadcaster::default(),
    };

    info!("starting dispatcher-api on 0.0.0.0:8000");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .route("/health", web::get().to(health))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", 8000))?
    .run()
    .await
}
