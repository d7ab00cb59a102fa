#[macro_use]
extern crate rocket;

mod api;
mod app_state;
mod config;
mod engine;
mod error;
mod generation;
mod model_registry;
mod types;

use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::ServiceConfig;

#[launch]
fn rocket() -> _ {
    init_tracing();

    rocket::custom(config::figment())
        .attach(AdHoc::try_on_ignite("Load model", load_model))
        .mount("/", api::routes())
}

/// Logs go to stderr; stdout carries only the echoed responses.
fn init_tracing() {
    let _ = log_subscriber(std::io::stderr).try_init();
}

fn log_subscriber<W>(writer: W) -> tracing_subscriber::FmtSubscriber<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format,
    EnvFilter,
    W,
>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(writer)
        .finish()
}

/// Fetches and builds the model before the server starts listening; any
/// failure aborts launch.
async fn load_model(rocket: Rocket<Build>) -> Result<Rocket<Build>, Rocket<Build>> {
    let config: ServiceConfig = match rocket.figment().extract() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid service configuration: {e}");
            return Err(rocket);
        }
    };
    info!(
        model_id = %config.model_id,
        revision = %config.revision,
        engine = ?config.engine,
        "loading model"
    );

    let loaded = tokio::task::spawn_blocking(move || engine::load(&config)).await;
    match loaded {
        Ok(Ok(engine)) => Ok(rocket.manage(AppState::new(engine))),
        Ok(Err(e)) => {
            error!("failed to load model: {e:#}");
            Err(rocket)
        }
        Err(e) => {
            error!("model loading task panicked: {e}");
            Err(rocket)
        }
    }
}
