use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{post, routes, Route, State};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::types::{GenerateRequest, GenerateResponse};

pub fn routes() -> Vec<Route> {
    routes![generate]
}

#[post("/generate", data = "<req>")]
pub async fn generate(
    state: &State<AppState>,
    req: Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, Status> {
    let GenerateRequest { prompt, max_tokens } = req.into_inner();
    info!(prompt_bytes = prompt.len(), max_tokens, "generate request");

    let text = state
        .engine
        .generate(&prompt, max_tokens)
        .await
        .map_err(|e| {
            error!("generation failed: {e}");
            Status::InternalServerError
        })?;

    let response = GenerateResponse { text };
    if let Err(e) = state.console.emit(&response) {
        warn!("failed to echo response to console: {e}");
    }
    Ok(Json(response))
}
