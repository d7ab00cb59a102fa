use std::path::PathBuf;

use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::{Figment, Profile};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "Ellbendls/Qwen-2.5-3b-Text_to_SQL";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;

/// Which engine backs `/generate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Candle,
    /// Model-free engine, handy for smoke runs.
    Echo,
}

/// Service settings, read from the same figment as Rocket's own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub model_id: String,
    pub revision: String,
    pub engine: EngineKind,
    /// `f32`, `f16`, `bf16`... `None` picks per device.
    pub dtype: Option<String>,
    /// Sampling seed; a random one is drawn when unset.
    pub seed: Option<u64>,
    pub hf_token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub device_id: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            engine: EngineKind::Candle,
            dtype: None,
            seed: None,
            hf_token: None,
            cache_dir: None,
            device_id: 0,
        }
    }
}

/// Rocket's layering (defaults, `Rocket.toml`, `ROCKET_*` env) with this
/// service's defaults slotted in underneath, including `0.0.0.0:5000`.
pub fn figment() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(Serialized::defaults(ServiceConfig::default()))
        .merge(("address", DEFAULT_ADDRESS))
        .merge(("port", DEFAULT_PORT))
        .merge(Toml::file(Env::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(Env::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
        .select(Profile::from_env_or(
            "ROCKET_PROFILE",
            rocket::Config::DEFAULT_PROFILE,
        ))
}
