use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{info, instrument};

use crate::config::ServiceConfig;
use crate::error::EngineError;

const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Local paths of everything needed to build a model, as resolved on the Hub.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelArtifacts {
    pub fn weights_size(&self) -> usize {
        self.weights
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len() as usize)
            .sum()
    }
}

/// Downloads (or reuses the local cache of) the configured model repo.
/// Cached files are served without touching the network.
#[instrument(skip_all, fields(model_id = %config.model_id, revision = %config.revision))]
pub fn fetch(config: &ServiceConfig) -> Result<ModelArtifacts, EngineError> {
    let mut builder = ApiBuilder::new()
        .with_progress(true)
        .with_token(config.hf_token.clone());
    if let Some(cache_dir) = &config.cache_dir {
        builder = builder.with_cache_dir(cache_dir.clone());
    }
    let api = builder.build()?;
    let repo = api.repo(Repo::with_revision(
        config.model_id.clone(),
        RepoType::Model,
        config.revision.clone(),
    ));

    let start = Instant::now();
    let config_path = repo.get("config.json")?;
    let tokenizer = repo.get("tokenizer.json")?;
    // optional: not every repo ships one
    let generation_config = repo.get("generation_config.json").ok();
    let weights = match repo.get(WEIGHTS_INDEX_FILE) {
        Ok(index) => hub_load_safetensors(&repo, &index)?,
        Err(_) => vec![repo.get(SINGLE_WEIGHTS_FILE)?],
    };

    let artifacts = ModelArtifacts {
        config: config_path,
        tokenizer,
        generation_config,
        weights,
    };
    info!(
        "resolved {} weight file(s) ({}) in {:.2}s",
        artifacts.weights.len(),
        format_size(artifacts.weights_size()),
        start.elapsed().as_secs_f32(),
    );
    Ok(artifacts)
}

fn hub_load_safetensors(repo: &ApiRepo, index: &Path) -> Result<Vec<PathBuf>, EngineError> {
    shard_names(index)?
        .iter()
        .map(|name| repo.get(name).map_err(EngineError::from))
        .collect()
}

/// Distinct shard file names listed in a safetensors index's `weight_map`.
pub fn shard_names(index: &Path) -> Result<BTreeSet<String>, EngineError> {
    let file = std::fs::File::open(index)?;
    let json: serde_json::Value = serde_json::from_reader(file)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            return Err(EngineError::InvalidArtifact(format!(
                "weight map in {index:?} is not a map"
            )))
        }
        None => {
            return Err(EngineError::InvalidArtifact(format!(
                "no weight map in {index:?}"
            )))
        }
    };
    Ok(weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect())
}

// human readable byte count
pub fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}
