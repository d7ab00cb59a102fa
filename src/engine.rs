use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument};

use crate::config::{EngineKind, ServiceConfig};
use crate::error::EngineError;
use crate::generation::{CausalLm, GenerationConfig, TextGenerator};
use crate::model_registry::{self, format_size};

/// Text generation backend behind `/generate`.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Generates from `prompt` until the sequence holds `max_tokens` tokens
    /// (prompt included) and returns the decoded text.
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, EngineError>;
}

/// Builds the engine selected by `config`. Blocks while weights download.
pub fn load(config: &ServiceConfig) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    let engine: Arc<dyn InferenceEngine> = match config.engine {
        EngineKind::Echo => EchoEngine::new(&config.model_id),
        EngineKind::Candle => CandleEngine::new(config)?,
    };
    Ok(engine)
}

/// Model-free engine: the continuation is empty, so the output is the prompt
/// itself.
pub struct EchoEngine {
    pub model_name: String,
}

impl EchoEngine {
    pub fn new(model_name: &str) -> Arc<Self> {
        Arc::new(Self {
            model_name: model_name.to_string(),
        })
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, EngineError> {
        debug!(model = %self.model_name, max_tokens, "echo generation");
        Ok(prompt.to_string())
    }
}

/// A candle model shared by all requests; generations run one at a time.
pub struct CandleEngine<M = qwen2::ModelForCausalLM> {
    model_name: String,
    seed: Option<u64>,
    generator: Mutex<TextGenerator<M>>,
}

impl CandleEngine {
    #[instrument(skip_all, fields(model_id = %config.model_id))]
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Arc<Self>> {
        info!(
            "avx: {}, neon: {}, simd128: {}, f16c: {}",
            candle_core::utils::with_avx(),
            candle_core::utils::with_neon(),
            candle_core::utils::with_simd128(),
            candle_core::utils::with_f16c()
        );
        let artifacts = model_registry::fetch(config)
            .with_context(|| format!("fetching `{}` from the hub", config.model_id))?;

        let device = device(config.device_id)?;
        let dtype = match &config.dtype {
            Some(dtype) => DType::from_str(dtype)
                .map_err(|e| anyhow::anyhow!("unsupported dtype `{dtype}`: {e}"))?,
            None if device.is_cpu() => DType::F32,
            None => DType::BF16,
        };

        let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
            .map_err(|e| anyhow::anyhow!("Error loading tokenizer: {e}"))?;
        let generation_config = match &artifacts.generation_config {
            Some(path) => GenerationConfig::from_file(path)
                .context("parsing generation_config.json")?,
            None => GenerationConfig::default(),
        };

        let start = Instant::now();
        let model_config: qwen2::Config =
            serde_json::from_slice(&std::fs::read(&artifacts.config)?)
                .context("parsing config.json")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&artifacts.weights, dtype, &device)? };
        let model = qwen2::ModelForCausalLM::new(&model_config, vb)?;
        info!(
            "model built ({}, {:?} on {:?}) in {:.2}s",
            format_size(artifacts.weights_size()),
            dtype,
            device,
            start.elapsed().as_secs_f32(),
        );

        let generator = TextGenerator::new(model, tokenizer, device, generation_config)?;
        Ok(Self::with_generator(&config.model_id, config.seed, generator))
    }
}

impl<M: CausalLm> CandleEngine<M> {
    pub fn with_generator(
        model_name: &str,
        seed: Option<u64>,
        generator: TextGenerator<M>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model_name: model_name.to_string(),
            seed,
            generator: Mutex::new(generator),
        })
    }

    fn generate_inner(&self, prompt: &str, max_tokens: usize) -> Result<String, EngineError> {
        let seed = self.seed.unwrap_or_else(rand::random);
        // one generation at a time: the KV cache lives inside the model
        let mut generator = self.generator.lock();
        generator.generate(prompt, max_tokens, seed)
    }
}

#[async_trait]
impl<M: CausalLm + Send + 'static> InferenceEngine for CandleEngine<M> {
    #[instrument(skip_all, fields(model = %self.model_name, max_tokens = max_tokens))]
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, EngineError> {
        // keep the runtime's other workers free while the forward passes run
        tokio::task::block_in_place(|| self.generate_inner(prompt, max_tokens))
    }
}

fn device(device_id: usize) -> candle_core::Result<Device> {
    if cuda_is_available() {
        info!("Using CUDA");
        Device::new_cuda(device_id)
    } else if metal_is_available() {
        info!("Using Metal");
        Device::new_metal(device_id)
    } else {
        info!("Using Cpu");
        Ok(Device::Cpu)
    }
}
