use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::qwen2;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::EngineError;

/// Special tokens tried, in order, when the repo does not declare an EOS id.
const FALLBACK_EOS_TOKENS: [&str; 2] = ["<|endoftext|>", "</s>"];

/// A decoder-only model with an internal KV cache.
pub trait CausalLm {
    /// Runs `input` (shape `(1, seq)`) starting at `seqlen_offset` and returns
    /// the logits of the last position.
    fn forward(&mut self, input: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor>;

    fn clear_kv_cache(&mut self);
}

impl CausalLm for qwen2::ModelForCausalLM {
    fn forward(&mut self, input: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor> {
        qwen2::ModelForCausalLM::forward(self, input, seqlen_offset)
    }

    fn clear_kv_cache(&mut self) {
        qwen2::ModelForCausalLM::clear_kv_cache(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn into_vec(self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![id],
            TokenIds::Many(ids) => ids,
        }
    }
}

/// The subset of a repo's `generation_config.json` that drives decoding.
/// Missing fields fall back to the Hugging Face defaults (greedy search).
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
}

fn default_temperature() -> f64 {
    1.0
}

fn default_top_k() -> usize {
    50
}

fn default_top_p() -> f64 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            bos_token_id: None,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .clone()
            .map(TokenIds::into_vec)
            .unwrap_or_default()
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        let top_p = self.top_p < 1.0;
        match (self.top_k, top_p) {
            (0, false) => Sampling::All { temperature },
            (0, true) => Sampling::TopP {
                p: self.top_p,
                temperature,
            },
            (k, false) => Sampling::TopK { k, temperature },
            (k, true) => Sampling::TopKThenTopP {
                k,
                p: self.top_p,
                temperature,
            },
        }
    }
}

/// Tokenizer + model + decoding settings: text in, text out.
pub struct TextGenerator<M> {
    model: M,
    tokenizer: Tokenizer,
    device: Device,
    config: GenerationConfig,
    eos_token_ids: Vec<u32>,
}

impl<M: CausalLm> TextGenerator<M> {
    pub fn new(
        model: M,
        tokenizer: Tokenizer,
        device: Device,
        config: GenerationConfig,
    ) -> Result<Self, EngineError> {
        let mut eos_token_ids = config.eos_token_ids();
        if eos_token_ids.is_empty() {
            let fallback = FALLBACK_EOS_TOKENS
                .iter()
                .find_map(|t| tokenizer.token_to_id(t))
                .ok_or_else(|| EngineError::MissingSpecialToken(FALLBACK_EOS_TOKENS[0].into()))?;
            eos_token_ids.push(fallback);
        }
        Ok(Self {
            model,
            tokenizer,
            device,
            config,
            eos_token_ids,
        })
    }

    /// Encodes `prompt`, extends it until the sequence holds `max_length`
    /// tokens or an EOS is sampled, and decodes the whole sequence with
    /// special tokens stripped. The prompt is part of the returned text.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_length: usize,
        seed: u64,
    ) -> Result<String, EngineError> {
        let mut tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        if tokens.is_empty() {
            tokens.push(self.config.bos_token_id.unwrap_or(self.eos_token_ids[0]));
        }

        let result = self.extend(&mut tokens, max_length, seed);
        self.model.clear_kv_cache();
        result?;

        Ok(self.tokenizer.decode(&tokens, true)?)
    }

    fn extend(
        &mut self,
        tokens: &mut Vec<u32>,
        max_length: usize,
        seed: u64,
    ) -> Result<(), EngineError> {
        let prompt_len = tokens.len();
        // like `generate`, at least one token even when the prompt fills max_length
        let budget = max_length.saturating_sub(prompt_len).max(1);
        let mut logits_processor = LogitsProcessor::from_sampling(seed, self.config.sampling());
        let penalty = self.config.repetition_penalty;

        let start = std::time::Instant::now();
        for index in 0..budget {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, start_pos)?
                .flatten_all()?
                .to_dtype(DType::F32)?;
            let logits = if penalty == 1.0 {
                logits
            } else {
                candle_transformers::utils::apply_repeat_penalty(&logits, penalty, &tokens[..])?
            };

            let next_token = logits_processor.sample(&logits)?;
            if self.eos_token_ids.contains(&next_token) {
                debug!(index, "eos sampled");
                break;
            }
            tokens.push(next_token);
        }

        let generated = tokens.len() - prompt_len;
        let dt = start.elapsed();
        info!(
            prompt_tokens = prompt_len,
            "{generated} tokens generated ({:.2} token/s)",
            generated as f64 / dt.as_secs_f64(),
        );
        Ok(())
    }
}

#[cfg(test)]
impl<M> TextGenerator<M> {
    pub(crate) fn model(&self) -> &M {
        &self.model
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const VOCAB: usize = 6;
    const EOS: u32 = 0;

    // ids: 0 <|endoftext|>, 1 SELECT, 2 name, 3 FROM, 4 users, 5 [UNK]
    pub(crate) fn word_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": 0,
                "content": "<|endoftext|>",
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            }],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "<|endoftext|>": 0,
                    "SELECT": 1,
                    "name": 2,
                    "FROM": 3,
                    "users": 4,
                    "[UNK]": 5
                },
                "unk_token": "[UNK]"
            }
        }"#;
        Tokenizer::from_bytes(json.as_bytes()).unwrap()
    }

    /// Emits a fixed sequence of tokens, one per forward call.
    pub(crate) struct ScriptedLm {
        script: Vec<u32>,
        step: usize,
        pub(crate) inputs: Vec<(usize, usize)>,
        pub(crate) cache_clears: usize,
    }

    impl ScriptedLm {
        pub(crate) fn new(script: &[u32]) -> Self {
            Self {
                script: script.to_vec(),
                step: 0,
                inputs: Vec::new(),
                cache_clears: 0,
            }
        }
    }

    impl CausalLm for ScriptedLm {
        fn forward(
            &mut self,
            input: &Tensor,
            seqlen_offset: usize,
        ) -> candle_core::Result<Tensor> {
            let (_, seq_len) = input.dims2()?;
            self.inputs.push((seq_len, seqlen_offset));
            let next = self.script.get(self.step).copied().unwrap_or(EOS) as usize;
            self.step += 1;
            let mut logits = vec![0f32; VOCAB];
            logits[next] = 10.0;
            Tensor::from_vec(logits, (1, 1, VOCAB), &Device::Cpu)
        }

        fn clear_kv_cache(&mut self) {
            self.step = 0;
            self.cache_clears += 1;
        }
    }

    fn generator(script: &[u32]) -> TextGenerator<ScriptedLm> {
        TextGenerator::new(
            ScriptedLm::new(script),
            word_tokenizer(),
            Device::Cpu,
            GenerationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn output_echoes_prompt_then_continuation() {
        let mut text_gen = generator(&[2, 3, 4]);
        let text = text_gen.generate("SELECT", 512, 42).unwrap();
        assert_eq!(text, "SELECT name FROM users");
    }

    #[test]
    fn max_length_bounds_the_whole_sequence() {
        let mut text_gen = generator(&[2, 3, 4, 2, 3]);
        let text = text_gen.generate("SELECT name", 3, 42).unwrap();
        assert_eq!(text, "SELECT name name");
    }

    #[test]
    fn at_least_one_token_when_prompt_fills_max_length() {
        let mut text_gen = generator(&[4]);
        let text = text_gen.generate("SELECT name FROM", 2, 42).unwrap();
        assert_eq!(text, "SELECT name FROM users");
    }

    #[test]
    fn eos_is_not_appended() {
        let mut text_gen = generator(&[2, EOS, 3]);
        let text = text_gen.generate("SELECT", 10, 42).unwrap();
        assert_eq!(text, "SELECT name");
    }

    #[test]
    fn empty_prompt_is_seeded_and_stripped() {
        let mut text_gen = generator(&[1, 2]);
        let text = text_gen.generate("", 10, 42).unwrap();
        assert_eq!(text, "SELECT name");
    }

    #[test]
    fn prompt_runs_once_then_one_token_per_step() {
        let mut text_gen = generator(&[3, 4]);
        text_gen.generate("SELECT name", 10, 42).unwrap();
        assert_eq!(text_gen.model.inputs, vec![(2, 0), (1, 2), (1, 3)]);
        assert_eq!(text_gen.model.cache_clears, 1);
    }

    #[test]
    fn declared_eos_ids_take_precedence() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"eos_token_id": [4, 0]}"#).unwrap();
        let mut text_gen =
            TextGenerator::new(ScriptedLm::new(&[2, 4]), word_tokenizer(), Device::Cpu, config)
                .unwrap();
        assert_eq!(text_gen.generate("SELECT", 10, 42).unwrap(), "SELECT name");
    }

    #[test]
    fn eos_id_accepts_single_int_or_list() {
        let one: GenerationConfig = serde_json::from_str(r#"{"eos_token_id": 151643}"#).unwrap();
        assert_eq!(one.eos_token_ids(), vec![151643]);
        let many: GenerationConfig =
            serde_json::from_str(r#"{"eos_token_id": [151645, 151643]}"#).unwrap();
        assert_eq!(many.eos_token_ids(), vec![151645, 151643]);
        let none: GenerationConfig = serde_json::from_str("{}").unwrap();
        assert!(none.eos_token_ids().is_empty());
    }

    #[test]
    fn greedy_unless_sampling_requested() {
        let config: GenerationConfig = serde_json::from_str(r#"{"temperature": 0.7}"#).unwrap();
        assert!(matches!(config.sampling(), Sampling::ArgMax));
    }

    #[test]
    fn qwen_style_config_samples_top_k_then_top_p() {
        let config: GenerationConfig = serde_json::from_str(
            r#"{
                "bos_token_id": 151643,
                "do_sample": true,
                "eos_token_id": [151645, 151643],
                "pad_token_id": 151643,
                "repetition_penalty": 1.05,
                "temperature": 0.7,
                "top_k": 20,
                "top_p": 0.8,
                "transformers_version": "4.44.2"
            }"#,
        )
        .unwrap();
        assert!(matches!(
            config.sampling(),
            Sampling::TopKThenTopP { k: 20, .. }
        ));
        assert_eq!(config.bos_token_id, Some(151643));
        assert!((config.repetition_penalty - 1.05).abs() < f32::EPSILON);
    }

    #[test]
    fn top_k_zero_disables_the_filter() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"do_sample": true, "top_k": 0}"#).unwrap();
        assert!(matches!(config.sampling(), Sampling::All { .. }));
    }

    #[test]
    fn repetition_penalty_still_picks_scripted_token() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"repetition_penalty": 1.2}"#).unwrap();
        let mut text_gen =
            TextGenerator::new(ScriptedLm::new(&[2, 3]), word_tokenizer(), Device::Cpu, config)
                .unwrap();
        assert_eq!(text_gen.generate("SELECT", 3, 42).unwrap(), "SELECT name FROM");
    }
}
