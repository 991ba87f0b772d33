//! Single-token transformer decoding for models too large for RAM.
//!
//! Weights live as int8 page files on block storage and are pulled through a
//! single reusable page buffer; the decoder consumes them as quantized views
//! without a second resident copy. One decode step advances a per-layer
//! key/value cache by exactly one position.

pub mod configuration;
pub mod generation;
pub mod sampler;
pub mod store;
pub mod tensor;
pub mod tokenizer;
pub mod transformer;
pub mod weights;

use anyhow::Result;
use log::debug;

use crate::configuration::{CacheScalePolicy, ModelConfig};
use crate::generation::generate;
use crate::sampler::Sampler;
use crate::tokenizer::{ByteTokenizer, VOCAB_SIZE};
use crate::transformer::ModelBuilder;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_dir: String,
    pub model: ModelConfig,
    pub scale_policy: CacheScalePolicy,
    pub temperature: f32,
    pub seed: u64,
    pub prompt: String,
    pub max_new_tokens: usize,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_dir: Option<String>,
    model: Option<ModelConfig>,
    scale_policy: Option<CacheScalePolicy>,
    temperature: Option<f32>,
    seed: Option<u64>,
    prompt: Option<String>,
    max_new_tokens: Option<usize>,
}

impl InferenceConfigBuilder {
    pub fn model_dir(mut self, dir: Option<&String>) -> Self {
        self.model_dir = dir.cloned();
        self
    }
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.model = Some(model);
        self
    }
    pub fn scale_policy(mut self, policy: Option<CacheScalePolicy>) -> Self {
        self.scale_policy = policy;
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn max_new_tokens(mut self, count: Option<usize>) -> Self {
        self.max_new_tokens = count;
        self
    }
    pub fn build(self) -> Result<InferenceConfig> {
        Ok(InferenceConfig {
            model_dir: self.model_dir.ok_or_else(|| anyhow::anyhow!("model_dir is required"))?,
            model: self.model.unwrap_or_default(),
            scale_policy: self.scale_policy.unwrap_or_default(),
            temperature: self.temperature.unwrap_or(1.0),
            seed: self.seed.unwrap_or(1234),
            prompt: self.prompt.ok_or_else(|| anyhow::anyhow!("prompt is required"))?,
            max_new_tokens: self.max_new_tokens.unwrap_or(64),
        })
    }
}

/// Loads the model from the configured page directory and runs one generation
/// pass over the prompt.
pub fn run_inference(config: InferenceConfig) -> Result<()> {
    debug!("{config:#?}");

    if config.model.vocab_size != VOCAB_SIZE {
        anyhow::bail!(
            "byte tokenizer needs a vocab of {VOCAB_SIZE}, configured {}",
            config.model.vocab_size
        );
    }

    let mut model = ModelBuilder::from_dir(&config.model_dir)
        .with_config(config.model.clone())
        .with_scale_policy(config.scale_policy)
        .build()?;

    let tokenizer = ByteTokenizer::new();
    let mut sampler = Sampler::new(config.temperature, config.seed);

    generate(
        &mut model,
        &tokenizer,
        &mut sampler,
        &config.prompt,
        config.max_new_tokens,
    )?;
    Ok(())
}
