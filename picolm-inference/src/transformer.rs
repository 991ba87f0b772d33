use crate::configuration::{CacheScalePolicy, ModelConfig};
use crate::store::{DirMedium, PageJournal, PageMedium, PageStore};
use crate::tensor::{QTensor, gelu, layer_norm, linear, rope_apply, softmax};
use crate::weights::WeightLoader;
use anyhow::{Context, Result};
use log::debug;
use rayon::prelude::*;
use std::path::Path;

/// Guard scale the KV cache starts from before the first token fixes it.
const CACHE_SCALE_EPS: f32 = 1e-6;
/// int8 quantization range.
const Q_MAX: f32 = 127.0;
/// Guard added to freshly computed cache scales.
const SCALE_EPS: f32 = 1e-8;

/// Learned layer-norm parameters, copied out of their page at layer load.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gain: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LayerNorm {
    pub fn new(gain: Vec<f32>, bias: Vec<f32>) -> Self {
        debug_assert_eq!(gain.len(), bias.len());
        Self { gain, bias }
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        layer_norm(x, &self.gain, &self.bias);
    }
}

/// One decoder layer's weights: six quantized projections plus two norm
/// parameter pairs. All tensors are owned — a layer outlives every page read
/// that happens after it is assembled.
#[derive(Debug)]
pub struct DecoderLayer {
    pub wq: QTensor<'static>,
    /// Shared key projection; every attention head reads its own slice of the
    /// projected vector.
    pub wk_shared: QTensor<'static>,
    /// Shared value projection, same sharing scheme as the keys.
    pub wv_shared: QTensor<'static>,
    pub wo: QTensor<'static>,
    pub w1: QTensor<'static>,
    pub w2: QTensor<'static>,
    pub ln1: LayerNorm,
    pub ln2: LayerNorm,
}

/// Per-layer history of quantized keys and values across decode steps.
///
/// Length only grows, one step per append, up to `max_seq`; appending past
/// capacity is rejected. Scales follow the configured [`CacheScalePolicy`]:
/// under `FixedAtFirst` the scales computed from the first token are reused
/// for every later step, so later tokens with a wider range saturate — that
/// matches the reference firmware and is deliberately not corrected here.
#[derive(Debug)]
pub struct KvCache {
    k: Vec<i8>,
    v: Vec<i8>,
    k_scales: Vec<f32>,
    v_scales: Vec<f32>,
    len: usize,
    max_seq: usize,
    dim: usize,
    policy: CacheScalePolicy,
}

impl KvCache {
    pub fn new(config: &ModelConfig, policy: CacheScalePolicy) -> Self {
        Self {
            k: vec![0; config.max_seq * config.dim],
            v: vec![0; config.max_seq * config.dim],
            k_scales: vec![CACHE_SCALE_EPS; config.max_seq],
            v_scales: vec![CACHE_SCALE_EPS; config.max_seq],
            len: 0,
            max_seq: config.max_seq,
            dim: config.dim,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Quantizes and stores one time step's key and value vectors.
    pub fn append(&mut self, key: &[f32], value: &[f32]) -> Result<()> {
        debug_assert_eq!(key.len(), self.dim);
        debug_assert_eq!(value.len(), self.dim);
        if self.len == self.max_seq {
            anyhow::bail!("KV cache full: capacity {} steps", self.max_seq);
        }

        let t = self.len;
        let k_scale = self.step_scale(t, key, self.k_scales[0]);
        let v_scale = self.step_scale(t, value, self.v_scales[0]);
        self.k_scales[t] = k_scale;
        self.v_scales[t] = v_scale;

        let off = t * self.dim;
        for (dst, &src) in self.k[off..off + self.dim].iter_mut().zip(key.iter()) {
            *dst = (src / k_scale).round() as i8;
        }
        for (dst, &src) in self.v[off..off + self.dim].iter_mut().zip(value.iter()) {
            *dst = (src / v_scale).round() as i8;
        }
        self.len = t + 1;
        Ok(())
    }

    fn step_scale(&self, t: usize, x: &[f32], first: f32) -> f32 {
        match self.policy {
            CacheScalePolicy::FixedAtFirst if t > 0 => first,
            _ => {
                let xmax = x.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
                xmax / Q_MAX + SCALE_EPS
            }
        }
    }

    fn key(&self, t: usize) -> &[i8] {
        &self.k[t * self.dim..(t + 1) * self.dim]
    }

    fn value(&self, t: usize) -> &[i8] {
        &self.v[t * self.dim..(t + 1) * self.dim]
    }

    /// Forgets all cached steps; scales reset to the guard value.
    pub fn reset(&mut self) {
        self.len = 0;
        self.k_scales.fill(CACHE_SCALE_EPS);
        self.v_scales.fill(CACHE_SCALE_EPS);
    }
}

/// Per-step activation arena. Every buffer the decode path touches is sized
/// here, once, from the validated configuration.
#[derive(Debug)]
struct Scratch {
    /// Hidden state threaded through the layers.
    x: Vec<f32>,
    /// Normed copy of the hidden state feeding the projections.
    h: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Attention scores, one `max_seq` stripe per head.
    att: Vec<f32>,
    /// Concatenated head outputs.
    att_out: Vec<f32>,
    o: Vec<f32>,
    n2: Vec<f32>,
    ff: Vec<f32>,
    ff_out: Vec<f32>,
    /// Quantized-activation staging for the linear layers.
    xq: Vec<i8>,
    logits: Vec<f32>,
}

impl Scratch {
    fn new(config: &ModelConfig) -> Self {
        let dim = config.dim;
        Self {
            x: vec![0.0; dim],
            h: vec![0.0; dim],
            q: vec![0.0; dim],
            k: vec![0.0; dim],
            v: vec![0.0; dim],
            att: vec![0.0; config.n_heads * config.max_seq],
            att_out: vec![0.0; dim],
            o: vec![0.0; dim],
            n2: vec![0.0; dim],
            ff: vec![0.0; config.d_ff],
            ff_out: vec![0.0; dim],
            xq: vec![0; dim.max(config.d_ff)],
            logits: vec![0.0; config.vocab_size],
        }
    }
}

impl DecoderLayer {
    /// One attention-plus-feed-forward step. Reads the hidden state from
    /// `scratch.x` and leaves the layer's output there.
    fn forward(
        &self,
        config: &ModelConfig,
        pos: usize,
        cache: &mut KvCache,
        scratch: &mut Scratch,
    ) -> Result<()> {
        if pos != cache.len() {
            anyhow::bail!("decode position {pos} does not match cache length {}", cache.len());
        }

        // Pre-norm, then project to query / shared key / shared value.
        scratch.h.copy_from_slice(&scratch.x);
        self.ln1.forward_inplace(&mut scratch.h);
        linear(&scratch.h, &self.wq, &mut scratch.xq, &mut scratch.q);
        linear(&scratch.h, &self.wk_shared, &mut scratch.xq, &mut scratch.k);
        linear(&scratch.h, &self.wv_shared, &mut scratch.xq, &mut scratch.v);

        rope_apply(&mut scratch.q, &mut scratch.k, pos);

        cache.append(&scratch.k, &scratch.v)?;

        // Scaled dot-product attention over the cached history, one head per
        // stripe. Heads write disjoint output slices.
        let head_dim = config.head_dim();
        let inv_sqrt = (head_dim as f32).sqrt().recip();
        let len = cache.len();
        let q = &scratch.q;
        let cache = &*cache;
        scratch
            .att
            .par_chunks_mut(config.max_seq)
            .zip(scratch.att_out.par_chunks_mut(head_dim))
            .zip((0..config.n_heads).into_par_iter())
            .for_each(|((att_stripe, out_slice), head_idx)| {
                let off = head_idx * head_dim;
                let q_head = &q[off..off + head_dim];

                let scores = &mut att_stripe[..len];
                for (t, score) in scores.iter_mut().enumerate() {
                    let k_scale = cache.k_scales[t];
                    let k_head = &cache.key(t)[off..off + head_dim];
                    *score = q_head
                        .iter()
                        .zip(k_head.iter())
                        .map(|(&qv, &kv)| qv * (kv as f32 * k_scale))
                        .sum::<f32>()
                        * inv_sqrt;
                }
                softmax(scores);

                out_slice.fill(0.0);
                for (t, &weight) in scores.iter().enumerate() {
                    let v_scale = cache.v_scales[t];
                    let v_head = &cache.value(t)[off..off + head_dim];
                    for (out, &vv) in out_slice.iter_mut().zip(v_head.iter()) {
                        *out += weight * (vv as f32 * v_scale);
                    }
                }
            });

        // Output projection and residual.
        linear(&scratch.att_out, &self.wo, &mut scratch.xq, &mut scratch.o);
        for (x, &o) in scratch.x.iter_mut().zip(scratch.o.iter()) {
            *x += o;
        }

        // Feed-forward block with its own norm and residual.
        scratch.n2.copy_from_slice(&scratch.x);
        self.ln2.forward_inplace(&mut scratch.n2);
        linear(&scratch.n2, &self.w1, &mut scratch.xq, &mut scratch.ff);
        for v in scratch.ff.iter_mut() {
            *v = gelu(*v);
        }
        linear(&scratch.ff, &self.w2, &mut scratch.xq, &mut scratch.ff_out);
        for (x, &f) in scratch.x.iter_mut().zip(scratch.ff_out.iter()) {
            *x += f;
        }

        Ok(())
    }
}

/// The assembled decoder: embedding, layers, per-layer caches, and the
/// activation arena. Weights are loaded once; `forward` advances the caches
/// one step per call.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    embedding: QTensor<'static>,
    layers: Vec<DecoderLayer>,
    caches: Vec<KvCache>,
    scratch: Scratch,
}

impl Model {
    /// Assembles a model from already-loaded parts, validating the geometry.
    pub fn from_parts(
        config: ModelConfig,
        embedding: QTensor<'static>,
        layers: Vec<DecoderLayer>,
        policy: CacheScalePolicy,
    ) -> Result<Self> {
        config.validate()?;
        if (embedding.rows, embedding.cols) != (config.vocab_size, config.dim) {
            anyhow::bail!(
                "embedding shape {}x{} does not match configured {}x{}",
                embedding.rows,
                embedding.cols,
                config.vocab_size,
                config.dim
            );
        }
        if layers.len() != config.n_layers {
            anyhow::bail!("expected {} layers, got {}", config.n_layers, layers.len());
        }

        let caches = (0..config.n_layers).map(|_| KvCache::new(&config, policy)).collect();
        let scratch = Scratch::new(&config);
        Ok(Self { config, embedding, layers, caches, scratch })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// One decode step: embeds the token, runs every layer (each advancing
    /// its cache at `pos`), and projects to vocabulary logits through the
    /// tied embedding.
    pub fn forward(&mut self, token: usize, pos: usize) -> Result<&[f32]> {
        let Model { config, embedding, layers, caches, scratch } = self;
        let dim = config.dim;

        if token >= config.vocab_size {
            anyhow::bail!("token {token} out of range for vocab {}", config.vocab_size);
        }
        if pos >= config.max_seq {
            anyhow::bail!("position {pos} exceeds context window {}", config.max_seq);
        }

        // Embedding lookup, dequantized on the fly.
        let row = &embedding.data[token * dim..(token + 1) * dim];
        for (x, &e) in scratch.x.iter_mut().zip(row.iter()) {
            *x = e as f32 * embedding.scale;
        }

        for (layer, cache) in layers.iter().zip(caches.iter_mut()) {
            layer.forward(config, pos, cache, scratch)?;
        }

        // Tied-embedding head: logits[v] = emb_row(v) . hidden.
        let x = &scratch.x;
        let embedding = &*embedding;
        scratch.logits.par_iter_mut().enumerate().for_each(|(v, logit)| {
            let row = &embedding.data[v * dim..(v + 1) * dim];
            *logit = row
                .iter()
                .zip(x.iter())
                .map(|(&e, &h)| e as f32 * embedding.scale * h)
                .sum();
        });

        Ok(&scratch.logits)
    }

    /// Drops all cached history so a fresh sequence can start at position 0.
    pub fn reset(&mut self) {
        for cache in &mut self.caches {
            cache.reset();
        }
    }
}

/// Builder wiring medium, store, loader, and model assembly together.
pub struct ModelBuilder<M> {
    medium: M,
    config: ModelConfig,
    policy: CacheScalePolicy,
    journal: Option<PageJournal>,
}

impl ModelBuilder<DirMedium> {
    /// Builds against a directory of page files.
    pub fn from_dir(root: impl AsRef<Path>) -> Self {
        Self::new(DirMedium::new(root.as_ref()))
    }
}

impl<M: PageMedium> ModelBuilder<M> {
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            config: ModelConfig::default(),
            policy: CacheScalePolicy::default(),
            journal: None,
        }
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_scale_policy(mut self, policy: CacheScalePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_journal(mut self, journal: PageJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> Result<Model> {
        self.config.validate().context("invalid model configuration")?;

        let mut store = PageStore::open(self.medium, self.config.page_size)?;
        if let Some(journal) = self.journal {
            store = store.with_journal(journal);
        }

        let mut loader = WeightLoader::new(store, self.config.clone());
        loader.load_index().context("failed to load weight index")?;

        let layers = (0..self.config.n_layers)
            .map(|i| {
                loader
                    .load_layer(i)
                    .with_context(|| format!("failed to load decoder layer {i}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let embedding = loader.take_embedding()?;
        debug!("loaded {} layers", layers.len());

        Model::from_parts(self.config, embedding, layers, self.policy)
    }
}
