use crate::tensor::mask_len;
use anyhow::Result;

/// Default page size, block-storage sector aligned.
pub const DEFAULT_PAGE_SIZE: usize = 512;
/// Trailing bytes of a tensor page holding the little-endian f32 scale.
pub const SCALE_BYTES: usize = 4;

/// How KV-cache dequantization scales evolve across decode steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheScalePolicy {
    /// Scales are computed from the first token's key/value magnitudes and
    /// frozen. Later tokens whose activations exceed that range saturate on
    /// quantization. This reproduces the reference firmware bit-for-bit and
    /// is the compatibility default.
    #[default]
    FixedAtFirst,
    /// A fresh scale is computed for every appended key/value and stored per
    /// time step.
    PerStep,
}

/// Runtime model geometry. Every buffer in the engine is sized from this
/// struct and validated up front; nothing is sized by compile-time constants.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Hidden dimension.
    pub dim: usize,
    /// Attention head count. All heads share one key and one value projection.
    pub n_heads: usize,
    /// Feed-forward inner width.
    pub d_ff: usize,
    /// KV-cache capacity in time steps.
    pub max_seq: usize,
    /// Vocabulary size of the embedding table.
    pub vocab_size: usize,
    /// Decoder layer count.
    pub n_layers: usize,
    /// Page size of the backing store. Every tensor's payload plus its
    /// trailing scale must fit in one page of this size.
    pub page_size: usize,
}

impl Default for ModelConfig {
    /// Geometry of the reference firmware. Note that these defaults do not
    /// pass [`ModelConfig::validate`] with the default 512-byte page: a
    /// 64-dim model's tensors exceed a single page, and the validator says
    /// so rather than letting the loader read a truncated payload.
    fn default() -> Self {
        Self {
            dim: 64,
            n_heads: 2,
            d_ff: 256,
            max_seq: 64,
            vocab_size: 128,
            n_layers: 2,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Validates the geometry before any buffer is allocated or page read.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("dim", self.dim),
            ("n_heads", self.n_heads),
            ("d_ff", self.d_ff),
            ("max_seq", self.max_seq),
            ("vocab_size", self.vocab_size),
            ("n_layers", self.n_layers),
            ("page_size", self.page_size),
        ];
        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!("invalid {name}: must be positive");
            }
        }

        if self.dim % self.n_heads != 0 {
            anyhow::bail!(
                "dim {} is not divisible by n_heads {}",
                self.dim,
                self.n_heads
            );
        }
        if self.dim % 2 != 0 {
            anyhow::bail!(
                "dim {} must be even: rotary embedding rotates element pairs",
                self.dim
            );
        }

        // Single-page ceiling: the index format stores each tensor's whole
        // payload plus a 4-byte scale in its first page, so every tensor the
        // model will load has to fit. Checked here and again per tensor at
        // load time.
        self.check_page_budget("embedding", self.vocab_size, self.dim)?;
        self.check_page_budget("attention projection", self.dim, self.dim)?;
        self.check_page_budget("feed-forward", self.dim, self.d_ff)?;

        let norm_bytes = 2 * self.dim * std::mem::size_of::<f32>();
        if norm_bytes > self.page_size {
            anyhow::bail!(
                "norm parameter file needs {norm_bytes} bytes but a page holds {}; \
                 shrink dim or raise page_size",
                self.page_size
            );
        }

        Ok(())
    }

    /// Fails if a `rows x cols` int8 tensor (payload + trailing scale) or its
    /// block mask cannot fit in one page.
    pub fn check_page_budget(&self, what: &str, rows: usize, cols: usize) -> Result<()> {
        let needed = rows * cols + SCALE_BYTES;
        if needed > self.page_size {
            anyhow::bail!(
                "{what} tensor ({rows}x{cols}) needs {needed} bytes but a page holds {}; \
                 shrink the model or raise page_size",
                self.page_size
            );
        }
        if mask_len(rows, cols) > self.page_size {
            anyhow::bail!(
                "{what} tensor ({rows}x{cols}) block mask does not fit in one page"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ModelConfig {
        ModelConfig {
            dim: 8,
            n_heads: 2,
            d_ff: 16,
            max_seq: 8,
            vocab_size: 16,
            n_layers: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[test]
    fn small_config_is_valid() {
        small().validate().unwrap();
    }

    #[test]
    fn firmware_defaults_exceed_the_page_budget() {
        let err = ModelConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("page"), "{err}");
    }

    #[test]
    fn firmware_defaults_pass_with_a_larger_page() {
        let config = ModelConfig { page_size: 32768, ..ModelConfig::default() };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_dimension() {
        let config = ModelConfig { n_layers: 0, ..small() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = ModelConfig { n_heads: 3, ..small() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_odd_dim() {
        let config = ModelConfig { dim: 9, n_heads: 3, ..small() };
        assert!(config.validate().is_err());
    }
}
