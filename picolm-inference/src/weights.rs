use crate::configuration::{ModelConfig, SCALE_BYTES};
use crate::store::{PageMedium, PageStore};
use crate::tensor::{QTensor, mask_len};
use crate::transformer::{DecoderLayer, LayerNorm};
use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;

/// Name of the manifest object.
pub const INDEX_OBJECT: &str = "index.json";
/// Name of the embedding tensor resolved eagerly at index-load time.
const EMBEDDING_TENSOR: &str = "emb_weight";

/// One manifest entry: either a page-file list for a tensor (or its mask), or
/// a two-integer shape.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IndexEntry {
    Pages(Vec<String>),
    Shape(Vec<u64>),
}

/// Parsed manifest mapping tensor names to page files, with optional
/// `<name>_shape` and `<name>.mask` companion entries. Loaded once, immutable
/// afterwards.
#[derive(Debug)]
pub struct ModelIndex {
    entries: HashMap<String, IndexEntry>,
}

impl ModelIndex {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let entries = serde_json::from_slice(bytes).context("malformed manifest")?;
        Ok(Self { entries })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Page-file list for a key; `Ok(None)` when the key is absent.
    pub fn pages(&self, key: &str) -> Result<Option<&[String]>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(IndexEntry::Pages(pages)) => Ok(Some(pages)),
            Some(IndexEntry::Shape(_)) => {
                anyhow::bail!("manifest entry {key} is not a page list")
            }
        }
    }

    /// Every page file the manifest references (tensor payloads and masks),
    /// sorted for stable iteration.
    pub fn page_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .filter_map(|entry| match entry {
                IndexEntry::Pages(pages) => Some(pages.iter().cloned()),
                IndexEntry::Shape(_) => None,
            })
            .flatten()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// `(rows, cols)` for a shape key; `Ok(None)` when the key is absent.
    pub fn shape(&self, key: &str) -> Result<Option<(usize, usize)>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(IndexEntry::Shape(dims)) if dims.len() == 2 && dims.iter().all(|&d| d > 0) => {
                Ok(Some((dims[0] as usize, dims[1] as usize)))
            }
            Some(_) => anyhow::bail!("manifest entry {key} is not a two-integer shape"),
        }
    }
}

/// Resolves named tensors from the manifest into quantized views over the
/// page store, and assembles whole decoder layers.
///
/// A tensor object is one page: int8 row-major payload at the front, the
/// little-endian f32 dequantization scale in the final [`SCALE_BYTES`] of the
/// page (the exporter pads between the two). Payloads larger than a page are
/// rejected up front; nothing here stitches pages together.
#[derive(Debug)]
pub struct WeightLoader<M> {
    store: PageStore<M>,
    config: ModelConfig,
    index: Option<ModelIndex>,
    embedding: Option<QTensor<'static>>,
}

impl<M: PageMedium> WeightLoader<M> {
    pub fn new(store: PageStore<M>, config: ModelConfig) -> Self {
        Self { store, config, index: None, embedding: None }
    }

    /// Reads and parses the manifest, then eagerly resolves the embedding
    /// tensor. Failure of either step fails the whole call and leaves the
    /// loader unusable for tensor resolution.
    pub fn load_index(&mut self) -> Result<()> {
        let bytes = self
            .store
            .read_whole(INDEX_OBJECT)
            .with_context(|| format!("failed to read {INDEX_OBJECT}"))?;
        self.index = Some(ModelIndex::parse(&bytes)?);
        debug!("manifest parsed, resolving embedding");

        let embedding = self
            .resolve_tensor(EMBEDDING_TENSOR)
            .context("failed to resolve embedding tensor")?
            .into_owned();
        let expected = (self.config.vocab_size, self.config.dim);
        if (embedding.rows, embedding.cols) != expected {
            anyhow::bail!(
                "embedding shape {}x{} does not match configured {}x{}",
                embedding.rows,
                embedding.cols,
                expected.0,
                expected.1
            );
        }
        self.embedding = Some(embedding);
        Ok(())
    }

    /// Looks a tensor up in the manifest and materializes a quantized view of
    /// it.
    ///
    /// Mask-less tensors borrow the page buffer directly (zero-copy); the
    /// borrow keeps the loader exclusively held, so the view cannot survive a
    /// later read. A `<name>.mask` companion forces a second page read, which
    /// would invalidate that borrow, so the payload is copied to owned
    /// storage before the mask page replaces the buffer.
    pub fn resolve_tensor(&mut self, name: &str) -> Result<QTensor<'_>> {
        let index = self.index.as_ref().context("model index not loaded")?;
        let pages = index
            .pages(name)?
            .with_context(|| format!("tensor {name} not in index"))?;
        let first = pages
            .first()
            .with_context(|| format!("tensor {name} has an empty page list"))?;

        let (rows, cols) = match index.shape(&format!("{name}_shape"))? {
            Some(shape) => shape,
            None => (self.config.dim, self.config.dim),
        };
        self.config.check_page_budget(name, rows, cols)?;
        let payload = rows * cols;

        let mask_pages = index.pages(&format!("{name}.mask"))?;
        if let Some(mask_pages) = &mask_pages {
            if mask_pages.is_empty() {
                anyhow::bail!("mask for tensor {name} has an empty page list");
            }
        }

        let page = self.store.read_page(first)?;
        let scale = LittleEndian::read_f32(&page[page.len() - SCALE_BYTES..]);

        match mask_pages {
            None => {
                // SAFETY: i8 and u8 have identical layout; the page budget
                // check above guarantees `payload` bytes are in bounds.
                let data = unsafe {
                    std::slice::from_raw_parts(page.as_ptr() as *const i8, payload)
                };
                Ok(QTensor::dense(data, scale, rows, cols))
            }
            Some(mask_pages) => {
                let data: Vec<i8> = page[..payload].iter().map(|&b| b as i8).collect();
                let needed = mask_len(rows, cols);
                let mask_page = self.store.read_page(&mask_pages[0])?;
                Ok(QTensor::block_sparse(data, scale, rows, cols, &mask_page[..needed]))
            }
        }
    }

    /// Assembles one decoder layer: six quantized projections plus the two
    /// norm parameter pairs. Any missing or misshapen component fails the
    /// whole call; no partial layer escapes.
    pub fn load_layer(&mut self, layer_idx: usize) -> Result<DecoderLayer> {
        let dim = self.config.dim;
        let d_ff = self.config.d_ff;

        let wq = self.named_tensor(layer_idx, "Wq", dim, dim)?;
        let wk_shared = self.named_tensor(layer_idx, "Wk_shared", dim, dim)?;
        let wv_shared = self.named_tensor(layer_idx, "Wv_shared", dim, dim)?;
        let wo = self.named_tensor(layer_idx, "Wo", dim, dim)?;
        let w1 = self.named_tensor(layer_idx, "W1", dim, d_ff)?;
        let w2 = self.named_tensor(layer_idx, "W2", d_ff, dim)?;

        let ln1 = self.read_norm_pair(&format!("dec{layer_idx}_ln1.bin"))?;
        let ln2 = self.read_norm_pair(&format!("dec{layer_idx}_ln2.bin"))?;

        Ok(DecoderLayer { wq, wk_shared, wv_shared, wo, w1, w2, ln1, ln2 })
    }

    fn named_tensor(
        &mut self,
        layer_idx: usize,
        suffix: &str,
        rows: usize,
        cols: usize,
    ) -> Result<QTensor<'static>> {
        let name = format!("dec{layer_idx}_{suffix}");
        let tensor = self.resolve_tensor(&name)?;
        if (tensor.rows, tensor.cols) != (rows, cols) {
            anyhow::bail!(
                "tensor {name} shape {}x{} does not match expected {rows}x{cols}",
                tensor.rows,
                tensor.cols
            );
        }
        Ok(tensor.into_owned())
    }

    /// Reads a norm parameter object: `2 * dim` f32 values, gain vector then
    /// bias vector, no header. The values are copied out of the page buffer —
    /// the one place page bytes are durably retained.
    fn read_norm_pair(&mut self, name: &str) -> Result<LayerNorm> {
        let dim = self.config.dim;
        let page = self
            .store
            .read_page(name)
            .with_context(|| format!("failed to read norm parameters {name}"))?;

        let mut cursor = Cursor::new(&page[..2 * dim * std::mem::size_of::<f32>()]);
        let mut read_vec = |what: &str| -> Result<Vec<f32>> {
            (0..dim)
                .map(|i| {
                    cursor
                        .read_f32::<LittleEndian>()
                        .with_context(|| format!("failed to read {what}[{i}] from {name}"))
                })
                .collect()
        };
        let gain = read_vec("gain")?;
        let bias = read_vec("bias")?;
        Ok(LayerNorm::new(gain, bias))
    }

    /// The embedding tensor cached by [`WeightLoader::load_index`].
    pub fn embedding(&self) -> Result<&QTensor<'static>> {
        self.embedding.as_ref().context("embedding not loaded")
    }

    pub fn take_embedding(&mut self) -> Result<QTensor<'static>> {
        self.embedding.take().context("embedding not loaded")
    }

    pub fn store_mut(&mut self) -> &mut PageStore<M> {
        &mut self.store
    }

    pub fn into_store(self) -> PageStore<M> {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemMedium;
    use crate::tensor::Layout;
    use serde_json::json;
    use std::borrow::Cow;

    const PAGE: usize = 512;

    fn small_config() -> ModelConfig {
        ModelConfig {
            dim: 4,
            n_heads: 2,
            d_ff: 8,
            max_seq: 8,
            vocab_size: 8,
            n_layers: 1,
            page_size: PAGE,
        }
    }

    /// Lays a tensor object out the way the exporter does: payload first,
    /// scale in the final four bytes of the page.
    fn tensor_page(data: &[i8], scale: f32) -> Vec<u8> {
        let mut page = vec![0u8; PAGE];
        for (dst, &v) in page.iter_mut().zip(data.iter()) {
            *dst = v as u8;
        }
        page[PAGE - 4..].copy_from_slice(&scale.to_le_bytes());
        page
    }

    fn norm_page(gain: &[f32], bias: &[f32]) -> Vec<u8> {
        let mut page = Vec::with_capacity(PAGE);
        for v in gain.iter().chain(bias.iter()) {
            page.extend_from_slice(&v.to_le_bytes());
        }
        page
    }

    fn loader_with(
        manifest: serde_json::Value,
        objects: Vec<(String, Vec<u8>)>,
    ) -> WeightLoader<MemMedium> {
        let mut medium = MemMedium::new();
        medium.insert(INDEX_OBJECT, serde_json::to_vec(&manifest).unwrap());
        for (name, bytes) in objects {
            medium.insert(name, bytes);
        }
        let store = PageStore::open(medium, PAGE).unwrap();
        WeightLoader::new(store, small_config())
    }

    fn emb_objects() -> (serde_json::Value, Vec<(String, Vec<u8>)>) {
        let config = small_config();
        let data = vec![1i8; config.vocab_size * config.dim];
        let manifest = json!({
            "emb_weight": ["emb_weight_0000.bin"],
            "emb_weight_shape": [config.vocab_size, config.dim],
        });
        (manifest, vec![("emb_weight_0000.bin".into(), tensor_page(&data, 0.5))])
    }

    #[test]
    fn load_index_caches_the_embedding() {
        let (manifest, objects) = emb_objects();
        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();

        let emb = loader.embedding().unwrap();
        assert_eq!((emb.rows, emb.cols), (8, 4));
        assert_eq!(emb.scale, 0.5);
        assert!(matches!(emb.data, Cow::Owned(_)));
    }

    #[test]
    fn missing_embedding_fails_index_load() {
        let mut loader = loader_with(json!({"other": ["x.bin"]}), vec![]);
        assert!(loader.load_index().is_err());
    }

    #[test]
    fn malformed_manifest_fails() {
        let mut medium = MemMedium::new();
        medium.insert(INDEX_OBJECT, b"not json".to_vec());
        let store = PageStore::open(medium, PAGE).unwrap();
        let mut loader = WeightLoader::new(store, small_config());
        assert!(loader.load_index().is_err());
    }

    #[test]
    fn resolve_reads_scale_from_page_end() {
        let (mut manifest, mut objects) = emb_objects();
        manifest["t"] = json!(["t_0000.bin"]);
        let data: Vec<i8> = (0..16).map(|v| v - 8).collect();
        objects.push(("t_0000.bin".into(), tensor_page(&data, 0.25)));

        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();

        // No shape entry: defaults to dim x dim.
        let t = loader.resolve_tensor("t").unwrap();
        assert_eq!((t.rows, t.cols), (4, 4));
        assert_eq!(t.scale, 0.25);
        assert_eq!(&t.data[..], &data[..]);
        assert!(matches!(t.layout, Layout::Dense));
        assert!(matches!(t.data, Cow::Borrowed(_)));
    }

    #[test]
    fn unknown_tensor_and_empty_page_list_fail() {
        let (mut manifest, objects) = emb_objects();
        manifest["empty"] = json!([]);
        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();

        assert!(loader.resolve_tensor("absent").is_err());
        assert!(loader.resolve_tensor("empty").is_err());
    }

    #[test]
    fn oversized_tensor_is_rejected_before_reading() {
        let (mut manifest, objects) = emb_objects();
        manifest["big"] = json!(["big_0000.bin"]);
        manifest["big_shape"] = json!([64, 64]);

        // The page object itself is never even opened.
        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();
        let err = loader.resolve_tensor("big").unwrap_err();
        assert!(err.to_string().contains("page"), "{err}");
    }

    #[test]
    fn masked_tensor_detaches_its_payload() {
        let (mut manifest, mut objects) = emb_objects();
        manifest["m"] = json!(["m_0000.bin"]);
        manifest["m.mask"] = json!(["m.mask"]);
        let data: Vec<i8> = (0..16).collect();
        objects.push(("m_0000.bin".into(), tensor_page(&data, 1.0)));
        objects.push(("m.mask".into(), vec![0xFF]));

        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();

        let t = loader.resolve_tensor("m").unwrap();
        // The mask read recycled the page buffer, so the payload must be an
        // owned copy and still intact.
        assert!(matches!(t.data, Cow::Owned(_)));
        assert_eq!(&t.data[..], &data[..]);
        let Layout::BlockSparse(mask) = &t.layout else {
            panic!("expected block-sparse layout")
        };
        assert_eq!(mask[0], 0xFF);
    }

    #[test]
    fn load_layer_fails_on_missing_page_file() {
        let config = small_config();
        let (mut manifest, mut objects) = emb_objects();
        let dxd = vec![1i8; config.dim * config.dim];
        // Wq is listed in the manifest but its page file is absent.
        for name in ["Wq", "Wk_shared", "Wv_shared", "Wo"] {
            manifest[format!("dec0_{name}")] = json!([format!("dec0_{name}_0000.bin")]);
            if name != "Wq" {
                objects.push((format!("dec0_{name}_0000.bin"), tensor_page(&dxd, 1.0)));
            }
        }

        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();
        assert!(loader.load_layer(0).is_err());
    }

    #[test]
    fn shape_mismatch_fails_layer_load() {
        let (mut manifest, mut objects) = emb_objects();
        manifest["dec0_Wq"] = json!(["dec0_Wq_0000.bin"]);
        manifest["dec0_Wq_shape"] = json!([2, 2]);
        objects.push(("dec0_Wq_0000.bin".into(), tensor_page(&[1, 2, 3, 4], 1.0)));

        let mut loader = loader_with(manifest, objects);
        loader.load_index().unwrap();
        let err = loader.load_layer(0).unwrap_err();
        assert!(err.to_string().contains("shape"), "{err}");
    }
}
