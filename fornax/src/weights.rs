//! llama2.c binary model format loader.
//!
//! The file is a 7-field little-endian `i32` header
//! `{dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size,
//! max_seq_len}` followed by raw f32 tensors, each tensor kind grouped
//! across layers:
//!
//! ```text
//! token_embedding [vocab, dim]
//! rms_att  x n_layers      [dim]
//! wq       x n_layers      [dim, n_heads * head_dim]
//! wk       x n_layers      [dim, n_kv_heads * head_dim]
//! wv       x n_layers      [dim, n_kv_heads * head_dim]
//! wo       x n_layers      [n_heads * head_dim, dim]
//! rms_ffn  x n_layers      [dim]
//! w_gate   x n_layers      [dim, hidden_dim]
//! w_down   x n_layers      [hidden_dim, dim]
//! w_up     x n_layers      [dim, hidden_dim]
//! rms_final                [dim]
//! lm_head (optional)       [vocab, dim]
//! ```
//!
//! If the file ends before `lm_head`, the classifier aliases the embedding
//! table ("shared weights").

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use crate::config::ModelConfig;
use crate::{Error, Result};

/// Weights for one transformer layer.
#[derive(Debug)]
pub struct LayerWeights {
    pub rms_att: Vec<f32>,
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv: Vec<f32>,
    pub wo: Vec<f32>,
    pub rms_ffn: Vec<f32>,
    pub w_gate: Vec<f32>,
    pub w_up: Vec<f32>,
    pub w_down: Vec<f32>,
}

/// All model weights.
#[derive(Debug)]
pub struct ModelWeights {
    pub token_embedding: Vec<f32>,
    pub layers: Vec<LayerWeights>,
    pub rms_final: Vec<f32>,
    pub lm_head: Vec<f32>,
    /// True when `lm_head` is a copy of the embedding table.
    pub shared_weights: bool,
}

/// A loaded model: configuration plus weights.
#[derive(Debug)]
pub struct Model {
    pub config: ModelConfig,
    pub weights: ModelWeights,
}

impl Model {
    /// Load a model from a llama2.c `.bin` file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, the header is
    /// malformed, or the file is truncated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading model");

        let file = File::open(path)?;
        // Safety: the mapping is read-only and lives only for the duration
        // of this call; tensor data is copied out below.
        let mmap = unsafe { Mmap::map(&file)? };
        let model = Self::from_bytes(&mmap)?;

        info!(
            dim = model.config.dim,
            layers = model.config.n_layers,
            heads = model.config.n_heads,
            vocab = model.config.vocab_size,
            "model loaded"
        );
        Ok(model)
    }

    /// Parse a model from raw file bytes.
    ///
    /// # Errors
    /// Returns [`Error::MalformedModel`] on a bad header or truncated body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let mut header = [0i32; 7];
        for field in &mut header {
            *field = reader.read_i32()?;
        }
        if header.iter().any(|&v| v <= 0) {
            return Err(Error::MalformedModel(format!(
                "non-positive header field in {header:?}"
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, max_seq_len] =
            header.map(|v| v as usize);

        let config = ModelConfig {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            max_seq_len,
            head_dim: dim / n_heads,
            rope_theta: 10_000.0,
            eos_token_id: 2,
        };
        config.validate()?;

        let weights = read_weights(&mut reader, &config)?;
        Ok(Self { config, weights })
    }

    /// Assemble a model from an existing configuration and weights,
    /// validating tensor sizes. Used by tests and synthetic models.
    ///
    /// # Errors
    /// Returns [`Error::MalformedModel`] if any tensor has the wrong length
    /// for `config`.
    pub fn from_parts(config: ModelConfig, weights: ModelWeights) -> Result<Self> {
        config.validate()?;
        let c = &config;
        let check = |name: &str, len: usize, expected: usize| -> Result<()> {
            if len == expected {
                Ok(())
            } else {
                Err(Error::MalformedModel(format!(
                    "{name}: expected {expected} elements, got {len}"
                )))
            }
        };

        check(
            "token_embedding",
            weights.token_embedding.len(),
            c.vocab_size * c.dim,
        )?;
        check("layers", weights.layers.len(), c.n_layers)?;
        for (i, l) in weights.layers.iter().enumerate() {
            check(&format!("layer {i} rms_att"), l.rms_att.len(), c.dim)?;
            check(
                &format!("layer {i} wq"),
                l.wq.len(),
                c.dim * c.n_heads * c.head_dim,
            )?;
            check(&format!("layer {i} wk"), l.wk.len(), c.dim * c.kv_dim())?;
            check(&format!("layer {i} wv"), l.wv.len(), c.dim * c.kv_dim())?;
            check(
                &format!("layer {i} wo"),
                l.wo.len(),
                c.n_heads * c.head_dim * c.dim,
            )?;
            check(&format!("layer {i} rms_ffn"), l.rms_ffn.len(), c.dim)?;
            check(
                &format!("layer {i} w_gate"),
                l.w_gate.len(),
                c.dim * c.hidden_dim,
            )?;
            check(&format!("layer {i} w_up"), l.w_up.len(), c.dim * c.hidden_dim)?;
            check(
                &format!("layer {i} w_down"),
                l.w_down.len(),
                c.hidden_dim * c.dim,
            )?;
        }
        check("rms_final", weights.rms_final.len(), c.dim)?;
        check("lm_head", weights.lm_head.len(), c.vocab_size * c.dim)?;

        Ok(Self { config, weights })
    }
}

fn read_weights(reader: &mut Reader<'_>, config: &ModelConfig) -> Result<ModelWeights> {
    let c = config;
    let qkv_dim = c.n_heads * c.head_dim;
    let kv_dim = c.kv_dim();

    let token_embedding = reader.read_f32_vec("token_embedding", c.vocab_size * c.dim)?;

    // Each tensor kind is stored for all layers before the next kind.
    let rms_att = read_layer_group(reader, "rms_att", c.n_layers, c.dim)?;
    let wq = read_layer_group(reader, "wq", c.n_layers, c.dim * qkv_dim)?;
    let wk = read_layer_group(reader, "wk", c.n_layers, c.dim * kv_dim)?;
    let wv = read_layer_group(reader, "wv", c.n_layers, c.dim * kv_dim)?;
    let wo = read_layer_group(reader, "wo", c.n_layers, qkv_dim * c.dim)?;
    let rms_ffn = read_layer_group(reader, "rms_ffn", c.n_layers, c.dim)?;
    let w_gate = read_layer_group(reader, "w_gate", c.n_layers, c.dim * c.hidden_dim)?;
    let w_down = read_layer_group(reader, "w_down", c.n_layers, c.hidden_dim * c.dim)?;
    let w_up = read_layer_group(reader, "w_up", c.n_layers, c.dim * c.hidden_dim)?;

    let rms_final = reader.read_f32_vec("rms_final", c.dim)?;

    // Shared classifier weights when the file ends here.
    let lm_head_len = c.vocab_size * c.dim;
    let (lm_head, shared_weights) = if reader.remaining() >= lm_head_len * 4 {
        (reader.read_f32_vec("lm_head", lm_head_len)?, false)
    } else {
        info!("shared weights: lm_head aliases token_embedding");
        (token_embedding.clone(), true)
    };

    let mut iters = [
        rms_att.into_iter(),
        wq.into_iter(),
        wk.into_iter(),
        wv.into_iter(),
        wo.into_iter(),
        rms_ffn.into_iter(),
        w_gate.into_iter(),
        w_down.into_iter(),
        w_up.into_iter(),
    ];
    let mut next = move |kind: usize| iters[kind].next().expect("one tensor per layer");
    let layers = (0..c.n_layers)
        .map(|_| LayerWeights {
            rms_att: next(0),
            wq: next(1),
            wk: next(2),
            wv: next(3),
            wo: next(4),
            rms_ffn: next(5),
            w_gate: next(6),
            w_down: next(7),
            w_up: next(8),
        })
        .collect();

    Ok(ModelWeights {
        token_embedding,
        layers,
        rms_final,
        lm_head,
        shared_weights,
    })
}

fn read_layer_group(
    reader: &mut Reader<'_>,
    name: &str,
    n_layers: usize,
    elements: usize,
) -> Result<Vec<Vec<f32>>> {
    (0..n_layers)
        .map(|i| reader.read_f32_vec(&format!("{name}[{i}]"), elements))
        .collect()
}

/// Sequential little-endian reader over the mapped file.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4, "header")?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_f32_vec(&mut self, name: &str, elements: usize) -> Result<Vec<f32>> {
        let bytes = self.take(elements * 4, name)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect())
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::MalformedModel(format!(
                "file truncated reading {what}: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
