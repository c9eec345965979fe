// engine.rs - Candle BERT embedding engine with attention-mask-aware mean pooling.
//
// Loads all-MiniLM-L6-v2 from safetensors, generates 384-dim sentence embeddings.
// Batches are padded to the longest sequence; pooling ignores the padding positions.

use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::config;
use crate::embeddings::Embedder;

/// The embedding engine holds the loaded model and tokenizer.
pub struct EmbeddingEngine {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dims: usize,
    model_name: String,
}

impl EmbeddingEngine {
    /// Load the model from a local directory containing model.safetensors,
    /// tokenizer.json, and config.json.
    pub fn load(model_dir: &Path) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let config_path = model_dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("parse {}", config_path.display()))?;

        log::info!(
            "Loading embedding model: hidden_size={}, layers={}, heads={}",
            bert_config.hidden_size,
            bert_config.num_hidden_layers,
            bert_config.num_attention_heads,
        );

        let weights_path = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.clone()], DType::F32, &device)
                .with_context(|| format!("load weights from {}", weights_path.display()))?
        };

        let model = BertModel::load(vb, &bert_config).context("load BERT model")?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config::embedding::MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("configure tokenizer truncation: {e}"))?;

        if bert_config.hidden_size != config::embedding::EMBEDDING_DIMS {
            log::warn!(
                "Model hidden size {} differs from expected {}",
                bert_config.hidden_size,
                config::embedding::EMBEDDING_DIMS
            );
        }

        log::info!("Embedding model loaded successfully (dims={})", bert_config.hidden_size);

        Ok(Self {
            model,
            tokenizer,
            device,
            dims: bert_config.hidden_size,
            model_name: config::embedding::EMBEDDING_MODEL_NAME.to_string(),
        })
    }

    fn embed_non_empty(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;

        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut token_ids: Vec<i64> = Vec::with_capacity(batch * seq_len);
        let mut attention_mask: Vec<i64> = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            if encoding.get_ids().len() != seq_len {
                bail!(
                    "tokenizer produced ragged batch: {} vs {} tokens",
                    encoding.get_ids().len(),
                    seq_len
                );
            }
            token_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        // [batch, seq_len]
        let token_ids_t = Tensor::from_vec(token_ids, (batch, seq_len), &self.device)?;
        let attention_mask_t = Tensor::from_vec(attention_mask, (batch, seq_len), &self.device)?;
        let token_type_ids = token_ids_t.zeros_like()?;

        // Forward pass → [batch, seq_len, hidden_size]
        let output = self
            .model
            .forward(&token_ids_t, &token_type_ids, Some(&attention_mask_t))?;

        let embedding = mean_pooling(&output, &attention_mask_t)?;

        // L2 normalize (sentence-transformers default)
        let embedding = l2_normalize(&embedding)?;

        let rows: Vec<Vec<f32>> = embedding.to_vec2()?;
        if let Some(row) = rows.iter().find(|r| r.len() != self.dims) {
            bail!("unexpected embedding dims: got {}, expected {}", row.len(), self.dims);
        }
        Ok(rows)
    }
}

impl Embedder for EmbeddingEngine {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        // Empty inputs get a zero vector; they never reach the model.
        let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        let mut live_slots: Vec<usize> = Vec::with_capacity(texts.len());
        let mut live_texts: Vec<&str> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                out[i] = vec![0.0; self.dims];
            } else {
                live_slots.push(i);
                live_texts.push(text.as_str());
            }
        }

        if live_texts.is_empty() {
            return Ok(out);
        }

        let rows = self.embed_non_empty(&live_texts)?;
        for (slot, row) in live_slots.into_iter().zip(rows) {
            out[slot] = row;
        }
        Ok(out)
    }
}

/// Attention-mask-aware mean pooling.
///
/// input_embeds: [batch, seq_len, hidden_size]
/// attention_mask: [batch, seq_len] (1 for real tokens, 0 for padding)
/// output: [batch, hidden_size]
fn mean_pooling(input_embeds: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
    let mask_expanded = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .broadcast_as(input_embeds.shape())?;

    let sum_embeddings = (input_embeds * &mask_expanded)?.sum(1)?;

    // clamp to avoid div by zero
    let sum_mask = mask_expanded.sum(1)?.clamp(1e-9, f64::MAX)?;

    Ok((sum_embeddings / sum_mask)?)
}

/// L2 normalize a tensor along the last dimension.
fn l2_normalize(tensor: &Tensor) -> anyhow::Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(1)?.sqrt()?;
    let norm = norm.clamp(1e-12, f64::MAX)?;
    Ok(tensor.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pooling_ignores_padding() {
        let device = Device::Cpu;
        // One sequence, three positions, hidden=2; the last position is padding.
        let embeds = Tensor::new(&[[[1.0f32, 2.0], [3.0, 4.0], [100.0, 100.0]]], &device).unwrap();
        let mask = Tensor::new(&[[1i64, 1, 0]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = mean_pooling(&embeds, &mask).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[3.0f32, 4.0], [0.0, 2.0]], &device).unwrap();
        let rows: Vec<Vec<f32>> = l2_normalize(&t).unwrap().to_vec2().unwrap();
        assert!((rows[0][0] - 0.6).abs() < 1e-6);
        assert!((rows[0][1] - 0.8).abs() < 1e-6);
        assert!((rows[1][1] - 1.0).abs() < 1e-6);
    }
}
