// embeddings/ - Local sentence embedding engine using candle (pure Rust).
//
// Provides:
// - The `Embedder` seam the similarity matcher is written against
// - Model download + SHA256 verification
// - Batched BERT inference with mean pooling

pub mod download;
pub mod engine;

use anyhow::Context;

/// Black-box text → fixed-dimension vector function.
///
/// Implementations must be deterministic: the same text always yields the same vector.
pub trait Embedder {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed every text in one call. Returns exactly one vector per input, in order.
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        vectors.pop().context("embedder returned no vector")
    }
}
