// similarity.rs - Nearest canonical entry by cosine similarity.
//
// The catalog matrix is embedded once and read-only afterwards, so batches are
// scored in parallel with no shared mutable state.

use anyhow::{bail, Context};
use rayon::prelude::*;

use crate::config;
use crate::embeddings::Embedder;
use crate::types::CanonicalEntry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityMatch<'a> {
    pub entry: &'a CanonicalEntry,
    pub score: f64,
}

pub struct SimilarityMatcher {
    entries: Vec<CanonicalEntry>,
    // Row-major [entries.len() x dims].
    matrix: Vec<f32>,
    norms: Vec<f64>,
    dims: usize,
}

impl SimilarityMatcher {
    /// Embed every catalog name and build the matrix.
    pub fn build(entries: Vec<CanonicalEntry>, embedder: &dyn Embedder) -> anyhow::Result<Self> {
        log::info!(
            "Embedding {} catalog entries with {}",
            entries.len(),
            embedder.model_name()
        );

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(entries.len());
        for chunk in entries.chunks(config::embedding::CATALOG_EMBED_CHUNK) {
            let names: Vec<String> = chunk.iter().map(|e| e.name.clone()).collect();
            let embedded = embedder
                .embed_batch(&names)
                .context("embed catalog names")?;
            if embedded.len() != names.len() {
                bail!(
                    "embedder returned {} vectors for {} catalog names",
                    embedded.len(),
                    names.len()
                );
            }
            vectors.extend(embedded);
        }

        Self::from_vectors(entries, vectors, embedder.dimensions())
    }

    /// Build from precomputed vectors, one per entry, all of length `dims`.
    pub fn from_vectors(entries: Vec<CanonicalEntry>, vectors: Vec<Vec<f32>>, dims: usize) -> anyhow::Result<Self> {
        if entries.len() != vectors.len() {
            bail!("{} catalog entries but {} vectors", entries.len(), vectors.len());
        }

        let mut matrix: Vec<f32> = Vec::with_capacity(entries.len() * dims);
        let mut norms: Vec<f64> = Vec::with_capacity(entries.len());
        for (entry, v) in entries.iter().zip(&vectors) {
            if v.len() != dims {
                bail!(
                    "catalog vector for '{}' has {} dims, expected {}",
                    entry.name,
                    v.len(),
                    dims
                );
            }
            norms.push(l2_norm(v));
            matrix.extend_from_slice(v);
        }

        let zero_rows = norms.iter().filter(|n| **n == 0.0).count();
        if zero_rows > 0 {
            log::warn!("{} catalog entries have a zero embedding and can never match", zero_rows);
        }

        log::info!("Similarity matrix ready: {} entries x {} dims", entries.len(), dims);
        Ok(Self {
            entries,
            matrix,
            norms,
            dims,
        })
    }

    pub fn entries(&self) -> &[CanonicalEntry] {
        &self.entries
    }

    /// Best catalog row for `query`, ignoring any threshold.
    ///
    /// Exact ties go to the lowest index. Returns `None` for a zero-norm query
    /// or an empty catalog.
    pub fn best_match(&self, query: &[f32]) -> Option<(usize, f64)> {
        let query_norm = l2_norm(query);
        if query_norm == 0.0 || self.dims == 0 {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, row) in self.matrix.chunks_exact(self.dims).enumerate() {
            let row_norm = self.norms[idx];
            if row_norm == 0.0 {
                continue;
            }
            let score = (dot(row, query) / (row_norm * query_norm)).clamp(-1.0, 1.0);
            if score.is_nan() {
                continue;
            }
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }
        best
    }

    /// Embed and match a batch of cleaned texts. One result per input, in order;
    /// `None` means below `threshold` or not scoreable.
    pub fn match_batch(
        &self,
        embedder: &dyn Embedder,
        texts: &[String],
        threshold: f64,
    ) -> anyhow::Result<Vec<Option<SimilarityMatch<'_>>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let queries = embedder.embed_batch(texts).context("embed mention batch")?;
        if queries.len() != texts.len() {
            bail!("embedder returned {} vectors for {} texts", queries.len(), texts.len());
        }
        if let Some(q) = queries.iter().find(|q| q.len() != self.dims) {
            bail!("query vector has {} dims, catalog has {}", q.len(), self.dims);
        }

        let results = queries
            .par_iter()
            .map(|q| self.accept(q, threshold))
            .collect();
        Ok(results)
    }

    /// Single-mention form of `match_batch`, used by `explain`.
    pub fn match_one(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        threshold: f64,
    ) -> anyhow::Result<Option<SimilarityMatch<'_>>> {
        let query = embedder.embed(text).context("embed mention")?;
        if query.len() != self.dims {
            bail!("query vector has {} dims, catalog has {}", query.len(), self.dims);
        }
        Ok(self.accept(&query, threshold))
    }

    fn accept(&self, query: &[f32], threshold: f64) -> Option<SimilarityMatch<'_>> {
        self.best_match(query)
            .filter(|(_, score)| *score >= threshold)
            .map(|(index, score)| SimilarityMatch {
                entry: &self.entries[index],
                score,
            })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        dims: usize,
    }

    impl Embedder for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }

        fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| self.table.get(t).cloned().unwrap_or_else(|| vec![0.0; self.dims]))
                .collect())
        }
    }

    fn entry(id: &str, name: &str) -> CanonicalEntry {
        CanonicalEntry {
            id: id.into(),
            name: name.into(),
            food_group: "Test".into(),
        }
    }

    fn matcher() -> (SimilarityMatcher, TableEmbedder) {
        let mut table = HashMap::new();
        table.insert("Quinoa".to_string(), vec![1.0, 0.0, 0.0]);
        table.insert("Oat".to_string(), vec![0.0, 1.0, 0.0]);
        table.insert("Oat copy".to_string(), vec![0.0, 2.0, 0.0]);
        table.insert("QUINOA FLAKES".to_string(), vec![0.62, 0.0, 0.784_602]);
        table.insert("OAT BRAN".to_string(), vec![0.0, 1.0, 1.0]);
        table.insert("ZXQVW".to_string(), vec![0.1, 0.0, 0.994_987]);
        let embedder = TableEmbedder { table, dims: 3 };
        let entries = vec![entry("1", "Quinoa"), entry("2", "Oat"), entry("3", "Oat copy")];
        let m = SimilarityMatcher::build(entries, &embedder).unwrap();
        (m, embedder)
    }

    #[test]
    fn test_scores_are_scale_invariant_cosines() {
        let (m, _) = matcher();
        let (idx, score) = m.best_match(&[3.0, 0.0, 0.0]).unwrap();
        assert_eq!(idx, 0);
        assert!((score - 1.0).abs() < 1e-12);
        let (_, score) = m.best_match(&[1.0, 1.0, 0.0]).unwrap();
        assert!((score - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn test_zero_norm_is_undefined() {
        let (m, e) = matcher();
        assert_eq!(m.best_match(&[0.0, 0.0, 0.0]), None);
        // Unknown texts embed to the zero vector.
        assert!(m.match_one(&e, "UNKNOWN", 0.0).unwrap().is_none());
    }

    #[test]
    fn test_accepts_at_or_above_threshold() {
        let (m, e) = matcher();
        let hit = m.match_one(&e, "QUINOA FLAKES", 0.50).unwrap().unwrap();
        assert_eq!(hit.entry.name, "Quinoa");
        assert!((hit.score - 0.62).abs() < 1e-4);
        assert!(m.match_one(&e, "QUINOA FLAKES", 0.70).unwrap().is_none());
    }

    #[test]
    fn test_below_threshold_is_unmatched() {
        let (m, e) = matcher();
        assert!(m.match_one(&e, "ZXQVW", 0.50).unwrap().is_none());
        let (_, score) = m.best_match(&[0.1, 0.0, 0.994_987]).unwrap();
        assert!((score - 0.10).abs() < 1e-4);
    }

    #[test]
    fn test_ties_go_to_first_loaded_entry() {
        let (m, e) = matcher();
        // "Oat" and "Oat copy" point the same direction; the earlier row wins.
        let hit = m.match_one(&e, "OAT BRAN", 0.1).unwrap().unwrap();
        assert_eq!(hit.entry.id, "2");
        assert_eq!(m.best_match(&[0.0, 1.0, 1.0]).map(|(idx, _)| idx), Some(1));
    }

    #[test]
    fn test_batch_results_follow_input_order() {
        let (m, e) = matcher();
        let texts: Vec<String> = ["OAT BRAN", "UNKNOWN", "QUINOA FLAKES"].iter().map(|s| s.to_string()).collect();
        let results = m.match_batch(&e, &texts, 0.5).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].unwrap().entry.name, "Oat");
        assert!(results[1].is_none());
        assert_eq!(results[2].unwrap().entry.name, "Quinoa");
    }

    #[test]
    fn test_single_and_batch_agree() {
        let (m, e) = matcher();
        let one = m.match_one(&e, "QUINOA FLAKES", 0.5).unwrap();
        let batch = m.match_batch(&e, &["QUINOA FLAKES".to_string()], 0.5).unwrap();
        assert_eq!(one, batch[0]);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let entries = vec![entry("1", "Quinoa")];
        assert!(SimilarityMatcher::from_vectors(entries, vec![vec![1.0, 0.0]], 3).is_err());
    }
}
