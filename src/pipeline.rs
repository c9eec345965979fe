// pipeline.rs - One pass over the unique mention set: normalize, override, similarity, store.
//
// All inputs (catalog matrix, policy, mention set) are prepared by the caller
// before `run` touches the store, so a failed preparation never leaves a
// half-cleared store behind.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::{MatchConfig, RunMode};
use crate::embeddings::Embedder;
use crate::matching::normalize::normalize;
use crate::matching::similarity::SimilarityMatcher;
use crate::policy::Policy;
use crate::sources::MentionSource;
use crate::store::{MappingStore, OnDuplicate, StoreError};
use crate::types::{CanonicalEntry, Mapping};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub unique_mentions: usize,
    pub skipped: usize,
    pub already_mapped: usize,
    pub override_count: usize,
    pub embedding_count: usize,
    pub unmatched_count: usize,
    pub tracked_group_count: usize,
    pub duplicate_writes: usize,
}

impl RunStats {
    pub fn matched(&self) -> usize {
        self.override_count + self.embedding_count
    }

    /// matched / (matched + unmatched); `None` when nothing reached matching.
    pub fn match_rate(&self) -> Option<f64> {
        let attempted = self.matched() + self.unmatched_count;
        if attempted == 0 {
            return None;
        }
        Some(self.matched() as f64 / attempted as f64)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "uniqueMentions": self.unique_mentions,
            "skipped": self.skipped,
            "alreadyMapped": self.already_mapped,
            "overrideCount": self.override_count,
            "embeddingCount": self.embedding_count,
            "unmatchedCount": self.unmatched_count,
            "trackedGroupCount": self.tracked_group_count,
            "duplicateWrites": self.duplicate_writes,
            "matched": self.matched(),
            "matchRate": self.match_rate(),
        })
    }
}

/// Distinct raw mentions across all products, in first-seen order.
///
/// Deduplication is on the literal string: "Salt" and "SALT" are two mentions.
pub fn collect_unique_mentions(source: &dyn MentionSource) -> anyhow::Result<Vec<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique: Vec<String> = Vec::new();
    let mut total = 0usize;

    let products = source.visit_products(&mut |mentions: &[String]| {
        for m in mentions {
            total += 1;
            if seen.insert(m.clone()) {
                unique.push(m.clone());
            }
        }
    })?;

    log::info!(
        "Collected {} unique mentions from {} mentions in {} products",
        unique.len(),
        total,
        products
    );
    Ok(unique)
}

/// Catalog matrix and model used by `explain` to preview the similarity stage.
pub struct SimilarityPreview<'a> {
    pub matcher: &'a SimilarityMatcher,
    pub embedder: &'a dyn Embedder,
    pub min_similarity: f64,
}

/// Stage-by-stage view of how one mention would be handled. Never touches the store.
///
/// With a `preview`, mentions that reach the similarity stage are scored too
/// and the result is reported under `similarity` (null when below threshold).
pub fn explain(policy: &Policy, raw: &str, preview: Option<&SimilarityPreview<'_>>) -> anyhow::Result<Value> {
    let n = normalize(raw, &policy.normalizer);
    let hit = if n.is_skipped() {
        None
    } else {
        policy.overrides.resolve(raw, &n.cleaned)
    };

    let next_stage = match (&n.skip, &hit) {
        (Some(_), _) => "none",
        (None, Some(_)) => "override",
        (None, None) => "similarity",
    };

    let mut out = json!({
        "original": raw,
        "cleaned": n.cleaned,
        "skip": n.skip.as_ref().map(|r| r.to_string()),
        "override": hit.map(|h| json!({
            "canonicalName": h.canonical_name,
            "matchKey": h.match_key,
            "stage": h.stage.as_str(),
        })),
        "nextStage": next_stage,
    });

    if let (Some(p), "similarity") = (preview, next_stage) {
        let found = p.matcher.match_one(p.embedder, &n.cleaned, p.min_similarity)?;
        out["similarity"] = match found {
            Some(m) => json!({
                "canonicalName": m.entry.name,
                "matchedId": m.entry.id,
                "score": m.score,
            }),
            None => Value::Null,
        };
    }
    Ok(out)
}

/// Hand-curated mapping for one mention, stored as an override.
///
/// `canonical_name` must name a catalog entry; the first-loaded entry wins.
pub fn manual_mapping(
    policy: &Policy,
    entries: &[CanonicalEntry],
    original: &str,
    canonical_name: &str,
) -> anyhow::Result<Mapping> {
    let entry = entries
        .iter()
        .find(|e| e.name == canonical_name)
        .with_context(|| format!("'{canonical_name}' is not a catalog entry"))?;
    let n = normalize(original, &policy.normalizer);
    if let Some(reason) = &n.skip {
        log::warn!("Pinning '{}' although normalization skips it ({})", original, reason);
    }
    Ok(Mapping::from_override(original.to_string(), n.cleaned, entry, Utc::now()))
}

pub struct MatchPipeline<'a> {
    policy: &'a Policy,
    config: &'a MatchConfig,
    matcher: &'a SimilarityMatcher,
    embedder: &'a dyn Embedder,
    // First-loaded entry wins for duplicate names.
    by_name: HashMap<&'a str, &'a CanonicalEntry>,
    created_at: DateTime<Utc>,
}

impl<'a> MatchPipeline<'a> {
    pub fn new(
        policy: &'a Policy,
        config: &'a MatchConfig,
        matcher: &'a SimilarityMatcher,
        embedder: &'a dyn Embedder,
    ) -> Self {
        let mut by_name: HashMap<&'a str, &'a CanonicalEntry> = HashMap::new();
        for entry in matcher.entries() {
            by_name.entry(entry.name.as_str()).or_insert(entry);
        }

        Self {
            policy,
            config,
            matcher,
            embedder,
            by_name,
            created_at: Utc::now(),
        }
    }

    /// Override target for a mention, if the rule names a catalog entry.
    pub fn resolve_override(&self, original: &str, cleaned: &str) -> Option<&'a CanonicalEntry> {
        let hit = self.policy.overrides.resolve(original, cleaned)?;
        match self.by_name.get(hit.canonical_name) {
            Some(entry) => Some(*entry),
            None => {
                log::debug!(
                    "Override '{}' -> '{}' names no catalog entry, falling back to similarity",
                    hit.match_key,
                    hit.canonical_name
                );
                None
            }
        }
    }

    /// Resolve every mention and write the mappings. `mentions` is expected to be
    /// deduplicated already.
    pub fn run(&self, mentions: &[String], store: &mut MappingStore) -> anyhow::Result<RunStats> {
        log::info!(
            "Matching {} mentions (mode={}, policy={}, minSimilarity={})",
            mentions.len(),
            self.config.mode,
            self.policy.version,
            self.config.min_similarity
        );

        let mut stats = RunStats {
            unique_mentions: mentions.len(),
            ..Default::default()
        };

        let on_duplicate = match self.config.mode {
            RunMode::Rebuild => {
                store.clear_all().context("clear mappings before rebuild")?;
                OnDuplicate::Fail
            }
            RunMode::Incremental => OnDuplicate::Skip,
        };

        let mut buffer: Vec<Mapping> = Vec::with_capacity(self.config.write_flush_every);
        let mut pending: Vec<(&str, String)> = Vec::with_capacity(self.config.batch_size);

        for original in mentions {
            if self.config.mode == RunMode::Incremental && store.contains(original)? {
                stats.already_mapped += 1;
                continue;
            }

            let n = normalize(original, &self.policy.normalizer);
            if let Some(reason) = &n.skip {
                stats.skipped += 1;
                log::debug!("Skipped '{}': {}", original, reason);
                continue;
            }

            match self.resolve_override(original, &n.cleaned) {
                Some(entry) => {
                    self.count_match(&mut stats, entry);
                    stats.override_count += 1;
                    buffer.push(Mapping::from_override(original.clone(), n.cleaned, entry, self.created_at));
                }
                None => pending.push((original.as_str(), n.cleaned)),
            }

            if pending.len() >= self.config.batch_size {
                self.match_pending(&mut pending, &mut buffer, &mut stats)?;
            }
            if buffer.len() >= self.config.write_flush_every {
                self.flush(store, &mut buffer, on_duplicate, &mut stats)?;
            }
        }

        self.match_pending(&mut pending, &mut buffer, &mut stats)?;
        self.flush(store, &mut buffer, on_duplicate, &mut stats)?;

        log::info!(
            "Run complete: {} override, {} embedding, {} unmatched, {} skipped, {} already mapped",
            stats.override_count,
            stats.embedding_count,
            stats.unmatched_count,
            stats.skipped,
            stats.already_mapped
        );
        Ok(stats)
    }

    fn match_pending(
        &self,
        pending: &mut Vec<(&str, String)>,
        buffer: &mut Vec<Mapping>,
        stats: &mut RunStats,
    ) -> anyhow::Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|(_, cleaned)| cleaned.clone()).collect();
        let results = self
            .matcher
            .match_batch(self.embedder, &texts, self.config.min_similarity)
            .context("similarity batch")?;

        let mut matched = 0usize;
        for ((original, cleaned), result) in pending.drain(..).zip(results) {
            match result {
                Some(hit) => {
                    self.count_match(stats, hit.entry);
                    stats.embedding_count += 1;
                    matched += 1;
                    buffer.push(Mapping::from_embedding(
                        original.to_string(),
                        cleaned,
                        hit.entry,
                        hit.score,
                        self.created_at,
                    ));
                }
                None => {
                    stats.unmatched_count += 1;
                    log::debug!("Unmatched '{}' (cleaned '{}')", original, cleaned);
                }
            }
        }

        log::debug!("Similarity batch: {} of {} matched", matched, texts.len());
        Ok(())
    }

    fn count_match(&self, stats: &mut RunStats, entry: &CanonicalEntry) {
        if self.policy.is_tracked_group(&entry.food_group) {
            stats.tracked_group_count += 1;
        }
    }

    fn flush(
        &self,
        store: &mut MappingStore,
        buffer: &mut Vec<Mapping>,
        on_duplicate: OnDuplicate,
        stats: &mut RunStats,
    ) -> anyhow::Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        match store.bulk_write(buffer, on_duplicate) {
            Ok(outcome) => {
                stats.duplicate_writes += outcome.duplicates;
                buffer.clear();
                Ok(())
            }
            Err(e @ StoreError::DuplicateKey { .. }) => {
                log::error!("Duplicate mapping during rebuild: {}", e);
                Err(anyhow::Error::new(e).context("mapping uniqueness violated after clearing the store"))
            }
            Err(e) => Err(anyhow::Error::new(e).context("write mappings")),
        }
    }
}
