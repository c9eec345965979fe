// policy.rs - Versioned skip rules, cleaning options and override table.
//
// Policies are data. Two ship with the binary; any other JSON file with the
// same shape can be loaded by path.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::matching::normalize::{NormalizePolicy, PrefixMode};
use crate::matching::overrides::{ConflictingRule, OverrideRule, OverrideTable};

const BUILTIN_POLICIES: &[(&str, &str)] = &[
    ("allergen-v1", include_str!("../policies/allergen_v1.json")),
    ("allergen-fodmap-v3", include_str!("../policies/allergen_fodmap_v3.json")),
];

// "key length > 4" in the first matcher generation.
const DEFAULT_MIN_SUBSTRING_KEY_CHARS: usize = 5;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid policy document {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_json::Error,
    },

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("skip length range is empty: minLen {min} > maxLen {max}")]
    LengthRange { min: usize, max: usize },

    #[error("minSimilarity must be within [0, 1], got {0}")]
    Threshold(f64),

    #[error(transparent)]
    Conflict(#[from] ConflictingRule),

    #[error("unknown policy '{0}' (built-ins: {builtins})", builtins = builtin_names().join(", "))]
    Unknown(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    version: String,
    #[serde(default)]
    description: String,
    min_similarity: f64,
    skip: SkipSection,
    #[serde(default)]
    cleaning: CleaningSection,
    #[serde(default)]
    overrides: OverridesSection,
    #[serde(default)]
    tracked_group_keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkipSection {
    min_len: usize,
    max_len: usize,
    #[serde(default)]
    exact: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleaningSection {
    #[serde(default)]
    promote_parenthetical: bool,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    prefix_mode: PrefixMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverridesSection {
    #[serde(default = "default_min_substring_key_chars")]
    min_substring_key_chars: usize,
    #[serde(default)]
    categories: Vec<OverrideCategory>,
}

impl Default for OverridesSection {
    fn default() -> Self {
        Self {
            min_substring_key_chars: DEFAULT_MIN_SUBSTRING_KEY_CHARS,
            categories: Vec::new(),
        }
    }
}

fn default_min_substring_key_chars() -> usize {
    DEFAULT_MIN_SUBSTRING_KEY_CHARS
}

#[derive(Debug, Deserialize)]
struct OverrideCategory {
    category: String,
    #[serde(default)]
    rules: Vec<OverrideRule>,
}

/// A loaded, validated policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub version: String,
    pub description: String,
    pub min_similarity: f64,
    pub normalizer: NormalizePolicy,
    pub overrides: OverrideTable,
    pub tracked_group_keywords: Vec<String>,
    /// (category, rule count) in document order.
    pub categories: Vec<(String, usize)>,
}

impl Policy {
    /// Whether a canonical food group belongs to one of the tracked families.
    pub fn is_tracked_group(&self, food_group: &str) -> bool {
        self.tracked_group_keywords.iter().any(|kw| food_group.contains(kw.as_str()))
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "description": self.description,
            "minSimilarity": self.min_similarity,
            "skip": {
                "minLen": self.normalizer.min_len,
                "maxLen": self.normalizer.max_len,
                "exact": self.normalizer.skip_exact_len(),
                "patterns": self.normalizer.skip_pattern_len(),
            },
            "cleaning": {
                "prefixes": self.normalizer.prefix_len(),
                "prefixMode": match self.normalizer.prefix_mode() {
                    PrefixMode::SinglePass => "singlePass",
                    PrefixMode::UntilStable => "untilStable",
                },
            },
            "overrides": {
                "rules": self.overrides.len(),
                "minSubstringKeyChars": self.overrides.min_substring_key_chars(),
                "categories": self.categories.iter()
                    .map(|(name, n)| serde_json::json!({ "category": name, "rules": n }))
                    .collect::<Vec<_>>(),
            },
            "trackedGroupKeywords": self.tracked_group_keywords,
        })
    }
}

pub fn builtin_names() -> Vec<&'static str> {
    BUILTIN_POLICIES.iter().map(|(name, _)| *name).collect()
}

/// Load a built-in policy by name, or a policy file by path.
pub fn load_policy(name_or_path: &str) -> Result<Policy, PolicyError> {
    if let Some((name, text)) = BUILTIN_POLICIES.iter().find(|(name, _)| *name == name_or_path) {
        log::info!("Using built-in policy {}", name);
        return parse_policy(text, name);
    }

    let path = Path::new(name_or_path);
    if !path.is_file() {
        return Err(PolicyError::Unknown(name_or_path.to_string()));
    }

    log::info!("Loading policy file {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_policy(&text, &path.display().to_string())
}

/// Parse and validate a policy document. `origin` only labels errors.
pub fn parse_policy(text: &str, origin: &str) -> Result<Policy, PolicyError> {
    let doc: PolicyDocument = serde_json::from_str(text).map_err(|source| PolicyError::Parse {
        origin: origin.to_string(),
        source,
    })?;

    if !(0.0..=1.0).contains(&doc.min_similarity) {
        return Err(PolicyError::Threshold(doc.min_similarity));
    }
    if doc.skip.min_len > doc.skip.max_len {
        return Err(PolicyError::LengthRange {
            min: doc.skip.min_len,
            max: doc.skip.max_len,
        });
    }

    let patterns = doc
        .skip
        .patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| PolicyError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let normalizer = NormalizePolicy::new(
        doc.skip.min_len,
        doc.skip.max_len,
        doc.skip.exact,
        patterns,
        doc.cleaning.promote_parenthetical,
        &doc.cleaning.prefixes,
        doc.cleaning.prefix_mode,
    )
    .map_err(|source| PolicyError::InvalidPattern {
        pattern: "<prefix>".to_string(),
        source,
    })?;

    let categories: Vec<(String, usize)> = doc
        .overrides
        .categories
        .iter()
        .map(|c| (c.category.clone(), c.rules.len()))
        .collect();
    let rules = doc.overrides.categories.into_iter().flat_map(|c| c.rules);
    let overrides = OverrideTable::from_rules(rules, doc.overrides.min_substring_key_chars)?;

    log::info!(
        "Policy {}: {} override rules, {} exact skips, {} skip patterns, threshold {}",
        doc.version,
        overrides.len(),
        normalizer.skip_exact_len(),
        normalizer.skip_pattern_len(),
        doc.min_similarity
    );

    Ok(Policy {
        version: doc.version,
        description: doc.description,
        min_similarity: doc.min_similarity,
        normalizer,
        overrides,
        tracked_group_keywords: doc.tracked_group_keywords,
        categories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::normalize::{normalize, SkipReason};

    #[test]
    fn test_builtins_load_and_match_their_names() {
        for name in builtin_names() {
            let p = load_policy(name).unwrap();
            assert_eq!(p.version, name);
        }
    }

    #[test]
    fn test_v3_policy_contents() {
        let p = load_policy("allergen-fodmap-v3").unwrap();
        assert_eq!(p.min_similarity, 0.50);
        assert_eq!(p.normalizer.max_len, 80);
        assert_eq!(normalize("VITAMIN C", &p.normalizer).skip, Some(SkipReason::ExactSkip));
        let hit = p.overrides.resolve("XANTHAN GUM", "XANTHAN GUM").unwrap();
        assert_eq!(hit.canonical_name, "Xanthan gum");
        assert!(p.is_tracked_group("FODMAP - Polyol"));
        assert!(!p.is_tracked_group("Vegetables"));
    }

    #[test]
    fn test_v1_policy_is_pattern_only() {
        let p = load_policy("allergen-v1").unwrap();
        assert_eq!(p.min_similarity, 0.35);
        assert_eq!(p.normalizer.skip_exact_len(), 0);
        // Preservative salts are skipped by pattern in the first generation.
        assert!(matches!(
            normalize("SODIUM BENZOATE", &p.normalizer).skip,
            Some(SkipReason::Pattern(_))
        ));
        // Sweeteners are not part of the allergen-only table.
        assert!(p.overrides.resolve("ERYTHRITOL", "ERYTHRITOL").is_none());
        assert!(p.overrides.resolve("PEANUTS", "PEANUTS").is_some());
    }

    #[test]
    fn test_unknown_policy_name() {
        assert!(matches!(load_policy("allergen-v9"), Err(PolicyError::Unknown(_))));
    }

    #[test]
    fn test_policy_file_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(
            &path,
            r#"{"version":"custom","minSimilarity":0.4,"skip":{"minLen":2,"maxLen":40},
                "overrides":{"categories":[{"category":"gums","rules":[["XANTHAN GUM","Xanthan gum"]]}]}}"#,
        )
        .unwrap();
        let p = load_policy(path.to_str().unwrap()).unwrap();
        assert_eq!(p.version, "custom");
        assert_eq!(p.overrides.len(), 1);
        assert_eq!(p.overrides.min_substring_key_chars(), DEFAULT_MIN_SUBSTRING_KEY_CHARS);
        assert_eq!(p.normalizer.prefix_mode(), PrefixMode::SinglePass);
    }

    #[test]
    fn test_validation_errors() {
        let bad_pattern = r#"{"version":"x","minSimilarity":0.5,"skip":{"minLen":2,"maxLen":80,"patterns":["(unclosed"]}}"#;
        assert!(matches!(parse_policy(bad_pattern, "t"), Err(PolicyError::InvalidPattern { .. })));

        let bad_range = r#"{"version":"x","minSimilarity":0.5,"skip":{"minLen":10,"maxLen":2}}"#;
        assert!(matches!(parse_policy(bad_range, "t"), Err(PolicyError::LengthRange { .. })));

        let bad_threshold = r#"{"version":"x","minSimilarity":1.5,"skip":{"minLen":2,"maxLen":80}}"#;
        assert!(matches!(parse_policy(bad_threshold, "t"), Err(PolicyError::Threshold(_))));

        let conflict = r#"{"version":"x","minSimilarity":0.5,"skip":{"minLen":2,"maxLen":80},
            "overrides":{"categories":[
                {"category":"a","rules":[["GUM ARABIC","Guar gum"]]},
                {"category":"b","rules":[["GUM ARABIC","Acacia"]]}]}}"#;
        assert!(matches!(parse_policy(conflict, "t"), Err(PolicyError::Conflict(_))));

        assert!(matches!(parse_policy("not json", "t"), Err(PolicyError::Parse { .. })));
    }
}
