// normalize.rs - Deterministic cleanup and skip classification of a raw mention.
//
// Cleaning order is fixed: uppercase, parenthetical promotion, bracket strip,
// digit strip, punctuation strip, descriptor prefixes, whitespace collapse.
// Changing the order changes stored `cleaned` values.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::config;

// Fixed literals; every one is compiled by `test_cleaning_patterns_compile`.
static PAREN_PROMOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Z][A-Z\s]+)").expect("parenthetical promote pattern"));
static PAREN_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("parenthesis group pattern"));
static BRACKET_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("bracket group pattern"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\.?\d*%?").expect("digit pattern"));
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").expect("punctuation pattern"));

// Promoted parenthetical text must be longer than this.
const PROMOTE_MIN_EXCLUSIVE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrefixMode {
    /// Each prefix is tried once, in list order. Stripping one can expose an
    /// earlier prefix that is not re-tested.
    #[default]
    SinglePass,
    /// Re-scan the whole list until no prefix matches.
    UntilStable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Trimmed mention length outside the policy's `[min_len, max_len]`.
    Length,
    /// Uppercased mention is in the exact skip set.
    ExactSkip,
    /// One of the skip patterns matched; carries the pattern source.
    Pattern(String),
    /// Nothing matchable survived cleaning.
    EmptyAfterCleaning,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Length => write!(f, "length"),
            SkipReason::ExactSkip => write!(f, "exact-skip"),
            SkipReason::Pattern(p) => write!(f, "pattern:{p}"),
            SkipReason::EmptyAfterCleaning => write!(f, "empty-after-cleaning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub cleaned: String,
    pub skip: Option<SkipReason>,
}

impl Normalized {
    pub fn is_skipped(&self) -> bool {
        self.skip.is_some()
    }
}

/// Compiled skip rules and cleaning options of one policy version.
#[derive(Debug, Clone)]
pub struct NormalizePolicy {
    pub min_len: usize,
    pub max_len: usize,
    skip_exact: HashSet<String>,
    skip_patterns: Vec<Regex>,
    promote_parenthetical: bool,
    prefixes: Vec<Regex>,
    prefix_mode: PrefixMode,
}

impl NormalizePolicy {
    /// `prefixes` are matched as whole leading words, in the given order.
    pub fn new(
        min_len: usize,
        max_len: usize,
        skip_exact: impl IntoIterator<Item = String>,
        skip_patterns: Vec<Regex>,
        promote_parenthetical: bool,
        prefixes: &[String],
        prefix_mode: PrefixMode,
    ) -> Result<Self, regex::Error> {
        let prefixes = prefixes
            .iter()
            .map(|p| Regex::new(&format!(r"^{}\s+", regex::escape(&p.trim().to_uppercase()))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            min_len,
            max_len,
            skip_exact: skip_exact.into_iter().map(|s| s.trim().to_uppercase()).collect(),
            skip_patterns,
            promote_parenthetical,
            prefixes,
            prefix_mode,
        })
    }

    pub fn skip_exact_len(&self) -> usize {
        self.skip_exact.len()
    }

    pub fn skip_pattern_len(&self) -> usize {
        self.skip_patterns.len()
    }

    pub fn prefix_len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn prefix_mode(&self) -> PrefixMode {
        self.prefix_mode
    }
}

/// Clean a raw mention and decide whether it should be skipped.
///
/// The cleaned text is always computed, even for skipped mentions, so callers
/// can show what the matcher would have seen.
pub fn normalize(raw: &str, policy: &NormalizePolicy) -> Normalized {
    let cleaned = clean(raw, policy);
    let skip = skip_reason(raw, policy).or_else(|| {
        (cleaned.chars().count() < config::matching::MIN_CLEANED_CHARS).then_some(SkipReason::EmptyAfterCleaning)
    });
    Normalized { cleaned, skip }
}

fn skip_reason(raw: &str, policy: &NormalizePolicy) -> Option<SkipReason> {
    let upper = raw.trim().to_uppercase();

    let len = upper.chars().count();
    if len < policy.min_len || len > policy.max_len {
        return Some(SkipReason::Length);
    }

    if policy.skip_exact.contains(&upper) {
        return Some(SkipReason::ExactSkip);
    }

    policy
        .skip_patterns
        .iter()
        .find(|re| re.is_match(&upper))
        .map(|re| SkipReason::Pattern(re.as_str().to_string()))
}

fn clean(raw: &str, policy: &NormalizePolicy) -> String {
    let mut s = raw.trim().to_uppercase();

    // "X (ACTUAL INGREDIENT)" labels: the parenthetical is the real ingredient.
    if policy.promote_parenthetical {
        let promoted = PAREN_PROMOTE
            .captures(&s)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|inner| inner.chars().count() > PROMOTE_MIN_EXCLUSIVE);
        if let Some(inner) = promoted {
            s = inner;
        }
    }

    let s = PAREN_GROUP.replace_all(&s, " ");
    let s = BRACKET_GROUP.replace_all(&s, " ");
    let s = DIGITS.replace_all(&s, "");
    let s = NON_WORD.replace_all(&s, " ");
    let s = strip_prefixes(s.into_owned(), policy);

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_prefixes(mut s: String, policy: &NormalizePolicy) -> String {
    match policy.prefix_mode {
        PrefixMode::SinglePass => {
            for re in &policy.prefixes {
                s = re.replace(&s, "").into_owned();
            }
        }
        PrefixMode::UntilStable => loop {
            let mut changed = false;
            for re in &policy.prefixes {
                if re.is_match(&s) {
                    s = re.replace(&s, "").into_owned();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        },
    }
    s
}
