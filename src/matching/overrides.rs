// overrides.rs - Curated exact/substring rules that bypass similarity scoring.

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::Deserialize;

/// One curated rule. Deserializes from either `{"matchKey", "canonicalName"}`
/// or the compact `[matchKey, canonicalName]` form used by the policy files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRule {
    pub match_key: String,
    pub canonical_name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("override key '{key}' maps to both '{first}' and '{second}'")]
pub struct ConflictingRule {
    pub key: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideStage {
    ExactOriginal,
    ExactCleaned,
    Substring,
}

impl OverrideStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideStage::ExactOriginal => "exact-original",
            OverrideStage::ExactCleaned => "exact-cleaned",
            OverrideStage::Substring => "substring",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideHit<'a> {
    pub canonical_name: &'a str,
    pub match_key: &'a str,
    pub stage: OverrideStage,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    exact: HashMap<String, String>,
    // Longest key first, then lexicographic, so the first containment hit wins.
    substring: Vec<(String, String)>,
    min_substring_key_chars: usize,
}

impl OverrideTable {
    /// Keys are uppercased. A key repeated with the same canonical name is
    /// accepted once; a key repeated with a different name is an error.
    pub fn from_rules(
        rules: impl IntoIterator<Item = OverrideRule>,
        min_substring_key_chars: usize,
    ) -> Result<Self, ConflictingRule> {
        let mut exact: HashMap<String, String> = HashMap::new();
        for rule in rules {
            let key = rule.match_key.trim().to_uppercase();
            if key.is_empty() {
                continue;
            }
            match exact.get(&key) {
                Some(existing) if *existing != rule.canonical_name => {
                    return Err(ConflictingRule {
                        key,
                        first: existing.clone(),
                        second: rule.canonical_name,
                    });
                }
                Some(_) => {}
                None => {
                    exact.insert(key, rule.canonical_name);
                }
            }
        }

        let mut substring: Vec<(String, String)> = exact
            .iter()
            .filter(|(k, _)| k.chars().count() >= min_substring_key_chars)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        substring.sort_by(|a, b| {
            Reverse(a.0.chars().count())
                .cmp(&Reverse(b.0.chars().count()))
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(Self {
            exact,
            substring,
            min_substring_key_chars,
        })
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn min_substring_key_chars(&self) -> usize {
        self.min_substring_key_chars
    }

    /// Resolve a mention to a canonical name.
    ///
    /// Order: uppercased original exactly, cleaned text exactly, then the
    /// longest rule key contained in the uppercased original.
    pub fn resolve(&self, original: &str, cleaned: &str) -> Option<OverrideHit<'_>> {
        let upper = original.trim().to_uppercase();

        if let Some((key, name)) = self.exact.get_key_value(&upper) {
            return Some(OverrideHit {
                canonical_name: name,
                match_key: key,
                stage: OverrideStage::ExactOriginal,
            });
        }

        if let Some((key, name)) = self.exact.get_key_value(cleaned) {
            return Some(OverrideHit {
                canonical_name: name,
                match_key: key,
                stage: OverrideStage::ExactCleaned,
            });
        }

        self.substring
            .iter()
            .find(|(key, _)| upper.contains(key.as_str()))
            .map(|(key, name)| OverrideHit {
                canonical_name: name,
                match_key: key,
                stage: OverrideStage::Substring,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(key: &str, name: &str) -> OverrideRule {
        OverrideRule {
            match_key: key.to_string(),
            canonical_name: name.to_string(),
        }
    }

    fn table() -> OverrideTable {
        OverrideTable::from_rules(
            vec![
                rule("XANTHAN GUM", "Xanthan gum"),
                rule("MILK", "Milk (Cow)"),
                rule("WHEY", "Whey"),
                rule("WHEY PROTEIN", "Whey"),
                rule("SOY", "Soybean"),
                rule("SOY LECITHIN", "Other soy product"),
                rule("PEANUT", "Peanut"),
                rule("PECAN", "Pecan nut"),
                rule("GUAR GUM", "Guar gum"),
            ],
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_exact_original_wins() {
        let t = table();
        let hit = t.resolve("xanthan gum", "XANTHAN GUM").unwrap();
        assert_eq!(hit.canonical_name, "Xanthan gum");
        assert_eq!(hit.stage, OverrideStage::ExactOriginal);
    }

    #[test]
    fn test_exact_cleaned_after_original() {
        let t = table();
        let hit = t.resolve("Organic Milk 2%", "MILK").unwrap();
        assert_eq!(hit.canonical_name, "Milk (Cow)");
        assert_eq!(hit.stage, OverrideStage::ExactCleaned);
    }

    #[test]
    fn test_short_keys_never_match_as_substring() {
        let t = table();
        // "MILK", "WHEY" and "SOY" are too short for containment.
        assert!(t.resolve("BUTTERMILK POWDER", "BUTTERMILK POWDER").is_none());
        assert!(t.resolve("SOYA SAUCE", "SOYA SAUCE").is_none());
    }

    #[test]
    fn test_longest_substring_key_wins() {
        let t = table();
        let hit = t.resolve("Emulsifier (Soy Lecithin)", "SOY LECITHIN EMULSIFIER").unwrap();
        assert_eq!(hit.canonical_name, "Other soy product");
        assert_eq!(hit.match_key, "SOY LECITHIN");
        assert_eq!(hit.stage, OverrideStage::Substring);

        let hit = t.resolve("HYDROLYZED WHEY PROTEIN", "HYDROLYZED WHEY PROTEIN").unwrap();
        assert_eq!(hit.match_key, "WHEY PROTEIN");
    }

    #[test]
    fn test_equal_length_keys_break_lexicographically() {
        let ties = OverrideTable::from_rules(vec![rule("ZESTY", "Zest"), rule("APPLE", "Apple")], 5).unwrap();
        let hit = ties.resolve("ZESTY APPLE CHIPS", "ZESTY APPLE CHIPS").unwrap();
        assert_eq!(hit.canonical_name, "Apple");
        assert_eq!(hit.match_key, "APPLE");
    }

    #[test]
    fn test_conflicting_rules_rejected() {
        let err = OverrideTable::from_rules(vec![rule("GUM ARABIC", "Guar gum"), rule("gum arabic", "Acacia")], 5)
            .unwrap_err();
        assert_eq!(err.key, "GUM ARABIC");
    }

    #[test]
    fn test_duplicate_identical_rules_accepted() {
        let t = OverrideTable::from_rules(vec![rule("AGAR", "Agar"), rule("agar", "Agar")], 5).unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_compact_rule_form_deserializes() {
        let r: OverrideRule = serde_json::from_str(r#"["ERYTHRITOL", "Erythritol"]"#).unwrap();
        assert_eq!(r, rule("ERYTHRITOL", "Erythritol"));
    }
}
