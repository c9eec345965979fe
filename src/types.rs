use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// One authoritative ingredient in the target catalog. Loaded once per run, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEntry {
    pub id: String,
    pub name: String,
    pub food_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Override,
    Embedding,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Override => "override",
            MatchType::Embedding => "embedding",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown match type '{0}'")]
pub struct UnknownMatchType(pub String);

impl std::str::FromStr for MatchType {
    type Err = UnknownMatchType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "override" => Ok(MatchType::Override),
            "embedding" => Ok(MatchType::Embedding),
            other => Err(UnknownMatchType(other.to_string())),
        }
    }
}

/// A persisted resolution of one raw mention.
///
/// `similarity_score` is exactly 1.0 for overrides and at least the run's
/// threshold for embedding matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub original: String,
    pub cleaned: String,
    pub matched_id: String,
    pub matched_name: String,
    pub food_group: String,
    pub similarity_score: f64,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    pub fn from_override(original: String, cleaned: String, entry: &CanonicalEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            original,
            cleaned,
            matched_id: entry.id.clone(),
            matched_name: entry.name.clone(),
            food_group: entry.food_group.clone(),
            similarity_score: 1.0,
            match_type: MatchType::Override,
            created_at,
        }
    }

    pub fn from_embedding(
        original: String,
        cleaned: String,
        entry: &CanonicalEntry,
        score: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original,
            cleaned,
            matched_id: entry.id.clone(),
            matched_name: entry.name.clone(),
            food_group: entry.food_group.clone(),
            similarity_score: score,
            match_type: MatchType::Embedding,
            created_at,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "original": self.original,
            "cleaned": self.cleaned,
            "matchedId": self.matched_id,
            "matchedName": self.matched_name,
            "foodGroup": self.food_group,
            "similarityScore": self.similarity_score,
            "matchType": self.match_type.as_str(),
            "createdAt": self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_type_round_trips_through_str() {
        assert_eq!("override".parse::<MatchType>().unwrap(), MatchType::Override);
        assert_eq!("embedding".parse::<MatchType>().unwrap(), MatchType::Embedding);
        assert!("ai".parse::<MatchType>().is_err());
    }

    #[test]
    fn test_override_mapping_scores_one() {
        let entry = CanonicalEntry {
            id: "ing-1".into(),
            name: "Xanthan gum".into(),
            food_group: "Additive - Gum".into(),
        };
        let m = Mapping::from_override("XANTHAN GUM".into(), "XANTHAN GUM".into(), &entry, Utc::now());
        assert_eq!(m.similarity_score, 1.0);
        assert_eq!(m.match_type, MatchType::Override);
        assert_eq!(m.to_json()["matchedName"], "Xanthan gum");
    }
}
