// sources.rs - Read-only inputs: the canonical catalog and per-product mention lists.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::types::CanonicalEntry;

pub trait CatalogSource {
    /// All canonical entries, in load order. Load order decides ties.
    fn load_catalog(&self) -> anyhow::Result<Vec<CanonicalEntry>>;
}

pub trait MentionSource {
    /// Call `visit` once per product with its raw ingredient strings.
    /// Returns the number of products visited.
    fn visit_products(&self, visit: &mut dyn FnMut(&[String])) -> anyhow::Result<usize>;
}

/// Products held in memory, one mention list each.
#[cfg(test)]
pub struct ProductMentions(pub Vec<Vec<String>>);

#[cfg(test)]
impl MentionSource for ProductMentions {
    fn visit_products(&self, visit: &mut dyn FnMut(&[String])) -> anyhow::Result<usize> {
        for product in &self.0 {
            visit(product);
        }
        Ok(self.0.len())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
    Oid {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
            RawId::Oid { oid } => oid,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCatalogEntry {
    #[serde(alias = "_id")]
    id: RawId,
    name: String,
    #[serde(default)]
    food_group: Option<String>,
}

/// Catalog stored as a JSON array of `{id, name, foodGroup}` objects.
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for JsonCatalog {
    fn load_catalog(&self) -> anyhow::Result<Vec<CanonicalEntry>> {
        log::info!("Loading catalog from {}", self.path.display());
        let file = File::open(&self.path).with_context(|| format!("open catalog {}", self.path.display()))?;
        let raw: Vec<RawCatalogEntry> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse catalog {}", self.path.display()))?;

        let mut entries: Vec<CanonicalEntry> = Vec::with_capacity(raw.len());
        for r in raw {
            if r.name.trim().is_empty() {
                log::warn!("Skipping catalog entry with empty name (id {:?})", r.id);
                continue;
            }
            entries.push(CanonicalEntry {
                id: r.id.into_string(),
                name: r.name,
                food_group: r.food_group.unwrap_or_default(),
            });
        }

        if entries.is_empty() {
            bail!("catalog {} has no entries", self.path.display());
        }
        log::info!("Catalog loaded: {} entries", entries.len());
        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
struct ProductLine {
    #[serde(default)]
    ingredients: Option<Vec<Option<String>>>,
}

/// One product per line, each a JSON object with an `ingredients` array.
pub struct JsonLinesMentions {
    path: PathBuf,
}

impl JsonLinesMentions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MentionSource for JsonLinesMentions {
    fn visit_products(&self, visit: &mut dyn FnMut(&[String])) -> anyhow::Result<usize> {
        log::info!("Reading products from {}", self.path.display());
        let file = File::open(&self.path).with_context(|| format!("open mentions {}", self.path.display()))?;

        let mut products = 0usize;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line_no = idx + 1;
            let line = line.with_context(|| format!("read {} line {}", self.path.display(), line_no))?;
            if line.trim().is_empty() {
                continue;
            }

            let product: ProductLine = serde_json::from_str(&line)
                .with_context(|| format!("malformed product at {} line {}", self.path.display(), line_no))?;
            let mentions: Vec<String> = product
                .ingredients
                .unwrap_or_default()
                .into_iter()
                .flatten()
                .filter(|m| !m.is_empty())
                .collect();

            visit(&mentions);
            products += 1;
        }

        log::info!("Read {} products", products);
        Ok(products)
    }
}

/// Count catalog entries whose food group contains a tracked keyword
/// (case-insensitive). Logs a warning when there are none.
pub fn check_tracked_coverage(entries: &[CanonicalEntry], keywords: &[String]) -> usize {
    if keywords.is_empty() {
        return 0;
    }
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let covered = entries
        .iter()
        .filter(|e| {
            let group = e.food_group.to_lowercase();
            keywords.iter().any(|k| group.contains(k.as_str()))
        })
        .count();

    if covered == 0 {
        log::warn!(
            "No catalog entries belong to a tracked group ({}); tracked mentions can only match by similarity",
            keywords.join(", ")
        );
    } else {
        log::info!("Tracked-group catalog entries: {}", covered);
    }
    covered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_catalog_id_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "catalog.json",
            r#"[
                {"id": "a1", "name": "Quinoa", "foodGroup": "Cereals"},
                {"id": 42, "name": "Xanthan gum", "foodGroup": "Additive - Gum"},
                {"_id": {"$oid": "65f0c0ffee"}, "name": "Salt"},
                {"id": "blank", "name": "  "}
            ]"#,
        );
        let entries = JsonCatalog::new(&path).load_catalog().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "a1");
        assert_eq!(entries[1].id, "42");
        assert_eq!(entries[2].id, "65f0c0ffee");
        assert_eq!(entries[2].food_group, "");
    }

    #[test]
    fn test_missing_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonCatalog::new(dir.path().join("nope.json")).load_catalog().unwrap_err();
        assert!(format!("{err:#}").contains("open catalog"));
    }

    #[test]
    fn test_mentions_drop_nulls_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "products.jsonl",
            "{\"ingredients\": [\"SALT\", null, \"\", \"QUINOA\"], \"brand\": \"x\"}\n\n{\"name\": \"no list\"}\n",
        );
        let mut seen: Vec<Vec<String>> = vec![];
        let n = JsonLinesMentions::new(&path)
            .visit_products(&mut |m: &[String]| seen.push(m.to_vec()))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen[0], vec!["SALT".to_string(), "QUINOA".to_string()]);
        assert!(seen[1].is_empty());
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.jsonl", "{\"ingredients\": []}\n{oops\n");
        let err = JsonLinesMentions::new(&path).visit_products(&mut |_: &[String]| {}).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn test_tracked_coverage_is_case_insensitive() {
        let entries = vec![
            CanonicalEntry {
                id: "1".into(),
                name: "Stevia".into(),
                food_group: "Artificial sweetener".into(),
            },
            CanonicalEntry {
                id: "2".into(),
                name: "Apple".into(),
                food_group: "Fruits".into(),
            },
        ];
        let keywords = vec!["SWEETENER".to_string(), "Gum".to_string()];
        assert_eq!(check_tracked_coverage(&entries, &keywords), 1);
        assert_eq!(check_tracked_coverage(&entries[1..], &keywords), 0);
    }
}
