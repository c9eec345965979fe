use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;

use crate::config;
use crate::types::{MatchType, Mapping};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("a mapping for '{original}' already exists")]
    DuplicateKey { original: String },

    #[error("mapping store schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("failed to create store directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Behaviour of a single `upsert` when `original` is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `StoreError::DuplicateKey`.
    Strict,
    /// Overwrite the stored mapping.
    Replace,
}

/// Behaviour of `bulk_write` when a record's `original` is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Abort and roll back the whole batch.
    Fail,
    /// Keep the stored record, count the duplicate, continue.
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct MappingStore {
    conn: Connection,
}

const COLUMNS: &str = "original, cleaned, matchedId, matchedName, foodGroup, similarity, matchType, createdAt";

impl MappingStore {
    pub fn open_or_create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        log::info!("Opening mapping store");
        log::info!("  DB Path: {}", path.display());

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        log::info!("Mapping store ready: {} mappings", store.count()?);
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // PRAGMA statements do not take bound parameters.
        conn.execute_batch(&format!(
            "\
PRAGMA journal_mode = WAL;\n\
PRAGMA synchronous = NORMAL;\n\
PRAGMA temp_store = MEMORY;\n\
PRAGMA cache_size = {cache_size};\n\
PRAGMA mmap_size = {mmap_size};\n\
PRAGMA busy_timeout = {busy_timeout};\n\
PRAGMA wal_autocheckpoint = {wal_autocheckpoint};\n\
",
            cache_size = config::sqlite::PRAGMA_CACHE_SIZE_KIB_NEG,
            mmap_size = config::sqlite::PRAGMA_MMAP_SIZE_BYTES,
            busy_timeout = config::sqlite::PRAGMA_BUSY_TIMEOUT_MS,
            wal_autocheckpoint = config::sqlite::PRAGMA_WAL_AUTOCHECKPOINT_PAGES,
        ))?;

        let table = config::store::MAPPINGS_TABLE;
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                params![table],
                |r| r.get(0),
            )
            .optional()?;

        let version: u32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if exists.is_some() {
            if version != config::SCHEMA_VERSION {
                return Err(StoreError::SchemaVersion {
                    found: version,
                    expected: config::SCHEMA_VERSION,
                });
            }
            log::info!("Using existing mapping schema (v{})", version);
        } else {
            log::info!("Creating mapping schema (v{})", config::SCHEMA_VERSION);
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE {table} (
                    id INTEGER PRIMARY KEY,
                    original TEXT NOT NULL UNIQUE,
                    cleaned TEXT NOT NULL,
                    matchedId TEXT NOT NULL,
                    matchedName TEXT NOT NULL,
                    foodGroup TEXT NOT NULL DEFAULT '',
                    similarity REAL NOT NULL,
                    matchType TEXT NOT NULL CHECK (matchType IN ('override', 'embedding')),
                    createdAt TEXT NOT NULL
                );

                CREATE INDEX idx_{table}_matched_name ON {table}(matchedName);
                CREATE INDEX idx_{table}_similarity ON {table}(similarity);
                CREATE INDEX idx_{table}_food_group ON {table}(foodGroup);

                PRAGMA user_version = {version};
                "#,
                version = config::SCHEMA_VERSION,
            ))?;
        }

        Ok(Self { conn })
    }

    pub fn upsert(&mut self, mapping: &Mapping, mode: WriteMode) -> Result<(), StoreError> {
        let sql = match mode {
            WriteMode::Strict => insert_sql(""),
            WriteMode::Replace => insert_sql(
                "ON CONFLICT(original) DO UPDATE SET \
                 cleaned = excluded.cleaned, matchedId = excluded.matchedId, \
                 matchedName = excluded.matchedName, foodGroup = excluded.foodGroup, \
                 similarity = excluded.similarity, matchType = excluded.matchType, \
                 createdAt = excluded.createdAt",
            ),
        };
        insert_one(&self.conn, &sql, mapping)?;
        Ok(())
    }

    /// Write a batch in one transaction.
    pub fn bulk_write(&mut self, mappings: &[Mapping], on_duplicate: OnDuplicate) -> Result<WriteOutcome, StoreError> {
        if mappings.is_empty() {
            return Ok(WriteOutcome::default());
        }
        log::debug!("Writing batch of {} mappings", mappings.len());

        let sql = match on_duplicate {
            OnDuplicate::Fail => insert_sql(""),
            OnDuplicate::Skip => insert_sql("ON CONFLICT(original) DO NOTHING"),
        };

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = WriteOutcome::default();
        for mapping in mappings {
            // An error here drops `tx`, which rolls the batch back.
            let changed = insert_one(&tx, &sql, mapping)?;
            if changed == 0 {
                outcome.duplicates += 1;
                log::debug!("Already mapped: {}", truncate_for_log(&mapping.original));
            } else {
                outcome.inserted += 1;
            }
        }
        tx.commit()?;

        if outcome.duplicates > 0 {
            log::warn!(
                "Wrote {} mappings, {} already present",
                outcome.inserted,
                outcome.duplicates
            );
        } else {
            log::debug!("Wrote {} mappings", outcome.inserted);
        }
        Ok(outcome)
    }

    /// Delete every mapping. Returns the number removed.
    pub fn clear_all(&mut self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {}", config::store::MAPPINGS_TABLE), [])?;
        log::info!("Cleared {} existing mappings", removed);
        Ok(removed)
    }

    pub fn contains(&self, original: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE original = ?1", config::store::MAPPINGS_TABLE),
                params![original],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", config::store::MAPPINGS_TABLE),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn get(&self, original: &str) -> Result<Option<Mapping>, StoreError> {
        let mapping = self
            .conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM {} WHERE original = ?1",
                    config::store::MAPPINGS_TABLE
                ),
                params![original],
                row_to_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn find_by_matched_name(&self, name: &str, limit: i64) -> Result<Vec<Mapping>, StoreError> {
        self.select("WHERE matchedName = ?1 ORDER BY original LIMIT ?2", params![name, limit])
    }

    /// Mappings with `min <= similarity <= max`, best first.
    pub fn find_by_score_range(&self, min: f64, max: f64, limit: i64) -> Result<Vec<Mapping>, StoreError> {
        self.select(
            "WHERE similarity >= ?1 AND similarity <= ?2 ORDER BY similarity DESC, original LIMIT ?3",
            params![min, max, limit],
        )
    }

    pub fn find_by_food_group(&self, food_group: &str, limit: i64) -> Result<Vec<Mapping>, StoreError> {
        self.select("WHERE foodGroup = ?1 ORDER BY original LIMIT ?2", params![food_group, limit])
    }

    /// Mappings whose food group contains any of `keywords`, ignoring case.
    pub fn sample_by_group_keywords(&self, keywords: &[String], limit: i64) -> Result<Vec<Mapping>, StoreError> {
        if keywords.is_empty() {
            return Ok(vec![]);
        }
        // SQLite's lower() only folds ASCII; keywords are folded the same way.
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_ascii_lowercase()).collect();
        let clauses = (1..=keywords.len())
            .map(|i| format!("instr(lower(foodGroup), ?{i}) > 0"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE {clauses} ORDER BY original LIMIT {limit}",
            config::store::MAPPINGS_TABLE
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keywords.iter()), row_to_mapping)?;
        let mut out = vec![];
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_by_match_type(&self) -> Result<Vec<(MatchType, usize)>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT matchType, COUNT(*) FROM {} GROUP BY matchType ORDER BY matchType",
            config::store::MAPPINGS_TABLE
        ))?;
        let rows = stmt.query_map([], |r| {
            let kind: String = r.get(0)?;
            let n: i64 = r.get(1)?;
            let kind = kind
                .parse::<MatchType>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
            Ok((kind, n as usize))
        })?;
        let mut out = vec![];
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Every mapping, ordered by `original`.
    #[cfg(test)]
    pub fn all_mappings(&self) -> Result<Vec<Mapping>, StoreError> {
        self.select("ORDER BY original", [])
    }

    fn select(&self, tail: &str, params: impl rusqlite::Params) -> Result<Vec<Mapping>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} {tail}", config::store::MAPPINGS_TABLE);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, row_to_mapping)?;
        let mut out = vec![];
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn insert_sql(conflict_clause: &str) -> String {
    format!(
        "INSERT INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) {conflict_clause}",
        config::store::MAPPINGS_TABLE
    )
}

fn insert_one(conn: &Connection, sql: &str, m: &Mapping) -> Result<usize, StoreError> {
    let created_at = m.created_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    conn.prepare_cached(sql)?
        .execute(params![
            m.original,
            m.cleaned,
            m.matched_id,
            m.matched_name,
            m.food_group,
            m.similarity_score,
            m.match_type.as_str(),
            created_at,
        ])
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateKey {
                    original: m.original.clone(),
                }
            } else {
                StoreError::Sqlite(e)
            }
        })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn row_to_mapping(r: &Row<'_>) -> rusqlite::Result<Mapping> {
    let match_type: String = r.get(6)?;
    let match_type = match_type
        .parse::<MatchType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let created_at: String = r.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Mapping {
        original: r.get(0)?,
        cleaned: r.get(1)?,
        matched_id: r.get(2)?,
        matched_name: r.get(3)?,
        food_group: r.get(4)?,
        similarity_score: r.get(5)?,
        match_type,
        created_at,
    })
}

fn truncate_for_log(s: &str) -> String {
    let max = 80usize;
    if s.len() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanonicalEntry;

    fn entry(name: &str, group: &str) -> CanonicalEntry {
        CanonicalEntry {
            id: format!("id-{name}"),
            name: name.to_string(),
            food_group: group.to_string(),
        }
    }

    fn override_mapping(original: &str, name: &str, group: &str) -> Mapping {
        Mapping::from_override(original.into(), original.to_uppercase(), &entry(name, group), Utc::now())
    }

    fn embedding_mapping(original: &str, name: &str, group: &str, score: f64) -> Mapping {
        Mapping::from_embedding(original.into(), original.to_uppercase(), &entry(name, group), score, Utc::now())
    }

    #[test]
    fn test_strict_upsert_rejects_duplicate() {
        let mut store = MappingStore::open_in_memory().unwrap();
        let m = override_mapping("XANTHAN GUM", "Xanthan gum", "Additive - Gum");
        store.upsert(&m, WriteMode::Strict).unwrap();
        let err = store.upsert(&m, WriteMode::Strict).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref original } if original == "XANTHAN GUM"));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_replace_upsert_overwrites() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .upsert(&embedding_mapping("Quinoa flakes", "Quinoa", "Cereals", 0.6), WriteMode::Strict)
            .unwrap();
        store
            .upsert(&embedding_mapping("Quinoa flakes", "Quinoa", "Cereals", 0.7), WriteMode::Replace)
            .unwrap();
        let got = store.get("Quinoa flakes").unwrap().unwrap();
        assert_eq!(got.similarity_score, 0.7);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_bulk_write_fail_rolls_back_batch() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .upsert(&override_mapping("MILK", "Milk (Cow)", "Milk"), WriteMode::Strict)
            .unwrap();
        let batch = vec![
            override_mapping("WHEY", "Whey", "Milk"),
            override_mapping("MILK", "Milk (Cow)", "Milk"),
        ];
        let err = store.bulk_write(&batch, OnDuplicate::Fail).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert!(!store.contains("WHEY").unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_bulk_write_skip_counts_duplicates() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .upsert(&override_mapping("MILK", "Milk (Cow)", "Milk"), WriteMode::Strict)
            .unwrap();
        let batch = vec![
            override_mapping("WHEY", "Whey", "Milk"),
            override_mapping("MILK", "Milk (Cow)", "Milk"),
        ];
        let outcome = store.bulk_write(&batch, OnDuplicate::Skip).unwrap();
        assert_eq!(outcome, WriteOutcome { inserted: 1, duplicates: 1 });
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_clear_all() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .bulk_write(
                &[override_mapping("A1", "Apple", "Fruits"), override_mapping("B1", "Banana", "Fruits")],
                OnDuplicate::Fail,
            )
            .unwrap();
        assert_eq!(store.clear_all().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_secondary_lookups() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .bulk_write(
                &[
                    override_mapping("XANTHAN GUM", "Xanthan gum", "Additive - Gum"),
                    override_mapping("GUAR GUM", "Guar gum", "Additive - Gum"),
                    embedding_mapping("QUINOA FLAKES", "Quinoa", "Cereals", 0.62),
                    embedding_mapping("QUINOA PUFFS", "Quinoa", "Cereals", 0.55),
                ],
                OnDuplicate::Fail,
            )
            .unwrap();

        let quinoa = store.find_by_matched_name("Quinoa", 10).unwrap();
        assert_eq!(quinoa.len(), 2);

        let mid = store.find_by_score_range(0.5, 0.6, 10).unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].original, "QUINOA PUFFS");

        let gums = store.find_by_food_group("Additive - Gum", 10).unwrap();
        assert_eq!(gums[0].original, "GUAR GUM");

        let sample = store.sample_by_group_keywords(&["Gum".to_string(), "FODMAP".to_string()], 1).unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].original, "GUAR GUM");

        let counts = store.count_by_match_type().unwrap();
        assert_eq!(counts, vec![(MatchType::Embedding, 2), (MatchType::Override, 2)]);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut store = MappingStore::open_in_memory().unwrap();
        let m = embedding_mapping("Quinoa Flakes", "Quinoa", "Cereals", 0.620_000_123);
        store.upsert(&m, WriteMode::Strict).unwrap();
        let got = store.get("Quinoa Flakes").unwrap().unwrap();
        assert_eq!(got.similarity_score, m.similarity_score);
        assert_eq!(got.match_type, MatchType::Embedding);
        assert_eq!(got.matched_id, "id-Quinoa");
        assert_eq!(got.created_at.timestamp_millis(), m.created_at.timestamp_millis());
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mappings.db");
        {
            let mut store = MappingStore::open_or_create(&path).unwrap();
            store
                .upsert(&override_mapping("MILK", "Milk (Cow)", "Milk"), WriteMode::Strict)
                .unwrap();
        }
        let store = MappingStore::open_or_create(&path).unwrap();
        assert!(store.contains("MILK").unwrap());
    }

    #[test]
    fn test_group_sample_ignores_case() {
        let mut store = MappingStore::open_in_memory().unwrap();
        store
            .bulk_write(
                &[
                    override_mapping("STEVIA", "Stevia", "Artificial Sweetener"),
                    override_mapping("ERYTHRITOL", "Erythritol", "FODMAP - Polyol"),
                    override_mapping("APPLE", "Apple", "Fruits"),
                ],
                OnDuplicate::Fail,
            )
            .unwrap();

        let keywords: Vec<String> = ["sweetener", "POLYOL"].iter().map(|k| k.to_string()).collect();
        let sample = store.sample_by_group_keywords(&keywords, 10).unwrap();
        let originals: Vec<&str> = sample.iter().map(|m| m.original.as_str()).collect();
        assert_eq!(originals, vec!["ERYTHRITOL", "STEVIA"]);
    }
}
