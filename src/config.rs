// IMPORTANT:
// Keep ALL numeric defaults centralized here (no hardcoded numeric values scattered around).
// Per-run values live in `MatchConfig`, which is built once at startup and passed down.

// NOTE: MATCHER_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const MATCHER_VERSION: &str = "0.3.0";

/// Schema version of the mapping database. Bump ONLY when the table layout changes.
pub const SCHEMA_VERSION: u32 = 1;

pub mod logging {
    pub const LOG_DIR_REL: &str = ".ingredient-matcher/logs";
    pub const LOG_FILE_NAME: &str = "ingredient_matcher.log";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod matching {
    // Mentions embedded per matcher call.
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    // Mapping records accumulated before a store flush. Throughput only.
    pub const DEFAULT_WRITE_FLUSH_EVERY: usize = 1000;

    // Cleaned text shorter than this is reported as empty after cleaning.
    pub const MIN_CLEANED_CHARS: usize = 2;

    // Built-in policy used when none is named.
    pub const DEFAULT_POLICY: &str = "allergen-fodmap-v3";

    // Samples printed per group in the run summary.
    pub const SUMMARY_SAMPLE_LIMIT: i64 = 10;

    // Food-group keywords used for the allergen sample in the run summary.
    pub const ALLERGEN_GROUP_KEYWORDS: &[&str] = &["Milk", "Nuts", "Soy", "Egg", "Cereals"];
}

pub mod sqlite {
    pub const PRAGMA_BUSY_TIMEOUT_MS: i64 = 2000;
    pub const PRAGMA_CACHE_SIZE_KIB_NEG: i64 = -64000;
    pub const PRAGMA_MMAP_SIZE_BYTES: i64 = 268_435_456;
    pub const PRAGMA_WAL_AUTOCHECKPOINT_PAGES: i64 = 200_000;
}

pub mod store {
    pub const MAPPINGS_TABLE: &str = "ingredient_mappings";

    // Rows returned by a single `query` lookup.
    pub const QUERY_DEFAULT_LIMIT: i64 = 1000;
}

pub mod embedding {
    pub const EMBEDDING_DIMS: usize = 384;
    pub const EMBEDDING_MODEL_NAME: &str = "all-MiniLM-L6-v2";

    // Max word-piece tokens for all-MiniLM-L6-v2 (model context limit is 256).
    pub const MAX_TOKENS: usize = 256;

    // Catalog names embedded per engine call while building the matrix.
    pub const CATALOG_EMBED_CHUNK: usize = 256;

    pub const MODEL_BASE_URL: &str =
        "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

    // SHA256 hashes for integrity verification
    pub const MODEL_SAFETENSORS_SHA256: &str =
        "53aa51172d142c89d9012cce15ae4d6cc0ca6895895114379cacb4fab128d9db";
    pub const TOKENIZER_JSON_SHA256: &str =
        "be50c3628f2bf5bb5e3a7f17b1f74611b2561a3a27eeab05e5aa30f411572037";
    pub const CONFIG_JSON_SHA256: &str =
        "953f9c0d463486b10a6871cc2fd59f223b2c70184f49815e7efbcab5d8908b41";

    // Local model storage directory (relative to home)
    pub const MODEL_DIR_REL: &str = ".ingredient-matcher/models/all-MiniLM-L6-v2";

    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 90;
}

/// How a run treats mappings that already exist in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Delete every mapping before repopulating.
    Rebuild,
    /// Keep existing mappings; only resolve mentions the store has never seen.
    Incremental,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Rebuild => write!(f, "rebuild"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Everything the pipeline needs to know about a run, decided once at startup.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub min_similarity: f64,
    pub batch_size: usize,
    pub write_flush_every: usize,
    pub mode: RunMode,
}

impl MatchConfig {
    pub fn new(min_similarity: f64, mode: RunMode) -> Self {
        Self {
            min_similarity,
            batch_size: matching::DEFAULT_BATCH_SIZE,
            write_flush_every: matching::DEFAULT_WRITE_FLUSH_EVERY,
            mode,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            anyhow::bail!("min similarity must be within [0, 1], got {}", self.min_similarity);
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if self.write_flush_every == 0 {
            anyhow::bail!("write flush interval must be at least 1");
        }
        Ok(())
    }
}
