use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};

use crate::config::{self, RunMode};

#[derive(Parser)]
#[command(name = "ingredient_matcher", version = config::MATCHER_VERSION)]
#[command(about = "Map ingredient-label mentions to a canonical ingredient catalog", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log directory (default: ~/.ingredient-matcher/logs)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Mirror info-level logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Delete every mapping, then repopulate
    Rebuild,
    /// Keep existing mappings, resolve only new mentions
    Incremental,
}

impl From<ModeArg> for RunMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Rebuild => RunMode::Rebuild,
            ModeArg::Incremental => RunMode::Incremental,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Match every unique mention and write the mapping store
    Run {
        /// Canonical catalog (JSON array of {id, name, foodGroup})
        #[arg(long)]
        catalog: PathBuf,

        /// Products, one JSON object per line with an `ingredients` array
        #[arg(long)]
        mentions: PathBuf,

        /// SQLite mapping store
        #[arg(long)]
        db: PathBuf,

        #[arg(long, value_enum)]
        mode: ModeArg,

        /// Built-in policy name or policy file path
        #[arg(long, default_value = config::matching::DEFAULT_POLICY)]
        policy: String,

        /// Override the policy's similarity threshold
        #[arg(long)]
        min_similarity: Option<f64>,

        /// Mentions embedded per batch
        #[arg(long, default_value_t = config::matching::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Mappings buffered before each store write
        #[arg(long, default_value_t = config::matching::DEFAULT_WRITE_FLUSH_EVERY)]
        flush_every: usize,

        /// Pre-fetched model directory (skips download)
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Base URL the model files are downloaded from
        #[arg(long, default_value = config::embedding::MODEL_BASE_URL)]
        model_url: String,
    },

    /// Show how mentions are cleaned, skipped and overridden
    Explain {
        #[arg(long, default_value = config::matching::DEFAULT_POLICY)]
        policy: String,

        /// Also score the similarity stage against this catalog (loads the model)
        #[arg(long)]
        catalog: Option<PathBuf>,

        #[arg(long, requires = "catalog")]
        min_similarity: Option<f64>,

        #[arg(long, requires = "catalog")]
        model_dir: Option<PathBuf>,

        #[arg(long, default_value = config::embedding::MODEL_BASE_URL)]
        model_url: String,

        #[arg(required = true)]
        mentions: Vec<String>,
    },

    /// Store a hand-curated mapping for one mention
    Pin {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        catalog: PathBuf,

        #[arg(long, default_value = config::matching::DEFAULT_POLICY)]
        policy: String,

        /// Raw mention exactly as it appears on labels
        #[arg(long)]
        original: String,

        /// Catalog entry name to map it to
        #[arg(long)]
        canonical: String,

        /// Overwrite an existing mapping for the mention
        #[arg(long)]
        replace: bool,
    },

    /// Load and validate a policy, then print its rule counts
    CheckPolicy {
        #[arg(long, default_value = config::matching::DEFAULT_POLICY)]
        policy: String,
    },

    /// Look up stored mappings (one JSON object per line)
    #[command(group(
        ArgGroup::new("lookup")
            .required(true)
            .args(["original", "matched_name", "food_group", "min_score"]),
    ))]
    Query {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        original: Option<String>,

        #[arg(long)]
        matched_name: Option<String>,

        #[arg(long)]
        food_group: Option<String>,

        #[arg(long)]
        min_score: Option<f64>,

        /// Upper bound for --min-score (default 1.0)
        #[arg(long, requires = "min_score")]
        max_score: Option<f64>,

        #[arg(long, default_value_t = config::store::QUERY_DEFAULT_LIMIT)]
        limit: i64,
    },
}
