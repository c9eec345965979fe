mod cli;
mod config;
mod embeddings;
mod logging;
mod matching;
mod pipeline;
mod policy;
mod sources;
mod store;
mod types;

use anyhow::Context;
use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::config::MatchConfig;
use crate::embeddings::engine::EmbeddingEngine;
use crate::embeddings::{download, Embedder};
use crate::matching::similarity::SimilarityMatcher;
use crate::pipeline::{MatchPipeline, RunStats, SimilarityPreview};
use crate::sources::{CatalogSource, JsonCatalog, JsonLinesMentions};
use crate::store::{MappingStore, WriteMode};
use crate::types::Mapping;

fn main() {
    if let Err(e) = real_main() {
        eprintln!("[ingredient-matcher] fatal error: {e:?}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logger = logging::init_logging(cli.log_dir.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Run {
            catalog,
            mentions,
            db,
            mode,
            policy,
            min_similarity,
            batch_size,
            flush_every,
            model_dir,
            model_url,
        } => {
            let policy = policy::load_policy(&policy)?;
            let mut config = MatchConfig::new(min_similarity.unwrap_or(policy.min_similarity), mode.into());
            config.batch_size = batch_size;
            config.write_flush_every = flush_every;
            config.validate()?;

            // Everything fallible is prepared before the store is opened.
            let entries = JsonCatalog::new(&catalog).load_catalog()?;
            sources::check_tracked_coverage(&entries, &policy.tracked_group_keywords);
            let unique = pipeline::collect_unique_mentions(&JsonLinesMentions::new(&mentions))?;

            let engine = load_engine(model_dir.as_deref(), &model_url)?;
            let matcher = SimilarityMatcher::build(entries, &engine)?;

            let mut store = MappingStore::open_or_create(&db)?;
            let stats = MatchPipeline::new(&policy, &config, &matcher, &engine).run(&unique, &mut store)?;

            print_summary(&stats, &store, &policy, &config, engine.model_name())?;
        }

        Commands::Explain {
            policy,
            catalog,
            min_similarity,
            model_dir,
            model_url,
            mentions,
        } => {
            let policy = policy::load_policy(&policy)?;

            let scoring = match catalog {
                Some(catalog) => {
                    let threshold = min_similarity.unwrap_or(policy.min_similarity);
                    MatchConfig::new(threshold, config::RunMode::Incremental).validate()?;
                    let entries = JsonCatalog::new(&catalog).load_catalog()?;
                    let engine = load_engine(model_dir.as_deref(), &model_url)?;
                    let matcher = SimilarityMatcher::build(entries, &engine)?;
                    Some((engine, matcher, threshold))
                }
                None => None,
            };
            let preview = scoring.as_ref().map(|(engine, matcher, threshold)| SimilarityPreview {
                matcher,
                embedder: engine,
                min_similarity: *threshold,
            });

            for m in &mentions {
                println!("{}", pipeline::explain(&policy, m, preview.as_ref())?);
            }
        }

        Commands::Pin {
            db,
            catalog,
            policy,
            original,
            canonical,
            replace,
        } => {
            let policy = policy::load_policy(&policy)?;
            let entries = JsonCatalog::new(&catalog).load_catalog()?;
            let mapping = pipeline::manual_mapping(&policy, &entries, &original, &canonical)?;

            let mode = if replace { WriteMode::Replace } else { WriteMode::Strict };
            let mut store = MappingStore::open_or_create(&db)?;
            store
                .upsert(&mapping, mode)
                .with_context(|| format!("pin '{}'", original))?;
            log::info!("Pinned '{}' -> '{}'", mapping.original, mapping.matched_name);
            println!("{}", mapping.to_json());
        }

        Commands::CheckPolicy { policy } => {
            let policy = policy::load_policy(&policy)?;
            println!("{}", serde_json::to_string_pretty(&policy.summary_json())?);
        }

        Commands::Query {
            db,
            original,
            matched_name,
            food_group,
            min_score,
            max_score,
            limit,
        } => {
            let store = MappingStore::open_or_create(&db)?;
            let found: Vec<Mapping> = if let Some(original) = original {
                store.get(&original)?.into_iter().collect()
            } else if let Some(name) = matched_name {
                store.find_by_matched_name(&name, limit)?
            } else if let Some(group) = food_group {
                store.find_by_food_group(&group, limit)?
            } else if let Some(min) = min_score {
                store.find_by_score_range(min, max_score.unwrap_or(1.0), limit)?
            } else {
                vec![]
            };

            log::info!("Query returned {} mappings", found.len());
            for m in &found {
                println!("{}", m.to_json());
            }
        }
    }

    Ok(())
}

fn load_engine(model_dir: Option<&std::path::Path>, model_url: &str) -> anyhow::Result<EmbeddingEngine> {
    let model_dir = download::ensure_model_files(model_dir, model_url).context("embedding model unavailable")?;
    EmbeddingEngine::load(&model_dir).context("embedding model failed to load")
}

fn print_summary(
    stats: &RunStats,
    store: &MappingStore,
    policy: &policy::Policy,
    config: &MatchConfig,
    model_name: &str,
) -> anyhow::Result<()> {
    let line = "=".repeat(60);
    println!("{line}");
    println!("Ingredient matching complete ({} mode)", config.mode);
    println!("{line}");
    println!("  Policy:            {}", policy.version);
    println!("  Model:             {}", model_name);
    println!("  Min similarity:    {}", config.min_similarity);
    println!();
    println!("  Unique mentions:   {}", stats.unique_mentions);
    println!("  Skipped:           {}", stats.skipped);
    println!("  Already mapped:    {}", stats.already_mapped);
    println!("  Overrides:         {}", stats.override_count);
    println!("  Embedding matches: {}", stats.embedding_count);
    println!("  Unmatched:         {}", stats.unmatched_count);
    println!("  Total matched:     {}", stats.matched());
    match stats.match_rate() {
        Some(rate) => println!("  Match rate:        {:.1}%", rate * 100.0),
        None => println!("  Match rate:        n/a"),
    }
    println!("  Tracked-group:     {}", stats.tracked_group_count);
    if stats.duplicate_writes > 0 {
        println!("  Duplicate writes:  {}", stats.duplicate_writes);
    }

    println!();
    println!("  Total in DB:       {}", store.count()?);
    for (kind, n) in store.count_by_match_type()? {
        println!("    {:<10} {}", kind.as_str(), n);
    }

    let limit = config::matching::SUMMARY_SAMPLE_LIMIT;
    print_samples("Sample tracked-group mappings", &store.sample_by_group_keywords(&policy.tracked_group_keywords, limit)?);

    let allergen_keywords: Vec<String> = config::matching::ALLERGEN_GROUP_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect();
    print_samples("Sample allergen mappings", &store.sample_by_group_keywords(&allergen_keywords, limit)?);

    log::info!("Run summary: {}", stats.to_json());
    Ok(())
}

fn print_samples(title: &str, mappings: &[Mapping]) {
    if mappings.is_empty() {
        return;
    }
    println!();
    println!("{title}:");
    for m in mappings {
        let original: String = m.original.chars().take(30).collect();
        println!("  {:<30} -> {:<20} ({})", original, m.matched_name, m.food_group);
    }
}
