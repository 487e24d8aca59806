// Merchant Memory CLI: admin access to the memory store from the terminal.
//
// Every command opens the service, does one thing, and closes it again, so
// the usage queue is drained and the pool shut before exit.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::debug;
use merchant_memory::engine::config::default_db_path;
use merchant_memory::{
    ContextTier, MemoryCandidate, MemoryCategory, MemoryConfig, MemoryError, MemoryResult, MemoryService,
    PromptFragment, StoreOutcome,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "merchant-memory", version)]
#[command(about = "Inspect and maintain the merchant memory store")]
struct Cli {
    /// TOML config file (missing file = defaults)
    #[arg(long, global = true, env = "MERCHANT_MEMORY_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overrides the config (":memory:" for a throwaway store)
    #[arg(long, global = true, env = "MERCHANT_MEMORY_DB")]
    db: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a memory (deduplicated against what the user already has)
    Store {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "general")]
        category: String,
        #[arg(long, default_value_t = 0.5)]
        importance: f64,
        #[arg(long)]
        ephemeral: bool,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
        content: String,
    },
    /// Search a user's active memories
    Search {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        threshold: Option<f64>,
        query: String,
    },
    /// Per-user counts and averages
    Stats {
        #[arg(long)]
        user: String,
    },
    /// Archive decayed, expired and stale memories (all users)
    ArchiveSweep {
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Retire duplicates that slipped in concurrently
    DedupSweep {
        #[arg(long)]
        user: String,
    },
    /// Soft-delete a memory owned by a user
    Delete {
        #[arg(long)]
        user: String,
        id: String,
    },
    /// Set a memory's importance (clamped to [0, 1])
    Importance {
        id: String,
        #[arg(allow_negative_numbers = true)]
        score: f64,
    },
    /// Mark a memory as verified
    Verify { id: String },
    /// Build the memory-aware prompt for a query
    Assemble {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "general")]
        agent: String,
        #[arg(long, default_value = "standard")]
        tier: String,
        query: String,
    },
    /// Manage prompt fragments
    Fragment {
        #[command(subcommand)]
        action: FragmentAction,
    },
    /// Embed memories stored without a vector
    Backfill {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum FragmentAction {
    Add {
        #[arg(long)]
        category: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value = "core")]
        tier: String,
        /// Restrict to one agent type (default: all agents)
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        content: String,
    },
    List {
        /// Include inactive fragments
        #[arg(long)]
        all: bool,
    },
    Disable { id: String },
}

fn load_config(cli: &Cli) -> MemoryResult<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => MemoryConfig::load(path)?,
        None => MemoryConfig::default(),
    };
    match &cli.db {
        Some(db) => config.database.path = db.clone(),
        None if cli.config.is_none() => {
            config.database.path = default_db_path().to_string_lossy().into_owned();
        }
        None => {}
    }
    debug!("[cli] database at {}", config.database.path);
    Ok(config)
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> MemoryResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}

async fn run(cli: Cli) -> MemoryResult<()> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "merchant-memory", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let service = MemoryService::init(config, None, None).await?;
    let result = dispatch(&service, cli.command, cli.json).await;
    service.close().await;
    result
}

async fn dispatch(service: &MemoryService, command: Commands, json: bool) -> MemoryResult<()> {
    match command {
        Commands::Store { user, category, importance, ephemeral, metadata, content } => {
            let category: MemoryCategory = category.parse()?;
            let mut candidate = MemoryCandidate::new(user, content, category).with_importance(importance);
            if ephemeral {
                candidate = candidate.ephemeral();
            }
            if let Some(raw) = metadata {
                candidate = candidate.with_metadata(serde_json::from_str(&raw)?);
            }
            let outcome = service.store_candidate(candidate).await?;
            print(json, &outcome, || match &outcome {
                StoreOutcome::Inserted { id } => format!("stored {}", id),
                StoreOutcome::Duplicate { id, dedup_type, similarity } => {
                    format!("duplicate of {} ({}, similarity {:.3})", id, dedup_type, similarity)
                }
            })
        }

        Commands::Search { user, limit, category, threshold, query } => {
            let category = category.map(|c| c.parse::<MemoryCategory>()).transpose()?;
            let results = service.search_memories(&user, &query, limit, category, threshold).await?;
            print(json, &results, || {
                if results.is_empty() {
                    return "no matches".into();
                }
                results
                    .iter()
                    .map(|r| {
                        format!(
                            "{:>2}. [{:.3}] {} ({}, importance {:.2}) {}",
                            r.rank,
                            r.similarity_score,
                            preview(&r.memory.content, 80),
                            r.memory.category,
                            r.memory.importance_score,
                            r.memory.id
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }

        Commands::Stats { user } => {
            let stats = service.get_user_memory_stats(&user).await?;
            print(json, &stats, || {
                let mut out = format!(
                    "{}: {} total ({} active, {} archived, {} deduplicated, {} deleted)\n\
                     avg importance {:.2}, avg usefulness {:.2}, avg accesses {:.1}\n\
                     {} with embeddings, {} ephemeral, {} verified, {} duplicate records",
                    stats.user_id,
                    stats.total,
                    stats.active,
                    stats.archived,
                    stats.deduplicated,
                    stats.deleted,
                    stats.avg_importance,
                    stats.avg_usefulness,
                    stats.avg_access_count,
                    stats.with_embeddings,
                    stats.ephemeral,
                    stats.verified,
                    stats.duplicate_records
                );
                for (cat, n) in &stats.categories {
                    out.push_str(&format!("\n  {:<14} {}", cat, n));
                }
                out
            })
        }

        Commands::ArchiveSweep { threshold } => {
            let threshold = threshold.unwrap_or(service.config().decay.archive_threshold);
            let archived = service.archive_sweep(threshold).await?;
            print(json, &serde_json::json!({ "archived": archived, "threshold": threshold }), || {
                format!("archived {} memories (threshold {:.2})", archived, threshold)
            })
        }

        Commands::DedupSweep { user } => {
            let retired = service.dedup_sweep(&user).await?;
            print(json, &serde_json::json!({ "retired": retired }), || {
                format!("retired {} duplicates for {}", retired, user)
            })
        }

        Commands::Delete { user, id } => {
            let deleted = service.delete_memory(&id, &user).await?;
            print(json, &serde_json::json!({ "deleted": deleted }), || {
                if deleted { format!("deleted {}", id) } else { format!("{} not found for {}", id, user) }
            })
        }

        Commands::Importance { id, score } => {
            let updated = service.update_memory_importance(&id, score).await?;
            let stored = match service.get_memory(&id).await? {
                Some(m) if updated => Some(m.importance_score),
                _ => None,
            };
            print(json, &serde_json::json!({ "updated": updated, "importance": stored }), || match stored {
                Some(v) => format!("{} importance set to {:.2}", id, v),
                None => format!("{} not found", id),
            })
        }

        Commands::Verify { id } => {
            let changed = service.verify_memory(&id).await?;
            print(json, &serde_json::json!({ "verified": changed }), || {
                if changed { format!("verified {}", id) } else { format!("{} was already verified", id) }
            })
        }

        Commands::Assemble { user, agent, tier, query } => {
            let tier: ContextTier = tier.parse()?;
            let prompt = service.assemble_prompt(&query, &user, &agent, tier).await?;
            print(json, &prompt, || {
                format!(
                    "{}\n\n--- {} tier, ~{}/{} tokens, {} memories, {} fragments, {:?}{}",
                    prompt.text,
                    prompt.tier,
                    prompt.estimated_tokens,
                    prompt.budget_tokens,
                    prompt.memories.len(),
                    prompt.fragments.len(),
                    prompt.consolidation,
                    if prompt.hard_capped { ", hard-capped" } else { "" }
                )
            })
        }

        Commands::Fragment { action } => match action {
            FragmentAction::Add { category, priority, tier, agent, tags, content } => {
                let tier: ContextTier = tier.parse()?;
                let mut fragment = PromptFragment::new(category, content, tier)
                    .with_priority(priority)
                    .with_tags(tags);
                if let Some(agent) = agent {
                    fragment = fragment.for_agent(agent);
                }
                let id = service.add_fragment(fragment).await?;
                print(json, &serde_json::json!({ "id": id }), || format!("fragment {}", id))
            }
            FragmentAction::List { all } => {
                let fragments = service.list_fragments(all).await?;
                print(json, &fragments, || {
                    if fragments.is_empty() {
                        return "no fragments".into();
                    }
                    fragments
                        .iter()
                        .map(|f| {
                            format!(
                                "{} [{}] p={} tier={} agent={} {}{}",
                                f.id,
                                f.category,
                                f.priority,
                                f.context_tier,
                                f.agent_type.as_deref().unwrap_or("*"),
                                preview(&f.content, 60),
                                if f.is_active { "" } else { " (inactive)" }
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            FragmentAction::Disable { id } => {
                let changed = service.set_fragment_active(&id, false).await?;
                if !changed {
                    return Err(MemoryError::not_found(format!("fragment {}", id)));
                }
                print(json, &serde_json::json!({ "disabled": id }), || format!("disabled {}", id))
            }
        },

        Commands::Backfill { limit } => {
            let (embedded, failed) = service.backfill_embeddings(limit).await?;
            print(json, &serde_json::json!({ "embedded": embedded, "failed": failed }), || {
                format!("embedded {}, failed {}", embedded, failed)
            })
        }

        Commands::Completions { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_parses_out_of_range_scores() {
        let cli = Cli::try_parse_from(["merchant-memory", "importance", "m1", "-0.5"]).unwrap();
        assert!(matches!(cli.command, Commands::Importance { score, .. } if score == -0.5));
        let cli = Cli::try_parse_from(["merchant-memory", "importance", "m1", "1.7"]).unwrap();
        assert!(matches!(cli.command, Commands::Importance { score, .. } if score == 1.7));
    }

    #[tokio::test]
    async fn importance_command_clamps() {
        let service = MemoryService::init(MemoryConfig::in_memory(), None, None).await.unwrap();
        let id = service
            .store_memory("u1", "Ships with FedEx", MemoryCategory::Facts, 0.5, serde_json::json!({}))
            .await
            .unwrap();

        dispatch(&service, Commands::Importance { id: id.clone(), score: 1.7 }, true).await.unwrap();
        assert_eq!(service.get_memory(&id).await.unwrap().unwrap().importance_score, 1.0);
        dispatch(&service, Commands::Importance { id: id.clone(), score: -0.5 }, true).await.unwrap();
        assert_eq!(service.get_memory(&id).await.unwrap().unwrap().importance_score, 0.0);
        service.close().await;
    }
}
