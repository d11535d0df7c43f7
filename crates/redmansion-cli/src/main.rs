//! redmansion - diagnostics for the reading client's session caches.
//!
//! Inspects and exercises the same caches, identity session and progress
//! tracker the reader uses, against the configured remote service.

use std::io;

use anyhow::{bail, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use redmansion_core::cache::{CacheStats, IndexSource};
use redmansion_core::models::chapter::find_by_number;
use redmansion_core::utils::format_age;
use redmansion_core::{AppContext, Config, IdentityState};

// ============================================================================
// Constants
// ============================================================================

/// Maximum chapter lists fetched at once by `prefetch`
const PREFETCH_CONCURRENCY: usize = 4;

const USAGE: &str = "\
Usage: redmansion <command> [args]

Commands:
  stats              Show cache sizes, limits and ages
  clear              Clear the media and chapter index caches
  whoami             Revalidate and show the signed-in identity
  chapters <id>      Show the chapter index of a content item
  prefetch <id>...   Warm the chapter index cache for several items
  resume <id>        Show where reading would resume
  logout             Sign out and drop the cached identity

Environment:
  REDMANSION_API_URL    Remote service base URL
  REDMANSION_API_TOKEN  Bearer token
  RUST_LOG              Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes buffered log lines when dropped.
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if command == "-h" || command == "--help" || command == "help" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let ctx = AppContext::from_config(config)?;
    info!(command = %command, "redmansion starting");

    match (command.as_str(), &args[1..]) {
        ("stats", []) => show_stats(&ctx).await,
        ("clear", []) => {
            ctx.clear_caches().await;
            println!("Caches cleared");
            Ok(())
        }
        ("whoami", []) => whoami(&ctx).await,
        ("chapters", [content_id]) => show_chapters(&ctx, content_id).await,
        ("prefetch", ids) if !ids.is_empty() => prefetch(&ctx, ids).await,
        ("resume", [content_id]) => resume(&ctx, content_id).await,
        ("logout", []) => {
            let outcome = ctx.logout().await;
            if let Some(flush) = outcome.final_flush {
                let _ = flush.await;
            }
            println!("Signed out");
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "))
        }
    }
}

fn print_cache_line(stats: &CacheStats) {
    let now = Utc::now();
    let oldest = stats
        .oldest_access
        .map(|at| format_age(at, now))
        .unwrap_or_else(|| "-".to_string());
    let ttl = stats
        .ttl_hours
        .map(|hours| format!("{}h", hours))
        .unwrap_or_else(|| "none".to_string());

    println!(
        "{:<32} {:>4}/{:<4} ttl: {:<5} oldest: {:<10} persist failures: {}",
        stats.namespace, stats.size, stats.max_entries, ttl, oldest, stats.persist_failures
    );
}

async fn show_stats(ctx: &AppContext) -> Result<()> {
    let stats = ctx.stats().await;

    print_cache_line(&stats.media.covers);
    print_cache_line(&stats.media.authors);
    print_cache_line(&stats.chapter_index);
    println!(
        "identity: {}",
        stats.identity.as_deref().unwrap_or("(not signed in)")
    );
    println!(
        "storage: {}",
        ctx.config().storage_dir()?.display()
    );
    Ok(())
}

async fn whoami(ctx: &AppContext) -> Result<()> {
    if let Some(revalidation) = ctx.on_navigate() {
        revalidation.await?;
    }

    match ctx.identity().state() {
        IdentityState::Validated(identity) | IdentityState::Optimistic(identity) => {
            println!("{} ({})", identity.display_name(), identity.id);
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        IdentityState::Expired => println!("Session expired, not signed in"),
        _ => println!("Not signed in"),
    }
    Ok(())
}

async fn show_chapters(ctx: &AppContext, content_id: &str) -> Result<()> {
    let load = ctx.load_chapter_index(content_id).await;
    let source = match load.source {
        IndexSource::Fresh => "cached",
        IndexSource::Stale => "cached, stale",
        IndexSource::Fetched => "fetched",
        IndexSource::Unavailable => "unavailable",
    };

    println!("{} chapters ({})", load.chapters.len(), source);
    for chapter in &load.chapters {
        println!("  {:>4}  {}", chapter.chapter_number, chapter.display_title());
    }

    // Let a background refresh land in the cache before exiting
    if let Some(refresh) = load.refresh {
        refresh.await?;
    }
    Ok(())
}

async fn prefetch(ctx: &AppContext, content_ids: &[String]) -> Result<()> {
    let results: Vec<(String, usize, IndexSource)> = stream::iter(content_ids)
        .map(|content_id| async move {
            let load = ctx.load_chapter_index(content_id).await;
            if let Some(refresh) = load.refresh {
                let _ = refresh.await;
            }
            (content_id.clone(), load.chapters.len(), load.source)
        })
        .buffer_unordered(PREFETCH_CONCURRENCY)
        .collect()
        .await;

    for (content_id, count, source) in &results {
        println!("{:<24} {:>4} chapters ({:?})", content_id, count, source);
    }
    let unavailable = results
        .iter()
        .filter(|(_, _, source)| *source == IndexSource::Unavailable)
        .count();
    if unavailable > 0 {
        eprintln!("{} of {} chapter lists unavailable", unavailable, results.len());
    }
    Ok(())
}

async fn resume(ctx: &AppContext, content_id: &str) -> Result<()> {
    if let Some(revalidation) = ctx.on_navigate() {
        revalidation.await?;
    }
    let point = ctx.tracker().resume_point(content_id).await?;
    let load = ctx.load_chapter_index(content_id).await;
    let title = find_by_number(&load.chapters, point.chapter_number)
        .map(|chapter| chapter.display_title())
        .unwrap_or_else(|| format!("Chapter {}", point.chapter_number));
    println!(
        "{}, paragraph {} ({})",
        title, point.paragraph_index, point.status
    );
    if let Some(refresh) = load.refresh {
        refresh.await?;
    }
    Ok(())
}
