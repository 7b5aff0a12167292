use std::{path::Path, sync::Arc};

use clap::Parser;
use protocol_retrieval::{
    CachePool,
    CorpusIndex,
    DataDir,
    KeywordNormalizer,
    PolicyConfig,
    RetrievalPipeline,
    bounded_cache::CacheStats,
    error,
    latency::LatencySnapshot,
    search,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{BatchArgs, Cli, Command, SearchArgs};

/// Environment variable holding a full `tracing` filter directive.
const LOG_ENV_VAR: &str = "PROTOCOL_RETRIEVAL_LOG";

/// Verbosity flags raise this crate's level only; dependencies stay at
/// `warn`.
fn log_directive(verbose: u8, quiet: bool) -> String {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    format!("warn,protocol_retrieval={level}")
}

fn init_tracing(verbose: u8, quiet: bool) {
    let fallback = log_directive(verbose, quiet);
    let (filter, rejected) = match std::env::var(LOG_ENV_VAR) {
        Ok(env) => match EnvFilter::try_new(&env) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new(&fallback), Some(env)),
        },
        Err(_) => (EnvFilter::new(&fallback), None),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    if let Some(env) = rejected {
        warn!(directive = %env, "ignoring invalid {LOG_ENV_VAR}");
    }
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let default_config = data_dir.config();
    let config = PolicyConfig::resolve(
        cli.config.as_deref(),
        Some(default_config.as_path()),
    )?;
    let corpus_path = data_dir.locate_corpus(cli.corpus.as_deref())?;
    let corpus = open_corpus(&corpus_path)?;

    let pipeline = RetrievalPipeline::with_config(
        Arc::new(corpus),
        Arc::new(KeywordNormalizer),
        config,
    );

    match cli.command {
        Command::Search(args) => cmd_search(&pipeline, &args).await?,
        Command::Batch(args) => cmd_batch(&pipeline, &args).await?,
    }

    Ok(())
}

fn open_corpus(path: &Path) -> error::Result<CorpusIndex> {
    let corpus = CorpusIndex::load(path)?;
    if corpus.is_empty() {
        warn!(path = %path.display(), "corpus is empty");
    }
    Ok(corpus)
}

async fn cmd_search(
    pipeline: &RetrievalPipeline,
    args: &SearchArgs,
) -> error::Result<()> {
    let params = args.scope.params(&args.query);
    let response = pipeline.search(&params, args.ranking.options()).await?;

    if args.json {
        search::format_json(&response)?;
    } else {
        search::format_human(&response);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEntry {
    query: String,
    result_count: usize,
    total_ms: f64,
    cache_hit: bool,
    /// Served from the last good answer after the search failed.
    fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchReport {
    queries: Vec<BatchEntry>,
    cache: CacheStats,
    pool: Vec<CacheStats>,
    latency: LatencySnapshot,
}

async fn cmd_batch(
    pipeline: &RetrievalPipeline,
    args: &BatchArgs,
) -> error::Result<()> {
    let contents = std::fs::read_to_string(&args.file)?;
    let questions: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    let pool = CachePool::from_config(pipeline.config());
    let every = pipeline.config().sweep_interval();
    let _sweeper = pipeline.cache().spawn_sweeper(every);
    let _pool_sweepers = pool.spawn_sweepers(every);
    let options = args.ranking.options();

    let mut entries = Vec::with_capacity(questions.len());
    for question in questions {
        let params = args.scope.params(question);
        let entry = match pipeline.search(&params, options).await {
            Ok(response) => {
                pool.search_fallback.set(question, response.results);
                BatchEntry {
                    query: question.to_string(),
                    result_count: response.metrics.result_count,
                    total_ms: response.metrics.total_ms,
                    cache_hit: response.metrics.cache_hit,
                    fallback: false,
                    error: None,
                }
            }
            Err(e) => {
                let last_good = pool.search_fallback.get(question);
                warn!(
                    query = question,
                    error = %e,
                    fallback = last_good.is_some(),
                    "query failed"
                );
                BatchEntry {
                    query: question.to_string(),
                    result_count: last_good.as_ref().map_or(0, Vec::len),
                    total_ms: 0.0,
                    cache_hit: false,
                    fallback: last_good.is_some(),
                    error: Some(e.to_string()),
                }
            }
        };
        entries.push(entry);
    }

    let report = BatchReport {
        queries: entries,
        cache: pipeline.cache().stats(),
        pool: pool.stats(),
        latency: pipeline.monitor().snapshot(),
    };
    info!(
        queries = report.queries.len(),
        healthy = report.latency.healthy,
        "batch complete"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    for e in &report.queries {
        match &e.error {
            Some(err) if e.fallback => println!(
                "{}\t{} result(s) from fallback\terror: {err}",
                e.query, e.result_count
            ),
            Some(err) => println!("{}\terror: {err}", e.query),
            None => println!(
                "{}\t{} result(s)\t{:.1}ms{}",
                e.query,
                e.result_count,
                e.total_ms,
                if e.cache_hit { " (cached)" } else { "" }
            ),
        }
    }

    println!();
    for c in std::iter::once(&report.cache).chain(&report.pool) {
        println!(
            "Cache '{}': {}/{} entries, {} hit(s), {} miss(es), hit rate \
             {:.2}, {} eviction(s)",
            c.name,
            c.entries,
            c.max_entries,
            c.hits,
            c.misses,
            c.hit_rate,
            c.evictions
        );
    }

    println!("\nLatency (last window):");
    for (op, s) in &report.latency.operations {
        println!(
            "  {:<16} n={:<5} avg {:>8.2}ms  p95 {:>8.2}ms",
            op.as_str(),
            s.count,
            s.average_ms,
            s.p95_ms
        );
    }
    println!(
        "Health: {}",
        if report.latency.healthy { "ok" } else { "degraded" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_scopes_to_this_crate() {
        assert_eq!(log_directive(0, false), "warn,protocol_retrieval=info");
        assert_eq!(log_directive(1, false), "warn,protocol_retrieval=debug");
        assert_eq!(log_directive(3, false), "warn,protocol_retrieval=trace");
        assert_eq!(log_directive(2, true), "warn,protocol_retrieval=warn");
    }

    #[test]
    fn directive_parses_as_filter() {
        for verbose in 0..3 {
            assert!(EnvFilter::try_new(log_directive(verbose, false)).is_ok());
        }
    }
}
