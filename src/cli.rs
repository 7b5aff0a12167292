use std::path::PathBuf;

use clap::{Parser, Subcommand};
use protocol_retrieval::types::{SearchOptions, SearchParams, UserTier};

#[derive(Debug, Parser)]
#[command(
    name = "protocol-retrieval",
    about = "Retrieve and rank EMS protocol excerpts for clinical questions"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Corpus file (defaults to corpus.json in the data directory)
    #[arg(long, global = true)]
    pub corpus: Option<PathBuf>,

    /// Policy file (defaults to config.json in the data directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search the corpus for one question
    Search(SearchArgs),
    /// Run every question in a file through one pipeline and report latency
    Batch(BatchArgs),
}

// -- Scope shared by search and batch --

#[derive(Debug, Clone, clap::Args)]
pub struct ScopeArgs {
    /// Caller's agency id, boosts that agency's protocols
    #[arg(long)]
    pub agency_id: Option<i64>,

    /// Caller's agency name
    #[arg(long)]
    pub agency_name: Option<String>,

    /// Two-letter state code, restricts and boosts results
    #[arg(long)]
    pub state: Option<String>,

    /// Subscription tier: free, pro or enterprise
    #[arg(long, default_value = "free")]
    pub tier: UserTier,

    /// Override the number of results returned
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

impl ScopeArgs {
    pub fn params(&self, query: &str) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            agency_id: self.agency_id,
            agency_name: self.agency_name.clone(),
            state_code: self.state.clone(),
            limit: self.limit,
            user_tier: self.tier,
        }
    }
}

// -- Ranking switches shared by search and batch --

#[derive(Debug, Clone, Copy, clap::Args)]
pub struct RankingArgs {
    /// Search several query variants and fuse them
    #[arg(long)]
    pub multi_query: bool,

    /// Force multi-query, advanced re-ranking and context boost
    #[arg(long)]
    pub high_accuracy: bool,

    /// Use the basic re-ranker only
    #[arg(long, conflicts_with = "high_accuracy")]
    pub basic_rerank: bool,

    /// Skip the agency/state boost
    #[arg(long, conflicts_with = "high_accuracy")]
    pub no_context_boost: bool,
}

impl RankingArgs {
    pub fn options(&self) -> SearchOptions {
        if self.high_accuracy {
            return SearchOptions::high_accuracy();
        }
        SearchOptions {
            multi_query: self.multi_query,
            advanced_rerank: !self.basic_rerank,
            context_boost: !self.no_context_boost,
        }
    }
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The clinical question
    pub query: String,

    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub ranking: RankingArgs,

    /// Output the full response as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Batch --

#[derive(Debug, Parser)]
pub struct BatchArgs {
    /// File with one question per line; blank lines and # comments are
    /// skipped
    pub file: PathBuf,

    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub ranking: RankingArgs,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["protocol-retrieval", "search", "epi dose"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "epi dose");
                assert_eq!(args.scope.tier, UserTier::Free);
                assert_eq!(args.scope.limit, None);
                assert!(!args.json);
                assert_eq!(args.ranking.options(), SearchOptions::default());
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_search_scope() {
        let cli = Cli::parse_from([
            "protocol-retrieval",
            "search",
            "chest pain",
            "--agency-id",
            "12",
            "--state",
            "ca",
            "--tier",
            "pro",
            "-n",
            "3",
        ]);
        let Command::Search(args) = cli.command else {
            panic!("expected search command");
        };
        let params = args.scope.params(&args.query);
        assert_eq!(params.agency_id, Some(12));
        assert_eq!(params.state_code.as_deref(), Some("ca"));
        assert_eq!(params.user_tier, UserTier::Pro);
        assert_eq!(params.limit, Some(3));
    }

    #[test]
    fn ranking_switches_map_to_options() {
        let cli = Cli::parse_from([
            "protocol-retrieval",
            "search",
            "q",
            "--basic-rerank",
            "--no-context-boost",
            "--multi-query",
        ]);
        let Command::Search(args) = cli.command else {
            panic!("expected search command");
        };
        assert_eq!(
            args.ranking.options(),
            SearchOptions {
                multi_query: true,
                advanced_rerank: false,
                context_boost: false,
            }
        );
    }

    #[test]
    fn high_accuracy_conflicts_with_basic_rerank() {
        let parsed = Cli::try_parse_from([
            "protocol-retrieval",
            "search",
            "q",
            "--high-accuracy",
            "--basic-rerank",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_batch_with_global_flags() {
        let cli = Cli::parse_from([
            "protocol-retrieval",
            "batch",
            "queries.txt",
            "--corpus",
            "c.json",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.corpus, Some(PathBuf::from("c.json")));
        assert!(matches!(cli.command, Command::Batch(_)));
    }
}
