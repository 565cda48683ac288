use clap::{Args, Parser, Subcommand};

use crate::align::Equivalence;
use crate::formats::Wiki;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extract the chapter/episode tree from a table-of-contents page.
    Structure(StructureArgs),
    /// Fetch and store the dialogue of every episode not stored yet.
    Crawl(CrawlArgs),
    /// Pair episodes of two structures into an alignment manifest.
    Plan(PlanArgs),
    /// Align stored dialogue of every manifest entry.
    Align(AlignArgs),
    /// Structure, crawl (both wikis concurrently), plan and align.
    Build(BuildArgs),
}

#[derive(Debug, Args)]
pub struct StructureArgs {
    /// Wiki the page belongs to.
    #[arg(long, value_enum)]
    pub wiki: Wiki,

    /// Saved table-of-contents HTML.
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    pub html: Option<String>,

    /// Table-of-contents URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Output path for the structure JSON.
    #[arg(long)]
    pub out: String,

    /// Tab panel holding the story list (tabbed pages only).
    #[arg(long, default_value_t = 0)]
    pub tab: usize,

    /// Per-request timeout.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Overwrite an existing output file.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    /// Wiki to crawl.
    #[arg(long, value_enum)]
    pub wiki: Wiki,

    /// Structure JSON (created by `structure`).
    #[arg(long)]
    pub structure: String,

    /// Artifact directory; stored episodes are skipped.
    #[arg(long)]
    pub store: String,

    /// Base URL episode links are resolved against (default: the wiki's).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Lower bound of the pause after each crawled episode.
    #[arg(long, default_value_t = 5000)]
    pub delay_min_ms: u64,

    /// Upper bound of the pause after each crawled episode.
    #[arg(long, default_value_t = 10000)]
    pub delay_max_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Fetch attempts per episode.
    #[arg(long, default_value_t = 3)]
    pub attempts: u32,

    /// Backoff unit; the n-th retry waits n times this.
    #[arg(long, default_value_t = 5000)]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Source structure JSON.
    #[arg(long)]
    pub source: String,

    #[arg(long, value_enum, default_value_t = Wiki::Huiji)]
    pub source_wiki: Wiki,

    /// Target structure JSON.
    #[arg(long)]
    pub target: String,

    #[arg(long, value_enum, default_value_t = Wiki::Fandom)]
    pub target_wiki: Wiki,

    /// Output path for `alignment.yaml`.
    #[arg(long)]
    pub out: String,

    /// Overwrite an existing manifest.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct AlignArgs {
    /// Alignment manifest (created by `plan`).
    #[arg(long)]
    pub manifest: String,

    /// Artifact directory holding both crawls.
    #[arg(long)]
    pub store: String,

    /// Line comparison used to locate a divergence.
    #[arg(long, value_enum, default_value_t = Equivalence::Narration)]
    pub equivalence: Equivalence,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Workspace directory (structure/, dialogues/, aligned/, reports/).
    #[arg(long)]
    pub out: String,

    /// Table-of-contents URL of the source wiki.
    #[arg(long)]
    pub source_toc: String,

    #[arg(long, value_enum, default_value_t = Wiki::Huiji)]
    pub source_wiki: Wiki,

    /// Base URL for source episode links (default: the wiki's).
    #[arg(long)]
    pub source_base_url: Option<String>,

    /// Tab panel of the source table of contents.
    #[arg(long, default_value_t = 0)]
    pub source_tab: usize,

    /// Table-of-contents URL of the target wiki.
    #[arg(long)]
    pub target_toc: String,

    #[arg(long, value_enum, default_value_t = Wiki::Fandom)]
    pub target_wiki: Wiki,

    /// Base URL for target episode links (default: the wiki's).
    #[arg(long)]
    pub target_base_url: Option<String>,

    /// Tab panel of the target table of contents.
    #[arg(long, default_value_t = 0)]
    pub target_tab: usize,

    #[arg(long, default_value_t = 5000)]
    pub delay_min_ms: u64,

    #[arg(long, default_value_t = 10000)]
    pub delay_max_ms: u64,

    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub attempts: u32,

    #[arg(long, default_value_t = 5000)]
    pub retry_delay_ms: u64,

    #[arg(long, value_enum, default_value_t = Equivalence::Narration)]
    pub equivalence: Equivalence,
}
