use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::cli::{BuildArgs, CrawlArgs};
use crate::crawl::{CrawlOptions, CrawlSummary};
use crate::fetch::{HttpPageFetcher, RetryPolicy, RetryingFetcher};
use crate::formats::{StoryStructure, Wiki};
use crate::store::LocalFsArtifactStore;
use crate::structure::StructureOptions;

/// Runs the whole pipeline into one workspace. Re-running against the same
/// workspace reuses the stored structures and skips crawled episodes.
pub async fn run(args: BuildArgs) -> anyhow::Result<()> {
    if args.source_wiki == args.target_wiki {
        anyhow::bail!("source and target wiki must differ");
    }

    let workspace_dir = PathBuf::from(&args.out);
    std::fs::create_dir_all(&workspace_dir)
        .with_context(|| format!("create workspace dir: {}", workspace_dir.display()))?;
    let manifest_path = workspace_dir.join("alignment.yaml");

    let retry = RetryPolicy {
        attempts: args.attempts,
        delay: Duration::from_millis(args.retry_delay_ms),
    };

    tracing::info!(wiki = %args.source_wiki, url = %args.source_toc, "build: structure");
    let source = load_structure(
        &workspace_dir,
        args.source_wiki,
        &args.source_toc,
        StructureOptions {
            tab: args.source_tab,
        },
        &args,
        retry,
    )
    .await
    .context("source structure")?;

    tracing::info!(wiki = %args.target_wiki, url = %args.target_toc, "build: structure");
    let target = load_structure(
        &workspace_dir,
        args.target_wiki,
        &args.target_toc,
        StructureOptions {
            tab: args.target_tab,
        },
        &args,
        retry,
    )
    .await
    .context("target structure")?;

    let source_options = crawl_options(
        &args,
        &workspace_dir,
        args.source_wiki,
        args.source_base_url.clone(),
    )?;
    let target_options = crawl_options(
        &args,
        &workspace_dir,
        args.target_wiki,
        args.target_base_url.clone(),
    )?;

    tracing::info!("build: crawl");
    let shutdown = crate::crawl::shutdown_on_ctrl_c();
    let (source_summary, target_summary) = tokio::join!(
        crate::crawl::crawl_wiki(&source_options, &source, shutdown.clone()),
        crate::crawl::crawl_wiki(&target_options, &target, shutdown.clone()),
    );
    let source_summary = source_summary.context("crawl source")?;
    let target_summary = target_summary.context("crawl target")?;
    if source_summary.interrupted || target_summary.interrupted {
        anyhow::bail!("build interrupted; re-run to resume");
    }
    warn_incomplete(args.source_wiki, &source_summary);
    warn_incomplete(args.target_wiki, &target_summary);

    tracing::info!("build: plan");
    let manifest = crate::align::plan(args.source_wiki, &source, args.target_wiki, &target);
    crate::align::write_manifest(&manifest_path, &manifest, true).context("write manifest")?;

    tracing::info!("build: align");
    let store = LocalFsArtifactStore::new(&workspace_dir);
    let summary = crate::align::align_manifest(&store, &manifest, args.equivalence)
        .await
        .context("align")?;
    crate::align::report(&summary)?;

    tracing::info!(out = %workspace_dir.display(), "build: done");
    Ok(())
}

pub fn structure_path(workspace_dir: &Path, wiki: Wiki) -> PathBuf {
    workspace_dir
        .join("structure")
        .join(format!("{}.json", wiki.as_str()))
}

async fn load_structure(
    workspace_dir: &Path,
    wiki: Wiki,
    toc_url: &str,
    options: StructureOptions,
    args: &BuildArgs,
    retry: RetryPolicy,
) -> anyhow::Result<StoryStructure> {
    let path = structure_path(workspace_dir, wiki);
    if path.exists() {
        tracing::info!(path = %path.display(), "reusing stored structure");
        return crate::structure::read_structure(&path);
    }

    let url = Url::parse(toc_url).with_context(|| format!("parse toc url: {toc_url}"))?;
    let fetcher = RetryingFetcher::new(
        HttpPageFetcher::new(Duration::from_secs(args.timeout_secs))
            .context("build http client")?,
        retry,
    );
    let structure = crate::structure::fetch_structure(&fetcher, &url, options).await?;
    tracing::info!(
        wiki = %wiki,
        chapters = structure.chapters.len(),
        episodes = structure.episode_count(),
        "extracted story structure"
    );
    crate::store::write_json_atomic(&path, &structure)
        .await
        .with_context(|| format!("write structure: {}", path.display()))?;
    Ok(structure)
}

fn crawl_options(
    args: &BuildArgs,
    workspace_dir: &Path,
    wiki: Wiki,
    base_url: Option<String>,
) -> anyhow::Result<CrawlOptions> {
    CrawlOptions::from_args(&CrawlArgs {
        wiki,
        structure: structure_path(workspace_dir, wiki)
            .to_string_lossy()
            .to_string(),
        store: workspace_dir.to_string_lossy().to_string(),
        base_url,
        delay_min_ms: args.delay_min_ms,
        delay_max_ms: args.delay_max_ms,
        timeout_secs: args.timeout_secs,
        attempts: args.attempts,
        retry_delay_ms: args.retry_delay_ms,
    })
    .with_context(|| format!("crawl options for {wiki}"))
}

fn warn_incomplete(wiki: Wiki, summary: &CrawlSummary) {
    if summary.failed > 0 {
        tracing::warn!(
            wiki = %wiki,
            failed = summary.failed,
            "some episodes were not crawled; their alignment stays pending"
        );
    }
}
