use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::cli::StructureArgs;
use crate::dom::{Anchor, Document, EpisodeEntry, Heading, OutlineNode, Table};
use crate::fetch::{HttpPageFetcher, PageFetcher, RetryPolicy, RetryingFetcher};
use crate::formats::{ChapterNode, EpisodeNode, StoryStructure};
use crate::store::{sanitize_segment, write_json_atomic};

#[derive(Debug, thiserror::Error)]
pub enum StructureError {
    #[error("table of contents has no episode list or wikitable container")]
    Malformed,
    #[error("tab {0} does not exist in the table of contents")]
    MissingTab(usize),
    #[error("duplicate episode {episode:?} in chapter {chapter:?}")]
    DuplicateEpisode { chapter: String, episode: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructureOptions {
    /// Which `.tabber-item` panel holds the story list.
    pub tab: usize,
}

pub async fn run(args: StructureArgs) -> anyhow::Result<()> {
    let out_path = PathBuf::from(&args.out);
    if out_path.exists() && !args.force {
        anyhow::bail!("structure output already exists: {}", out_path.display());
    }

    let options = StructureOptions { tab: args.tab };
    let structure = match (&args.html, &args.url) {
        (Some(path), _) => {
            let html =
                std::fs::read_to_string(path).with_context(|| format!("read toc html: {path}"))?;
            extract(&html, options).context("extract story structure")?
        }
        (None, Some(url)) => {
            let url = Url::parse(url).context("parse --url")?;
            let fetcher = RetryingFetcher::new(
                HttpPageFetcher::new(Duration::from_secs(args.timeout_secs))
                    .context("build http client")?,
                RetryPolicy::default(),
            );
            fetch_structure(&fetcher, &url, options).await?
        }
        (None, None) => anyhow::bail!("either --html or --url is required"),
    };
    tracing::info!(
        wiki = %args.wiki,
        chapters = structure.chapters.len(),
        episodes = structure.episode_count(),
        "extracted story structure"
    );

    write_json_atomic(&out_path, &structure)
        .await
        .with_context(|| format!("write structure: {}", out_path.display()))?;
    Ok(())
}

pub async fn fetch_structure(
    fetcher: &dyn PageFetcher,
    url: &Url,
    options: StructureOptions,
) -> anyhow::Result<StoryStructure> {
    let page = fetcher
        .fetch(url)
        .await
        .with_context(|| format!("fetch toc: {url}"))?;
    let structure = extract(&page.html, options).context("extract story structure")?;
    Ok(structure)
}

pub fn read_structure(path: &std::path::Path) -> anyhow::Result<StoryStructure> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read structure: {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse structure: {}", path.display()))
}

/// Parses a table-of-contents page. The dialect is picked from the page
/// itself: tabbed episode lists first, then wikitable rows.
pub fn extract(html: &str, options: StructureOptions) -> Result<StoryStructure, StructureError> {
    let doc = Document::parse(html);
    let root = doc.root();

    let chapters = if crate::dom::has_episode_lists(root) {
        let nodes =
            crate::dom::outline(root, options.tab).ok_or(StructureError::MissingTab(options.tab))?;
        chapters_from_outline(nodes)
    } else {
        let tables = crate::dom::tables(root, "wikitable");
        if tables.is_empty() {
            return Err(StructureError::Malformed);
        }
        chapters_from_tables(&tables)
    };

    ensure_unique_episodes(&chapters)?;
    Ok(StoryStructure { chapters })
}

fn chapter_from_heading(heading: Heading) -> Option<ChapterNode> {
    let (source_title, translated_title) = match heading.split {
        Some(split) => split,
        None => (heading.combined, String::new()),
    };
    if source_title.is_empty() {
        return None;
    }
    Some(ChapterNode {
        source_title,
        translated_title,
        episodes: Vec::new(),
    })
}

fn episode_from_entry(entry: EpisodeEntry) -> Option<EpisodeNode> {
    let anchor = entry
        .anchors
        .into_iter()
        .find(|a| !a.text.is_empty() && !a.decorative && a.href.is_some())?;
    Some(EpisodeNode {
        link: anchor.href.unwrap_or_default(),
        source_title: anchor.text,
        translated_title: entry.translated,
    })
}

fn chapters_from_outline(nodes: Vec<OutlineNode>) -> Vec<ChapterNode> {
    let mut chapters = Vec::new();
    let mut current: Option<ChapterNode> = None;

    for node in nodes {
        match node {
            OutlineNode::Heading(heading) => {
                let combined = heading.combined.clone();
                let chapter = chapter_from_heading(heading);
                if chapter.is_none() {
                    tracing::warn!(heading = %combined, "skipping heading without a title");
                }
                chapters.extend(std::mem::replace(&mut current, chapter));
            }
            OutlineNode::Untitled => {
                tracing::warn!("skipping heading without a headline span");
                chapters.extend(current.take());
            }
            OutlineNode::Episode(entry) => {
                let Some(chapter) = current.as_mut() else {
                    tracing::debug!("episode entry outside a titled chapter; ignoring");
                    continue;
                };
                match episode_from_entry(entry) {
                    Some(episode) => chapter.episodes.push(episode),
                    None => tracing::debug!(
                        chapter = %chapter.source_title,
                        "episode entry without a usable link"
                    ),
                }
            }
        }
    }

    chapters.extend(current);
    chapters
}

fn is_episode_anchor(anchor: &Anchor) -> bool {
    !anchor.text.is_empty()
        && !anchor.decorative
        && anchor.href.as_deref().is_some_and(|h| !h.is_empty())
        && anchor.title.is_some()
}

fn chapters_from_tables(tables: &[Table]) -> Vec<ChapterNode> {
    let mut chapters = Vec::new();
    let mut current: Option<ChapterNode> = None;

    for table in tables {
        let width = table.width();
        for row in &table.rows {
            if let [only] = row.cells.as_slice()
                && only.colspan.is_some_and(|span| span > 1 && span >= width)
            {
                let title = only
                    .anchors
                    .iter()
                    .find(|a| !a.text.is_empty())
                    .map(|a| a.text.clone())
                    .unwrap_or_else(|| only.text.clone());
                if title.is_empty() {
                    tracing::warn!("skipping header row without a title");
                    continue;
                }
                let chapter = ChapterNode {
                    source_title: title,
                    translated_title: String::new(),
                    episodes: Vec::new(),
                };
                if let Some(done) = current.replace(chapter) {
                    chapters.push(done);
                }
                continue;
            }

            let Some(chapter) = current.as_mut() else {
                continue;
            };
            let cells = match row.cells.first() {
                Some(first) if first.has_rowspan => &row.cells[1..],
                _ => &row.cells[..],
            };
            for anchor in cells.iter().flat_map(|c| &c.anchors) {
                if !is_episode_anchor(anchor) {
                    continue;
                }
                chapter.episodes.push(EpisodeNode {
                    source_title: anchor.text.clone(),
                    translated_title: String::new(),
                    link: anchor.href.clone().unwrap_or_default(),
                });
            }
        }
    }

    chapters.extend(current);
    chapters
}

/// Episode titles address artifacts on disk, so two episodes of one chapter
/// must not map to the same file.
fn ensure_unique_episodes(chapters: &[ChapterNode]) -> Result<(), StructureError> {
    for chapter in chapters {
        let mut seen = HashSet::new();
        for episode in &chapter.episodes {
            if !seen.insert(sanitize_segment(&episode.source_title)) {
                return Err(StructureError::DuplicateEpisode {
                    chapter: chapter.source_title.clone(),
                    episode: episode.source_title.clone(),
                });
            }
        }
    }
    Ok(())
}
