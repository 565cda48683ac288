use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::ValueEnum;

use crate::cli::{AlignArgs, PlanArgs};
use crate::formats::{
    AlignedLine, AlignmentManifest, ChapterNode, DialogueLine, EpisodeNode, ManifestEntry,
    StoryStructure, Wiki,
};
use crate::store::{ArtifactStore, EpisodeKey, LocalFsArtifactStore, TranscriptKey};

/// How two lines at the same index are compared when lengths disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Equivalence {
    /// Both narration or both spoken.
    Narration,
    /// Identical text.
    Text,
}

impl Equivalence {
    pub fn matches(self, source: &DialogueLine, target: &DialogueLine) -> bool {
        match self {
            Self::Narration => source.is_narration() == target.is_narration(),
            Self::Text => source.text == target.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "dialogue diverges at line {} (source has {source_len}, target has {target_len}): {source_text:?} vs {target_text:?}",
    .index + 1
)]
pub struct AlignmentMismatch {
    pub index: usize,
    pub source_len: usize,
    pub target_len: usize,
    pub source_text: Option<String>,
    pub target_text: Option<String>,
}

/// Pairs line `i` of `source` with line `i` of `target`. Sequences of
/// different length are rejected at the first index where `equivalent`
/// fails, or at the end of the shorter one.
pub fn align(
    source: &[DialogueLine],
    target: &[DialogueLine],
    equivalent: impl Fn(&DialogueLine, &DialogueLine) -> bool,
) -> Result<Vec<AlignedLine>, AlignmentMismatch> {
    if source.len() != target.len() {
        let index = source
            .iter()
            .zip(target)
            .position(|(s, t)| !equivalent(s, t))
            .unwrap_or_else(|| source.len().min(target.len()));
        return Err(AlignmentMismatch {
            index,
            source_len: source.len(),
            target_len: target.len(),
            source_text: source.get(index).map(|l| l.text.clone()),
            target_text: target.get(index).map(|l| l.text.clone()),
        });
    }

    Ok(source
        .iter()
        .zip(target)
        .map(|(s, t)| AlignedLine {
            source_speaker: s.speaker.clone(),
            source_text: s.text.clone(),
            target_speaker: t.speaker.clone(),
            target_text: t.text.clone(),
        })
        .collect())
}

fn same_title(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.to_lowercase() == b.to_lowercase()
}

fn last_link_segment(link: &str) -> &str {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn match_episode<'a>(episode: &EpisodeNode, chapter: &'a ChapterNode) -> Option<&'a EpisodeNode> {
    chapter
        .episodes
        .iter()
        .find(|t| same_title(&episode.translated_title, &t.source_title))
        .or_else(|| {
            let segment = last_link_segment(&episode.link);
            chapter
                .episodes
                .iter()
                .find(|t| same_title(segment, last_link_segment(&t.link)))
        })
}

/// Builds the alignment manifest by walking the source tree and looking up
/// each episode's counterpart through its translated titles.
pub fn plan(
    source_wiki: Wiki,
    source: &StoryStructure,
    target_wiki: Wiki,
    target: &StoryStructure,
) -> AlignmentManifest {
    let mut episodes = Vec::new();
    for chapter in &source.chapters {
        let Some(target_chapter) = target
            .chapters
            .iter()
            .find(|t| same_title(&chapter.translated_title, &t.source_title))
        else {
            tracing::warn!(
                chapter = %chapter.source_title,
                translated = %chapter.translated_title,
                "no matching target chapter"
            );
            continue;
        };

        for episode in &chapter.episodes {
            let Some(target_episode) = match_episode(episode, target_chapter) else {
                tracing::warn!(
                    chapter = %chapter.source_title,
                    episode = %episode.source_title,
                    "no matching target episode"
                );
                continue;
            };
            episodes.push(ManifestEntry {
                chapter: chapter.source_title.clone(),
                episode: episode.source_title.clone(),
                target_chapter: target_chapter.source_title.clone(),
                target_episode: target_episode.source_title.clone(),
            });
        }
    }

    AlignmentManifest {
        source: source_wiki,
        target: target_wiki,
        episodes,
    }
}

pub fn run_plan(args: PlanArgs) -> anyhow::Result<()> {
    let out_path = PathBuf::from(&args.out);
    if out_path.exists() && !args.force {
        anyhow::bail!("manifest output already exists: {}", out_path.display());
    }

    let source = crate::structure::read_structure(args.source.as_ref())?;
    let target = crate::structure::read_structure(args.target.as_ref())?;
    let manifest = plan(args.source_wiki, &source, args.target_wiki, &target);
    tracing::info!(
        paired = manifest.episodes.len(),
        source_episodes = source.episode_count(),
        "planned alignment"
    );
    write_manifest(&out_path, &manifest, args.force)
}

pub fn write_manifest(
    path: &std::path::Path,
    manifest: &AlignmentManifest,
    force: bool,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create manifest dir: {}", parent.display()))?;
    }

    let yaml = serde_yaml::to_string(manifest).context("serialize manifest yaml")?;
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut out = options
        .open(path)
        .with_context(|| format!("open manifest output: {}", path.display()))?;
    out.write_all(yaml.as_bytes())
        .with_context(|| format!("write manifest: {}", path.display()))?;
    out.flush().context("flush manifest")?;
    Ok(())
}

pub fn read_manifest(path: &std::path::Path) -> anyhow::Result<AlignmentManifest> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest: {}", path.display()))?;
    serde_yaml::from_str(&yaml).with_context(|| format!("parse manifest: {}", path.display()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignSummary {
    pub total: usize,
    pub aligned: usize,
    /// One side has not been crawled yet.
    pub pending: usize,
    pub mismatched: usize,
}

/// Aligns every manifest entry whose two sequences are both stored. A
/// mismatch only affects its own episode.
pub async fn align_manifest(
    store: &dyn ArtifactStore,
    manifest: &AlignmentManifest,
    equivalence: Equivalence,
) -> anyhow::Result<AlignSummary> {
    let mut summary = AlignSummary {
        total: manifest.episodes.len(),
        ..AlignSummary::default()
    };

    for entry in &manifest.episodes {
        let source_key = EpisodeKey::new(manifest.source, &entry.chapter, &entry.episode);
        let target_key = EpisodeKey::new(
            manifest.target,
            &entry.target_chapter,
            &entry.target_episode,
        );

        let source = load_dialogue(store, &source_key).await;
        let target = load_dialogue(store, &target_key).await;
        let (Some(source), Some(target)) = (source, target) else {
            tracing::info!(
                chapter = %entry.chapter,
                episode = %entry.episode,
                "dialogue not crawled on both sides yet; skipping"
            );
            summary.pending += 1;
            continue;
        };

        match align(&source, &target, |s, t| equivalence.matches(s, t)) {
            Ok(lines) => {
                let key = TranscriptKey {
                    source: manifest.source,
                    target: manifest.target,
                    chapter: entry.chapter.clone(),
                    episode: entry.episode.clone(),
                };
                store
                    .put_transcript(&key, &lines)
                    .await
                    .context("store transcript")?;
                tracing::info!(
                    chapter = %entry.chapter,
                    episode = %entry.episode,
                    lines = lines.len(),
                    "aligned"
                );
                summary.aligned += 1;
            }
            Err(mismatch) => {
                tracing::error!(
                    chapter = %entry.chapter,
                    episode = %entry.episode,
                    target_episode = %entry.target_episode,
                    "{mismatch}"
                );
                summary.mismatched += 1;
            }
        }
    }

    Ok(summary)
}

/// An unreadable artifact counts as not crawled, the same as in
/// [`ArtifactStore::exists`].
async fn load_dialogue(
    store: &dyn ArtifactStore,
    key: &EpisodeKey,
) -> Option<Vec<DialogueLine>> {
    match store.get(key).await {
        Ok(lines) => lines,
        Err(err) => {
            tracing::warn!(
                wiki = %key.source,
                chapter = %key.chapter,
                episode = %key.episode,
                "unreadable dialogue; treating as not crawled: {err:#}"
            );
            None
        }
    }
}

pub async fn run(args: AlignArgs) -> anyhow::Result<()> {
    let manifest = read_manifest(args.manifest.as_ref())?;
    let store = LocalFsArtifactStore::new(&args.store);
    let summary = align_manifest(&store, &manifest, args.equivalence).await?;
    report(&summary)
}

pub fn report(summary: &AlignSummary) -> anyhow::Result<()> {
    tracing::info!(
        total = summary.total,
        aligned = summary.aligned,
        pending = summary.pending,
        mismatched = summary.mismatched,
        "alignment finished"
    );
    if summary.mismatched > 0 {
        anyhow::bail!(
            "{} of {} episodes failed alignment",
            summary.mismatched,
            summary.total
        );
    }
    Ok(())
}
