use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::formats::{AlignedLine, DialogueLine, Language, Wiki};

/// Address of one persisted dialogue sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeKey {
    pub source: Wiki,
    pub language: Language,
    pub chapter: String,
    pub episode: String,
}

impl EpisodeKey {
    pub fn new(source: Wiki, chapter: impl Into<String>, episode: impl Into<String>) -> Self {
        Self {
            source,
            language: source.language(),
            chapter: chapter.into(),
            episode: episode.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranscriptKey {
    pub source: Wiki,
    pub target: Wiki,
    pub chapter: String,
    pub episode: String,
}

/// Persisted artifacts of a crawl. A stored, non-empty sequence is the only
/// record that an episode is done.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &EpisodeKey) -> anyhow::Result<Option<Vec<DialogueLine>>>;
    /// Publishes the whole sequence at once; readers never see a prefix.
    async fn put(&self, key: &EpisodeKey, lines: &[DialogueLine]) -> anyhow::Result<()>;
    async fn exists(&self, key: &EpisodeKey) -> anyhow::Result<bool>;
    async fn put_transcript(
        &self,
        key: &TranscriptKey,
        lines: &[AlignedLine],
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsArtifactStore {
    base_dir: PathBuf,
}

impl LocalFsArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn dialogue_path(&self, key: &EpisodeKey) -> PathBuf {
        self.base_dir
            .join("dialogues")
            .join(key.source.as_str())
            .join(key.language.as_str())
            .join(sanitize_segment(&key.chapter))
            .join(format!("{}.json", sanitize_segment(&key.episode)))
    }

    pub fn transcript_path(&self, key: &TranscriptKey) -> PathBuf {
        self.base_dir
            .join("aligned")
            .join(format!("{}-{}", key.source, key.target))
            .join(sanitize_segment(&key.chapter))
            .join(format!("{}.json", sanitize_segment(&key.episode)))
    }
}

#[async_trait]
impl ArtifactStore for LocalFsArtifactStore {
    async fn get(&self, key: &EpisodeKey) -> anyhow::Result<Option<Vec<DialogueLine>>> {
        let path = self.dialogue_path(key);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, key: &EpisodeKey, lines: &[DialogueLine]) -> anyhow::Result<()> {
        if lines.is_empty() {
            anyhow::bail!("refusing to store an empty dialogue sequence");
        }
        write_json_atomic(&self.dialogue_path(key), lines)
            .await
            .context("write dialogue")
    }

    async fn exists(&self, key: &EpisodeKey) -> anyhow::Result<bool> {
        let path = self.dialogue_path(key);
        match read_json::<Vec<DialogueLine>>(&path).await {
            Ok(Some(lines)) => Ok(!lines.is_empty()),
            Ok(None) => Ok(false),
            Err(err) => {
                tracing::warn!(path = %path.display(), ?err, "unreadable dialogue file; treating as not crawled");
                Ok(false)
            }
        }
    }

    async fn put_transcript(
        &self,
        key: &TranscriptKey,
        lines: &[AlignedLine],
    ) -> anyhow::Result<()> {
        write_json_atomic(&self.transcript_path(key), lines)
            .await
            .context("write transcript")
    }
}

/// Keeps everything in memory; for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    dialogues: Mutex<HashMap<EpisodeKey, Vec<DialogueLine>>>,
    transcripts: Mutex<HashMap<TranscriptKey, Vec<AlignedLine>>>,
}

impl MemoryArtifactStore {
    pub async fn transcript(&self, key: &TranscriptKey) -> Option<Vec<AlignedLine>> {
        self.transcripts.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &EpisodeKey) -> anyhow::Result<Option<Vec<DialogueLine>>> {
        Ok(self.dialogues.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &EpisodeKey, lines: &[DialogueLine]) -> anyhow::Result<()> {
        if lines.is_empty() {
            anyhow::bail!("refusing to store an empty dialogue sequence");
        }
        self.dialogues
            .lock()
            .await
            .insert(key.clone(), lines.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &EpisodeKey) -> anyhow::Result<bool> {
        Ok(self
            .dialogues
            .lock()
            .await
            .get(key)
            .is_some_and(|lines| !lines.is_empty()))
    }

    async fn put_transcript(
        &self,
        key: &TranscriptKey,
        lines: &[AlignedLine],
    ) -> anyhow::Result<()> {
        self.transcripts
            .lock()
            .await
            .insert(key.clone(), lines.to_vec());
        Ok(())
    }
}

/// Turns a title into a single safe path segment.
pub fn sanitize_segment(title: &str) -> String {
    let replaced: String = title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "_".to_owned();
    }
    trimmed.to_owned()
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

/// Writes to a sibling temp file and renames it over `path`.
pub async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
