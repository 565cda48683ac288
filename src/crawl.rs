use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use serde::Serialize;
use tokio::sync::watch;
use url::Url;

use crate::cli::CrawlArgs;
use crate::fetch::{FetchError, HttpPageFetcher, PageFetcher, RetryPolicy, RetryingFetcher};
use crate::formats::{ChapterNode, DialogueLine, EpisodeNode, StoryStructure, Wiki};
use crate::store::{ArtifactStore, EpisodeKey, LocalFsArtifactStore};

/// Randomized pause after each newly crawled episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> anyhow::Result<Self> {
        if min > max {
            anyhow::bail!("minimum delay {min:?} exceeds maximum delay {max:?}");
        }
        Ok(Self { min, max })
    }

    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn pick(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    Pending,
    Fetching,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum EpisodeFailure {
    #[error("page yielded no dialogue")]
    Empty,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid episode link {link:?}: {error}")]
    BadLink {
        link: String,
        error: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpisodeReport {
    pub chapter: String,
    pub episode: String,
    pub state: EpisodeState,
    /// Already stored before this run.
    pub resumed: bool,
    pub lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub total: usize,
    pub already_done: usize,
    pub newly_done: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub episodes: Vec<EpisodeReport>,
}

impl CrawlSummary {
    pub fn completion_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.already_done + self.newly_done) as f64 * 100.0 / self.total as f64
    }

    fn record(&mut self, report: EpisodeReport) {
        match (report.state, report.resumed) {
            (EpisodeState::Done, true) => self.already_done += 1,
            (EpisodeState::Done, false) => self.newly_done += 1,
            _ => self.failed += 1,
        }
        self.episodes.push(report);
    }
}

/// Walks a story structure and stores the dialogue of every episode that
/// is not stored yet. Safe to re-run: stored episodes are never fetched
/// again, failed ones are retried on the next run.
pub struct CrawlController {
    wiki: Wiki,
    base_url: Url,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ArtifactStore>,
    pacing: Pacing,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CrawlController {
    pub fn new(
        wiki: Wiki,
        base_url: Url,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ArtifactStore>,
        pacing: Pacing,
    ) -> Self {
        Self {
            wiki,
            base_url,
            fetcher,
            store,
            pacing,
            shutdown: None,
        }
    }

    /// Stop between steps once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn run(&self, structure: &StoryStructure) -> anyhow::Result<CrawlSummary> {
        let mut summary = CrawlSummary {
            total: structure.episode_count(),
            ..CrawlSummary::default()
        };

        for chapter in &structure.chapters {
            tracing::info!(
                wiki = %self.wiki,
                chapter = %chapter.source_title,
                translated = %chapter.translated_title,
                episodes = chapter.episodes.len(),
                "processing chapter"
            );

            for episode in &chapter.episodes {
                let key = EpisodeKey::new(self.wiki, &chapter.source_title, &episode.source_title);
                if self.store.exists(&key).await.context("check stored dialogue")? {
                    tracing::info!(episode = %episode.source_title, "already crawled; skipping");
                    summary.record(report(chapter, episode, EpisodeState::Done, true, 0, None));
                    continue;
                }

                let Some(fetched) = self.interruptible(self.fetch_episode(episode)).await else {
                    summary.interrupted = true;
                    return Ok(summary);
                };

                match fetched {
                    Ok(lines) => {
                        // Outside `interruptible`: a started write always reaches its rename.
                        self.store.put(&key, &lines).await.with_context(|| {
                            format!("store dialogue for {}", episode.source_title)
                        })?;
                        tracing::info!(
                            episode = %episode.source_title,
                            lines = lines.len(),
                            "crawled episode"
                        );
                        summary.record(report(
                            chapter,
                            episode,
                            EpisodeState::Done,
                            false,
                            lines.len(),
                            None,
                        ));
                        if self.interruptible(self.pace()).await.is_none() {
                            summary.interrupted = true;
                            return Ok(summary);
                        }
                    }
                    Err(failure) => {
                        tracing::warn!(
                            episode = %episode.source_title,
                            error = %failure,
                            "episode failed; it will be retried on the next run"
                        );
                        summary.record(report(
                            chapter,
                            episode,
                            EpisodeState::Failed,
                            false,
                            0,
                            Some(failure.to_string()),
                        ));
                    }
                }
            }
        }

        Ok(summary)
    }

    /// `Fetching` → the episode's dialogue, or why it failed. Nothing is
    /// stored here.
    async fn fetch_episode(
        &self,
        episode: &EpisodeNode,
    ) -> Result<Vec<DialogueLine>, EpisodeFailure> {
        let url = self
            .base_url
            .join(&episode.link)
            .map_err(|error| EpisodeFailure::BadLink {
                link: episode.link.clone(),
                error,
            })?;

        tracing::debug!(%url, state = ?EpisodeState::Fetching, "fetching episode");
        let page = self.fetcher.fetch(&url).await?;

        let lines = crate::dialogue::extract(&page.html, self.wiki.layout(), self.wiki.language());
        if lines.is_empty() {
            return Err(EpisodeFailure::Empty);
        }
        Ok(lines)
    }

    async fn pace(&self) {
        let wait = self.pacing.pick();
        if wait.is_zero() {
            return;
        }
        tracing::debug!(?wait, "pausing before next episode");
        tokio::time::sleep(wait).await;
    }

    /// `None` when shutdown was requested before `fut` finished.
    async fn interruptible<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return Some(fut.await);
        };
        if *shutdown.borrow() {
            return None;
        }

        // A dropped sender disables the second branch.
        tokio::select! {
            out = fut => Some(out),
            Ok(_) = shutdown.wait_for(|stop| *stop) => None,
        }
    }
}

fn report(
    chapter: &ChapterNode,
    episode: &EpisodeNode,
    state: EpisodeState,
    resumed: bool,
    lines: usize,
    error: Option<String>,
) -> EpisodeReport {
    EpisodeReport {
        chapter: chapter.source_title.clone(),
        episode: episode.source_title.clone(),
        state,
        resumed,
        lines,
        error,
    }
}

#[derive(Debug, Serialize)]
struct CrawlReport<'a> {
    wiki: Wiki,
    started_at: String,
    finished_at: String,
    completion_percent: f64,
    #[serde(flatten)]
    summary: &'a CrawlSummary,
}

pub fn log_summary(wiki: Wiki, summary: &CrawlSummary) {
    tracing::info!(
        %wiki,
        total = summary.total,
        already_done = summary.already_done,
        newly_done = summary.newly_done,
        failed = summary.failed,
        interrupted = summary.interrupted,
        "crawl finished ({:.2}% complete)",
        summary.completion_percent()
    );
}

pub fn report_path(store_dir: &Path, wiki: Wiki) -> PathBuf {
    store_dir.join("reports").join(format!("{wiki}-crawl.json"))
}

/// Options shared by the `crawl` and `build` commands.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub wiki: Wiki,
    pub base_url: Url,
    pub store_dir: PathBuf,
    pub pacing: Pacing,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl CrawlOptions {
    pub fn from_args(args: &CrawlArgs) -> anyhow::Result<Self> {
        let base_url = args
            .base_url
            .as_deref()
            .unwrap_or(args.wiki.default_base_url());
        Ok(Self {
            wiki: args.wiki,
            base_url: Url::parse(base_url).context("parse --base-url")?,
            store_dir: PathBuf::from(&args.store),
            pacing: Pacing::new(
                Duration::from_millis(args.delay_min_ms),
                Duration::from_millis(args.delay_max_ms),
            )?,
            timeout: Duration::from_secs(args.timeout_secs),
            retry: RetryPolicy {
                attempts: args.attempts,
                delay: Duration::from_millis(args.retry_delay_ms),
            },
        })
    }
}

/// Crawls one wiki to completion (or interruption) and writes its report.
pub async fn crawl_wiki(
    options: &CrawlOptions,
    structure: &StoryStructure,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<CrawlSummary> {
    let started_at = chrono::Utc::now().to_rfc3339();
    let fetcher = RetryingFetcher::new(
        HttpPageFetcher::new(options.timeout).context("build http client")?,
        options.retry,
    );
    let controller = CrawlController::new(
        options.wiki,
        options.base_url.clone(),
        Arc::new(fetcher),
        Arc::new(LocalFsArtifactStore::new(&options.store_dir)),
        options.pacing,
    )
    .with_shutdown(shutdown);

    let summary = controller.run(structure).await?;
    log_summary(options.wiki, &summary);

    let report = CrawlReport {
        wiki: options.wiki,
        started_at,
        finished_at: chrono::Utc::now().to_rfc3339(),
        completion_percent: summary.completion_percent(),
        summary: &summary,
    };
    let path = report_path(&options.store_dir, options.wiki);
    crate::store::write_json_atomic(&path, &report)
        .await
        .with_context(|| format!("write crawl report: {}", path.display()))?;
    Ok(summary)
}

/// Flips to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current step");
            let _ = tx.send(true);
        }
    });
    rx
}

pub async fn run(args: CrawlArgs) -> anyhow::Result<()> {
    let options = CrawlOptions::from_args(&args)?;
    let structure = crate::structure::read_structure(Path::new(&args.structure))?;
    crawl_wiki(&options, &structure, shutdown_on_ctrl_c()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::fetch::Page;
    use crate::formats::AlignedLine;
    use crate::store::{MemoryArtifactStore, TranscriptKey};

    /// Serves canned pages and counts requests.
    #[derive(Default)]
    struct CannedFetcher {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<String>>,
    }

    impl CannedFetcher {
        fn with_page(mut self, path: &str, html: &str) -> Self {
            self.pages.insert(path.to_owned(), html.to_owned());
            self
        }

        fn request_count(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl PageFetcher for CannedFetcher {
        async fn fetch(&self, url: &Url) -> Result<Page, FetchError> {
            self.requests
                .lock()
                .expect("lock")
                .push(url.path().to_owned());
            match self.pages.get(url.path()) {
                Some(html) => Ok(Page {
                    url: url.clone(),
                    html: html.clone(),
                }),
                None => Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    fn story_page(text: &str) -> String {
        format!(
            r#"<div class="mw-parser-output"><div class="story-text"><div>维尔汀：</div><div>{text}</div></div></div>"#
        )
    }

    fn structure() -> StoryStructure {
        let episode = |title: &str, link: &str| EpisodeNode {
            source_title: title.to_owned(),
            translated_title: String::new(),
            link: link.to_owned(),
        };
        StoryStructure {
            chapters: vec![
                ChapterNode {
                    source_title: "第一章".to_owned(),
                    translated_title: "Chapter 1".to_owned(),
                    episodes: vec![episode("雨", "/wiki/1-01"), episode("空", "/wiki/1-02")],
                },
                ChapterNode {
                    source_title: "第二章".to_owned(),
                    translated_title: "Chapter 2".to_owned(),
                    episodes: vec![episode("风", "/wiki/2-01")],
                },
            ],
        }
    }

    fn controller(
        fetcher: Arc<CannedFetcher>,
        store: Arc<MemoryArtifactStore>,
    ) -> anyhow::Result<CrawlController> {
        paced_controller(fetcher, store, Pacing::none())
    }

    fn paced_controller(
        fetcher: Arc<CannedFetcher>,
        store: Arc<dyn ArtifactStore>,
        pacing: Pacing,
    ) -> anyhow::Result<CrawlController> {
        Ok(CrawlController::new(
            Wiki::Huiji,
            Url::parse("https://res1999.example")?,
            fetcher,
            store,
            pacing,
        ))
    }

    /// Requests shutdown while a write is in flight.
    struct InterruptingStore {
        inner: MemoryArtifactStore,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl ArtifactStore for InterruptingStore {
        async fn get(&self, key: &EpisodeKey) -> anyhow::Result<Option<Vec<DialogueLine>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &EpisodeKey, lines: &[DialogueLine]) -> anyhow::Result<()> {
            let _ = self.shutdown.send(true);
            tokio::task::yield_now().await;
            self.inner.put(key, lines).await
        }

        async fn exists(&self, key: &EpisodeKey) -> anyhow::Result<bool> {
            self.inner.exists(key).await
        }

        async fn put_transcript(
            &self,
            key: &TranscriptKey,
            lines: &[AlignedLine],
        ) -> anyhow::Result<()> {
            self.inner.put_transcript(key, lines).await
        }
    }

    #[tokio::test]
    async fn second_run_fetches_nothing() -> anyhow::Result<()> {
        let fetcher = Arc::new(
            CannedFetcher::default()
                .with_page("/wiki/1-01", &story_page("下雨了。"))
                .with_page("/wiki/1-02", &story_page("天晴了。"))
                .with_page("/wiki/2-01", &story_page("起风了。")),
        );
        let store = Arc::new(MemoryArtifactStore::default());

        let first = controller(fetcher.clone(), store.clone())?
            .run(&structure())
            .await?;
        assert_eq!((first.newly_done, first.already_done, first.failed), (3, 0, 0));
        assert_eq!(fetcher.request_count(), 3);

        let second = controller(fetcher.clone(), store.clone())?
            .run(&structure())
            .await?;
        assert_eq!((second.newly_done, second.already_done, second.failed), (0, 3, 0));
        assert_eq!(fetcher.request_count(), 3);
        assert_eq!(second.completion_percent(), 100.0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_and_failed_episodes_are_retried_next_run() -> anyhow::Result<()> {
        let fetcher = Arc::new(
            CannedFetcher::default()
                .with_page("/wiki/1-01", &story_page("下雨了。"))
                .with_page("/wiki/1-02", "<html><body>layout changed</body></html>"),
        );
        let store = Arc::new(MemoryArtifactStore::default());

        let summary = controller(fetcher.clone(), store.clone())?
            .run(&structure())
            .await?;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.newly_done, 1);
        assert_eq!(summary.failed, 2);
        assert!((summary.completion_percent() - 100.0 / 3.0).abs() < 1e-9);

        let states: Vec<_> = summary.episodes.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![EpisodeState::Done, EpisodeState::Failed, EpisodeState::Failed]
        );
        assert!(!store.exists(&EpisodeKey::new(Wiki::Huiji, "第一章", "空")).await?);

        let again = controller(fetcher.clone(), store.clone())?
            .run(&structure())
            .await?;
        assert_eq!(again.already_done, 1);
        assert_eq!(fetcher.request_count(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn episodes_are_processed_in_document_order() -> anyhow::Result<()> {
        let fetcher = Arc::new(CannedFetcher::default());
        let store = Arc::new(MemoryArtifactStore::default());
        controller(fetcher.clone(), store)?.run(&structure()).await?;
        let requests = fetcher.requests.lock().expect("lock").clone();
        assert_eq!(requests, vec!["/wiki/1-01", "/wiki/1-02", "/wiki/2-01"]);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_before_next_episode() -> anyhow::Result<()> {
        let fetcher = Arc::new(
            CannedFetcher::default().with_page("/wiki/1-01", &story_page("下雨了。")),
        );
        let store = Arc::new(MemoryArtifactStore::default());
        let (tx, rx) = watch::channel(true);

        let summary = controller(fetcher.clone(), store)?
            .with_shutdown(rx)
            .run(&structure())
            .await?;
        assert!(summary.interrupted);
        assert_eq!(fetcher.request_count(), 0);
        drop(tx);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pause_follows_newly_crawled_episodes_only() -> anyhow::Result<()> {
        let fetcher = Arc::new(
            CannedFetcher::default()
                .with_page("/wiki/1-01", &story_page("下雨了。"))
                .with_page("/wiki/2-01", &story_page("起风了。")),
        );
        let store = Arc::new(MemoryArtifactStore::default());
        let pacing = Pacing::new(Duration::from_secs(5), Duration::from_secs(10))?;

        let started = tokio::time::Instant::now();
        let first = paced_controller(fetcher.clone(), store.clone(), pacing)?
            .run(&structure())
            .await?;
        let elapsed = started.elapsed();
        assert_eq!((first.newly_done, first.failed), (2, 1));
        // Two pauses; the failed episode adds none.
        assert!(
            elapsed >= Duration::from_secs(10) && elapsed <= Duration::from_secs(20),
            "{elapsed:?}"
        );

        let started = tokio::time::Instant::now();
        let resumed = paced_controller(fetcher.clone(), store.clone(), pacing)?
            .run(&structure())
            .await?;
        assert_eq!((resumed.already_done, resumed.failed), (2, 1));
        assert_eq!(started.elapsed(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_during_store_lets_the_write_finish() -> anyhow::Result<()> {
        let fetcher = Arc::new(
            CannedFetcher::default()
                .with_page("/wiki/1-01", &story_page("下雨了。"))
                .with_page("/wiki/1-02", &story_page("天晴了。")),
        );
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(InterruptingStore {
            inner: MemoryArtifactStore::default(),
            shutdown: tx,
        });

        let summary = paced_controller(fetcher.clone(), store.clone(), Pacing::none())?
            .with_shutdown(rx)
            .run(&structure())
            .await?;
        assert!(summary.interrupted);
        assert_eq!(summary.newly_done, 1);
        assert!(
            store
                .inner
                .exists(&EpisodeKey::new(Wiki::Huiji, "第一章", "雨"))
                .await?
        );
        assert_eq!(fetcher.request_count(), 1);
        Ok(())
    }

    #[test]
    fn pacing_rejects_inverted_range() {
        assert!(Pacing::new(Duration::from_secs(10), Duration::from_secs(5)).is_err());
        let pacing = Pacing::new(Duration::from_millis(5), Duration::from_millis(10))
            .expect("valid range");
        let wait = pacing.pick();
        assert!(wait >= Duration::from_millis(5) && wait <= Duration::from_millis(10));
    }
}
