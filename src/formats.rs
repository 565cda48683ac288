use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_SPEAKER: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Zh,
    En,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zh => "zh",
            Self::En => "en",
        }
    }

    /// Speaker recorded for lines that have no identified speaker.
    pub fn narrator(self) -> &'static str {
        match self {
            Self::Zh => "旁白",
            Self::En => "Narrator",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueLayout {
    /// `div.story-text` blocks holding a speaker block and a text block.
    SingleColumn,
    /// `table.wikitable` rows of (speaker cell, text cell).
    Tabular,
}

/// The wikis this tool knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Wiki {
    Huiji,
    Fandom,
}

impl Wiki {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Huiji => "huiji",
            Self::Fandom => "fandom",
        }
    }

    pub fn language(self) -> Language {
        match self {
            Self::Huiji => Language::Zh,
            Self::Fandom => Language::En,
        }
    }

    pub fn layout(self) -> DialogueLayout {
        match self {
            Self::Huiji => DialogueLayout::SingleColumn,
            Self::Fandom => DialogueLayout::Tabular,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Huiji => "https://res1999.huijiwiki.com",
            Self::Fandom => "https://reverse1999.fandom.com",
        }
    }
}

impl fmt::Display for Wiki {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryStructure {
    pub chapters: Vec<ChapterNode>,
}

impl StoryStructure {
    pub fn episode_count(&self) -> usize {
        self.chapters.iter().map(|c| c.episodes.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterNode {
    pub source_title: String,
    #[serde(default)]
    pub translated_title: String,
    pub episodes: Vec<EpisodeNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeNode {
    pub source_title: String,
    #[serde(default)]
    pub translated_title: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
    pub language: Language,
}

impl DialogueLine {
    pub fn is_narration(&self) -> bool {
        self.speaker == self.language.narrator()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedLine {
    pub source_speaker: String,
    pub source_text: String,
    pub target_speaker: String,
    pub target_text: String,
}

/// Pairs episodes of one wiki with their counterparts on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentManifest {
    pub source: Wiki,
    pub target: Wiki,
    pub episodes: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub chapter: String,
    pub episode: String,
    pub target_chapter: String,
    pub target_episode: String,
}
