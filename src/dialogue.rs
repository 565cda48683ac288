use crate::dom::{Cell, Document, Table, TextBlock};
use crate::formats::{DialogueLayout, DialogueLine, Language, UNKNOWN_SPEAKER};

const BATTLE_MARKERS: [&str; 2] = ["Pre-Battle", "Post-Battle"];

/// Caption rows of dialogue tables span five columns.
const CAPTION_COLSPAN: u32 = 5;

/// Extracts the dialogue of one episode page. A page without a dialogue
/// container yields an empty sequence.
pub fn extract(html: &str, layout: DialogueLayout, language: Language) -> Vec<DialogueLine> {
    let doc = Document::parse(html);
    match layout {
        DialogueLayout::SingleColumn => {
            extract_single_column(&crate::dom::text_blocks(doc.root()), language)
        }
        DialogueLayout::Tabular => {
            extract_tabular(&crate::dom::tables(doc.root(), "wikitable"), language)
        }
    }
}

fn push_line(out: &mut Vec<DialogueLine>, speaker: &str, text: &str, language: Language) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    out.push(DialogueLine {
        speaker: speaker.to_owned(),
        text: text.to_owned(),
        language,
    });
}

fn clean_speaker(raw: &str) -> &str {
    raw.trim_matches(|c: char| c == '：' || c == ':' || c.is_whitespace())
}

fn extract_single_column(blocks: &[TextBlock], language: Language) -> Vec<DialogueLine> {
    let mut lines = Vec::new();
    for block in blocks {
        match block.parts.as_slice() {
            [] => {}
            [text] => push_line(&mut lines, language.narrator(), text, language),
            // Blocks past the text block are annotations, not dialogue.
            [speaker, text, ..] => {
                let speaker = match clean_speaker(speaker) {
                    "" => language.narrator(),
                    name => name,
                };
                push_line(&mut lines, speaker, text, language);
            }
        }
    }
    lines
}

/// Speaker carried across rows of one table.
#[derive(Debug, Default)]
struct SpeakerState {
    last_known: Option<String>,
}

impl SpeakerState {
    fn resolve(&mut self, cell: &Cell) -> String {
        let located = match &cell.speaker_plate {
            Some(plate) => plate.trim().to_owned(),
            None if cell.has_content => UNKNOWN_SPEAKER.to_owned(),
            None => String::new(),
        };
        if !located.is_empty() {
            self.last_known = Some(located);
        }
        self.last_known
            .clone()
            .unwrap_or_else(|| UNKNOWN_SPEAKER.to_owned())
    }
}

fn extract_tabular(tables: &[Table], language: Language) -> Vec<DialogueLine> {
    let mut lines = Vec::new();
    for table in tables {
        let mut speakers = SpeakerState::default();
        for row in &table.rows {
            match row.cells.as_slice() {
                [only] if only.colspan.is_some() => {
                    if only.colspan == Some(CAPTION_COLSPAN)
                        || BATTLE_MARKERS.contains(&only.text.as_str())
                    {
                        continue;
                    }
                    push_line(&mut lines, language.narrator(), &only.text, language);
                }
                [speaker, text] => {
                    if text.text.trim().is_empty() {
                        continue;
                    }
                    let speaker = speakers.resolve(speaker);
                    push_line(&mut lines, &speaker, &text.text, language);
                }
                _ => {}
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zh(html: &str) -> Vec<DialogueLine> {
        extract(html, DialogueLayout::SingleColumn, Language::Zh)
    }

    fn en(html: &str) -> Vec<DialogueLine> {
        extract(html, DialogueLayout::Tabular, Language::En)
    }

    fn pairs(lines: &[DialogueLine]) -> Vec<(&str, &str)> {
        lines
            .iter()
            .map(|l| (l.speaker.as_str(), l.text.as_str()))
            .collect()
    }

    #[test]
    fn single_inner_block_is_narration() {
        let lines = zh(
            r#"<div class="mw-parser-output"><div class="story-text"><div>  雨停了。 </div></div></div>"#,
        );
        assert_eq!(pairs(&lines), vec![("旁白", "雨停了。")]);
        assert_eq!(lines[0].language, Language::Zh);
    }

    #[test]
    fn speaker_punctuation_is_stripped() {
        let lines = zh(
            r#"<div class="story-text"><div>维尔汀：</div><div>我们走吧。</div></div>
<div class="story-text"><div>十四行诗: </div><div>是。</div></div>"#,
        );
        assert_eq!(
            pairs(&lines),
            vec![("维尔汀", "我们走吧。"), ("十四行诗", "是。")]
        );
    }

    #[test]
    fn trailing_blocks_do_not_add_lines() {
        let lines = zh(
            r#"<div class="story-text"><div>维尔汀：</div><div>第一句。</div><div>附注</div></div>"#,
        );
        assert_eq!(pairs(&lines), vec![("维尔汀", "第一句。")]);
    }

    #[test]
    fn empty_blocks_are_dropped() {
        let lines = zh(
            r#"<div class="story-text"><div>   </div></div>
<div class="story-text"><div>维尔汀：</div><div> </div></div>
<div class="story-text"></div>
<div class="story-text"><div>好。</div></div>"#,
        );
        assert_eq!(pairs(&lines), vec![("旁白", "好。")]);
    }

    #[test]
    fn missing_container_yields_empty_sequence() {
        assert!(zh("<html><body><p>404</p></body></html>").is_empty());
        assert!(en("<html><body><p>404</p></body></html>").is_empty());
    }

    #[test]
    fn empty_speaker_cell_inherits_previous_speaker() {
        let lines = en(r#"<table class="wikitable">
<tr><td><div style="align-self: flex-end">X</div></td><td>a</td></tr>
<tr><td></td><td>b</td></tr>
</table>"#);
        assert_eq!(pairs(&lines), vec![("X", "a"), ("X", "b")]);
    }

    #[test]
    fn speaker_state_resets_per_table() {
        let lines = en(r#"<table class="wikitable">
<tr><td><div style="align-self: flex-end">X</div></td><td>a</td></tr>
</table>
<table class="wikitable">
<tr><td></td><td>b</td></tr>
</table>"#);
        assert_eq!(pairs(&lines), vec![("X", "a"), ("Unknown", "b")]);
    }

    #[test]
    fn unlocatable_speaker_is_unknown_not_narrator() {
        let lines = en(r#"<table class="wikitable">
<tr><td><img src="portrait.png"></td><td>Who said this?</td></tr>
<tr><td colspan="2">The wind howls.</td></tr>
</table>"#);
        assert_eq!(
            pairs(&lines),
            vec![("Unknown", "Who said this?"), ("Narrator", "The wind howls.")]
        );
    }

    #[test]
    fn caption_and_battle_rows_are_skipped() {
        let lines = en(r#"<table class="wikitable">
<tr><td colspan="5">NS-1 Script</td></tr>
<tr><td colspan="2">Pre-Battle</td></tr>
<tr><td><div style="align-self: flex-end">Vertin</div></td><td>Let's go.</td></tr>
<tr><td colspan="2">Post-Battle</td></tr>
<tr><td colspan="2">  </td></tr>
<tr><td>a</td><td>b</td><td>c</td></tr>
</table>"#);
        assert_eq!(pairs(&lines), vec![("Vertin", "Let's go.")]);
    }
}
