// Chapter detection and formatting for imported manuscripts

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Matches `第<numeral>章` or `Chapter <digits>` plus whatever follows on the same line.
const HEADING_PATTERN: &str = r"(?i)(?:第[零一二三四五六七八九十百千0-9]+章|chapter[^\S\n]+[0-9]+)[^\n]*";

/// Headings starting closer than this many characters to an accepted one are dropped.
const DEDUP_WINDOW: usize = 10;

const FALLBACK_TITLE: &str = "第一章";
const FORMAT_HEADER: &str = "===== 章节内容 =====";

static HEADING: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(HEADING_PATTERN).ok());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub content: String,
}

impl Chapter {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug)]
struct Heading<'a> {
    title: &'a str,
    offset: usize,
}

/// Split a manuscript into chapters at recognised headings.
///
/// Each chapter runs from its heading up to the next heading (or the end of
/// the text) and keeps the heading line in its content. Text before the first
/// heading is not part of any chapter. Returns an empty vec when nothing looks
/// like a heading; callers wanting a single catch-all chapter should use
/// [`split_or_whole`].
pub fn split_chapters(text: &str) -> Vec<Chapter> {
    let headings = find_headings(text);

    headings
        .iter()
        .enumerate()
        .map(|(i, heading)| {
            let end = headings.get(i + 1).map_or(text.len(), |next| next.offset);
            Chapter::new(heading.title, &text[heading.offset..end])
        })
        .collect()
}

/// Like [`split_chapters`], but wraps the whole text as one chapter when no heading is found.
pub fn split_or_whole(text: &str) -> Vec<Chapter> {
    let chapters = split_chapters(text);
    if chapters.is_empty() {
        tracing::debug!("no chapter headings found, importing as a single chapter");
        return vec![Chapter::new(FALLBACK_TITLE, text)];
    }
    chapters
}

fn find_headings(text: &str) -> Vec<Heading<'_>> {
    let Some(pattern) = HEADING.as_ref() else {
        return Vec::new();
    };

    let mut accepted: Vec<(usize, Heading<'_>)> = Vec::new();
    let mut scanned_bytes = 0;
    let mut scanned_chars = 0;

    for m in pattern.find_iter(text) {
        scanned_chars += text[scanned_bytes..m.start()].chars().count();
        scanned_bytes = m.start();

        let near_existing = accepted
            .iter()
            .any(|(chars, _)| chars.abs_diff(scanned_chars) < DEDUP_WINDOW);
        if near_existing {
            continue;
        }

        accepted.push((
            scanned_chars,
            Heading {
                title: m.as_str().trim(),
                offset: m.start(),
            },
        ));
    }

    accepted.sort_by_key(|(_, heading)| heading.offset);
    accepted.into_iter().map(|(_, heading)| heading).collect()
}

/// Replace the text of chapter `index`, or append a new chapter when `index`
/// is one past the end. Returns false when `index` is further out.
pub fn put_chapter(chapters: &mut Vec<Chapter>, index: usize, title: Option<String>, content: String) -> bool {
    let len = chapters.len();
    if index < len {
        let chapter = &mut chapters[index];
        chapter.content = content;
        if let Some(title) = title {
            chapter.title = title;
        }
        true
    } else if index == len {
        let title = title.unwrap_or_else(|| format!("章节 {}", index + 1));
        chapters.push(Chapter::new(title, content));
        true
    } else {
        false
    }
}

/// Append generated text to the end of chapter `index`, after a blank line.
pub fn append_to_chapter(chapters: &mut [Chapter], index: usize, text: &str) -> bool {
    let Some(chapter) = chapters.get_mut(index) else {
        return false;
    };
    chapter.content.push_str("\n\n");
    chapter.content.push_str(text);
    true
}

/// Renders selected chapters into the block sent along with an instruction.
pub struct ChapterFormatter;

impl ChapterFormatter {
    /// Selected chapters in selection order; out-of-range indices are skipped.
    pub fn format(chapters: &[Chapter], selected: &[usize]) -> String {
        let body = selected
            .iter()
            .filter_map(|&index| chapters.get(index).map(|chapter| (index, chapter)))
            .map(|(index, chapter)| {
                let title = if chapter.title.is_empty() {
                    format!("章节 {}", index + 1)
                } else {
                    chapter.title.clone()
                };
                format!("# {title}\n\n{}", chapter.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let body = if body.is_empty() { "无内容" } else { &body };
        format!("{FORMAT_HEADER}\n\n{body}")
    }

    pub fn format_prompt(chapters: &[Chapter], selected: &[usize], prompt: &str) -> String {
        format!("{prompt}\n\n{}", Self::format(chapters, selected))
    }
}
