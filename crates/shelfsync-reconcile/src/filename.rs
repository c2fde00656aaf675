//! Best-effort (author, title) guess from a loosely named file.
//!
//! Archive uploads carry names like `Лукьяненко_Сергей_Ночной_Дозор.fb2.zip`
//! or `Жуков - Остров.fb2`. An ordered cascade of rules runs over the
//! NFC-composed stem; the first rule that applies wins, then a fixed set of
//! post-processing fixes runs regardless of the rule.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shelfsync_core::normalize;

use crate::parser::CYCLE_MARKER;

pub const UNKNOWN_AUTHOR: &str = "Unknown";
pub const UNTITLED: &str = "Untitled";

const KNOWN_EXTENSIONS: &[&str] = &[
    "fb2", "zip", "epub", "txt", "rtf", "pdf", "djvu", "mobi", "rar", "7z",
];

/// Word forms that start the title part of a name (`Автор_цикл_Название`).
const TITLE_PREFIX_INDICATORS: &[&str] = &[
    "цикл", "цикла", "сага", "саги", "серия", "серии", "saga", "series",
];

/// Substrings that mark a title as a series even without the cycle marker.
const SAGA_MARKERS: &[&str] = &[
    "хроники",
    "сага",
    "трилогия",
    "дилогия",
    "тетралогия",
    "пенталогия",
    "эпопея",
];

static DASH_SPLIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+?)(?:\s+-\s+|\s*[–—]\s*)(.+)$").expect("valid dash split regex")
});
static MULTI_AUTHOR_AND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^_,]+)_(?i:и)_([^_,]+)_(.+)$").expect("valid multi-author regex")
});
static MULTI_AUTHOR_COMMA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^_,]+),_*([^_,]+)_(.+)$").expect("valid multi-author comma regex")
});
static TOKEN_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[_\-\s]+").expect("valid token split regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub author: String,
    pub title: String,
}

impl ExtractedMetadata {
    pub fn has_known_author(&self) -> bool {
        self.author != UNKNOWN_AUTHOR
    }
}

/// Drop trailing known extensions, stacked ones included (`.fb2.zip`).
pub fn strip_extensions(name: &str) -> &str {
    let mut stem = name.trim();
    while let Some((head, ext)) = stem.rsplit_once('.') {
        if head.trim().is_empty() || !KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            break;
        }
        stem = head.trim_end();
    }
    stem
}

pub fn extract_from_filename(name: &str) -> ExtractedMetadata {
    let composed = normalize::nfc(name);
    let stem = strip_extensions(&composed);
    let underscored = stem.split_whitespace().collect::<Vec<_>>().join("_");
    let spaced = underscored.replace('_', " ");

    let (author, title) = split_by_dash(&spaced)
        .or_else(|| split_multi_author(&underscored))
        .or_else(|| split_on_indicator(&spaced))
        .or_else(|| split_tokens(&spaced))
        .unwrap_or_else(|| (UNKNOWN_AUTHOR.to_string(), spaced.clone()));

    finish(&author, &title)
}

/// Lowercased NFC tokens longer than one character, in order, without repeats.
pub fn search_terms(name: &str) -> Vec<String> {
    let composed = normalize::nfc(name);
    let mut terms: Vec<String> = Vec::new();
    for word in normalize::words(strip_extensions(&composed)) {
        if word.chars().count() > 1 && !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

fn split_by_dash(spaced: &str) -> Option<(String, String)> {
    let caps = DASH_SPLIT_RE.captures(spaced)?;
    Some((caps[1].trim().to_string(), caps[2].trim().to_string()))
}

fn split_multi_author(underscored: &str) -> Option<(String, String)> {
    if let Some(caps) = MULTI_AUTHOR_AND_RE.captures(underscored) {
        return Some((
            format!("{} и {}", &caps[1], &caps[2]),
            caps[3].replace('_', " "),
        ));
    }
    let caps = MULTI_AUTHOR_COMMA_RE.captures(underscored)?;
    Some((
        format!("{}, {}", &caps[1], &caps[2]),
        caps[3].replace('_', " "),
    ))
}

fn split_on_indicator(spaced: &str) -> Option<(String, String)> {
    let words: Vec<&str> = spaced.split_whitespace().collect();
    let pos = words.iter().position(|word| {
        let folded = normalize::fold(word);
        TITLE_PREFIX_INDICATORS.contains(&folded.as_str())
    })?;
    Some((words[..pos].join(" "), words[pos..].join(" ")))
}

fn split_tokens(spaced: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = TOKEN_SPLIT_RE
        .split(spaced)
        .filter(|t| !t.is_empty())
        .collect();
    match tokens.len() {
        0 => None,
        1 => Some((UNKNOWN_AUTHOR.to_string(), spaced.trim().to_string())),
        n => {
            // Surname + given name lead longer names.
            let author_len = if n >= 4 { 2 } else { 1 };
            Some((
                tokens[..author_len].join(" "),
                tokens[author_len..].join(" "),
            ))
        }
    }
}

fn finish(author: &str, title: &str) -> ExtractedMetadata {
    let mut author_words: Vec<&str> = author.split_whitespace().collect();
    let mut title = title.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut title_has_marker = starts_with_cycle_marker(&title);
    if let Some(pos) = author_words
        .iter()
        .position(|w| normalize::fold(w) == CYCLE_MARKER)
    {
        author_words.remove(pos);
        if !title_has_marker {
            title = format!("{CYCLE_MARKER} {title}").trim().to_string();
            title_has_marker = true;
        }
    }

    let folded_title = normalize::fold(&title);
    if !title_has_marker && SAGA_MARKERS.iter().any(|m| folded_title.contains(m)) {
        title = format!("{CYCLE_MARKER} {title}");
    }

    let author = author_words.join(" ");
    ExtractedMetadata {
        author: if author.trim().is_empty() { UNKNOWN_AUTHOR.to_string() } else { author },
        title: if title.trim().is_empty() { UNTITLED.to_string() } else { title },
    }
}

fn starts_with_cycle_marker(title: &str) -> bool {
    normalize::words(title).first().map(String::as_str) == Some(CYCLE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted(author: &str, title: &str) -> ExtractedMetadata {
        ExtractedMetadata {
            author: author.to_string(),
            title: title.to_string(),
        }
    }

    #[test]
    fn dash_rule_splits_and_trims() {
        assert_eq!(extract_from_filename("Жуков - Остров"), extracted("Жуков", "Остров"));
        assert_eq!(
            extract_from_filename("  Жуков   -   Остров.fb2  "),
            extracted("Жуков", "Остров")
        );
        assert_eq!(
            extract_from_filename("Толстой — Война и мир.fb2"),
            extracted("Толстой", "Война и мир")
        );
        assert_eq!(
            extract_from_filename("Пелевин_-_Омон_Ра.zip"),
            extracted("Пелевин", "Омон Ра")
        );
    }

    #[test]
    fn hyphenated_words_are_not_dash_splits() {
        let meta = extract_from_filename("Путеводитель_Йошкар-Ола.fb2");
        assert_eq!(meta.author, "Путеводитель");
    }

    #[test]
    fn multi_author_joins() {
        assert_eq!(
            extract_from_filename("Ильф_и_Петров_Двенадцать_стульев.zip"),
            extracted("Ильф и Петров", "Двенадцать стульев")
        );
        assert_eq!(
            extract_from_filename("Стругацкий,_Стругацкий_Пикник_на_обочине.fb2"),
            extracted("Стругацкий, Стругацкий", "Пикник на обочине")
        );
    }

    #[test]
    fn indicator_anchors_the_title() {
        assert_eq!(
            extract_from_filename("Лукьяненко_цикл_Дозоры.fb2"),
            extracted("Лукьяненко", "цикл Дозоры")
        );
        assert_eq!(
            extract_from_filename("Сапковский_Сага_о_ведьмаке.fb2.zip"),
            extracted("Сапковский", "цикл Сага о ведьмаке")
        );
    }

    #[test]
    fn generic_split_uses_two_author_tokens_for_long_names() {
        assert_eq!(
            extract_from_filename("Лукьяненко_Сергей_Ночной_Дозор.fb2.zip"),
            extracted("Лукьяненко Сергей", "Ночной Дозор")
        );
        assert_eq!(
            extract_from_filename("Жуков_Остров_Сокровищ.fb2"),
            extracted("Жуков", "Остров Сокровищ")
        );
    }

    #[test]
    fn single_token_is_a_title_with_unknown_author() {
        let meta = extract_from_filename("Остров.fb2");
        assert_eq!(meta, extracted(UNKNOWN_AUTHOR, "Остров"));
        assert!(!meta.has_known_author());
    }

    #[test]
    fn blank_names_get_sentinels() {
        assert_eq!(extract_from_filename(""), extracted(UNKNOWN_AUTHOR, UNTITLED));
        assert_eq!(extract_from_filename("   "), extracted(UNKNOWN_AUTHOR, UNTITLED));
    }

    #[test]
    fn saga_marker_prefixes_cycle() {
        assert_eq!(
            extract_from_filename("Мартин - Хроники льда и пламени.fb2"),
            extracted("Мартин", "цикл Хроники льда и пламени")
        );
    }

    #[test]
    fn cycle_marker_moves_out_of_author() {
        assert_eq!(
            extract_from_filename("Лукьяненко цикл - Дозоры.fb2"),
            extracted("Лукьяненко", "цикл Дозоры")
        );
    }

    #[test]
    fn decomposed_input_matches_composed() {
        let decomposed = "Войнович_Жизнь_и_необычаи\u{0306}ные.fb2";
        let composed = "Войнович_Жизнь_и_необычайные.fb2";
        assert_eq!(extract_from_filename(decomposed), extract_from_filename(composed));
    }

    #[test]
    fn search_terms_skip_short_tokens_and_extensions() {
        assert_eq!(
            search_terms("Лукьяненко_Сергей_Ночной_Дозор.fb2.zip"),
            vec!["лукьяненко", "сергей", "ночной", "дозор"]
        );
        assert_eq!(search_terms("Ильф_и_Петров.fb2"), vec!["ильф", "петров"]);
    }

    #[test]
    fn strip_extensions_handles_stacks_and_unknowns() {
        assert_eq!(strip_extensions("book.fb2.zip"), "book");
        assert_eq!(strip_extensions("book.FB2"), "book");
        assert_eq!(strip_extensions("vol.1"), "vol.1");
        assert_eq!(strip_extensions(".fb2"), ".fb2");
    }
}
