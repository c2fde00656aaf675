//! Publication text → structured fields.
//!
//! Channel posts follow a loose labeled layout (`Автор:`, `Название:`,
//! `Жанр:`, `Рейтинг:`, `Состав:`) with hashtags sprinkled in. Every rule is
//! independent and tolerant of absence; the parser never fails.

use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shelfsync_core::normalize;

/// Token marking a title as a multi-book series.
pub const CYCLE_MARKER: &str = "цикл";

const MIN_SUB_BOOK_YEAR: i32 = 1900;
const FUTURE_YEAR_SLACK: i32 = 10;

/// Channel housekeeping hashtags, never genres or tags of a work.
const ADMIN_TAGS: &[&str] = &[
    "выбор_читателей",
    "выбор_редакции",
    "новинка",
    "новинки",
    "анонс",
    "реклама",
    "отзыв",
    "подборка",
    "розыгрыш",
];

static AUTHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[^\p{L}\n]*автор(?:ы)?\s*:[ \t]*(.+)$").expect("valid author regex")
});
static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[^\p{L}\n]*название\s*:[ \t]*(.+)$").expect("valid title regex")
});
static GENRE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[^\p{L}\n]*жанры?\s*:(.*)$").expect("valid genre line regex")
});
static RATING_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[^\p{L}\n]*рейтинг\s*:(.*)$").expect("valid rating line regex")
});
static DECIMAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("valid decimal regex"));
static COMPOSITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[^\p{L}\n]*состав\b").expect("valid composition regex")
});
static SUB_BOOK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(\d+)[.)]\s*(.+?)\s*\((\d{4})\)\s*$").expect("valid sub-book regex")
});
static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([\p{L}\p{N}_]+)").expect("valid hashtag regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedPublication {
    pub author: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub rating: f64,
    pub description: String,
    pub books: Vec<SubBook>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubBook {
    pub index: u32,
    pub title: String,
    pub year: i32,
}

impl ParsedPublication {
    pub fn earliest_year(&self) -> Option<i32> {
        self.books.iter().map(|b| b.year).min()
    }

    pub fn has_identity(&self) -> bool {
        !self.title.is_empty() && !self.author.is_empty()
    }
}

pub fn parse_publication(text: &str) -> ParsedPublication {
    parse_publication_at(text, Utc::now().year())
}

/// Same as [`parse_publication`] with an explicit reference year for the
/// sub-book year window.
pub fn parse_publication_at(text: &str, current_year: i32) -> ParsedPublication {
    let text = normalize::nfc(text);

    let author = first_labeled(&AUTHOR_RE, &text);
    let title = first_labeled(&TITLE_RE, &text);
    let series = normalize::words(&title)
        .iter()
        .any(|w| w == CYCLE_MARKER)
        .then(|| title.clone());

    ParsedPublication {
        genres: parse_genres(&text),
        tags: collect_hashtags(&text),
        rating: parse_rating(&text),
        description: parse_description(&text),
        books: parse_sub_books(&text, current_year),
        author,
        title,
        series,
    }
}

fn first_labeled(re: &Regex, text: &str) -> String {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn is_admin_tag(tag: &str) -> bool {
    let folded = normalize::fold(tag);
    ADMIN_TAGS.iter().any(|admin| *admin == folded)
}

fn collect_hashtags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for caps in HASHTAG_RE.captures_iter(text) {
        let tag = caps[1].to_string();
        if is_admin_tag(&tag) || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    tags
}

fn parse_genres(text: &str) -> Vec<String> {
    let Some(caps) = GENRE_LINE_RE.captures(text) else {
        return Vec::new();
    };
    let line = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

    let tagged = collect_hashtags(line);
    if !tagged.is_empty() {
        return tagged;
    }

    // Plain comma list: "Жанр: фантастика, мистика"
    let mut genres: Vec<String> = Vec::new();
    for part in line.split(',') {
        let genre = part.trim();
        if genre.is_empty() || is_admin_tag(genre) || genres.iter().any(|g| g == genre) {
            continue;
        }
        genres.push(genre.to_string());
    }
    genres
}

fn parse_rating(text: &str) -> f64 {
    RATING_LINE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|line| DECIMAL_RE.find(line.as_str()))
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn parse_description(text: &str) -> String {
    let Some(rating_line) = RATING_LINE_RE.find(text) else {
        return String::new();
    };
    let tail = &text[rating_line.end()..];
    let end = COMPOSITION_RE.find(tail).map(|m| m.start()).unwrap_or(tail.len());
    tail[..end].trim().to_string()
}

fn parse_sub_books(text: &str, current_year: i32) -> Vec<SubBook> {
    let Some(label) = COMPOSITION_RE.find(text) else {
        return Vec::new();
    };
    let max_year = current_year + FUTURE_YEAR_SLACK;

    SUB_BOOK_RE
        .captures_iter(&text[label.end()..])
        .filter_map(|caps| {
            let index = caps[1].parse::<u32>().ok()?;
            let year = caps[3].parse::<i32>().ok()?;
            if !(MIN_SUB_BOOK_YEAR..=max_year).contains(&year) {
                return None;
            }
            Some(SubBook {
                index,
                title: caps[2].trim().to_string(),
                year,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_POST: &str = "📖 Автор: Сергей Лукьяненко
📚 Название: цикл Дозоры
🎭 Жанр: #фантастика #городское_фэнтези #выбор_читателей
⭐ Рейтинг: 8,7 из 10

Мир, где Иные живут среди людей
и каждый выбирает сторону.

Состав цикла:
1. Ночной Дозор (1998)
2. Дневной Дозор (2000)
3. Сумеречный Дозор (1850)
4. Новый Дозор (2012)

#мистика";

    #[test]
    fn parses_labeled_fields() {
        let parsed = parse_publication_at(FULL_POST, 2026);
        assert_eq!(parsed.author, "Сергей Лукьяненко");
        assert_eq!(parsed.title, "цикл Дозоры");
        assert_eq!(parsed.series.as_deref(), Some("цикл Дозоры"));
        assert_eq!(parsed.rating, 8.7);
        assert_eq!(
            parsed.description,
            "Мир, где Иные живут среди людей\nи каждый выбирает сторону."
        );
    }

    #[test]
    fn genres_come_from_genre_line_and_tags_from_everywhere() {
        let parsed = parse_publication_at(FULL_POST, 2026);
        assert_eq!(parsed.genres, vec!["фантастика", "городское_фэнтези"]);
        assert_eq!(parsed.tags, vec!["фантастика", "городское_фэнтези", "мистика"]);
    }

    #[test]
    fn sub_books_outside_year_window_are_dropped() {
        let parsed = parse_publication_at(FULL_POST, 2026);
        let titles: Vec<_> = parsed.books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Ночной Дозор", "Дневной Дозор", "Новый Дозор"]);
        assert_eq!(parsed.earliest_year(), Some(1998));

        let far_future = "Состав:\n1. Завтра (2040)\n2. Сегодня (2030)";
        let parsed = parse_publication_at(far_future, 2026);
        assert_eq!(parsed.books.len(), 1);
        assert_eq!(parsed.books[0].year, 2030);
    }

    #[test]
    fn missing_rating_line_yields_defaults() {
        let text = "Автор: Жуков\nНазвание: Остров\n\nОписание без рейтинга.";
        let parsed = parse_publication(text);
        assert_eq!(parsed.rating, 0.0);
        assert_eq!(parsed.description, "");
        assert_eq!(parsed.series, None);
        assert!(parsed.books.is_empty());
    }

    #[test]
    fn cycle_marker_must_be_a_whole_word() {
        let parsed = parse_publication("Автор: Жуков\nНазвание: Циклоп");
        assert_eq!(parsed.series, None);

        let parsed = parse_publication("Автор: Жуков\nНазвание: Острова (цикл)");
        assert_eq!(parsed.series.as_deref(), Some("Острова (цикл)"));
    }

    #[test]
    fn empty_text_never_fails() {
        let parsed = parse_publication("");
        assert_eq!(parsed, ParsedPublication::default());
        assert!(!parsed.has_identity());
    }

    #[test]
    fn parsing_is_deterministic() {
        let first = parse_publication_at(FULL_POST, 2026);
        for _ in 0..5 {
            assert_eq!(parse_publication_at(FULL_POST, 2026), first);
        }
    }

    #[test]
    fn rating_accepts_dot_separator_and_plain_genre_list() {
        let text = "Жанр: детектив, триллер\nРейтинг: 4.25\nКоротко.";
        let parsed = parse_publication(text);
        assert_eq!(parsed.rating, 4.25);
        assert_eq!(parsed.genres, vec!["детектив", "триллер"]);
        assert_eq!(parsed.description, "Коротко.");
    }
}
