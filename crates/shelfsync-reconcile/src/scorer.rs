//! Multi-factor fuzzy matching of an extracted (author, title) guess against
//! catalog candidates.
//!
//! The score is additive. Every comparison runs over NFC-composed, lowercased
//! word sequences, so punctuation and spacing differences between a filename
//! and a catalog title do not matter.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;
use shelfsync_core::config::MatchingConfig;
use shelfsync_core::{CatalogRecord, normalize};
use tracing::debug;

use crate::filename::ExtractedMetadata;
use crate::parser::CYCLE_MARKER;

pub const DEFAULT_THRESHOLD: u32 = 25;

/// Title words known to collide between unrelated works.
const FALSE_POSITIVE_KEYWORDS: &[&str] = &[
    "vanished",
    "dying",
    "returned",
    "reborn",
    "возвращение",
    "последний",
    "пробуждение",
    "наследие",
];

const EXACT_TITLE: i64 = 50;
const EXACT_AUTHOR: i64 = 30;
const CONTAINMENT: i64 = 20;
const BOTH_CONTAINED: i64 = 30;
const HALF_TITLE_WORDS: i64 = 15;
const FALSE_POSITIVE_PENALTY: i64 = 20;
const PER_TERM: i64 = 5;
const PER_WORD: i64 = 5;
const WORDS_CAP: i64 = 30;
const WORDS_IN_BOTH_FIELDS: i64 = 10;
const ALL_WORDS_IN_BOTH_FIELDS: i64 = 20;
const CYCLE_CONTAINED: i64 = 25;
const CYCLE_HALF_WORDS: i64 = 15;
const WORD_SET_FULL: i64 = 35;
const WORD_SET_MOST: i64 = 25;
const WORD_SET_HALF: i64 = 15;
const TERM_RATIO_MAX: f64 = 40.0;

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub record: CatalogRecord,
    pub score: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchScorer {
    threshold: u32,
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// A title or author reduced to comparable form.
struct Field {
    joined: String,
    words: Vec<String>,
}

impl Field {
    fn new(text: &str) -> Self {
        let words = normalize::words(text);
        Self {
            joined: words.join(" "),
            words,
        }
    }

    fn without_cycle_marker(&self) -> Self {
        let words: Vec<String> = self
            .words
            .iter()
            .filter(|w| w.as_str() != CYCLE_MARKER)
            .cloned()
            .collect();
        Self {
            joined: words.join(" "),
            words,
        }
    }

    fn has_cycle_marker(&self) -> bool {
        self.words.iter().any(|w| w == CYCLE_MARKER)
    }

    fn word_set(&self) -> HashSet<&str> {
        self.words.iter().map(String::as_str).collect()
    }

    fn contains_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    /// Either side is a substring of the other.
    fn overlaps(&self, other: &Field) -> bool {
        !self.joined.is_empty()
            && !other.joined.is_empty()
            && (self.joined.contains(&other.joined) || other.joined.contains(&self.joined))
    }

    /// Share of `self` words that appear in `other`.
    fn coverage_in(&self, other: &Field) -> f64 {
        if self.words.is_empty() {
            return 0.0;
        }
        let found = self.words.iter().filter(|w| other.contains_word(w)).count();
        found as f64 / self.words.len() as f64
    }
}

impl MatchScorer {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.threshold)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn score(&self, extracted: &ExtractedMetadata, terms: &[String], candidate: &CatalogRecord) -> u32 {
        let ext_title = Field::new(&extracted.title);
        let ext_author = Field::new(&extracted.author);
        let cand_title = Field::new(&candidate.title);
        let cand_author = Field::new(&candidate.author);

        if is_sibling_work(&ext_title, &ext_author, &cand_title, &cand_author) {
            debug!(candidate = %candidate.id, title = %candidate.title, "sibling work, score 0");
            return 0;
        }

        let mut score: i64 = 0;

        if !ext_title.joined.is_empty() && ext_title.joined == cand_title.joined {
            score += EXACT_TITLE;
        }
        if !ext_author.joined.is_empty() && ext_author.joined == cand_author.joined {
            score += EXACT_AUTHOR;
        }

        let title_contained = ext_title.overlaps(&cand_title);
        let author_contained = ext_author.overlaps(&cand_author);
        if title_contained {
            score += CONTAINMENT;
        }
        if author_contained {
            score += CONTAINMENT;
        }
        if title_contained && author_contained {
            score += BOTH_CONTAINED;
        }

        if ext_title.coverage_in(&cand_title) >= 0.5 {
            score += HALF_TITLE_WORDS;
        }

        if false_positive_mismatch(&ext_title, &cand_title) {
            score -= FALSE_POSITIVE_PENALTY;
        }

        let title_hits = terms.iter().filter(|t| cand_title.joined.contains(t.as_str())).count();
        let author_hits = terms.iter().filter(|t| cand_author.joined.contains(t.as_str())).count();
        score += PER_TERM * (title_hits + author_hits) as i64;

        score += all_words_bonus(&ext_title, &cand_title, &cand_author);

        if !ext_title.has_cycle_marker() && cand_title.has_cycle_marker() {
            let stripped = cand_title.without_cycle_marker();
            if ext_title.overlaps(&stripped) {
                score += CYCLE_CONTAINED;
            } else if ext_title.coverage_in(&stripped) >= 0.5 {
                score += CYCLE_HALF_WORDS;
            }
        }

        score += word_set_bonus(&ext_title, &cand_title);

        if !terms.is_empty() {
            let ratio = (title_hits + author_hits) as f64 / (2 * terms.len()) as f64;
            score += (ratio * TERM_RATIO_MAX).floor() as i64;
        }

        let score = score.max(0) as u32;
        debug!(candidate = %candidate.id, title = %candidate.title, score, "scored candidate");
        score
    }

    /// All candidates with their scores, best first. Ties go to the lower id.
    pub fn rank(
        &self,
        extracted: &ExtractedMetadata,
        terms: &[String],
        candidates: &[CatalogRecord],
    ) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|record| ScoredCandidate {
                score: self.score(extracted, terms, record),
                record: record.clone(),
            })
            .collect();
        scored.sort_by(|a, b| match b.score.cmp(&a.score) {
            Ordering::Equal => a.record.id.cmp(&b.record.id),
            other => other,
        });
        scored
    }

    /// The top candidate, if it clears the threshold.
    pub fn best_match(
        &self,
        extracted: &ExtractedMetadata,
        terms: &[String],
        candidates: &[CatalogRecord],
    ) -> Option<ScoredCandidate> {
        self.rank(extracted, terms, candidates)
            .into_iter()
            .next()
            .filter(|top| top.score >= self.threshold)
    }
}

/// Another work by the recognised author: every extracted author word is in
/// the candidate author, the titles conflict, and some extracted title word
/// appears in neither candidate field. A title word found in the candidate
/// author means the filename put the fields in a different order.
fn is_sibling_work(
    ext_title: &Field,
    ext_author: &Field,
    cand_title: &Field,
    cand_author: &Field,
) -> bool {
    if ext_author.words.is_empty()
        || !ext_author.words.iter().all(|w| cand_author.contains_word(w))
    {
        return false;
    }
    if !titles_conflict(ext_title, cand_title) {
        return false;
    }
    ext_title
        .without_cycle_marker()
        .words
        .iter()
        .any(|w| !cand_title.contains_word(w) && !cand_author.contains_word(w))
}

/// Distinct works that share only author or series words: neither title
/// contains the other, with or without the cycle marker, and each side has
/// a word the other lacks.
fn titles_conflict(extracted: &Field, candidate: &Field) -> bool {
    if extracted.words.is_empty() || candidate.words.is_empty() {
        return false;
    }
    if extracted.overlaps(candidate) {
        return false;
    }
    let ext_stripped = extracted.without_cycle_marker();
    let cand_stripped = candidate.without_cycle_marker();
    if ext_stripped.overlaps(&cand_stripped) {
        return false;
    }

    let ext_words = ext_stripped.word_set();
    let cand_words = cand_stripped.word_set();
    ext_words.difference(&cand_words).next().is_some()
        && cand_words.difference(&ext_words).next().is_some()
}

fn false_positive_mismatch(extracted: &Field, candidate: &Field) -> bool {
    FALSE_POSITIVE_KEYWORDS
        .iter()
        .any(|kw| extracted.contains_word(kw) != candidate.contains_word(kw))
}

/// Extracted title words found in the candidate, with extra credit when the
/// words spread over both candidate fields and more when each one is in both.
fn all_words_bonus(ext_title: &Field, cand_title: &Field, cand_author: &Field) -> i64 {
    let mut seen = HashSet::new();
    let words: Vec<&str> = ext_title
        .words
        .iter()
        .map(String::as_str)
        .filter(|w| seen.insert(*w))
        .collect();
    if words.is_empty() {
        return 0;
    }

    let mut in_title = 0;
    let mut in_author = 0;
    let mut found = 0;
    let mut in_both = 0;
    for word in &words {
        let t = cand_title.contains_word(word);
        let a = cand_author.contains_word(word);
        in_title += usize::from(t);
        in_author += usize::from(a);
        found += usize::from(t || a);
        in_both += usize::from(t && a);
    }

    let mut bonus = (PER_WORD * found as i64).min(WORDS_CAP);
    if in_title > 0 && in_author > 0 {
        bonus += WORDS_IN_BOTH_FIELDS;
        if in_both == words.len() {
            bonus += ALL_WORDS_IN_BOTH_FIELDS;
        }
    }
    bonus
}

fn word_set_bonus(extracted: &Field, candidate: &Field) -> i64 {
    let ext = extracted.word_set();
    let cand = candidate.word_set();
    let union = ext.union(&cand).count();
    if union == 0 {
        return 0;
    }
    let overlap = ext.intersection(&cand).count() as f64 / union as f64;
    if overlap >= 1.0 {
        WORD_SET_FULL
    } else if overlap >= 0.7 {
        WORD_SET_MOST
    } else if overlap >= 0.5 {
        WORD_SET_HALF
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filename::{extract_from_filename, search_terms};

    fn record(title: &str, author: &str) -> CatalogRecord {
        CatalogRecord::new(title, author)
    }

    const SCENARIO_FILE: &str = "Лукьяненко_Сергей_Ночной_Дозор.fb2.zip";

    #[test]
    fn scenario_a_accepts_the_right_book() {
        let scorer = MatchScorer::default();
        let extracted = extract_from_filename(SCENARIO_FILE);
        let terms = search_terms(SCENARIO_FILE);
        let night = record("Ночной Дозор", "Сергей Лукьяненко");

        let score = scorer.score(&extracted, &terms, &night);
        assert!(score >= 25, "score {score}");

        let best = scorer.best_match(&extracted, &terms, std::slice::from_ref(&night)).unwrap();
        assert_eq!(best.record.id, night.id);
    }

    #[test]
    fn scenario_b_rejects_a_sibling_book() {
        let scorer = MatchScorer::default();
        let extracted = extract_from_filename(SCENARIO_FILE);
        let terms = search_terms(SCENARIO_FILE);
        let day = record("Дневной Дозор", "Сергей Лукьяненко");

        assert!(scorer.score(&extracted, &terms, &day) < 25);
        assert!(scorer.best_match(&extracted, &terms, &[day]).is_none());
    }

    #[test]
    fn sibling_does_not_outrank_the_right_book() {
        let scorer = MatchScorer::default();
        let extracted = extract_from_filename(SCENARIO_FILE);
        let terms = search_terms(SCENARIO_FILE);
        let day = record("Дневной Дозор", "Сергей Лукьяненко");
        let night = record("Ночной Дозор", "Сергей Лукьяненко");

        let best = scorer.best_match(&extracted, &terms, &[day, night.clone()]).unwrap();
        assert_eq!(best.record.id, night.id);
    }

    #[test]
    fn exact_match_beats_partial_substring_match() {
        let scorer = MatchScorer::default();
        let extracted = extract_from_filename("Жуков - Остров.fb2");
        let terms = search_terms("Жуков - Остров.fb2");
        let exact = record("Остров", "Жуков");
        let partial = record("Остров сокровищ", "Жуков");

        let exact_score = scorer.score(&extracted, &terms, &exact);
        let partial_score = scorer.score(&extracted, &terms, &partial);
        assert!(exact_score > partial_score, "{exact_score} <= {partial_score}");

        let ranked = scorer.rank(&extracted, &terms, &[partial, exact.clone()]);
        assert_eq!(ranked[0].record.id, exact.id);
    }

    #[test]
    fn cycle_prefixed_candidate_matches_plain_title() {
        let scorer = MatchScorer::default();
        let extracted = ExtractedMetadata {
            author: "Лукьяненко".to_string(),
            title: "Дозоры".to_string(),
        };
        let terms = vec!["лукьяненко".to_string(), "дозоры".to_string()];
        let cycle = record("цикл Дозоры", "Сергей Лукьяненко");
        assert!(scorer.best_match(&extracted, &terms, &[cycle]).is_some());
    }

    #[test]
    fn false_positive_keyword_costs_points() {
        let scorer = MatchScorer::default();
        let extracted = ExtractedMetadata {
            author: "King".to_string(),
            title: "The Stand".to_string(),
        };
        let terms = vec!["king".to_string(), "stand".to_string()];
        let plain = record("The Stand Redux", "King");
        let colliding = record("The Stand Returned", "King");
        assert_eq!(
            scorer.score(&extracted, &terms, &plain),
            scorer.score(&extracted, &terms, &colliding) + FALSE_POSITIVE_PENALTY as u32
        );
    }

    #[test]
    fn threshold_is_configurable() {
        let extracted = extract_from_filename("Жуков_Остров.fb2");
        let terms = search_terms("Жуков_Остров.fb2");
        let candidate = record("Остров", "Жуков");
        let lenient = MatchScorer::default();
        let score = lenient.score(&extracted, &terms, &candidate);

        assert!(lenient.best_match(&extracted, &terms, std::slice::from_ref(&candidate)).is_some());
        let strict = MatchScorer::new(score + 1);
        assert!(strict.best_match(&extracted, &terms, &[candidate]).is_none());
    }

    #[test]
    fn reordered_or_noisy_file_names_still_match() {
        let scorer = MatchScorer::default();
        let night = record("Ночной Дозор", "Сергей Лукьяненко");
        for name in [
            "Ночной_Дозор_Лукьяненко.fb2",
            "Ночной_Дозор_Лукьяненко_С.fb2",
            "Лукьяненко_Ночной_Дозор_1998.fb2",
        ] {
            let extracted = extract_from_filename(name);
            let terms = search_terms(name);
            let score = scorer.score(&extracted, &terms, &night);
            assert!(score >= DEFAULT_THRESHOLD, "{name}: score {score}");
            let best = scorer.best_match(&extracted, &terms, std::slice::from_ref(&night));
            assert_eq!(best.map(|b| b.record.id), Some(night.id), "{name}");
        }
    }

    #[test]
    fn sibling_veto_needs_the_author_to_be_recognised() {
        let day = Field::new("Дневной Дозор");
        let lukyanenko = Field::new("Сергей Лукьяненко");
        assert!(is_sibling_work(
            &Field::new("Ночной Дозор"),
            &Field::new("Лукьяненко"),
            &day,
            &lukyanenko
        ));
        assert!(!is_sibling_work(
            &Field::new("Ночной Дозор"),
            &Field::new("Иванов"),
            &day,
            &lukyanenko
        ));
        assert!(!is_sibling_work(
            &Field::new("Дозор Сергей"),
            &Field::new("Лукьяненко"),
            &day,
            &lukyanenko
        ));
    }

    #[test]
    fn all_words_bonus_tiers() {
        let title = Field::new("Ночной Дозор");
        let author = Field::new("Сергей Лукьяненко");

        // Title words only in the candidate title.
        assert_eq!(all_words_bonus(&Field::new("Ночной Дозор"), &title, &author), 10);
        // Spread over both candidate fields.
        assert_eq!(all_words_bonus(&Field::new("Дозор Лукьяненко"), &title, &author), 20);
        // Every word in both fields.
        assert_eq!(
            all_words_bonus(&Field::new("Дозор"), &Field::new("Дозор"), &Field::new("Дозор Иванов")),
            35
        );
        // Capped.
        let long = "a b c d e f g";
        assert_eq!(all_words_bonus(&Field::new(long), &Field::new(long), &author), 30);
        // Nothing found.
        assert_eq!(all_words_bonus(&Field::new("Остров"), &title, &author), 0);
    }

    #[test]
    fn author_words_do_not_earn_the_all_words_bonus() {
        let bonus = all_words_bonus(
            &Field::new("Остров"),
            &Field::new("Война и мир"),
            &Field::new("Жуков"),
        );
        assert_eq!(bonus, 0);
    }

    #[test]
    fn unrelated_candidates_score_low() {
        let scorer = MatchScorer::default();
        let extracted = extract_from_filename("Жуков - Остров.fb2");
        let terms = search_terms("Жуков - Остров.fb2");
        let other = record("Война и мир", "Лев Толстой");
        assert_eq!(scorer.score(&extracted, &terms, &other), 0);
    }
}
