//! Heuristic re-ranking of backend candidates.
//!
//! Scores start from `similarity * 100` and accumulate additive boosts for
//! lexical overlap with the query, extracted medications and conditions,
//! section headings and dosing language. Advanced mode layers positional,
//! phrase and intent-specific signals on top of the basic score, and a
//! protocol-number match outweighs everything else.

use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;

use crate::{
    config::{BOOST_KEYWORDS, SectionPriority},
    types::{Intent, NormalizedQuery, RetrievalResult, sort_by_score},
};

const TITLE_TERM_BOOST: f64 = 5.0;
const CONTENT_MEDICATION_BOOST: f64 = 8.0;
const CONTENT_CONDITION_BOOST: f64 = 6.0;
const KEYWORD_BOOST: f64 = 2.0;
const SHORT_CONTENT_CHARS: usize = 200;
const SHORT_CONTENT_PENALTY: f64 = 5.0;
const DOSING_INTENT_BOOST: f64 = 10.0;

const TERM_FREQUENCY_WEIGHT: f64 = 2.0;
const TERM_FREQUENCY_CAP: f64 = 20.0;
const EARLY_MENTION_CHARS: usize = 200;
const EARLY_MENTION_BOOST: f64 = 5.0;
const EXACT_PHRASE_BOOST: f64 = 15.0;
const ADVANCED_TITLE_TERM_BOOST: f64 = 8.0;
const TITLE_MEDICATION_BOOST: f64 = 12.0;
const TITLE_CONDITION_BOOST: f64 = 10.0;
const PROTOCOL_NUMBER_BOOST: f64 = 50.0;
const DOSE_PATTERN_BOOST: f64 = 15.0;
const AGE_DOSING_BOOST: f64 = 8.0;
const STEP_MARKER_MIN: usize = 3;
const STEP_SEQUENCE_BOOST: f64 = 10.0;
const CAUTION_BOOST: f64 = 12.0;
const URGENCY_BOOST: f64 = 8.0;

pub const AGENCY_MATCH_BOOST: f64 = 15.0;
pub const STATE_MATCH_BOOST: f64 = 5.0;

static DOSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+\s*(?:mg|mcg|ml|units?|g)").expect("valid regex")
});

static AGE_DOSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:adult|pediatric|peds?)\s+(?:dose|dosing|dosage)\b")
        .expect("valid regex")
});

static STEP_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\bstep\s*\d+|^\s*\d+[.)]\s").expect("valid regex")
});

static CAUTION_LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:contraindicat|caution|warning)").expect("valid regex")
});

static URGENCY_LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:immediate(?:ly)?|stat|emergency|emergent|critical)\b")
        .expect("valid regex")
});

static PROTOCOL_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3,4}\b").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RerankMode {
    Basic,
    #[default]
    Advanced,
}

/// Query features extracted once per re-rank call.
struct QuerySignals {
    terms: Vec<String>,
    term_patterns: Vec<Regex>,
    phrase: String,
    medications: Vec<String>,
    conditions: Vec<String>,
    protocol_numbers: Vec<String>,
    intent: Intent,
    is_emergent: bool,
}

impl QuerySignals {
    fn new(query: &NormalizedQuery) -> Self {
        let mut terms: Vec<String> = Vec::new();
        for raw in query.normalized.split_whitespace() {
            let term = raw
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if term.chars().count() > 2 && !terms.contains(&term) {
                terms.push(term);
            }
        }

        let term_patterns = terms
            .iter()
            .filter_map(|t| {
                Regex::new(&format!(r"\b{}\b", regex::escape(t))).ok()
            })
            .collect();

        let protocol_numbers = PROTOCOL_NUMBER
            .find_iter(&query.original)
            .chain(PROTOCOL_NUMBER.find_iter(&query.normalized))
            .map(|m| m.as_str().to_string())
            .collect();

        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.to_lowercase()).collect()
        };

        Self {
            terms,
            term_patterns,
            phrase: query.original.trim().to_lowercase(),
            medications: lower(&query.extracted_medications),
            conditions: lower(&query.extracted_conditions),
            protocol_numbers,
            intent: query.intent,
            is_emergent: query.is_emergent,
        }
    }
}

/// Lowercased text fields of one candidate.
struct Candidate<'a> {
    result: &'a RetrievalResult,
    title: String,
    content: String,
}

impl<'a> Candidate<'a> {
    fn new(result: &'a RetrievalResult) -> Self {
        Self {
            result,
            title: result.protocol_title.to_lowercase(),
            content: result.content.to_lowercase(),
        }
    }
}

fn count_contained(haystack: &str, needles: &[String]) -> f64 {
    needles.iter().filter(|n| haystack.contains(n.as_str())).count() as f64
}

fn basic_score(c: &Candidate<'_>, q: &QuerySignals) -> f64 {
    let mut score = c.result.similarity * 100.0;

    score += TITLE_TERM_BOOST * count_contained(&c.title, &q.terms);
    score +=
        CONTENT_MEDICATION_BOOST * count_contained(&c.content, &q.medications);
    score +=
        CONTENT_CONDITION_BOOST * count_contained(&c.content, &q.conditions);

    if let Some(section) = &c.result.section {
        score += SectionPriority::weight_for(section);
    }

    score += KEYWORD_BOOST
        * BOOST_KEYWORDS
            .iter()
            .filter(|k| c.content.contains(*k))
            .count() as f64;

    if c.result.content.chars().count() < SHORT_CONTENT_CHARS {
        score -= SHORT_CONTENT_PENALTY;
    }

    if q.intent == Intent::MedicationDosing && DOSE_PATTERN.is_match(&c.content)
    {
        score += DOSING_INTENT_BOOST;
    }

    score
}

fn advanced_bonus(c: &Candidate<'_>, q: &QuerySignals) -> f64 {
    let mut bonus = 0.0;

    let frequency: usize = q
        .term_patterns
        .iter()
        .map(|p| p.find_iter(&c.content).count())
        .sum();
    bonus += (frequency as f64 * TERM_FREQUENCY_WEIGHT).min(TERM_FREQUENCY_CAP);

    bonus += EARLY_MENTION_BOOST
        * q.terms
            .iter()
            .filter(|t| {
                c.content.find(t.as_str()).is_some_and(|pos| {
                    c.content[..pos].chars().count() < EARLY_MENTION_CHARS
                })
            })
            .count() as f64;

    if !q.phrase.is_empty() && c.content.contains(&q.phrase) {
        bonus += EXACT_PHRASE_BOOST;
    }

    bonus += ADVANCED_TITLE_TERM_BOOST * count_contained(&c.title, &q.terms);
    bonus += TITLE_MEDICATION_BOOST * count_contained(&c.title, &q.medications);
    bonus += TITLE_CONDITION_BOOST * count_contained(&c.title, &q.conditions);

    if q
        .protocol_numbers
        .iter()
        .any(|n| c.result.protocol_number.contains(n.as_str()))
    {
        bonus += PROTOCOL_NUMBER_BOOST;
    }

    match q.intent {
        Intent::MedicationDosing => {
            if DOSE_PATTERN.is_match(&c.content) {
                bonus += DOSE_PATTERN_BOOST;
            }
            if AGE_DOSING.is_match(&c.content) {
                bonus += AGE_DOSING_BOOST;
            }
        }
        Intent::ProcedureSteps => {
            if STEP_MARKER.find_iter(&c.result.content).count()
                >= STEP_MARKER_MIN
            {
                bonus += STEP_SEQUENCE_BOOST;
            }
        }
        Intent::ContraindicationCheck => {
            if CAUTION_LANGUAGE.is_match(&c.content) {
                bonus += CAUTION_BOOST;
            }
        }
        _ => {}
    }

    if q.is_emergent && URGENCY_LANGUAGE.is_match(&c.content) {
        bonus += URGENCY_BOOST;
    }

    bonus
}

/// Score every candidate and return annotated copies sorted by score
/// descending. Any previous `reranked_score` is replaced.
pub fn rerank(
    results: &[RetrievalResult],
    query: &NormalizedQuery,
    mode: RerankMode,
) -> Vec<RetrievalResult> {
    let signals = QuerySignals::new(query);

    let mut ranked: Vec<RetrievalResult> = results
        .par_iter()
        .map(|result| {
            let candidate = Candidate::new(result);
            let mut score = basic_score(&candidate, &signals);
            if mode == RerankMode::Advanced {
                score += advanced_bonus(&candidate, &signals);
            }
            result.with_score(score)
        })
        .collect();

    sort_by_score(&mut ranked);
    ranked
}

/// Add agency and state affinity on top of the current score and re-sort.
pub fn apply_context_boost(
    results: &[RetrievalResult],
    agency_id: Option<i64>,
    state_code: Option<&str>,
) -> Vec<RetrievalResult> {
    let mut boosted: Vec<RetrievalResult> = results
        .iter()
        .map(|r| {
            let mut score = r.score();
            if agency_id.is_some() && r.agency_id() == agency_id {
                score += AGENCY_MATCH_BOOST;
            }
            if let (Some(wanted), Some(have)) = (state_code, r.state_code()) {
                if wanted.trim().eq_ignore_ascii_case(have.trim()) {
                    score += STATE_MATCH_BOOST;
                }
            }
            r.with_score(score)
        })
        .collect();

    sort_by_score(&mut boosted);
    boosted
}
