//! Query normalization: canonical text, intent, and extracted clinical
//! terms.
//!
//! The pipeline only depends on the [`QueryNormalizer`] trait.
//! [`KeywordNormalizer`] is a rule-based implementation driven by fixed
//! vocabularies of EMS abbreviations, medications and conditions.

use crate::types::{Intent, NormalizedQuery};

/// Turns raw query text into a [`NormalizedQuery`] and proposes
/// paraphrases for multi-query fusion.
pub trait QueryNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> NormalizedQuery;

    /// Ordered paraphrases of `raw`. Callers use only the first few.
    fn variants(&self, raw: &str) -> Vec<String>;
}

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("epi", "epinephrine"),
    ("nitro", "nitroglycerin"),
    ("ntg", "nitroglycerin"),
    ("asa", "aspirin"),
    ("narcan", "naloxone"),
    ("amio", "amiodarone"),
    ("bicarb", "sodium bicarbonate"),
    ("benadryl", "diphenhydramine"),
    ("versed", "midazolam"),
    ("zofran", "ondansetron"),
    ("d50", "dextrose"),
    ("d10", "dextrose"),
    ("mag", "magnesium sulfate"),
    ("vfib", "ventricular fibrillation"),
    ("v-fib", "ventricular fibrillation"),
    ("vtach", "ventricular tachycardia"),
    ("v-tach", "ventricular tachycardia"),
    ("svt", "supraventricular tachycardia"),
    ("cp", "chest pain"),
    ("sob", "shortness of breath"),
    ("loc", "loss of consciousness"),
    ("ams", "altered mental status"),
    ("mi", "myocardial infarction"),
    ("od", "overdose"),
    ("peds", "pediatric"),
    ("ped", "pediatric"),
    ("pt", "patient"),
];

const MEDICATIONS: &[&str] = &[
    "epinephrine",
    "nitroglycerin",
    "aspirin",
    "naloxone",
    "amiodarone",
    "adenosine",
    "atropine",
    "diphenhydramine",
    "albuterol",
    "ipratropium",
    "midazolam",
    "fentanyl",
    "morphine",
    "ketamine",
    "ondansetron",
    "dextrose",
    "glucagon",
    "sodium bicarbonate",
    "magnesium sulfate",
    "lidocaine",
    "calcium chloride",
    "methylprednisolone",
    "ketorolac",
    "acetaminophen",
];

const CONDITIONS: &[&str] = &[
    "anaphylaxis",
    "allergic reaction",
    "cardiac arrest",
    "chest pain",
    "myocardial infarction",
    "stemi",
    "stroke",
    "seizure",
    "status epilepticus",
    "asthma",
    "copd",
    "shortness of breath",
    "pulmonary edema",
    "hypoglycemia",
    "hypotension",
    "bradycardia",
    "supraventricular tachycardia",
    "ventricular tachycardia",
    "ventricular fibrillation",
    "altered mental status",
    "overdose",
    "sepsis",
    "trauma",
    "burns",
    "croup",
    "preeclampsia",
];

const DIFFERENTIAL_CUES: &[&str] = &[
    "differential",
    "vs",
    "versus",
    "rule out",
    "difference between",
    "distinguish",
];

const CONTRAINDICATION_CUES: &[&str] = &[
    "contraindication",
    "contraindications",
    "contraindicated",
    "should not",
    "safe to",
    "avoid",
    "caution",
    "interaction",
];

const DOSING_CUES: &[&str] =
    &["dose", "dosing", "dosage", "how much", "mg", "mcg", "mg/kg"];

const PROCEDURE_CUES: &[&str] = &[
    "how to",
    "how do",
    "steps",
    "procedure",
    "technique",
    "perform",
    "insert",
    "placement",
];

const PEDIATRIC_CUES: &[&str] =
    &["pediatric", "child", "children", "infant", "neonate", "newborn", "kid"];

const EMERGENT_CUES: &[&str] = &[
    "cardiac arrest",
    "arrest",
    "pulseless",
    "apneic",
    "apnea",
    "not breathing",
    "unresponsive",
    "anaphylaxis",
    "status epilepticus",
    "ventricular fibrillation",
    "stat",
];

const COMPLEX_WORD_COUNT: usize = 12;

/// Keyword-rule normalizer for EMS protocol questions.
///
/// ```
/// use protocol_retrieval::normalizer::{KeywordNormalizer, QueryNormalizer};
/// use protocol_retrieval::types::Intent;
///
/// let q = KeywordNormalizer.normalize("Epi dose for anaphylaxis?");
/// assert_eq!(q.normalized, "epinephrine dose for anaphylaxis");
/// assert_eq!(q.intent, Intent::MedicationDosing);
/// assert_eq!(q.extracted_medications, ["epinephrine"]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordNormalizer;

/// Lowercase, collapse whitespace, trim punctuation from each token and
/// expand abbreviations.
fn canonicalize(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map_or(token, |(_, full)| (*full).to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `text` padded with spaces so phrase lookups match whole words only.
struct Words(String);

impl Words {
    fn new(canonical: &str) -> Self {
        Self(format!(" {canonical} "))
    }

    fn has(&self, phrase: &str) -> bool {
        self.0.contains(&format!(" {phrase} "))
    }

    fn has_any(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.has(p))
    }

    fn extract(&self, vocabulary: &[&str]) -> Vec<String> {
        vocabulary
            .iter()
            .filter(|term| self.has(term))
            .map(|term| (*term).to_string())
            .collect()
    }
}

fn classify(words: &Words, has_medications: bool) -> Intent {
    if words.has_any(DIFFERENTIAL_CUES) {
        Intent::DifferentialDiagnosis
    } else if words.has_any(CONTRAINDICATION_CUES) {
        Intent::ContraindicationCheck
    } else if words.has_any(DOSING_CUES) {
        Intent::MedicationDosing
    } else if words.has_any(PROCEDURE_CUES) {
        Intent::ProcedureSteps
    } else if words.has_any(PEDIATRIC_CUES) {
        Intent::PediatricSpecific
    } else if has_medications && words.has("give") {
        Intent::MedicationDosing
    } else {
        Intent::General
    }
}

impl QueryNormalizer for KeywordNormalizer {
    fn normalize(&self, raw: &str) -> NormalizedQuery {
        let normalized = canonicalize(raw);
        let words = Words::new(&normalized);

        let extracted_medications = words.extract(MEDICATIONS);
        let extracted_conditions = words.extract(CONDITIONS);
        let intent = classify(&words, !extracted_medications.is_empty());

        let is_complex = normalized.split(' ').count() > COMPLEX_WORD_COUNT
            || extracted_conditions.len() >= 2
            || intent == Intent::DifferentialDiagnosis;
        let is_emergent = words.has_any(EMERGENT_CUES);

        NormalizedQuery {
            original: raw.to_string(),
            normalized,
            intent,
            is_complex,
            is_emergent,
            extracted_medications,
            extracted_conditions,
        }
    }

    fn variants(&self, raw: &str) -> Vec<String> {
        let q = self.normalize(raw);
        let medication = q.extracted_medications.first();
        let condition = q.extracted_conditions.first();

        let templated = match (q.intent, medication, condition) {
            (Intent::MedicationDosing, Some(med), Some(cond)) => {
                Some(format!("{med} dose {cond}"))
            }
            (Intent::MedicationDosing, Some(med), None) => {
                Some(format!("{med} dose route"))
            }
            (Intent::ContraindicationCheck, Some(med), _) => {
                Some(format!("{med} contraindications"))
            }
            (Intent::ProcedureSteps, _, _) => {
                Some(format!("{} procedure steps", q.normalized))
            }
            (Intent::DifferentialDiagnosis, _, _)
                if !q.extracted_conditions.is_empty() =>
            {
                Some(format!(
                    "{} assessment",
                    q.extracted_conditions.join(" ")
                ))
            }
            (Intent::PediatricSpecific, _, _) => {
                Some(format!("pediatric {}", q.normalized))
            }
            (_, _, Some(cond)) => Some(format!("{cond} treatment protocol")),
            _ => None,
        };

        let raw_lower = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut variants: Vec<String> = Vec::new();
        for candidate in [Some(q.normalized), templated, Some(raw_lower)]
            .into_iter()
            .flatten()
        {
            if !candidate.is_empty() && !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_abbreviations_and_strips_punctuation() {
        let q = KeywordNormalizer.normalize("  NTG   for CP??  ");
        assert_eq!(q.normalized, "nitroglycerin for chest pain");
        assert_eq!(q.original, "  NTG   for CP??  ");
        assert_eq!(q.extracted_medications, ["nitroglycerin"]);
        assert_eq!(q.extracted_conditions, ["chest pain"]);
    }

    #[test]
    fn dosing_query_is_classified() {
        let q = KeywordNormalizer.normalize("epi dose for anaphylaxis");
        assert_eq!(q.intent, Intent::MedicationDosing);
        assert!(q.is_emergent);
        assert!(!q.is_complex);
    }

    #[test]
    fn differential_is_complex() {
        let q = KeywordNormalizer.normalize("stemi vs pulmonary edema");
        assert_eq!(q.intent, Intent::DifferentialDiagnosis);
        assert!(q.is_complex);
    }

    #[test]
    fn contraindication_beats_dosing() {
        let q = KeywordNormalizer
            .normalize("nitro contraindications dose with hypotension");
        assert_eq!(q.intent, Intent::ContraindicationCheck);
    }

    #[test]
    fn procedure_and_pediatric_cues() {
        assert_eq!(
            KeywordNormalizer.normalize("how to perform needle decompression").intent,
            Intent::ProcedureSteps
        );
        assert_eq!(
            KeywordNormalizer.normalize("peds croup").intent,
            Intent::PediatricSpecific
        );
        assert_eq!(
            KeywordNormalizer.normalize("stroke scale").intent,
            Intent::General
        );
    }

    #[test]
    fn words_match_whole_tokens_only() {
        // "mg" must not match inside "emergency".
        let q = KeywordNormalizer.normalize("emergency contacts");
        assert_eq!(q.intent, Intent::General);
    }

    #[test]
    fn two_conditions_make_query_complex() {
        let q = KeywordNormalizer.normalize("seizure with hypoglycemia");
        assert!(q.is_complex);
    }

    #[test]
    fn variants_are_distinct_and_ordered() {
        let v = KeywordNormalizer.variants("Epi dose for anaphylaxis");
        assert_eq!(
            v,
            [
                "epinephrine dose for anaphylaxis",
                "epinephrine dose anaphylaxis",
                "epi dose for anaphylaxis",
            ]
        );
    }

    #[test]
    fn variants_skip_duplicates() {
        let v = KeywordNormalizer.variants("stroke");
        assert_eq!(v, ["stroke", "stroke treatment protocol"]);
    }

    #[test]
    fn empty_query_has_no_variants() {
        assert!(KeywordNormalizer.variants("   ").is_empty());
        assert_eq!(KeywordNormalizer.normalize("").intent, Intent::General);
    }
}
