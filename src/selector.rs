//! Maps query features and the caller's tier to a similarity threshold,
//! a result count and a generation model tier.

use crate::{
    config::PolicyConfig,
    types::{Intent, ModelTier, NormalizedQuery, UserTier},
};

/// Medication questions and contraindication checks share the strictest
/// threshold; procedures sit in the middle; everything else is general.
pub fn select_similarity_threshold(
    config: &PolicyConfig,
    intent: Intent,
    has_extracted_medications: bool,
) -> f64 {
    let t = &config.thresholds;
    match intent {
        Intent::MedicationDosing | Intent::ContraindicationCheck => {
            t.medication
        }
        _ if has_extracted_medications => t.medication,
        Intent::ProcedureSteps => t.procedure,
        _ => t.general,
    }
}

pub fn select_result_limit(
    config: &PolicyConfig,
    is_complex: bool,
    intent: Intent,
) -> usize {
    if is_complex || intent == Intent::DifferentialDiagnosis {
        config.limits.complex_return
    } else {
        config.limits.standard_return
    }
}

/// Free tier always gets the standard model.
pub fn select_model(
    intent: Intent,
    is_complex: bool,
    has_extracted_medications: bool,
    tier: UserTier,
) -> ModelTier {
    if tier == UserTier::Free {
        return ModelTier::Standard;
    }

    let needs_accuracy = is_complex
        || intent == Intent::DifferentialDiagnosis
        || (intent == Intent::PediatricSpecific && has_extracted_medications);

    if needs_accuracy {
        ModelTier::Advanced
    } else {
        ModelTier::Standard
    }
}

/// Threshold, limit and model resolved for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub threshold: f64,
    pub limit: usize,
    pub model: ModelTier,
}

impl Selection {
    /// Resolve all three choices. `limit_override` replaces the computed
    /// result count when present and non-zero.
    pub fn resolve(
        config: &PolicyConfig,
        query: &NormalizedQuery,
        tier: UserTier,
        limit_override: Option<usize>,
    ) -> Self {
        let has_meds = !query.extracted_medications.is_empty();
        let computed_limit =
            select_result_limit(config, query.is_complex, query.intent);
        Self {
            threshold: select_similarity_threshold(
                config,
                query.intent,
                has_meds,
            ),
            limit: limit_override.filter(|&n| n > 0).unwrap_or(computed_limit),
            model: select_model(
                query.intent,
                query.is_complex,
                has_meds,
                tier,
            ),
        }
    }
}
