//! Tier-weighted deal scoring engine: five criteria, fixed weight vectors
//! per contracting tier, banded pursue/avoid recommendation.

use std::collections::BTreeMap;

use oflp_core::{Band, Criterion, DealScore, Tier};
use thiserror::Error;

pub const CRATE_NAME: &str = "oflp-score";

/// Criterion scores are restricted to this discrete set.
pub const ALLOWED_VALUES: [u8; 4] = [0, 1, 3, 5];

/// Weight vector for a tier, in `Criterion::ALL` order. Each vector sums
/// to 1.0, so the weighted total stays in [0, 5].
pub fn tier_weights(tier: Tier) -> [(Criterion, f64); 5] {
    let weights = match tier {
        Tier::Local => [0.12, 0.15, 0.38, 0.12, 0.23],
        Tier::State | Tier::Federal => [0.13, 0.20, 0.32, 0.15, 0.20],
    };
    [
        (Criterion::ScopeAlignment, weights[0]),
        (Criterion::ContractValue, weights[1]),
        (Criterion::InternalStaffingMatch, weights[2]),
        (Criterion::QualificationsMatch, weights[3]),
        (Criterion::DealOverview, weights[4]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("missing criterion {0}")]
    MissingCriterion(Criterion),
    #[error("score {value} for {criterion} is not one of 0, 1, 3, 5")]
    InvalidValue { criterion: Criterion, value: u8 },
}

/// Band thresholds are expressed over `weighted_total / 5`, the rubric's
/// percentage scale. Lower bounds are inclusive: ratios of exactly 0.69
/// and 0.80 land in the higher band.
pub fn band_for(weighted_total: f64) -> Band {
    let ratio = weighted_total / 5.0;
    if ratio >= 0.80 {
        Band::Pursue
    } else if ratio >= 0.69 {
        Band::ProceedWithCaution
    } else {
        Band::AvoidUnlessJustified
    }
}

/// Stateless engine: a pure function of its inputs and the fixed weight
/// tables, safe to share across evaluations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringEngine;

impl ScoringEngine {
    /// Requires all five criteria, each valued in {0, 1, 3, 5}; never
    /// substitutes a default for a missing or out-of-domain score.
    pub fn score(
        &self,
        tier: Tier,
        scores: &BTreeMap<Criterion, u8>,
    ) -> Result<DealScore, ScoreError> {
        let mut weighted_total = 0.0;
        for (criterion, weight) in tier_weights(tier) {
            let value = *scores
                .get(&criterion)
                .ok_or(ScoreError::MissingCriterion(criterion))?;
            if !ALLOWED_VALUES.contains(&value) {
                return Err(ScoreError::InvalidValue { criterion, value });
            }
            weighted_total += weight * f64::from(value);
        }

        Ok(DealScore {
            tier,
            criterion_scores: scores.clone(),
            weighted_total,
            band: band_for(weighted_total),
        })
    }
}
