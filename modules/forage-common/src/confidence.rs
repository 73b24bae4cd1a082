//! Confidence scoring for staged entities.
//!
//! Scoring is a pure function of named factors. Each factor carries a 0–100
//! score and a relative weight. The aggregation policy is fixed:
//!
//! - A factor whose input is missing (`score: None`) is omitted and the weights of
//!   the remaining factors are renormalised to sum to 1.
//! - Factor scores are clamped to 0–100; non-positive or non-finite weights count
//!   as omitted.
//! - The aggregate is `Σ score_i * weight_i / Σ weight_i`, rounded half away from
//!   zero to an integer.
//! - With no usable factors the score is 0, which routes the entity to review or
//!   rejection rather than approval.
//!
//! Callers persist results themselves; nothing here touches storage.

use serde::{Deserialize, Serialize};

use crate::staging::Price;

pub const GEOCODING: &str = "geocoding";
pub const NAME_MATCH: &str = "name_match";
pub const PRICE_PLAUSIBILITY: &str = "price_plausibility";
pub const SOURCE_RELIABILITY: &str = "source_reliability";
pub const PARTNER_QUALITY: &str = "partner_quality";
pub const COMPLETENESS: &str = "completeness";

/// One scoring input.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub name: String,
    pub score: Option<f64>,
    pub weight: f64,
}

impl Factor {
    pub fn new(name: impl Into<String>, score: Option<f64>, weight: f64) -> Self {
        Self {
            name: name.into(),
            score,
            weight,
        }
    }

    pub fn missing(name: impl Into<String>, weight: f64) -> Self {
        Self::new(name, None, weight)
    }
}

/// One line of the breakdown shown to reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub name: String,
    /// None when the input was missing and the factor was omitted.
    pub score: Option<f64>,
    /// Weight after renormalisation (0 for omitted factors).
    pub weight: f64,
    /// Points this factor added to the total.
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceResult {
    pub score: u8,
    pub breakdown: Vec<FactorScore>,
}

pub fn score(factors: &[Factor]) -> ConfidenceResult {
    let usable = |f: &Factor| f.score.is_some_and(f64::is_finite) && f.weight.is_finite() && f.weight > 0.0;
    let total_weight: f64 = factors.iter().filter(|f| usable(f)).map(|f| f.weight).sum();

    let mut aggregate = 0.0;
    let breakdown = factors
        .iter()
        .map(|f| {
            if !usable(f) || total_weight <= 0.0 {
                return FactorScore {
                    name: f.name.clone(),
                    score: f.score.filter(|s| s.is_finite()).map(clamp_score),
                    weight: 0.0,
                    contribution: 0.0,
                };
            }
            let s = clamp_score(f.score.unwrap_or_default());
            let weight = f.weight / total_weight;
            let contribution = s * weight;
            aggregate += contribution;
            FactorScore {
                name: f.name.clone(),
                score: Some(s),
                weight,
                contribution,
            }
        })
        .collect();

    ConfidenceResult {
        score: clamp_score(aggregate).round() as u8,
        breakdown,
    }
}

fn clamp_score(s: f64) -> f64 {
    s.clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Signal → factor helpers
// ---------------------------------------------------------------------------

/// Precision reported by a geocoder for a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodePrecision {
    Rooftop,
    RangeInterpolated,
    GeometricCenter,
    Approximate,
}

pub fn geocoding_factor(precision: Option<GeocodePrecision>, weight: f64) -> Factor {
    let score = precision.map(|p| match p {
        GeocodePrecision::Rooftop => 100.0,
        GeocodePrecision::RangeInterpolated => 80.0,
        GeocodePrecision::GeometricCenter => 55.0,
        GeocodePrecision::Approximate => 25.0,
    });
    Factor::new(GEOCODING, score, weight)
}

/// Similarity of a candidate name to the closest known catalog name.
pub fn name_match_factor(candidate: &str, known: Option<&str>, weight: f64) -> Factor {
    let score = known.map(|k| name_similarity(candidate, k) * 100.0);
    Factor::new(NAME_MATCH, score, weight)
}

/// Full marks inside `[min, max]`, decaying linearly to 0 at half/double the bounds.
pub fn price_plausibility_factor(price: Option<&Price>, min: f64, max: f64, weight: f64) -> Factor {
    let score = price.map(|p| {
        let amount = p.amount;
        if amount <= 0.0 {
            0.0
        } else if amount < min {
            let floor = min / 2.0;
            (100.0 * (amount - floor) / (min - floor)).max(0.0)
        } else if amount > max {
            let ceiling = max * 2.0;
            (100.0 * (ceiling - amount) / (ceiling - max)).max(0.0)
        } else {
            100.0
        }
    });
    Factor::new(PRICE_PLAUSIBILITY, score, weight)
}

/// A strategy's success rate is the reliability of what it produced.
pub fn source_reliability_factor(success_rate: Option<u8>, weight: f64) -> Factor {
    Factor::new(SOURCE_RELIABILITY, success_rate.map(f64::from), weight)
}

pub fn partner_quality_factor(data_quality_score: Option<u8>, weight: f64) -> Factor {
    Factor::new(PARTNER_QUALITY, data_quality_score.map(f64::from), weight)
}

/// Share of expected fields that are populated.
pub fn completeness_factor(present: usize, expected: usize, weight: f64) -> Factor {
    let score = (expected > 0).then(|| 100.0 * present.min(expected) as f64 / expected as f64);
    Factor::new(COMPLETENESS, score, weight)
}

/// Sørensen–Dice coefficient over character bigrams of normalised names (0.0–1.0).
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let a_grams = bigrams(&a);
    let b_grams = bigrams(&b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return 0.0;
    }

    let mut remaining = b_grams.clone();
    let mut overlap = 0usize;
    for gram in &a_grams {
        if let Some(pos) = remaining.iter().position(|g| g == gram) {
            remaining.swap_remove(pos);
            overlap += 1;
        }
    }
    2.0 * overlap as f64 / (a_grams.len() + b_grams.len()) as f64
}

fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
