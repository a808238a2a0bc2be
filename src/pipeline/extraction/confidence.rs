//! Field confidence: `100 * clamp(w_ocr * ocr_conf + w_match * match_quality, 0, 1)`.

use crate::models::ConfidenceWeights;

/// Match-quality constants per strategy.
pub mod quality {
    /// Regex with exactly one candidate in the text.
    pub const REGEX_UNIQUE: f32 = 1.0;
    /// Regex where several candidates competed.
    pub const REGEX_AMBIGUOUS: f32 = 0.85;
    /// Table located by header keywords.
    pub const TABLE_KEYWORDS: f32 = 0.9;
    /// Table located by row-shape heuristics only.
    pub const TABLE_HEURISTIC: f32 = 0.75;
    /// LLM answer without a self-reported confidence.
    pub const LLM_DEFAULT: f32 = 0.8;
}

/// Anchor quality decays linearly to 0.5 at the edge of the window.
pub fn anchor_quality(distance: usize, window: usize) -> f32 {
    if window == 0 {
        return 1.0;
    }
    let ratio = (distance as f32 / window as f32).min(1.0);
    1.0 - 0.5 * ratio
}

/// Normalised 0-100 score. Empty values always score 0.
pub fn score(weights: &ConfidenceWeights, ocr_confidence: f32, match_quality: f32, is_empty: bool) -> f32 {
    if is_empty {
        return 0.0;
    }
    let total = weights.ocr + weights.strategy;
    if total <= 0.0 {
        return 0.0;
    }
    let combined = (weights.ocr * ocr_confidence.clamp(0.0, 1.0)
        + weights.strategy * match_quality.clamp(0.0, 1.0))
        / total;
    (combined.clamp(0.0, 1.0) * 100.0 * 10.0).round() / 10.0
}

/// LLM self-reported confidence may come as 0-1 or 0-100.
pub fn normalize_reported(raw: f64) -> Option<f32> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(value.min(1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights() {
        let w = ConfidenceWeights::default();
        assert_eq!(score(&w, 1.0, 1.0, false), 100.0);
        assert_eq!(score(&w, 0.5, 1.0, false), 70.0);
        assert_eq!(score(&w, 0.9, 0.85, false), 88.0);
    }

    #[test]
    fn empty_values_score_zero() {
        assert_eq!(score(&ConfidenceWeights::default(), 1.0, 1.0, true), 0.0);
    }

    #[test]
    fn weights_are_normalised() {
        let w = ConfidenceWeights { ocr: 3.0, strategy: 1.0 };
        assert_eq!(score(&w, 1.0, 0.0, false), 75.0);
        let zero = ConfidenceWeights { ocr: 0.0, strategy: 0.0 };
        assert_eq!(score(&zero, 1.0, 1.0, false), 0.0);
    }

    #[test]
    fn anchor_quality_decays_with_distance() {
        assert_eq!(anchor_quality(0, 40), 1.0);
        assert_eq!(anchor_quality(20, 40), 0.75);
        assert_eq!(anchor_quality(80, 40), 0.5);
    }

    #[test]
    fn reported_confidence_scales() {
        assert_eq!(normalize_reported(0.9), Some(0.9));
        assert_eq!(normalize_reported(85.0), Some(0.85));
        assert_eq!(normalize_reported(-1.0), None);
    }
}
