//! Credit cost estimation.
//!
//! Cost is derived from the estimated narration length: every started minute
//! is billed for both audio and video synthesis, and custom voice/template
//! surcharges apply once per task regardless of segment count.
//!
//! # Example
//!
//! ```ignore
//! use reel_models::CostEstimator;
//!
//! let cost = CostEstimator::new(&text)
//!     .with_custom_voice(true)
//!     .estimate()?;
//!
//! assert_eq!(cost.total, cost.audio_cost + cost.video_cost + cost.extra_cost);
//! ```

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::segment::{segment, SegmentResult, SegmentationResult, SegmentationStrategy};

// =============================================================================
// Rates
// =============================================================================

/// Credit rates applied by the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRates {
    pub audio_per_minute: u32,
    pub video_per_minute: u32,
    pub custom_voice_surcharge: u32,
    pub custom_template_surcharge: u32,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            audio_per_minute: 2,
            video_per_minute: 8,
            custom_voice_surcharge: 5,
            custom_template_surcharge: 10,
        }
    }
}

impl CostRates {
    /// Load rates from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            audio_per_minute: read("COST_AUDIO_PER_MINUTE", defaults.audio_per_minute),
            video_per_minute: read("COST_VIDEO_PER_MINUTE", defaults.video_per_minute),
            custom_voice_surcharge: read("COST_CUSTOM_VOICE", defaults.custom_voice_surcharge),
            custom_template_surcharge: read("COST_CUSTOM_TEMPLATE", defaults.custom_template_surcharge),
        }
    }
}

// =============================================================================
// Cost Breakdown
// =============================================================================

/// Detailed breakdown of the credits charged for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct CostBreakdown {
    pub audio_cost: u32,
    pub video_cost: u32,
    /// Custom voice and/or template surcharges
    pub extra_cost: u32,
    pub subtotal: u32,
    /// Credits debited from the owner
    pub total: u32,
    pub duration_sec: u32,
    /// Billed minutes (`ceil(duration_sec / 60)`)
    pub minutes: u32,
    pub segment_count: u32,
}

impl CostBreakdown {
    /// Human-readable description for credit transactions.
    ///
    /// Format: "Generate N min video (K segments) + custom voice + custom template"
    pub fn to_description(&self) -> String {
        let segment_text = if self.segment_count == 1 { "segment" } else { "segments" };
        let mut description = format!(
            "Generate {} min video ({} {})",
            self.minutes, self.segment_count, segment_text
        );
        if self.extra_cost > 0 {
            description.push_str(" + custom assets");
        }
        description
    }

    /// Metadata map for credit transaction records.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("duration_sec".to_string(), self.duration_sec.to_string());
        metadata.insert("minutes".to_string(), self.minutes.to_string());
        metadata.insert("segment_count".to_string(), self.segment_count.to_string());
        metadata.insert("audio_credits".to_string(), self.audio_cost.to_string());
        metadata.insert("video_credits".to_string(), self.video_cost.to_string());
        if self.extra_cost > 0 {
            metadata.insert("extra_credits".to_string(), self.extra_cost.to_string());
        }
        metadata.insert("total_credits".to_string(), self.total.to_string());
        metadata
    }
}

// =============================================================================
// Estimator
// =============================================================================

/// Builder for task cost estimates.
#[derive(Debug, Clone)]
pub struct CostEstimator<'a> {
    text: &'a str,
    has_custom_voice: bool,
    has_custom_template: bool,
    strategy: SegmentationStrategy,
    rates: CostRates,
}

impl<'a> CostEstimator<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            has_custom_voice: false,
            has_custom_template: false,
            strategy: SegmentationStrategy::Auto,
            rates: CostRates::default(),
        }
    }

    pub fn with_custom_voice(mut self, enabled: bool) -> Self {
        self.has_custom_voice = enabled;
        self
    }

    pub fn with_custom_template(mut self, enabled: bool) -> Self {
        self.has_custom_template = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: SegmentationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_rates(mut self, rates: CostRates) -> Self {
        self.rates = rates;
        self
    }

    /// Segment the text and price it.
    pub fn estimate(&self) -> SegmentResult<CostBreakdown> {
        let plan = segment(self.text, self.strategy)?;
        Ok(self.price(&plan))
    }

    /// Price an existing segmentation of the same text.
    pub fn price(&self, plan: &SegmentationResult) -> CostBreakdown {
        let rates = &self.rates;
        let duration_sec = plan.total_estimated_duration_sec;
        let minutes = duration_sec.div_ceil(60);

        let audio_cost = minutes * rates.audio_per_minute;
        let video_cost = minutes * rates.video_per_minute;

        let mut extra_cost = 0;
        if self.has_custom_voice {
            extra_cost += rates.custom_voice_surcharge;
        }
        if self.has_custom_template {
            extra_cost += rates.custom_template_surcharge;
        }

        let subtotal = audio_cost + video_cost + extra_cost;
        CostBreakdown {
            audio_cost,
            video_cost,
            extra_cost,
            subtotal,
            total: subtotal,
            duration_sec,
            minutes,
            segment_count: plan.segment_count(),
        }
    }
}

/// Estimate with default rates and automatic strategy.
pub fn estimate_cost(
    text: &str,
    has_custom_voice: bool,
    has_custom_template: bool,
) -> SegmentResult<CostBreakdown> {
    CostEstimator::new(text)
        .with_custom_voice(has_custom_voice)
        .with_custom_template(has_custom_template)
        .estimate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentError;

    #[test]
    fn test_ninety_seconds_custom_voice() {
        // 315 chars -> 90 s -> 2 billed minutes
        let text = "x".repeat(315);
        let rates = CostRates::default();
        let cost = estimate_cost(&text, true, false).unwrap();

        assert_eq!(cost.duration_sec, 90);
        assert_eq!(cost.minutes, 2);
        assert_eq!(cost.audio_cost, 2 * rates.audio_per_minute);
        assert_eq!(cost.video_cost, 2 * rates.video_per_minute);
        assert_eq!(cost.extra_cost, rates.custom_voice_surcharge);
        assert_eq!(cost.total, cost.audio_cost + cost.video_cost + cost.extra_cost);
        assert_eq!(cost.total, 25);
    }

    #[test]
    fn test_surcharges_apply_once() {
        let mut text = String::new();
        for _ in 0..30 {
            text.push_str("This sentence is repeated to force several segments. ");
        }
        let base = estimate_cost(&text, false, false).unwrap();
        let both = estimate_cost(&text, true, true).unwrap();

        assert!(base.segment_count > 1);
        assert_eq!(both.total - base.total, 15);
        assert_eq!(both.extra_cost, 15);
    }

    #[test]
    fn test_cost_monotone_in_length() {
        let mut previous = 0;
        for len in (1..2000).step_by(37) {
            let cost = estimate_cost(&"y".repeat(len), false, false).unwrap();
            assert!(cost.total >= previous, "cost decreased at {len}");
            previous = cost.total;
        }
    }

    #[test]
    fn test_custom_rates() {
        let rates = CostRates {
            audio_per_minute: 1,
            video_per_minute: 1,
            custom_voice_surcharge: 0,
            custom_template_surcharge: 3,
        };
        let cost = CostEstimator::new("short text.")
            .with_custom_template(true)
            .with_rates(rates)
            .estimate()
            .unwrap();

        assert_eq!(cost.minutes, 1);
        assert_eq!(cost.total, 5);
        assert_eq!(cost.subtotal, cost.total);
    }

    #[test]
    fn test_empty_text_is_validation_error() {
        assert_eq!(estimate_cost("  ", false, false), Err(SegmentError::EmptyText));
    }

    #[test]
    fn test_description_and_metadata() {
        let cost = estimate_cost(&"z".repeat(315), true, true).unwrap();

        assert_eq!(cost.to_description(), "Generate 2 min video (1 segment) + custom assets");
        let metadata = cost.to_metadata();
        assert_eq!(metadata.get("total_credits"), Some(&cost.total.to_string()));
        assert_eq!(metadata.get("extra_credits"), Some(&"15".to_string()));
    }
}
