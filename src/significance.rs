//! Recommendation diff policy.
//!
//! Decides whether a freshly computed recommendation differs enough from
//! the last one a session received to justify a broadcast. Deliberately
//! conservative so subscribers are not flooded with cosmetic reshuffles.

use crate::models::Recommendation;
use std::collections::HashSet;

/// Thresholds for the significance check. These are tuning knobs, not law.
#[derive(Debug, Clone)]
pub struct SignificanceConfig {
    /// Core-build symmetric difference must exceed this to count.
    pub core_delta: usize,
    /// Absolute threat-level change that counts on its own.
    pub threat_delta: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            core_delta: 1,
            threat_delta: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignificanceEvaluator {
    config: SignificanceConfig,
}

impl SignificanceEvaluator {
    pub fn new(config: SignificanceConfig) -> Self {
        Self { config }
    }

    /// True when `candidate` should be pushed out given what was last sent.
    ///
    /// No previous recommendation is always significant. Otherwise: a core
    /// build reshuffle bigger than one item, any change to the counter
    /// items, or a threat swing past the configured delta.
    pub fn is_significant(
        &self,
        previous: Option<&Recommendation>,
        candidate: &Recommendation,
    ) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        if core_symmetric_difference(previous, candidate) > self.config.core_delta {
            return true;
        }

        if !same_item_set(&previous.counter_items, &candidate.counter_items) {
            return true;
        }

        (previous.threat_level - candidate.threat_level).abs() > self.config.threat_delta
    }
}

fn core_symmetric_difference(a: &Recommendation, b: &Recommendation) -> usize {
    let a: HashSet<&str> = a.core_items.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.core_items.iter().map(String::as_str).collect();
    a.symmetric_difference(&b).count()
}

fn same_item_set(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}
