//! Adaptive buffer controller.
//!
//! After every scheduled fragment the scheduler reports the observed
//! latency (scheduled start minus arrival time).  The controller keeps a
//! rolling window of those observations plus the context's dropout count,
//! classifies link quality, and nudges the scheduler's lead time and
//! pre-buffer depth in small multiplicative steps.
//!
//! | Tier | Condition | Lead | Pre-buffer |
//! |------|-----------|------|------------|
//! | `good` | avg < `good_latency_secs` and dropouts ≤ `low_dropouts` | × `shrink_factor` | −1 after a streak |
//! | `degraded` | avg < `degraded_latency_secs` and dropouts ≤ `moderate_dropouts` | × `grow_factor` | unchanged |
//! | `poor` | otherwise | × `poor_grow_factor` | +1 |
//!
//! Both values are clamped to their configured ranges after every step.

use serde::Serialize;

use crate::config::AdaptiveConfig;

use super::history::LatencyHistory;

// ---------------------------------------------------------------------------
// QualityTier / QualityMetrics
// ---------------------------------------------------------------------------

/// Coarse link quality derived from latency and dropouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    #[default]
    Good,
    Degraded,
    Poor,
}

/// Per-context quality measurements.  Reset on every context switch.
#[derive(Debug, Clone)]
pub struct QualityMetrics {
    latency: LatencyHistory,
    dropouts: u32,
    tier: QualityTier,
}

impl QualityMetrics {
    fn new(window: usize) -> Self {
        Self {
            latency: LatencyHistory::new(window),
            dropouts: 0,
            tier: QualityTier::Good,
        }
    }

    pub fn average_latency(&self) -> f64 {
        self.latency.average()
    }

    pub fn dropouts(&self) -> u32 {
        self.dropouts
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn samples(&self) -> usize {
        self.latency.len()
    }
}

// ---------------------------------------------------------------------------
// AdaptiveController
// ---------------------------------------------------------------------------

/// Feedback loop tuning lead time and pre-buffer depth.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    metrics: QualityMetrics,
    lead_secs: f64,
    prebuffer: usize,
    good_streak: u32,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let lead_secs = config
            .initial_lead_secs
            .max(config.min_lead_secs)
            .min(config.max_lead_secs);
        let prebuffer = config
            .initial_prebuffer
            .max(config.min_prebuffer)
            .min(config.max_prebuffer);
        Self {
            metrics: QualityMetrics::new(config.history_len),
            config,
            lead_secs,
            prebuffer,
            good_streak: 0,
        }
    }

    /// Current minimum lead time in seconds.
    pub fn lead_secs(&self) -> f64 {
        self.lead_secs
    }

    /// Current pre-buffer depth in fragments.
    pub fn prebuffer(&self) -> usize {
        self.prebuffer
    }

    pub fn tier(&self) -> QualityTier {
        self.metrics.tier
    }

    pub fn metrics(&self) -> &QualityMetrics {
        &self.metrics
    }

    /// Count one dropout against the current context.
    pub fn record_dropout(&mut self) {
        self.metrics.dropouts = self.metrics.dropouts.saturating_add(1);
    }

    /// Forget the current context's measurements.
    ///
    /// Lead time and pre-buffer depth carry over to the next context.
    pub fn reset_metrics(&mut self) {
        self.metrics = QualityMetrics::new(self.config.history_len);
        self.good_streak = 0;
    }

    /// Feed one latency observation and adapt.
    ///
    /// Returns the new tier when it changed.
    pub fn observe(&mut self, latency_secs: f64) -> Option<QualityTier> {
        if !latency_secs.is_finite() {
            return None;
        }
        self.metrics.latency.push(latency_secs);

        let previous = self.metrics.tier;
        let tier = self.classify();
        self.metrics.tier = tier;
        self.adjust(tier);

        if tier != previous {
            log::info!(
                "adaptive: quality {:?} → {:?} (avg latency {:.3}s, dropouts {}, lead {:.3}s, prebuffer {})",
                previous,
                tier,
                self.metrics.average_latency(),
                self.metrics.dropouts,
                self.lead_secs,
                self.prebuffer
            );
            Some(tier)
        } else {
            None
        }
    }

    fn classify(&self) -> QualityTier {
        let avg = self.metrics.average_latency();
        let dropouts = self.metrics.dropouts;
        let c = &self.config;
        if avg < c.good_latency_secs && dropouts <= c.low_dropouts {
            QualityTier::Good
        } else if avg < c.degraded_latency_secs && dropouts <= c.moderate_dropouts {
            QualityTier::Degraded
        } else {
            QualityTier::Poor
        }
    }

    fn adjust(&mut self, tier: QualityTier) {
        let c = &self.config;
        match tier {
            QualityTier::Good => {
                self.lead_secs *= c.shrink_factor;
                self.good_streak += 1;
                if self.good_streak >= c.good_streak_to_shrink.max(1) {
                    self.prebuffer = self.prebuffer.saturating_sub(1);
                    self.good_streak = 0;
                }
            }
            QualityTier::Degraded => {
                self.lead_secs *= c.grow_factor;
                self.good_streak = 0;
            }
            QualityTier::Poor => {
                self.lead_secs *= c.poor_grow_factor;
                self.prebuffer = self.prebuffer.saturating_add(1);
                self.good_streak = 0;
            }
        }
        self.lead_secs = self.lead_secs.max(c.min_lead_secs).min(c.max_lead_secs);
        self.prebuffer = self.prebuffer.max(c.min_prebuffer).min(c.max_prebuffer);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(AdaptiveConfig::default())
    }

    #[test]
    fn starts_at_initial_values() {
        let c = controller();
        assert!((c.lead_secs() - 0.05).abs() < 1e-12);
        assert_eq!(c.prebuffer(), 5);
        assert_eq!(c.tier(), QualityTier::Good);
    }

    #[test]
    fn low_latency_is_good_and_shrinks_lead() {
        let mut c = controller();
        assert_eq!(c.observe(0.05), None);
        assert_eq!(c.tier(), QualityTier::Good);
        assert!((c.lead_secs() - 0.05 * 0.95).abs() < 1e-12);
    }

    #[test]
    fn moderate_latency_is_degraded() {
        let mut c = controller();
        assert_eq!(c.observe(0.15), Some(QualityTier::Degraded));
        assert!((c.lead_secs() - 0.05 * 1.1).abs() < 1e-12);
        assert_eq!(c.prebuffer(), 5);
    }

    #[test]
    fn high_latency_is_poor_and_grows_both() {
        let mut c = controller();
        assert_eq!(c.observe(0.25), Some(QualityTier::Poor));
        assert!((c.lead_secs() - 0.06).abs() < 1e-12);
        assert_eq!(c.prebuffer(), 6);
    }

    #[test]
    fn dropouts_degrade_quality() {
        let mut c = controller();
        c.record_dropout();
        c.record_dropout();
        c.observe(0.01);
        assert_eq!(c.tier(), QualityTier::Degraded);

        for _ in 0..3 {
            c.record_dropout();
        }
        c.observe(0.01);
        assert_eq!(c.tier(), QualityTier::Poor);
    }

    #[test]
    fn sustained_good_shrinks_prebuffer() {
        let mut c = controller();
        for _ in 0..10 {
            c.observe(0.01);
        }
        assert_eq!(c.prebuffer(), 4);
        for _ in 0..100 {
            c.observe(0.01);
        }
        assert_eq!(c.prebuffer(), 3);
        assert!((c.lead_secs() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn sustained_poor_reaches_upper_bounds() {
        let mut c = controller();
        for _ in 0..50 {
            c.observe(1.0);
        }
        assert!((c.lead_secs() - 0.3).abs() < 1e-12);
        assert_eq!(c.prebuffer(), 20);
    }

    #[test]
    fn reset_clears_metrics_but_keeps_tuning() {
        let mut c = controller();
        c.record_dropout();
        c.observe(0.25);
        let lead = c.lead_secs();
        c.reset_metrics();
        assert_eq!(c.metrics().dropouts(), 0);
        assert_eq!(c.metrics().samples(), 0);
        assert_eq!(c.tier(), QualityTier::Good);
        assert!((c.lead_secs() - lead).abs() < 1e-12);
        assert_eq!(c.prebuffer(), 6);
    }

    #[test]
    fn non_finite_latency_is_ignored() {
        let mut c = controller();
        assert_eq!(c.observe(f64::NAN), None);
        assert_eq!(c.observe(f64::INFINITY), None);
        assert_eq!(c.metrics().samples(), 0);
    }

    #[test]
    fn window_forgets_old_latency() {
        let mut c = controller();
        c.observe(5.0);
        assert_eq!(c.tier(), QualityTier::Poor);
        for _ in 0..10 {
            c.observe(0.0);
        }
        assert_eq!(c.tier(), QualityTier::Good);
    }

    proptest! {
        #[test]
        fn lead_and_prebuffer_stay_in_bounds(
            steps in prop::collection::vec((-10.0f64..10.0, 0u32..4), 1..200)
        ) {
            let cfg = AdaptiveConfig::default();
            let mut c = AdaptiveController::new(cfg.clone());
            for (latency, dropouts) in steps {
                for _ in 0..dropouts {
                    c.record_dropout();
                }
                c.observe(latency);
                prop_assert!(c.lead_secs() >= cfg.min_lead_secs);
                prop_assert!(c.lead_secs() <= cfg.max_lead_secs);
                prop_assert!(c.prebuffer() >= cfg.min_prebuffer);
                prop_assert!(c.prebuffer() <= cfg.max_prebuffer);
            }
        }
    }
}
