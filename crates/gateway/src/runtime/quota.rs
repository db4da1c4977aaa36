//! Quota allocator: burn-rate forecasting, budget checks and the
//! degradation ladder.
//!
//! [`QuotaAllocator`] keeps a bounded history of rolling utilization
//! samples (percent of the 5-hour and 7-day limits) and answers every
//! question from that history plus the current [`AllocatorConfig`]. All
//! queries are deterministic over the stored samples; nothing reads the
//! wall clock except [`QuotaAllocator::record_utilization_sample`].

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use sw_domain::config::{
    AllocatorConfig, AllocatorConfigPatch, DegradationStep, Enforcement, EstimationMethod,
};
use sw_domain::error::Result;
use sw_domain::trace::TraceEvent;

use crate::quota_source::{QuotaReading, QuotaSource};

/// Samples newer than this (relative to the latest) feed the burn rate.
const BURN_WINDOW_MINUTES: i64 = 30;
/// Hysteresis, in percentage points, for trend detection.
const TREND_HYSTERESIS: f64 = 0.5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rolling utilization at one instant, in percent (`0..=100`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub five_hour_pct: f64,
    pub seven_day_pct: f64,
}

impl UtilizationSample {
    pub fn from_reading(reading: QuotaReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            five_hour_pct: reading.five_hour * 100.0,
            seven_day_pct: reading.seven_day * 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnLabel {
    Unknown,
    OnTrack,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurnRate {
    pub label: BurnLabel,
    pub trend: Trend,
    /// Percentage points per hour.
    pub rate_per_hour_5h: f64,
    pub rate_per_hour_7d: f64,
    /// Minutes until the window hits 100% at the current rate.
    pub minutes_to_limit_5h: Option<f64>,
    pub minutes_to_limit_7d: Option<f64>,
    pub current_5h: Option<f64>,
    pub current_7d: Option<f64>,
    pub samples_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Expected utilization cost of one more message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub per_message_5h: f64,
    pub per_message_7d: f64,
    pub confidence: Confidence,
    /// Positive deltas the average was taken over.
    pub samples: usize,
    pub method: EstimationMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    None,
    Soft,
    Hard,
}

/// Admission decision for a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub enforcement: EnforcementLevel,
    pub reason: Option<String>,
    pub threshold_hit: Option<f64>,
    pub active_degradations: Vec<DegradationStep>,
}

impl BudgetCheck {
    fn clear(active_degradations: Vec<DegradationStep>) -> Self {
        Self {
            allowed: true,
            enforcement: EnforcementLevel::None,
            reason: None,
            threshold_hit: None,
            active_degradations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueCostEstimate {
    pub message_count: usize,
    pub per_message_5h: f64,
    pub total_5h: f64,
    pub total_7d: f64,
    pub projected_5h: f64,
    pub projected_7d: f64,
    /// 1-based index of the first queued message that reaches the
    /// session cap.
    pub would_exceed_at: Option<usize>,
}

/// Everything the CLI status report shows.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorSnapshot {
    pub enabled: bool,
    pub latest: Option<UtilizationSample>,
    pub sample_count: usize,
    pub burn_rate: BurnRate,
    pub cost: CostEstimate,
    pub budget: BudgetCheck,
    pub queue_paused: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// QuotaAllocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct QuotaAllocator {
    config: RwLock<AllocatorConfig>,
    samples: RwLock<VecDeque<UtilizationSample>>,
    /// Steps computed by the last budget evaluation.
    active: RwLock<Vec<DegradationStep>>,
}

impl QuotaAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config: RwLock::new(config),
            samples: RwLock::new(VecDeque::new()),
            active: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> AllocatorConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: AllocatorConfig) {
        *self.config.write() = config;
        self.reevaluate();
    }

    /// Merge `patch` into the live config and return the result.
    pub fn update_config(&self, patch: AllocatorConfigPatch) -> AllocatorConfig {
        let updated = {
            let mut cfg = self.config.write();
            cfg.apply(patch);
            cfg.clone()
        };
        self.reevaluate();
        updated
    }

    // ── Samples ──────────────────────────────────────────────────────

    /// Query `source` and record the reading. `Ok(None)` when the source
    /// had nothing to report.
    pub async fn record_utilization_sample(
        &self,
        source: &dyn QuotaSource,
    ) -> Result<Option<UtilizationSample>> {
        let reading = match source.query_quota().await? {
            Some(r) => r,
            None => {
                tracing::debug!("quota source returned no reading");
                return Ok(None);
            }
        };
        let sample = UtilizationSample::from_reading(reading, Utc::now());
        self.record_sample(sample);
        Ok(Some(sample))
    }

    /// Append a sample, trimming the oldest beyond `max_samples`.
    pub fn record_sample(&self, sample: UtilizationSample) {
        let max = self.config.read().max_samples.max(2);
        let count = {
            let mut samples = self.samples.write();
            samples.push_back(sample);
            while samples.len() > max {
                samples.pop_front();
            }
            samples.len()
        };
        TraceEvent::UtilizationSampled {
            five_hour_pct: sample.five_hour_pct,
            seven_day_pct: sample.seven_day_pct,
            samples: count,
        }
        .emit();
        self.get_active_degradation_steps(sample.five_hour_pct);
    }

    pub fn latest_sample(&self) -> Option<UtilizationSample> {
        self.samples.read().back().copied()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    pub fn clear_history(&self) {
        self.samples.write().clear();
        self.active.write().clear();
    }

    // ── Forecasting ──────────────────────────────────────────────────

    pub fn get_burn_rate(&self) -> BurnRate {
        let samples: Vec<UtilizationSample> = self.samples.read().iter().copied().collect();
        burn_rate(&samples)
    }

    pub fn estimate_message_cost(&self) -> CostEstimate {
        let method = self.config.read().estimation_method;
        let samples: Vec<UtilizationSample> = self.samples.read().iter().copied().collect();
        cost_estimate(&samples, method)
    }

    pub fn estimate_queue_cost(&self, message_count: usize) -> QueueCostEstimate {
        let cost = self.estimate_message_cost();
        let cap = self.config.read().session_cap_percent_5h;
        let (current_5h, current_7d) = self
            .latest_sample()
            .map(|s| (s.five_hour_pct, s.seven_day_pct))
            .unwrap_or((0.0, 0.0));

        let total_5h = cost.per_message_5h * message_count as f64;
        let total_7d = cost.per_message_7d * message_count as f64;
        let would_exceed_at =
            (1..=message_count).find(|i| current_5h + cost.per_message_5h * *i as f64 >= cap);

        QueueCostEstimate {
            message_count,
            per_message_5h: cost.per_message_5h,
            total_5h,
            total_7d,
            projected_5h: current_5h + total_5h,
            projected_7d: current_7d + total_7d,
            would_exceed_at,
        }
    }

    // ── Enforcement ──────────────────────────────────────────────────

    /// Admission check against the global caps, using `reading` or the
    /// latest recorded sample.
    pub fn check_budget_limits(&self, reading: Option<QuotaReading>) -> BudgetCheck {
        self.check_budget_limits_for(None, reading)
    }

    /// Admission check with `workspace` overrides applied.
    pub fn check_budget_limits_for(
        &self,
        workspace: Option<&str>,
        reading: Option<QuotaReading>,
    ) -> BudgetCheck {
        let config = self.config.read().clone();
        if !config.enabled {
            return BudgetCheck::clear(Vec::new());
        }

        let (five_hour, seven_day) = match reading {
            Some(r) => (r.five_hour * 100.0, r.seven_day * 100.0),
            None => match self.latest_sample() {
                Some(s) => (s.five_hour_pct, s.seven_day_pct),
                None => return BudgetCheck::clear(Vec::new()),
            },
        };

        let limits = resolve_limits(&config, workspace);
        let degradations = self.get_active_degradation_steps(five_hour);

        if five_hour > limits.session_cap && limits.enforcement == Enforcement::Hard {
            return BudgetCheck {
                allowed: false,
                enforcement: EnforcementLevel::Hard,
                reason: Some(format!(
                    "5-hour utilization {five_hour:.1}% exceeds the session cap of {:.1}%",
                    limits.session_cap
                )),
                threshold_hit: Some(limits.session_cap),
                active_degradations: degradations,
            };
        }

        let weekly_ceiling = limits.weekly_cap - config.reserve_percent;
        if seven_day > weekly_ceiling {
            return BudgetCheck {
                allowed: false,
                enforcement: EnforcementLevel::Hard,
                reason: Some(format!(
                    "7-day utilization {seven_day:.1}% exceeds the weekly cap of {:.1}% \
                     less the {:.1}% reserve",
                    limits.weekly_cap, config.reserve_percent
                )),
                threshold_hit: Some(weekly_ceiling),
                active_degradations: degradations,
            };
        }

        if let Some(threshold) = config
            .warn_thresholds
            .iter()
            .rev()
            .copied()
            .find(|t| five_hour >= *t)
        {
            return BudgetCheck {
                allowed: true,
                enforcement: EnforcementLevel::Soft,
                reason: Some(format!(
                    "5-hour utilization {five_hour:.1}% crossed the {threshold:.0}% warning threshold"
                )),
                threshold_hit: Some(threshold),
                active_degradations: degradations,
            };
        }

        BudgetCheck::clear(degradations)
    }

    /// Ladder rungs enabled at `five_hour_pct`. The result is cached and
    /// returned by [`active_degradations`](Self::active_degradations).
    pub fn get_active_degradation_steps(&self, five_hour_pct: f64) -> Vec<DegradationStep> {
        let steps = {
            let config = self.config.read();
            if config.enabled {
                ladder_steps(&config.warn_thresholds, &config.degradation_ladder, five_hour_pct)
            } else {
                Vec::new()
            }
        };
        *self.active.write() = steps.clone();
        steps
    }

    pub fn active_degradations(&self) -> Vec<DegradationStep> {
        self.active.read().clone()
    }

    pub fn is_step_active(&self, step: &DegradationStep) -> bool {
        self.active.read().contains(step)
    }

    pub fn should_pause_queue(&self, five_hour_pct: f64) -> bool {
        let config = self.config.read();
        config.enabled && five_hour_pct >= config.queue_auto_pause_percent
    }

    pub fn snapshot(&self) -> AllocatorSnapshot {
        let latest = self.latest_sample();
        AllocatorSnapshot {
            enabled: self.config.read().enabled,
            latest,
            sample_count: self.sample_count(),
            burn_rate: self.get_burn_rate(),
            cost: self.estimate_message_cost(),
            budget: self.check_budget_limits(None),
            queue_paused: latest.is_some_and(|s| self.should_pause_queue(s.five_hour_pct)),
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    fn reevaluate(&self) {
        match self.latest_sample() {
            Some(s) => {
                self.get_active_degradation_steps(s.five_hour_pct);
            }
            None => self.active.write().clear(),
        }
    }
}

struct Limits {
    session_cap: f64,
    weekly_cap: f64,
    enforcement: Enforcement,
}

fn resolve_limits(config: &AllocatorConfig, workspace: Option<&str>) -> Limits {
    let ws = workspace.and_then(|w| config.per_workspace.get(w));
    Limits {
        session_cap: ws
            .and_then(|w| w.session_cap_percent_5h)
            .unwrap_or(config.session_cap_percent_5h),
        weekly_cap: ws
            .and_then(|w| w.weekly_cap_percent)
            .unwrap_or(config.workspace_weekly_cap_percent),
        enforcement: ws
            .and_then(|w| w.enforcement)
            .unwrap_or(config.default_enforcement),
    }
}

/// Threshold n enables ladder rung n; the highest threshold enables every
/// remaining rung.
fn ladder_steps(
    thresholds: &[f64; 3],
    ladder: &[DegradationStep],
    five_hour_pct: f64,
) -> Vec<DegradationStep> {
    let mut steps = Vec::new();
    if five_hour_pct >= thresholds[0] {
        steps.extend(ladder.first().cloned());
    }
    if five_hour_pct >= thresholds[1] {
        steps.extend(ladder.get(1).cloned());
    }
    if five_hour_pct >= thresholds[2] {
        steps.extend(ladder.iter().skip(2).cloned());
    }
    steps
}

fn burn_rate(samples: &[UtilizationSample]) -> BurnRate {
    let latest = samples.last();
    if samples.len() < 2 {
        return BurnRate {
            label: BurnLabel::Unknown,
            trend: Trend::Stable,
            rate_per_hour_5h: 0.0,
            rate_per_hour_7d: 0.0,
            minutes_to_limit_5h: None,
            minutes_to_limit_7d: None,
            current_5h: latest.map(|s| s.five_hour_pct),
            current_7d: latest.map(|s| s.seven_day_pct),
            samples_used: samples.len(),
        };
    }

    let newest = samples[samples.len() - 1];
    let cutoff = newest.timestamp - Duration::minutes(BURN_WINDOW_MINUTES);
    let recent: Vec<&UtilizationSample> =
        samples.iter().filter(|s| s.timestamp >= cutoff).collect();
    let window: Vec<&UtilizationSample> = if recent.len() >= 2 {
        recent
    } else {
        samples[samples.len() - 2..].iter().collect()
    };

    let first = window[0];
    let last = window[window.len() - 1];
    let hours = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 3_600_000.0;
    let rate = |from: f64, to: f64| if hours > 0.0 { (to - from) / hours } else { 0.0 };
    let rate_5h = rate(first.five_hour_pct, last.five_hour_pct);
    let rate_7d = rate(first.seven_day_pct, last.seven_day_pct);

    let to_limit = |current: f64, rate: f64| {
        (rate > 0.0).then(|| (100.0 - current).max(0.0) / rate * 60.0)
    };
    let minutes_5h = to_limit(last.five_hour_pct, rate_5h);
    let minutes_7d = to_limit(last.seven_day_pct, rate_7d);

    let soonest = [minutes_5h, minutes_7d]
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<f64>, m| Some(acc.map_or(m, |a| a.min(m))));
    let label = match soonest {
        Some(m) if m < 60.0 => BurnLabel::Critical,
        Some(m) if m < 120.0 => BurnLabel::Elevated,
        _ => BurnLabel::OnTrack,
    };

    BurnRate {
        label,
        trend: trend(samples),
        rate_per_hour_5h: rate_5h,
        rate_per_hour_7d: rate_7d,
        minutes_to_limit_5h: minutes_5h,
        minutes_to_limit_7d: minutes_7d,
        current_5h: Some(last.five_hour_pct),
        current_7d: Some(last.seven_day_pct),
        samples_used: window.len(),
    }
}

/// Compare the latest 5-hour delta with the one before it.
fn trend(samples: &[UtilizationSample]) -> Trend {
    let n = samples.len();
    if n < 3 {
        return Trend::Stable;
    }
    let recent = samples[n - 1].five_hour_pct - samples[n - 2].five_hour_pct;
    let prior = samples[n - 2].five_hour_pct - samples[n - 3].five_hour_pct;
    if recent > prior + TREND_HYSTERESIS {
        Trend::Increasing
    } else if recent < prior - TREND_HYSTERESIS {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn positive_deltas(
    samples: &[UtilizationSample],
    pct: impl Fn(&UtilizationSample) -> f64,
) -> Vec<f64> {
    samples
        .windows(2)
        .map(|w| pct(&w[1]) - pct(&w[0]))
        .filter(|d| *d > 0.0)
        .collect()
}

fn cost_estimate(samples: &[UtilizationSample], method: EstimationMethod) -> CostEstimate {
    let deltas_5h = positive_deltas(samples, |s| s.five_hour_pct);
    let deltas_7d = positive_deltas(samples, |s| s.seven_day_pct);

    let mean = |d: &[f64]| {
        if d.is_empty() {
            0.0
        } else {
            d.iter().sum::<f64>() / d.len() as f64
        }
    };
    let confidence = match samples.len() {
        n if n >= 5 => Confidence::High,
        n if n >= 3 => Confidence::Medium,
        _ => Confidence::Low,
    };

    CostEstimate {
        per_message_5h: mean(&deltas_5h) * method.multiplier(),
        per_message_7d: mean(&deltas_7d) * method.multiplier(),
        confidence,
        samples: deltas_5h.len(),
        method,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sw_domain::config::WorkspaceQuota;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn sample(minutes: i64, five: f64, seven: f64) -> UtilizationSample {
        UtilizationSample {
            timestamp: at(minutes),
            five_hour_pct: five,
            seven_day_pct: seven,
        }
    }

    fn reading(five_pct: f64, seven_pct: f64) -> Option<QuotaReading> {
        Some(QuotaReading {
            five_hour: five_pct / 100.0,
            seven_day: seven_pct / 100.0,
        })
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn hard_cap_blocks() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            session_cap_percent_5h: 80.0,
            default_enforcement: Enforcement::Hard,
            ..Default::default()
        });
        let check = alloc.check_budget_limits(reading(85.0, 10.0));
        assert!(!check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::Hard);
        assert!(check.reason.is_some());
    }

    #[test]
    fn exactly_at_session_cap_is_allowed() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            session_cap_percent_5h: 50.0,
            default_enforcement: Enforcement::Hard,
            warn_thresholds: [60.0, 70.0, 90.0],
            ..Default::default()
        });
        let check = alloc.check_budget_limits(reading(50.0, 10.0));
        assert!(check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::None);

        let check = alloc.check_budget_limits(reading(50.5, 10.0));
        assert!(!check.allowed);
        assert_eq!(check.threshold_hit, Some(50.0));
    }

    #[test]
    fn soft_threshold_warns() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            warn_thresholds: [50.0, 70.0, 90.0],
            default_enforcement: Enforcement::Soft,
            ..Default::default()
        });
        let check = alloc.check_budget_limits(reading(75.0, 10.0));
        assert!(check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::Soft);
        assert_eq!(check.threshold_hit, Some(70.0));
    }

    #[test]
    fn soft_breach_of_session_cap_still_allowed() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        let check = alloc.check_budget_limits(reading(95.0, 10.0));
        assert!(check.allowed);
        assert_eq!(check.threshold_hit, Some(90.0));
    }

    #[test]
    fn weekly_reserve_blocks_regardless_of_enforcement() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            workspace_weekly_cap_percent: 90.0,
            reserve_percent: 5.0,
            default_enforcement: Enforcement::Soft,
            ..Default::default()
        });
        assert!(alloc.check_budget_limits(reading(10.0, 84.0)).allowed);
        let check = alloc.check_budget_limits(reading(10.0, 86.0));
        assert!(!check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::Hard);
    }

    #[test]
    fn below_thresholds_is_clear() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        let check = alloc.check_budget_limits(reading(20.0, 10.0));
        assert!(check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::None);
        assert!(check.active_degradations.is_empty());
    }

    #[test]
    fn disabled_allocator_allows_everything() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            enabled: false,
            default_enforcement: Enforcement::Hard,
            ..Default::default()
        });
        let check = alloc.check_budget_limits(reading(100.0, 100.0));
        assert!(check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::None);
        assert!(alloc.get_active_degradation_steps(100.0).is_empty());
        assert!(!alloc.should_pause_queue(100.0));
    }

    #[test]
    fn no_data_is_clear() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            default_enforcement: Enforcement::Hard,
            ..Default::default()
        });
        let check = alloc.check_budget_limits(None);
        assert!(check.allowed);
        assert_eq!(check.enforcement, EnforcementLevel::None);
    }

    #[test]
    fn latest_sample_used_when_no_reading() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            default_enforcement: Enforcement::Hard,
            ..Default::default()
        });
        alloc.record_sample(sample(0, 81.0, 5.0));
        assert!(!alloc.check_budget_limits(None).allowed);
    }

    #[test]
    fn workspace_override_takes_precedence() {
        let mut config = AllocatorConfig::default();
        config.per_workspace.insert(
            "api".into(),
            WorkspaceQuota {
                session_cap_percent_5h: Some(40.0),
                weekly_cap_percent: None,
                enforcement: Some(Enforcement::Hard),
            },
        );
        let alloc = QuotaAllocator::new(config);
        assert!(!alloc.check_budget_limits_for(Some("api"), reading(45.0, 5.0)).allowed);
        assert!(alloc.check_budget_limits_for(Some("web"), reading(45.0, 5.0)).allowed);
        assert!(alloc.check_budget_limits_for(None, reading(45.0, 5.0)).allowed);
    }

    #[test]
    fn ladder_rungs_follow_thresholds() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        let ladder = AllocatorConfig::default().degradation_ladder;

        assert!(alloc.get_active_degradation_steps(49.9).is_empty());
        assert_eq!(alloc.get_active_degradation_steps(50.0), ladder[..1].to_vec());
        assert_eq!(alloc.get_active_degradation_steps(70.0), ladder[..2].to_vec());
        assert_eq!(alloc.get_active_degradation_steps(90.0), ladder);
        // Cached for readers.
        assert_eq!(alloc.active_degradations(), ladder);
        assert!(alloc.is_step_active(&DegradationStep::BlockNewSessions));
    }

    #[test]
    fn short_ladder_does_not_panic() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            degradation_ladder: vec![DegradationStep::RequireConfirmation],
            ..Default::default()
        });
        assert_eq!(
            alloc.get_active_degradation_steps(95.0),
            vec![DegradationStep::RequireConfirmation]
        );
    }

    #[test]
    fn burn_rate_unknown_below_two_samples() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        assert_eq!(alloc.get_burn_rate().label, BurnLabel::Unknown);
        alloc.record_sample(sample(0, 10.0, 5.0));
        let burn = alloc.get_burn_rate();
        assert_eq!(burn.label, BurnLabel::Unknown);
        assert_eq!(burn.current_5h, Some(10.0));
    }

    #[test]
    fn burn_rate_projection() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        alloc.record_sample(sample(0, 10.0, 5.0));
        alloc.record_sample(sample(10, 20.0, 5.0));

        let burn = alloc.get_burn_rate();
        assert!(approx(burn.rate_per_hour_5h, 60.0));
        assert!(approx(burn.minutes_to_limit_5h.unwrap(), 80.0));
        assert!(burn.minutes_to_limit_7d.is_none());
        assert_eq!(burn.label, BurnLabel::Elevated);
        assert_eq!(burn.trend, Trend::Stable);
    }

    #[test]
    fn burn_rate_critical_and_on_track() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        alloc.record_sample(sample(0, 50.0, 5.0));
        alloc.record_sample(sample(10, 70.0, 5.0));
        // 120 pp/h, 30 pp left → 15 minutes.
        assert_eq!(alloc.get_burn_rate().label, BurnLabel::Critical);

        let slow = QuotaAllocator::new(AllocatorConfig::default());
        slow.record_sample(sample(0, 10.0, 5.0));
        slow.record_sample(sample(30, 11.0, 5.0));
        assert_eq!(slow.get_burn_rate().label, BurnLabel::OnTrack);
    }

    #[test]
    fn burn_rate_uses_recent_window() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        // Old steep climb, then flat for the last half hour.
        alloc.record_sample(sample(0, 0.0, 1.0));
        alloc.record_sample(sample(5, 40.0, 1.0));
        alloc.record_sample(sample(60, 40.0, 1.0));
        alloc.record_sample(sample(80, 40.0, 1.0));
        let burn = alloc.get_burn_rate();
        assert_eq!(burn.samples_used, 2);
        assert!(approx(burn.rate_per_hour_5h, 0.0));
        assert_eq!(burn.label, BurnLabel::OnTrack);
    }

    #[test]
    fn burn_rate_zero_elapsed_time() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        alloc.record_sample(sample(0, 10.0, 5.0));
        alloc.record_sample(sample(0, 30.0, 5.0));
        let burn = alloc.get_burn_rate();
        assert!(approx(burn.rate_per_hour_5h, 0.0));
        assert_eq!(burn.label, BurnLabel::OnTrack);
    }

    #[test]
    fn trend_detects_acceleration() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        alloc.record_sample(sample(0, 10.0, 1.0));
        alloc.record_sample(sample(5, 11.0, 1.0));
        alloc.record_sample(sample(10, 15.0, 1.0));
        assert_eq!(alloc.get_burn_rate().trend, Trend::Increasing);
        alloc.record_sample(sample(15, 15.2, 1.0));
        assert_eq!(alloc.get_burn_rate().trend, Trend::Decreasing);
        alloc.record_sample(sample(20, 15.5, 1.0));
        assert_eq!(alloc.get_burn_rate().trend, Trend::Stable);
    }

    #[test]
    fn cost_estimate_averages_positive_deltas() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        for (i, five) in [10.0, 12.0, 12.0, 16.0, 3.0].iter().enumerate() {
            alloc.record_sample(sample(i as i64, *five, 1.0));
        }
        let cost = alloc.estimate_message_cost();
        // Positive deltas: 2 and 4. The window reset (16 → 3) is ignored.
        assert!(approx(cost.per_message_5h, 3.0));
        assert_eq!(cost.samples, 2);
        assert_eq!(cost.confidence, Confidence::High);
        assert!(approx(cost.per_message_7d, 0.0));
    }

    #[test]
    fn confidence_follows_sample_count() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        let mut levels = Vec::new();
        for i in 0..5 {
            alloc.record_sample(sample(i, 10.0 + i as f64, 1.0));
            levels.push(alloc.estimate_message_cost().confidence);
        }
        assert_eq!(
            levels,
            [
                Confidence::Low,
                Confidence::Low,
                Confidence::Medium,
                Confidence::Medium,
                Confidence::High,
            ]
        );
    }

    #[test]
    fn cost_estimate_method_and_confidence() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            estimation_method: EstimationMethod::Conservative,
            ..Default::default()
        });
        for i in 0..6 {
            alloc.record_sample(sample(i, 10.0 + 2.0 * i as f64, 1.0));
        }
        let cost = alloc.estimate_message_cost();
        assert!(approx(cost.per_message_5h, 3.0));
        assert_eq!(cost.confidence, Confidence::High);
    }

    #[test]
    fn queue_cost_finds_first_breach() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            session_cap_percent_5h: 80.0,
            ..Default::default()
        });
        alloc.record_sample(sample(0, 60.0, 10.0));
        alloc.record_sample(sample(1, 65.0, 11.0));
        // 5 pp per message from 65%: 70, 75, 80 → third message hits the cap.
        let est = alloc.estimate_queue_cost(4);
        assert_eq!(est.would_exceed_at, Some(3));
        assert!(approx(est.total_5h, 20.0));
        assert!(approx(est.projected_5h, 85.0));
        assert!(approx(est.projected_7d, 15.0));

        assert_eq!(alloc.estimate_queue_cost(2).would_exceed_at, None);
        assert_eq!(alloc.estimate_queue_cost(0).would_exceed_at, None);
    }

    #[test]
    fn pause_threshold() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            queue_auto_pause_percent: 85.0,
            ..Default::default()
        });
        assert!(!alloc.should_pause_queue(84.9));
        assert!(alloc.should_pause_queue(85.0));
    }

    #[test]
    fn history_is_bounded() {
        let alloc = QuotaAllocator::new(AllocatorConfig {
            max_samples: 3,
            ..Default::default()
        });
        for i in 0..10 {
            alloc.record_sample(sample(i, i as f64, 0.0));
        }
        assert_eq!(alloc.sample_count(), 3);
        assert_eq!(alloc.latest_sample().unwrap().five_hour_pct, 9.0);
        alloc.clear_history();
        assert_eq!(alloc.sample_count(), 0);
        assert!(alloc.active_degradations().is_empty());
    }

    #[test]
    fn update_config_reevaluates_ladder() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        alloc.record_sample(sample(0, 60.0, 1.0));
        assert_eq!(alloc.active_degradations().len(), 1);

        let updated = alloc.update_config(AllocatorConfigPatch {
            enabled: Some(false),
            ..Default::default()
        });
        assert!(!updated.enabled);
        assert!(alloc.active_degradations().is_empty());
    }

    struct FixedSource(Option<QuotaReading>);

    #[async_trait::async_trait]
    impl QuotaSource for FixedSource {
        async fn query_quota(&self) -> Result<Option<QuotaReading>> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn record_from_source_converts_to_percent() {
        let alloc = QuotaAllocator::new(AllocatorConfig::default());
        let sample = alloc
            .record_utilization_sample(&FixedSource(reading(42.0, 7.0)))
            .await
            .unwrap()
            .unwrap();
        assert!(approx(sample.five_hour_pct, 42.0));
        assert!(approx(sample.seven_day_pct, 7.0));

        let none = alloc
            .record_utilization_sample(&FixedSource(None))
            .await
            .unwrap();
        assert!(none.is_none());
        assert_eq!(alloc.sample_count(), 1);
    }
}
