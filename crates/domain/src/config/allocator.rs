use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Quota allocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Budget caps, warning thresholds and the degradation ladder applied as
/// rolling utilization climbs. All percentages are in `0..=100`.
///
/// Per-workspace overrides in `per_workspace` take precedence over the
/// global caps for sessions attached to that workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Cap on the rolling 5-hour utilization.
    #[serde(default = "d_session_cap")]
    pub session_cap_percent_5h: f64,
    /// Cap on the rolling 7-day utilization.
    #[serde(default = "d_weekly_cap")]
    pub workspace_weekly_cap_percent: f64,
    /// Headroom kept below the weekly cap.
    #[serde(default = "d_reserve")]
    pub reserve_percent: f64,
    /// Ascending warning thresholds; crossing the n-th enables ladder rung n.
    #[serde(default = "d_warn_thresholds")]
    pub warn_thresholds: [f64; 3],
    #[serde(default)]
    pub default_enforcement: Enforcement,
    #[serde(default = "d_ladder")]
    pub degradation_ladder: Vec<DegradationStep>,
    #[serde(default)]
    pub per_workspace: HashMap<String, WorkspaceQuota>,
    /// 5-hour utilization at which queued messages stop draining.
    #[serde(default = "d_queue_pause")]
    pub queue_auto_pause_percent: f64,
    #[serde(default)]
    pub estimation_method: EstimationMethod,
    /// Bound on the utilization sample history.
    #[serde(default = "d_max_samples")]
    pub max_samples: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_cap_percent_5h: d_session_cap(),
            workspace_weekly_cap_percent: d_weekly_cap(),
            reserve_percent: d_reserve(),
            warn_thresholds: d_warn_thresholds(),
            default_enforcement: Enforcement::default(),
            degradation_ladder: d_ladder(),
            per_workspace: HashMap::new(),
            queue_auto_pause_percent: d_queue_pause(),
            estimation_method: EstimationMethod::default(),
            max_samples: d_max_samples(),
        }
    }
}

impl AllocatorConfig {
    /// Overwrite every field present in `patch` as a whole (no deep merge).
    pub fn apply(&mut self, patch: AllocatorConfigPatch) {
        if let Some(v) = patch.enabled {
            self.enabled = v;
        }
        if let Some(v) = patch.session_cap_percent_5h {
            self.session_cap_percent_5h = v;
        }
        if let Some(v) = patch.workspace_weekly_cap_percent {
            self.workspace_weekly_cap_percent = v;
        }
        if let Some(v) = patch.reserve_percent {
            self.reserve_percent = v;
        }
        if let Some(v) = patch.warn_thresholds {
            self.warn_thresholds = v;
        }
        if let Some(v) = patch.default_enforcement {
            self.default_enforcement = v;
        }
        if let Some(v) = patch.degradation_ladder {
            self.degradation_ladder = v;
        }
        if let Some(v) = patch.per_workspace {
            self.per_workspace = v;
        }
        if let Some(v) = patch.queue_auto_pause_percent {
            self.queue_auto_pause_percent = v;
        }
        if let Some(v) = patch.estimation_method {
            self.estimation_method = v;
        }
    }
}

/// What happens when a cap is crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Warn and degrade, but let the turn run.
    #[default]
    Soft,
    /// Refuse the turn.
    Hard,
}

/// One rung of the degradation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DegradationStep {
    RequireConfirmation,
    SwitchModel { model_id: String },
    RequirePlanMode,
    PauseQueue,
    SuggestSplit,
    BlockNewSessions,
}

impl DegradationStep {
    pub fn label(&self) -> String {
        match self {
            DegradationStep::RequireConfirmation => "require confirmation".into(),
            DegradationStep::SwitchModel { model_id } => format!("switch model to {model_id}"),
            DegradationStep::RequirePlanMode => "require plan mode".into(),
            DegradationStep::PauseQueue => "pause queue".into(),
            DegradationStep::SuggestSplit => "suggest split".into(),
            DegradationStep::BlockNewSessions => "block new sessions".into(),
        }
    }
}

/// Cap overrides for one workspace (repository id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceQuota {
    #[serde(default)]
    pub session_cap_percent_5h: Option<f64>,
    #[serde(default)]
    pub weekly_cap_percent: Option<f64>,
    #[serde(default)]
    pub enforcement: Option<Enforcement>,
}

/// How the per-message cost average is scaled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    #[default]
    Average,
    Conservative,
    Optimistic,
}

impl EstimationMethod {
    pub fn multiplier(self) -> f64 {
        match self {
            EstimationMethod::Average => 1.0,
            EstimationMethod::Conservative => 1.5,
            EstimationMethod::Optimistic => 0.7,
        }
    }
}

/// Partial update for [`AllocatorConfig`]; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorConfigPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub session_cap_percent_5h: Option<f64>,
    #[serde(default)]
    pub workspace_weekly_cap_percent: Option<f64>,
    #[serde(default)]
    pub reserve_percent: Option<f64>,
    #[serde(default)]
    pub warn_thresholds: Option<[f64; 3]>,
    #[serde(default)]
    pub default_enforcement: Option<Enforcement>,
    #[serde(default)]
    pub degradation_ladder: Option<Vec<DegradationStep>>,
    #[serde(default)]
    pub per_workspace: Option<HashMap<String, WorkspaceQuota>>,
    #[serde(default)]
    pub queue_auto_pause_percent: Option<f64>,
    #[serde(default)]
    pub estimation_method: Option<EstimationMethod>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_session_cap() -> f64 {
    80.0
}
fn d_weekly_cap() -> f64 {
    90.0
}
fn d_reserve() -> f64 {
    5.0
}
fn d_warn_thresholds() -> [f64; 3] {
    [50.0, 70.0, 90.0]
}
fn d_ladder() -> Vec<DegradationStep> {
    vec![
        DegradationStep::RequireConfirmation,
        DegradationStep::SwitchModel {
            model_id: "haiku".into(),
        },
        DegradationStep::RequirePlanMode,
        DegradationStep::PauseQueue,
        DegradationStep::BlockNewSessions,
    ]
}
fn d_queue_pause() -> f64 {
    85.0
}
fn d_max_samples() -> usize {
    300
}
