use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::TokenUsage;
use crate::util::now_utc_string;

pub const DEFAULT_ITEM_TOKEN_CAP: u64 = 8_000;
pub const DEFAULT_ALERT_THRESHOLD_PCT: f64 = 90.0;
pub const DEFAULT_COST_RATIO_TARGET: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BaselineReference {
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub run_id: String,
    pub cumulative_tokens: u64,
    pub cumulative_cost: f64,
    pub item_cap: u64,
    pub run_cap: f64,
    pub baseline_reference: Option<BaselineReference>,
    pub items_over_cap: Vec<String>,
    pub processed_items: usize,
    pub total_items: usize,
    pub tasks_per_item: u32,
    pub updated_at: String,
}

impl BudgetState {
    pub fn budget_used_pct(&self) -> f64 {
        if self.run_cap <= 0.0 {
            return 0.0;
        }
        self.cumulative_cost / self.run_cap * 100.0
    }

    pub fn projected_total_cost(&self) -> f64 {
        if self.processed_items == 0 {
            return 0.0;
        }
        self.cumulative_cost / self.processed_items as f64 * self.total_items as f64
    }

    pub fn avg_tokens_per_item(&self) -> f64 {
        if self.processed_items == 0 {
            return 0.0;
        }
        self.cumulative_tokens as f64 / self.processed_items as f64
    }

    /// Token cap for one work item: the per-pipeline cap times the number of
    /// pipeline instances run for it.
    pub fn effective_item_cap(&self) -> u64 {
        self.item_cap_for(self.tasks_per_item)
    }

    fn item_cap_for(&self, instances: u32) -> u64 {
        self.item_cap.saturating_mul(u64::from(instances.max(1)))
    }

    /// Usage equal to the cap is still within it.
    pub fn within_item_cap(&self, usage: &TokenUsage, instances: u32) -> bool {
        usage.total <= self.item_cap_for(instances)
    }

    pub fn token_ratio(&self) -> Option<f64> {
        self.baseline_reference
            .filter(|baseline| baseline.tokens > 0)
            .map(|baseline| self.cumulative_tokens as f64 / baseline.tokens as f64)
    }

    pub fn cost_ratio(&self) -> Option<f64> {
        self.baseline_reference
            .filter(|baseline| baseline.cost > 0.0)
            .map(|baseline| self.cumulative_cost / baseline.cost)
    }

    pub fn is_run_cap_exhausted(&self) -> bool {
        self.run_cap > 0.0 && self.cumulative_cost >= self.run_cap
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLimits {
    pub item_cap: u64,
    pub run_cap: f64,
    pub alert_threshold_pct: f64,
    pub cost_ratio_target: Option<f64>,
    pub baseline_reference: Option<BaselineReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Warning,
    Exceeded,
}

/// Tracks cumulative usage for one run. All mutation goes through the
/// internal mutex; callers receive snapshots.
pub struct BudgetGovernor {
    state: Mutex<BudgetState>,
    alert_threshold_pct: f64,
    cost_ratio_target: Option<f64>,
    last_alert: Mutex<Option<AlertLevel>>,
}

impl BudgetGovernor {
    pub fn new(run_id: &str, limits: &BudgetLimits, total_items: usize, tasks_per_item: u32) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                run_id: run_id.to_string(),
                cumulative_tokens: 0,
                cumulative_cost: 0.0,
                item_cap: limits.item_cap,
                run_cap: limits.run_cap,
                baseline_reference: limits.baseline_reference,
                items_over_cap: Vec::new(),
                processed_items: 0,
                total_items,
                tasks_per_item: tasks_per_item.max(1),
                updated_at: now_utc_string(),
            }),
            alert_threshold_pct: limits.alert_threshold_pct,
            cost_ratio_target: limits.cost_ratio_target,
            last_alert: Mutex::new(None),
        }
    }

    /// Seeds totals persisted by earlier sessions of the same run.
    pub fn resume_from(&self, usage: TokenUsage, cost: f64, processed_items: usize, items_over_cap: Vec<String>) {
        let mut state = self.state.lock();
        state.cumulative_tokens = usage.total;
        state.cumulative_cost = cost;
        state.processed_items = processed_items;
        state.items_over_cap = items_over_cap;
        state.updated_at = now_utc_string();
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.lock().clone()
    }

    pub fn instance_cap(&self) -> u64 {
        self.state.lock().item_cap
    }

    /// Whether `usage`, spent across `instances` pipeline runs, fits the
    /// per-item cap.
    pub fn check_item_cap(&self, usage: &TokenUsage, instances: u32) -> bool {
        self.state.lock().within_item_cap(usage, instances)
    }

    /// Adds one StageResult's usage and returns the new state.
    pub fn update_and_status(&self, usage: &TokenUsage, cost: f64) -> BudgetState {
        let mut state = self.state.lock();
        state.cumulative_tokens += usage.total;
        state.cumulative_cost += cost;
        state.updated_at = now_utc_string();
        state.clone()
    }

    /// Counts a finished item and records it when its aggregate usage is over
    /// the item cap. Over-cap items still complete.
    pub fn record_item(&self, item_id: &str, usage: &TokenUsage) -> BudgetState {
        let mut state = self.state.lock();
        state.processed_items += 1;
        if !state.within_item_cap(usage, state.tasks_per_item) {
            warn!(
                run_id = %state.run_id,
                item_id,
                tokens = usage.total,
                cap = state.effective_item_cap(),
                "item exceeded token cap"
            );
            if !state.items_over_cap.iter().any(|id| id == item_id) {
                state.items_over_cap.push(item_id.to_string());
            }
        }
        state.updated_at = now_utc_string();
        state.clone()
    }

    pub fn should_alert(&self, state: &BudgetState) -> bool {
        state.budget_used_pct() >= self.alert_threshold_pct
            || state.projected_total_cost() > state.run_cap
    }

    pub fn is_within_ratio_target(&self, state: &BudgetState) -> bool {
        match (self.cost_ratio_target, state.cost_ratio()) {
            (Some(target), Some(ratio)) => ratio <= target,
            _ => true,
        }
    }

    /// Returns an alert level the first time the run enters it; repeated
    /// calls at the same level return `None`.
    pub fn take_alert(&self, state: &BudgetState) -> Option<AlertLevel> {
        let level = if state.is_run_cap_exhausted() {
            AlertLevel::Exceeded
        } else if self.should_alert(state) {
            AlertLevel::Warning
        } else {
            return None;
        };

        let mut last = self.last_alert.lock();
        if last.is_some_and(|previous| previous >= level) {
            return None;
        }
        *last = Some(level);
        Some(level)
    }

    pub fn format_alert(&self, state: &BudgetState) -> String {
        let mut lines = vec![
            "BUDGET ALERT".to_string(),
            format!("run_id: {}", state.run_id),
            format!(
                "progress: {}/{} items (x{} pipeline instances each)",
                state.processed_items, state.total_items, state.tasks_per_item
            ),
            format!("tokens: {}", state.cumulative_tokens),
            format!(
                "cost: ${:.4} of ${:.2} ({:.1}%)",
                state.cumulative_cost,
                state.run_cap,
                state.budget_used_pct()
            ),
            format!("projected total cost: ${:.4}", state.projected_total_cost()),
            format!("avg tokens/item: {:.0}", state.avg_tokens_per_item()),
        ];

        if let (Some(token_ratio), Some(cost_ratio)) = (state.token_ratio(), state.cost_ratio()) {
            lines.push(format!("vs baseline: tokens {token_ratio:.2}x, cost {cost_ratio:.2}x"));
            if let Some(target) = self.cost_ratio_target {
                let verdict = if cost_ratio <= target { "within" } else { "over" };
                lines.push(format!("cost ratio target {target:.2}x: {verdict}"));
            }
        }

        if !state.items_over_cap.is_empty() {
            let preview = state
                .items_over_cap
                .iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let suffix = if state.items_over_cap.len() > 5 { ", ..." } else { "" };
            lines.push(format!(
                "items over {} token cap: {} ({preview}{suffix})",
                state.effective_item_cap(),
                state.items_over_cap.len()
            ));
        }

        lines.join("\n")
    }
}
