use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::PipelineError;
use crate::util::now_utc_string;

/// Below this many discordant pairs the exact binomial test is used.
pub const EXACT_TEST_MAX_DISCORDANT: usize = 25;
pub const LOW_POWER_COMMON_ITEMS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemScore {
    pub is_correct: bool,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantResults {
    pub label: String,
    pub items: BTreeMap<String, ItemScore>,
}

impl VariantResults {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            items: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, item_id: &str, score: ItemScore) {
        self.items.insert(item_id.to_string(), score);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContingencyTable {
    pub both_correct: usize,
    pub a_correct_b_wrong: usize,
    pub a_wrong_b_correct: usize,
    pub both_wrong: usize,
}

impl ContingencyTable {
    pub fn discordant(&self) -> usize {
        self.a_correct_b_wrong + self.a_wrong_b_correct
    }

    /// Rows are variant A correct/wrong, columns variant B correct/wrong.
    pub fn as_matrix(&self) -> [[usize; 2]; 2] {
        [
            [self.both_correct, self.a_correct_b_wrong],
            [self.a_wrong_b_correct, self.both_wrong],
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McNemarMethod {
    NoDiscordantPairs,
    ExactBinomial,
    ChiSquareContinuityCorrected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub variant_a: String,
    pub variant_b: String,
    pub common_item_ids: Vec<String>,
    pub only_in_a: usize,
    pub only_in_b: usize,
    pub contingency_table: [[usize; 2]; 2],
    pub table: ContingencyTable,
    pub accuracy_a: f64,
    pub accuracy_b: f64,
    pub delta_accuracy_pct: f64,
    pub p_value: f64,
    pub method: McNemarMethod,
    pub statistic: Option<f64>,
    pub low_statistical_power: bool,
    pub avg_tokens_a: f64,
    pub avg_tokens_b: f64,
    pub token_ratio: Option<f64>,
    pub cost_ratio: Option<f64>,
    pub generated_at: String,
}

/// Paired comparison of `b` against `a` over the items both variants scored.
pub fn compare(a: &VariantResults, b: &VariantResults) -> Result<ComparisonResult, PipelineError> {
    let ids_a: BTreeSet<&String> = a.items.keys().collect();
    let ids_b: BTreeSet<&String> = b.items.keys().collect();
    let common: Vec<String> = ids_a.intersection(&ids_b).map(|id| (*id).clone()).collect();

    if common.is_empty() {
        return Err(PipelineError::DataMismatch(format!(
            "no common item ids between {} ({} items) and {} ({} items)",
            a.label,
            a.items.len(),
            b.label,
            b.items.len()
        )));
    }

    let mut table = ContingencyTable::default();
    let (mut tokens_a, mut tokens_b) = (0_u64, 0_u64);
    let (mut cost_a, mut cost_b) = (0.0_f64, 0.0_f64);

    for id in &common {
        let (Some(score_a), Some(score_b)) = (a.items.get(id), b.items.get(id)) else {
            continue;
        };
        match (score_a.is_correct, score_b.is_correct) {
            (true, true) => table.both_correct += 1,
            (true, false) => table.a_correct_b_wrong += 1,
            (false, true) => table.a_wrong_b_correct += 1,
            (false, false) => table.both_wrong += 1,
        }
        tokens_a += score_a.tokens;
        tokens_b += score_b.tokens;
        cost_a += score_a.cost;
        cost_b += score_b.cost;
    }

    let n = common.len() as f64;
    let accuracy_a = (table.both_correct + table.a_correct_b_wrong) as f64 / n;
    let accuracy_b = (table.both_correct + table.a_wrong_b_correct) as f64 / n;
    let (p_value, method, statistic) = mcnemar(table.a_correct_b_wrong, table.a_wrong_b_correct);

    Ok(ComparisonResult {
        variant_a: a.label.clone(),
        variant_b: b.label.clone(),
        only_in_a: ids_a.len() - common.len(),
        only_in_b: ids_b.len() - common.len(),
        low_statistical_power: common.len() < LOW_POWER_COMMON_ITEMS,
        contingency_table: table.as_matrix(),
        table,
        accuracy_a,
        accuracy_b,
        delta_accuracy_pct: (accuracy_b - accuracy_a) * 100.0,
        p_value,
        method,
        statistic,
        avg_tokens_a: tokens_a as f64 / n,
        avg_tokens_b: tokens_b as f64 / n,
        token_ratio: ratio(tokens_b as f64, tokens_a as f64),
        cost_ratio: ratio(cost_b, cost_a),
        common_item_ids: common,
        generated_at: now_utc_string(),
    })
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0).then(|| numerator / denominator)
}

/// McNemar's test on the discordant cells `b` (A right, B wrong) and `c`
/// (A wrong, B right).
pub fn mcnemar(b: usize, c: usize) -> (f64, McNemarMethod, Option<f64>) {
    let n = b + c;
    if n == 0 {
        return (1.0, McNemarMethod::NoDiscordantPairs, None);
    }

    if n < EXACT_TEST_MAX_DISCORDANT {
        let k = b.min(c);
        let mut tail = 0.0_f64;
        for i in 0..=k {
            tail += binomial_pmf_half(n, i);
        }
        return ((2.0 * tail).min(1.0), McNemarMethod::ExactBinomial, None);
    }

    let diff = (b as f64 - c as f64).abs() - 1.0;
    let statistic = diff.max(0.0).powi(2) / n as f64;
    (
        chi_square_1df_survival(statistic),
        McNemarMethod::ChiSquareContinuityCorrected,
        Some(statistic),
    )
}

fn binomial_pmf_half(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }

    let mut coefficient = 1.0_f64;
    let top_k = k.min(n - k);
    for i in 0..top_k {
        coefficient *= (n - i) as f64 / (i + 1) as f64;
    }
    coefficient * 0.5_f64.powi(n as i32)
}

fn chi_square_1df_survival(statistic: f64) -> f64 {
    if statistic <= 0.0 {
        return 1.0;
    }
    erfc((statistic / 2.0).sqrt()).clamp(0.0, 1.0)
}

// Chebyshev fit with fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let value = t * poly.exp();
    if x >= 0.0 { value } else { 2.0 - value }
}
