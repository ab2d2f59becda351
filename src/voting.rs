use std::collections::BTreeMap;

use crate::model::{InstanceVote, VoteBundle, VoteDecision};

pub const DEFAULT_VOTE_TEMPERATURE: f64 = 0.70;

/// Folds the final answers of N perturbed pipeline instances into one
/// consensus.
///
/// A strict majority wins outright. A unique plurality wins next. When the
/// top answers tie, the answer from the instance sampled closest to the
/// default temperature is taken, with the lower seed breaking an exact tie.
/// If no instance produced an answer there is no consensus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MajorityVoteAggregator {
    default_temperature: f64,
}

impl Default for MajorityVoteAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_TEMPERATURE)
    }
}

impl MajorityVoteAggregator {
    pub fn new(default_temperature: f64) -> Self {
        Self {
            default_temperature,
        }
    }

    pub fn reconcile(&self, item_id: &str, instance_results: Vec<InstanceVote>) -> VoteBundle {
        let mut vote_counts = BTreeMap::<String, usize>::new();
        for vote in &instance_results {
            if let Some(answer) = &vote.final_answer {
                *vote_counts.entry(answer.clone()).or_insert(0) += 1;
            }
        }

        let (consensus_answer, decision) = self.decide(&instance_results, &vote_counts);

        VoteBundle {
            item_id: item_id.to_string(),
            instance_results,
            consensus_answer,
            vote_counts,
            decision,
        }
    }

    fn decide(
        &self,
        votes: &[InstanceVote],
        counts: &BTreeMap<String, usize>,
    ) -> (Option<String>, VoteDecision) {
        let Some(top) = counts.values().copied().max() else {
            return (None, VoteDecision::NoValidAnswers);
        };
        let leaders: Vec<&String> = counts
            .iter()
            .filter(|(_, count)| **count == top)
            .map(|(answer, _)| answer)
            .collect();

        if let [winner] = leaders.as_slice() {
            let decision = if votes.len() == 1 {
                VoteDecision::Single
            } else if top == votes.len() {
                VoteDecision::Unanimous
            } else if top * 2 > votes.len() {
                VoteDecision::Majority
            } else {
                VoteDecision::Plurality
            };
            return (Some((*winner).clone()), decision);
        }

        let chosen = votes
            .iter()
            .filter(|vote| {
                vote.final_answer
                    .as_ref()
                    .is_some_and(|answer| leaders.contains(&answer))
            })
            .min_by(|left, right| {
                let left_gap = (left.instance_temperature - self.default_temperature).abs();
                let right_gap = (right.instance_temperature - self.default_temperature).abs();
                left_gap
                    .total_cmp(&right_gap)
                    .then(left.instance_seed.cmp(&right.instance_seed))
            })
            .and_then(|vote| vote.final_answer.clone());

        match chosen {
            Some(answer) => (Some(answer), VoteDecision::TieBreakDefaultTemperature),
            None => (None, VoteDecision::NoValidAnswers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::normalize::NumericNormalizer;

    fn vote(index: u32, temperature: f64, answer: Option<&str>) -> InstanceVote {
        InstanceVote {
            instance_index: index,
            instance_seed: 42 + 101 * (u64::from(index) + 1),
            instance_temperature: temperature,
            final_answer: answer.map(str::to_string),
        }
    }

    #[test]
    fn two_of_three_is_a_majority() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0001",
            vec![
                vote(0, 0.65, Some("4")),
                vote(1, 0.70, Some("4")),
                vote(2, 0.75, Some("5")),
            ],
        );
        assert_eq!(bundle.consensus_answer.as_deref(), Some("4"));
        assert_eq!(
            bundle.vote_counts,
            BTreeMap::from([("4".to_string(), 2), ("5".to_string(), 1)])
        );
        assert_eq!(bundle.decision, VoteDecision::Majority);
    }

    #[test]
    fn three_of_three_is_unanimous() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0001",
            vec![
                vote(0, 0.65, Some("7")),
                vote(1, 0.70, Some("7")),
                vote(2, 0.75, Some("7")),
            ],
        );
        assert_eq!(bundle.decision, VoteDecision::Unanimous);
    }

    #[test]
    fn three_way_split_prefers_default_temperature_instance() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0002",
            vec![
                vote(0, 0.65, Some("1")),
                vote(1, 0.70, Some("2")),
                vote(2, 0.75, Some("3")),
            ],
        );
        assert_eq!(bundle.consensus_answer.as_deref(), Some("2"));
        assert_eq!(bundle.decision, VoteDecision::TieBreakDefaultTemperature);
    }

    #[test]
    fn tie_without_default_instance_uses_lowest_seed_among_closest() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0003",
            vec![
                vote(0, 0.75, Some("3")),
                vote(1, 0.70, None),
                vote(2, 0.75, Some("1")),
            ],
        );
        assert_eq!(bundle.consensus_answer.as_deref(), Some("3"));
        assert_eq!(bundle.decision, VoteDecision::TieBreakDefaultTemperature);
    }

    #[test]
    fn missing_answers_do_not_vote() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0004",
            vec![
                vote(0, 0.65, Some("9")),
                vote(1, 0.70, None),
                vote(2, 0.75, None),
            ],
        );
        assert_eq!(bundle.consensus_answer.as_deref(), Some("9"));
        assert_eq!(bundle.decision, VoteDecision::Plurality);
        assert_eq!(bundle.vote_counts.len(), 1);
    }

    #[test]
    fn no_answers_means_no_consensus() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile("gsm8k-0005", vec![vote(0, 0.65, None), vote(1, 0.70, None)]);
        assert_eq!(bundle.consensus_answer, None);
        assert_eq!(bundle.decision, VoteDecision::NoValidAnswers);
    }

    #[test]
    fn equal_values_with_different_spellings_vote_together() {
        let normalizer = NumericNormalizer::new().expect("normalizer");
        let extract = |raw: &str| normalizer.extract(raw);
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile(
            "gsm8k-0007",
            vec![
                InstanceVote {
                    final_answer: extract("Final: 72"),
                    ..vote(0, 0.75, None)
                },
                InstanceVote {
                    final_answer: extract("Final: 72.0"),
                    ..vote(1, 0.65, None)
                },
                InstanceVote {
                    final_answer: extract("Final: 71"),
                    ..vote(2, 0.70, None)
                },
            ],
        );
        assert_eq!(bundle.consensus_answer.as_deref(), Some("72"));
        assert_eq!(
            bundle.vote_counts,
            BTreeMap::from([("71".to_string(), 1), ("72".to_string(), 2)])
        );
        assert_eq!(bundle.decision, VoteDecision::Majority);
    }

    #[test]
    fn single_instance_is_passed_through() {
        let aggregator = MajorityVoteAggregator::default();
        let bundle = aggregator.reconcile("gsm8k-0006", vec![vote(0, 0.70, Some("12"))]);
        assert_eq!(bundle.consensus_answer.as_deref(), Some("12"));
        assert_eq!(bundle.decision, VoteDecision::Single);
    }
}
