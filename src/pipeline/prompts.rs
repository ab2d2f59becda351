use crate::model::{StageName, StageResult, WorkItem};

/// Builds the prompt for one stage from the item and the stages already
/// completed in the same pipeline run. Must be a pure function.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, stage: StageName, item: &WorkItem, prior: &[StageResult]) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrompts;

const FINAL_LINE: &str = "End with a line of the form 'Final: <answer>' containing only the answer.";

impl PromptBuilder for DefaultPrompts {
    fn build(&self, stage: StageName, item: &WorkItem, prior: &[StageResult]) -> String {
        let question = item.prompt_payload.trim();
        match stage {
            StageName::Baseline => format!(
                "Solve the following problem step by step.\n{FINAL_LINE}\n\nProblem:\n{question}"
            ),
            StageName::Thesis => format!(
                "You are solving a problem. Provide a concise solution with brief reasoning.\n\
                 {FINAL_LINE}\n\nProblem:\n{question}"
            ),
            StageName::Antithesis => format!(
                "Critique the proposed solution below. Identify defects in assumptions, \
                 arithmetic, logic or format, and state the strongest opposing point.\n\n\
                 Problem:\n{question}\n\nProposed solution:\n{thesis}\n\n\
                 Output a short critique.",
                thesis = output_of(prior, StageName::Thesis),
            ),
            StageName::Synthesis => format!(
                "Unify the original solution and the critique into a single improved answer. \
                 Keep correct steps and fix the mistakes the critique identifies.\n\
                 {FINAL_LINE}\n\nProblem:\n{question}\n\nOriginal solution:\n{thesis}\n\n\
                 Critique:\n{critique}",
                thesis = output_of(prior, StageName::Thesis),
                critique = output_of(prior, StageName::Antithesis),
            ),
        }
    }
}

fn output_of(prior: &[StageResult], stage: StageName) -> &str {
    prior
        .iter()
        .find(|result| result.stage_name == stage)
        .map(|result| result.output_text.trim())
        .unwrap_or("")
}
