use super::{GenerationRequest, GenerationResponse, ServiceError, TextGenerator, estimate_tokens};
use crate::util::sha256_hex;

/// Offline generator for smoke runs. Output depends only on the prompt and
/// the seed, so repeated runs produce identical results.
#[derive(Debug, Default, Clone)]
pub struct DryRunGenerator;

impl DryRunGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl TextGenerator for DryRunGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
        let digest = sha256_hex(&format!("{}|{}", request.seed.unwrap_or(0), request.prompt));
        let value = u64::from_str_radix(&digest[..8], 16).unwrap_or(0) % 100;
        let text = format!("Dry-run reasoning for a {}-char prompt.\nFinal: {value}", request.prompt.len());

        Ok(GenerationResponse {
            prompt_tokens: estimate_tokens(&request.prompt),
            completion_tokens: estimate_tokens(&text).min(u64::from(request.max_tokens)),
            text,
        })
    }
}
