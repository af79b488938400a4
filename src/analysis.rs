//! Analysis Client: prompt construction and LLM completion calls.
//!
//! The completion capability sits behind [`Completion`] so tests can run
//! against a stub. The production backend is OpenRouter via rig. Every
//! call is attempted exactly once per triggering request, with a fixed
//! token budget and no retries.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openrouter;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::models::{AnalysisBundle, LabResults, NOT_FOUND, PatientInfo};

/// Token budget for each of the three analysis completions.
pub const ANALYSIS_MAX_TOKENS: u64 = 300;
/// Token budget for a chat reply.
pub const CHAT_MAX_TOKENS: u64 = 100;

/// Headline panel included in the first report summary sent to the LLM,
/// spelled the way the lab prints them.
pub const HEADLINE_TESTS: [&str; 6] = [
    "HAEMOGLOBIN",
    "PCV",
    "RBC COUNT",
    "GLUCOSE, FASTING , NAF PLASMA",
    "HBA1C, GLYCATED HEMOGLOBIN",
    "CREATININE , SERUM",
];

/// Prompt + max-token budget → completion text.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u64) -> Result<String>;
}

/// OpenRouter-backed completion.
pub struct OpenRouterCompletion {
    client: openrouter::Client,
    model: String,
}

impl OpenRouterCompletion {
    pub fn new(api_key: &str, model: impl Into<String>) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Completion for OpenRouterCompletion {
    async fn complete(&self, prompt: &str, max_tokens: u64) -> Result<String> {
        let agent = self.client.agent(&self.model).max_tokens(max_tokens).build();
        let text = agent
            .prompt(prompt)
            .await
            .map_err(|e| ServiceError::Completion(e.to_string()))?;
        Ok(text)
    }
}

/// Builds the natural-language report summary the completions work from.
pub fn build_report_summary(patient: &PatientInfo, tests: &LabResults) -> String {
    let mut report = format!(
        "Patient Name: {}\nAge: {}\nHeight: {}\nWeight: {}\n\nTest Results:\n",
        patient.name.as_deref().unwrap_or(NOT_FOUND),
        patient.age.as_deref().unwrap_or(NOT_FOUND),
        patient.height.as_deref().unwrap_or(NOT_FOUND),
        patient.weight.as_deref().unwrap_or(NOT_FOUND),
    );
    for (name, value) in tests {
        report.push_str(&format!("{name}: {value}\n"));
    }
    report
}

fn diagnosis_prompt(report: &str) -> String {
    format!(
        "Analyze the following pathology report and provide diagnostic suggestions \
         and identify any patterns or correlations relevant to diabetic patients. \
         Ensure the response is well-structured and properly formatted. \
         End with a clear conclusion.\n\nPathology Report:\n{report}\n\nDiagnostic Suggestions:"
    )
}

fn recommendations_prompt(analysis: &str) -> String {
    format!(
        "Based on the following analysis, provide detailed recommendations for \
         lifestyle changes and further medical actions in a well-structured and \
         properly formatted manner. End with a clear conclusion.\n\nAnalysis:\n{analysis}\n\nRecommendations:"
    )
}

fn medications_prompt(analysis: &str) -> String {
    format!(
        "Based on the following analysis, provide a list of 10 medications for the \
         identified disease in a well-structured, bullet-point format. \
         End with a clear conclusion.\n\nAnalysis:\n{analysis}\n\nMedications:"
    )
}

/// Drives the three-call analysis chain and single-call chat replies.
pub struct AnalysisClient {
    completion: Arc<dyn Completion>,
}

impl AnalysisClient {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self { completion }
    }

    /// Diagnosis from the report, then recommendations and medications
    /// derived from the diagnosis as independent siblings.
    pub async fn analyze_report(&self, report: &str) -> Result<AnalysisBundle> {
        let analysis = self.complete_trimmed(&diagnosis_prompt(report)).await?;
        info!(chars = analysis.len(), "diagnosis generated");

        let recommendations = self
            .complete_trimmed(&recommendations_prompt(&analysis))
            .await?;
        let medications = self.complete_trimmed(&medications_prompt(&analysis)).await?;

        Ok(AnalysisBundle {
            analysis,
            recommendations,
            medications,
        })
    }

    /// One completion per chat message, on a tighter budget.
    pub async fn chat_reply(&self, message: &str) -> Result<String> {
        let reply = self.completion.complete(message, CHAT_MAX_TOKENS).await?;
        Ok(reply.trim().to_string())
    }

    async fn complete_trimmed(&self, prompt: &str) -> Result<String> {
        let text = self.completion.complete(prompt, ANALYSIS_MAX_TOKENS).await?;
        Ok(text.trim().to_string())
    }
}
