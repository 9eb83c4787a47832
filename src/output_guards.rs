//! Output guard pipeline.
//!
//! Mirrors [`crate::guards`]'s ordered-stage shape, but stages may also
//! rewrite content (`Modified`), not just allow/reject, and modified content
//! flows into the next stage. Fail-close on stage error. `OutputTooShort` is
//! a distinct outcome from a stage `Rejected`, reserved for boundary-length
//! enforcement (spec.md §4.11).

use crate::types::OutputGuardContext;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputRejectionCategory {
    PiiDetected,
    HarmfulContent,
    PolicyViolation,
    SystemError,
}

#[derive(Debug, Clone)]
pub enum OutputDecision {
    Allowed { hints: Vec<String> },
    Modified { content: String, reason: String },
    Rejected { reason: String, category: OutputRejectionCategory },
    /// Distinct from `Rejected`: reserved for minimum-length enforcement.
    TooShort { minimum: usize, actual: usize },
}

#[async_trait]
pub trait OutputGuardStage: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, content: &str, ctx: &OutputGuardContext) -> OutputDecision;
}

/// Ordered output guard pipeline. `run` returns the final content (possibly
/// rewritten) or the first terminal rejection/too-short outcome.
pub struct OutputGuardPipeline {
    stages: Vec<Arc<dyn OutputGuardStage>>,
}

impl OutputGuardPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn add_stage(mut self, stage: Arc<dyn OutputGuardStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub async fn run(&self, content: &str, ctx: &OutputGuardContext) -> OutputDecision {
        let mut current = content.to_string();
        for stage in &self.stages {
            match stage.check(&current, ctx).await {
                OutputDecision::Allowed { .. } => continue,
                OutputDecision::Modified { content, .. } => current = content,
                rejected @ (OutputDecision::Rejected { .. } | OutputDecision::TooShort { .. }) => {
                    return rejected;
                }
            }
        }
        OutputDecision::Allowed { hints: Vec::new() }
            .into_final(current)
    }
}

impl Default for OutputGuardPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDecision {
    /// Collapse a terminal `Allowed` into a `Modified`-shaped carrier of the
    /// accumulated content so callers have one place to read the final text.
    fn into_final(self, content: String) -> OutputDecision {
        match self {
            OutputDecision::Allowed { .. } => OutputDecision::Modified { content, reason: String::new() },
            other => other,
        }
    }

    pub fn final_content(&self) -> Option<&str> {
        match self {
            OutputDecision::Modified { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// Detects canary tokens planted to catch system-prompt exfiltration.
pub struct CanaryTokenStage {
    tokens: Vec<String>,
}

impl CanaryTokenStage {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl OutputGuardStage for CanaryTokenStage {
    fn name(&self) -> &str {
        "canary_token"
    }

    async fn check(&self, content: &str, _ctx: &OutputGuardContext) -> OutputDecision {
        for token in &self.tokens {
            if !token.is_empty() && content.contains(token.as_str()) {
                return OutputDecision::Rejected {
                    reason: "output contains a canary token".to_string(),
                    category: OutputRejectionCategory::PolicyViolation,
                };
            }
        }
        OutputDecision::Allowed { hints: Vec::new() }
    }
}

/// Masks common PII patterns (phone numbers, emails) rather than rejecting
/// outright.
pub struct PiiMaskingStage {
    phone: regex::Regex,
    email: regex::Regex,
}

impl PiiMaskingStage {
    pub fn new() -> Self {
        Self {
            phone: regex::Regex::new(r"\d{2,3}-\d{3,4}-\d{4}").expect("static pattern"),
            email: regex::Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static pattern"),
        }
    }
}

impl Default for PiiMaskingStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputGuardStage for PiiMaskingStage {
    fn name(&self) -> &str {
        "pii_masking"
    }

    async fn check(&self, content: &str, _ctx: &OutputGuardContext) -> OutputDecision {
        let masked_phone = self.phone.replace_all(content, "***-****-****");
        let masked = self.email.replace_all(&masked_phone, "***@***.***");
        if masked != content {
            OutputDecision::Modified { content: masked.into_owned(), reason: "PII masked".to_string() }
        } else {
            OutputDecision::Allowed { hints: Vec::new() }
        }
    }
}

/// Rejects output matching configured policy-violation patterns.
pub struct PolicyViolationStage {
    patterns: Vec<regex::Regex>,
}

impl PolicyViolationStage {
    pub fn new(patterns: Vec<regex::Regex>) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl OutputGuardStage for PolicyViolationStage {
    fn name(&self) -> &str {
        "policy_violation"
    }

    async fn check(&self, content: &str, _ctx: &OutputGuardContext) -> OutputDecision {
        for pattern in &self.patterns {
            if pattern.is_match(content) {
                return OutputDecision::Rejected {
                    reason: "output matched a policy-violation pattern".to_string(),
                    category: OutputRejectionCategory::PolicyViolation,
                };
            }
        }
        OutputDecision::Allowed { hints: Vec::new() }
    }
}

/// Enforces a minimum content length, producing `TooShort` rather than
/// `Rejected`.
pub struct MinLengthStage {
    minimum: usize,
}

impl MinLengthStage {
    pub fn new(minimum: usize) -> Self {
        Self { minimum }
    }
}

#[async_trait]
impl OutputGuardStage for MinLengthStage {
    fn name(&self) -> &str {
        "min_length"
    }

    async fn check(&self, content: &str, _ctx: &OutputGuardContext) -> OutputDecision {
        let len = content.trim().chars().count();
        if len < self.minimum {
            OutputDecision::TooShort { minimum: self.minimum, actual: len }
        } else {
            OutputDecision::Allowed { hints: Vec::new() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GuardCommand;

    fn ctx() -> OutputGuardContext {
        OutputGuardContext {
            command: GuardCommand { text: String::new(), user_id: None, channel: None, metadata: Default::default() },
            tools_used: vec![],
            duration_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_pii_masking_rewrites_phone_number() {
        let pipeline = OutputGuardPipeline::new().add_stage(Arc::new(PiiMaskingStage::new()));
        let decision = pipeline.run("call me at 010-1234-5678", &ctx()).await;
        let content = decision.final_content().unwrap();
        assert!(content.contains("***-****-****"));
        assert!(!content.contains("010-1234-5678"));
    }

    #[tokio::test]
    async fn test_canary_token_rejects() {
        let pipeline = OutputGuardPipeline::new().add_stage(Arc::new(CanaryTokenStage::new(vec!["CANARY123".into()])));
        let decision = pipeline.run("leaked CANARY123 token", &ctx()).await;
        assert!(matches!(decision, OutputDecision::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_min_length_is_distinct_outcome() {
        let pipeline = OutputGuardPipeline::new().add_stage(Arc::new(MinLengthStage::new(10)));
        let decision = pipeline.run("hi", &ctx()).await;
        assert!(matches!(decision, OutputDecision::TooShort { .. }));
    }

    #[tokio::test]
    async fn test_modified_flows_into_next_stage() {
        let pipeline = OutputGuardPipeline::new()
            .add_stage(Arc::new(PiiMaskingStage::new()))
            .add_stage(Arc::new(MinLengthStage::new(1)));
        let decision = pipeline.run("010-1234-5678", &ctx()).await;
        let content = decision.final_content().unwrap();
        assert!(content.contains("***-****-****"));
    }

    #[tokio::test]
    async fn test_no_stages_allows_unmodified() {
        let pipeline = OutputGuardPipeline::new();
        let decision = pipeline.run("hello", &ctx()).await;
        assert_eq!(decision.final_content(), Some("hello"));
    }
}
