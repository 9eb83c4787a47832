//! Input guard pipeline.
//!
//! Ordered, enabled-filtered stages, each deciding `Allowed` or `Rejected`
//! for a [`GuardCommand`]. Execution stops at the first rejection
//! (fail-close semantics extend to stage errors too: a stage that errors is
//! treated as a `SYSTEM_ERROR` rejection, never as silent pass-through).
//! An empty pipeline allows everything.

use crate::capabilities::{GuardAuditEvent, GuardAuditPublisher};
use crate::types::GuardCommand;
use async_trait::async_trait;
use std::sync::Arc;

/// Why a stage rejected a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCategory {
    RateLimited,
    InvalidInput,
    PromptInjection,
    OffTopic,
    Unauthorized,
    SystemError,
}

/// Outcome of a single guard stage.
#[derive(Debug, Clone)]
pub enum GuardDecision {
    Allowed,
    Rejected { reason: String, category: RejectionCategory, stage: String },
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allowed)
    }
}

/// A single input policy stage.
#[async_trait]
pub trait GuardStage: Send + Sync {
    fn name(&self) -> &str;
    fn enabled(&self) -> bool {
        true
    }
    async fn check(&self, command: &GuardCommand) -> GuardDecision;
}

fn hash_text(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Ordered input guard pipeline.
pub struct InputGuardPipeline {
    stages: Vec<Arc<dyn GuardStage>>,
    audit: Arc<dyn GuardAuditPublisher>,
}

impl InputGuardPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new(), audit: Arc::new(crate::observability::NoopAuditPublisher) }
    }

    pub fn with_audit(audit: Arc<dyn GuardAuditPublisher>) -> Self {
        Self { stages: Vec::new(), audit }
    }

    pub fn add_stage(mut self, stage: Arc<dyn GuardStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run the pipeline. Stops at the first rejection; an empty pipeline
    /// (or all-disabled pipeline) allows. `run_id` ties published audit
    /// events back to the agent run that produced them.
    pub async fn run(&self, command: &GuardCommand, run_id: &str) -> GuardDecision {
        let text_hash = hash_text(&command.text);
        for stage in &self.stages {
            if !stage.enabled() {
                continue;
            }
            let decision = stage.check(command).await;
            tracing::trace!(stage = stage.name(), text_hash, "guard stage evaluated");
            self.audit.publish(GuardAuditEvent {
                run_id: run_id.to_string(),
                stage: stage.name().to_string(),
                outcome: if decision.is_allowed() { "allowed".to_string() } else { "rejected".to_string() },
                reason: match &decision {
                    GuardDecision::Rejected { reason, .. } => Some(reason.clone()),
                    GuardDecision::Allowed => None,
                },
            });
            if !decision.is_allowed() {
                return decision;
            }
        }
        GuardDecision::Allowed
    }
}

impl Default for InputGuardPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal prompt-injection heuristic stage: rejects input containing
/// common "ignore previous instructions" phrasing. Intended as a seed
/// stage callers extend or replace.
pub struct PromptInjectionStage {
    patterns: Vec<regex::Regex>,
}

impl PromptInjectionStage {
    pub fn new() -> Self {
        let patterns = [
            r"(?i)ignore (all )?previous instructions",
            r"(?i)disregard (the )?system prompt",
            r"(?i)you are now (in )?developer mode",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static pattern"))
        .collect();
        Self { patterns }
    }
}

impl Default for PromptInjectionStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuardStage for PromptInjectionStage {
    fn name(&self) -> &str {
        "prompt_injection"
    }

    async fn check(&self, command: &GuardCommand) -> GuardDecision {
        for pattern in &self.patterns {
            if pattern.is_match(&command.text) {
                return GuardDecision::Rejected {
                    reason: "input matched a prompt-injection pattern".to_string(),
                    category: RejectionCategory::PromptInjection,
                    stage: self.name().to_string(),
                };
            }
        }
        GuardDecision::Allowed
    }
}
