//! Fallback strategy.
//!
//! On terminal error after retries are exhausted, try each configured
//! alternate model in turn with a simple single-shot call (no tools, no
//! ReAct loop). The first non-empty success wins; if every alternate is
//! exhausted the original error is propagated to the caller rather than
//! whatever the last fallback attempt produced.

use crate::error::{Error, Result};
use std::future::Future;

/// One attempt against an alternate model. `call` receives the model name
/// and should perform a single, tool-free completion.
pub async fn run_fallback<F, Fut>(
    original_error: Error,
    models: &[String],
    mut call: F,
) -> Result<String>
where
    F: FnMut(&str) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    for model in models {
        match call(model).await {
            Ok(content) if !content.trim().is_empty() => return Ok(content),
            _ => continue,
        }
    }
    Err(original_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_success_wins() {
        let models = vec!["backup-a".to_string(), "backup-b".to_string()];
        let result = run_fallback(Error::timeout(), &models, |model| async move {
            if model == "backup-a" {
                Ok("hello from a".to_string())
            } else {
                Ok("hello from b".to_string())
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "hello from a");
    }

    #[tokio::test]
    async fn test_skips_empty_success() {
        let models = vec!["backup-a".to_string(), "backup-b".to_string()];
        let result = run_fallback(Error::timeout(), &models, |model| async move {
            if model == "backup-a" {
                Ok("   ".to_string())
            } else {
                Ok("real answer".to_string())
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "real answer");
    }

    #[tokio::test]
    async fn test_all_exhausted_propagates_original_error() {
        let models = vec!["backup-a".to_string()];
        let result = run_fallback(Error::timeout(), &models, |_model| async move { Err(Error::tool("nope".into())) }).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_empty_model_list_propagates_original_error() {
        let models: Vec<String> = vec![];
        let result = run_fallback(Error::config("bad".into()), &models, |_model| async move { Ok("never reached".to_string()) }).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
