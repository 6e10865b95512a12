use super::ServerOrchestrator;
use crate::types::ServerId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for BatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchAction::Start => write!(f, "start"),
            BatchAction::Stop => write!(f, "stop"),
            BatchAction::Restart => write!(f, "restart"),
        }
    }
}

/// What to do with the remaining servers after one fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    #[default]
    ContinueOnError,
    StopOnFirstError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "lowercase")]
pub enum BatchOutcome {
    Succeeded,
    Failed(String),
    /// Not attempted because an earlier server failed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub server_id: ServerId,
    pub outcome: BatchOutcome,
}

impl ServerOrchestrator {
    /// Apply `action` to each server in order, one at a time.
    ///
    /// Returns one result per id, in the order given.
    pub async fn batch(
        &self,
        action: BatchAction,
        ids: &[ServerId],
        mode: BatchMode,
    ) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(ids.len());
        let mut halted = false;

        for &server_id in ids {
            if halted {
                results.push(BatchResult {
                    server_id,
                    outcome: BatchOutcome::Skipped,
                });
                continue;
            }

            let result = match action {
                BatchAction::Start => self.start(server_id).await,
                BatchAction::Stop => self.stop(server_id).await,
                BatchAction::Restart => self.restart(server_id).await,
            };

            let outcome = match result {
                Ok(_) => BatchOutcome::Succeeded,
                Err(e) => {
                    warn!("Batch {} of {} failed: {}", action, server_id, e);
                    halted = mode == BatchMode::StopOnFirstError;
                    BatchOutcome::Failed(e.to_string())
                }
            };
            results.push(BatchResult { server_id, outcome });
        }

        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, BatchOutcome::Failed(_)))
            .count();
        info!(
            "Batch {} finished: {} server(s), {} failed",
            action,
            ids.len(),
            failed
        );

        results
    }
}
