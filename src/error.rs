use uuid::Uuid;

use crate::core::{claims::ClaimError, exchange::ExchangeState};

/// Errors surfaced by the [Engine](crate::engine::Engine).
///
/// Every variant concerning a specific exchange carries its id, and the step where relevant.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange {id} not found")]
    NotFound { id: Uuid },
    #[error("exchange {id} has expired")]
    Expired { id: Uuid },
    #[error("exchange {id} was modified concurrently (expected sequence {expected})")]
    Conflict { id: Uuid, expected: u64 },
    #[error("cannot {operation} exchange {id} in state `{state}`")]
    InvalidState {
        id: Uuid,
        state: ExchangeState,
        operation: &'static str,
    },
    #[error("challenge mismatch for exchange {id} at step `{step}`")]
    ChallengeMismatch { id: Uuid, step: String },
    #[error("verification failed for exchange {id} at step `{step}`: {reason}")]
    VerificationFailed {
        id: Uuid,
        step: String,
        reason: String,
    },
    #[error("exchange {id} is missing required claims at step `{step}`: {}", missing_rules(.missing))]
    IncompleteClaims {
        id: Uuid,
        step: String,
        missing: Vec<ClaimError>,
    },
    #[error("workflow `{workflow}` is misconfigured: {reason}")]
    ConfigurationError { workflow: String, reason: String },
    #[error("session store failure: {0:#}")]
    Store(anyhow::Error),
}

impl ExchangeError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Conflict { .. }
                | ExchangeError::VerificationFailed { .. }
                | ExchangeError::Store(_)
        )
    }
}

fn missing_rules(missing: &[ClaimError]) -> String {
    missing
        .iter()
        .map(ClaimError::rule)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_claims_lists_rules() {
        let id = Uuid::nil();
        let err = ExchangeError::IncompleteClaims {
            id,
            step: "license".into(),
            missing: vec![
                ClaimError::MissingClaim {
                    rule: "email".into(),
                    path: "email".into(),
                },
                ClaimError::MissingClaim {
                    rule: "dl_number".into(),
                    path: "driversLicense.document_number".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            format!("exchange {id} is missing required claims at step `license`: email, dl_number")
        );
    }
}
