//! Bounded corrective retry around structured oracle calls.
//!
//! Every attempt reports an [`AttemptOutcome`]. Retryable outcomes carry the
//! raw output and a reason, which become the correction fed into the next
//! attempt. Exhausting the budget, or any fatal outcome, ends in a
//! fallback reason rather than an error.

use super::client::{OracleExchange, StructureOracle};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    Success(T),
    Retryable {
        raw_output: Option<String>,
        reason: String,
    },
    Fatal(String),
}

/// What the next attempt is told about the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub previous_output: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: Result<T, String>,
    pub attempts: usize,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Runs `attempt` up to `max_retries + 1` times.
pub fn with_bounded_retry<T, F>(max_retries: usize, mut attempt: F) -> RetryOutcome<T>
where
    F: FnMut(Option<&Correction>) -> AttemptOutcome<T>,
{
    let mut correction: Option<Correction> = None;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt(correction.as_ref()) {
            AttemptOutcome::Success(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            AttemptOutcome::Fatal(reason) => {
                warn!("Oracle attempt {} failed fatally: {}", attempts, reason);
                return RetryOutcome {
                    result: Err(reason),
                    attempts,
                };
            }
            AttemptOutcome::Retryable { raw_output, reason } => {
                if attempts > max_retries {
                    warn!("Oracle gave up after {} attempts: {}", attempts, reason);
                    return RetryOutcome {
                        result: Err(format!("retries exhausted after {attempts} attempts: {reason}")),
                        attempts,
                    };
                }
                debug!("Oracle attempt {} retryable: {}", attempts, reason);
                correction = Some(Correction {
                    previous_output: raw_output,
                    reason,
                });
            }
        }
    }
}

pub fn corrective_instruction(reason: &str) -> String {
    format!(
        "Your previous answer could not be used: {reason}. \
         Reply again with a single JSON object that follows the requested schema exactly, \
         with no commentary before or after it."
    )
}

/// Asks the oracle and parses its reply, retrying with corrections on
/// transport hiccups and unparseable output.
pub fn ask_structured<T, P>(
    oracle: &dyn StructureOracle,
    exchange: &OracleExchange,
    max_retries: usize,
    parse: P,
) -> RetryOutcome<T>
where
    P: Fn(&str) -> Result<T, String>,
{
    with_bounded_retry(max_retries, |correction| {
        let request = match correction {
            None => exchange.clone(),
            Some(c) => exchange.with_correction(
                c.previous_output.as_deref(),
                &corrective_instruction(&c.reason),
            ),
        };
        match oracle.complete(&request) {
            Ok(raw) => match parse(&raw) {
                Ok(value) => {
                    oracle.accept(&request, &raw);
                    AttemptOutcome::Success(value)
                }
                Err(reason) => AttemptOutcome::Retryable {
                    raw_output: Some(raw),
                    reason,
                },
            },
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable {
                raw_output: None,
                reason: e.to_string(),
            },
            Err(e) => AttemptOutcome::Fatal(e.to_string()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::client::{OracleError, Role, ScriptedOracle};

    #[test]
    fn succeeds_after_corrections_within_budget() {
        let mut seen_corrections = Vec::new();
        let outcome = with_bounded_retry(2, |correction| {
            seen_corrections.push(correction.cloned());
            match seen_corrections.len() {
                1 | 2 => AttemptOutcome::Retryable {
                    raw_output: Some(format!("bad {}", seen_corrections.len())),
                    reason: "not json".to_string(),
                },
                _ => AttemptOutcome::Success(7),
            }
        });

        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert!(seen_corrections[0].is_none());
        assert_eq!(
            seen_corrections[2].as_ref().and_then(|c| c.previous_output.clone()),
            Some("bad 2".to_string())
        );
    }

    #[test]
    fn exhaustion_returns_fallback_reason() {
        let outcome: RetryOutcome<()> = with_bounded_retry(2, |_| AttemptOutcome::Retryable {
            raw_output: None,
            reason: "timeout".to_string(),
        });
        assert_eq!(outcome.attempts, 3);
        let reason = outcome.result.unwrap_err();
        assert!(reason.contains("timeout"));
    }

    #[test]
    fn fatal_outcome_stops_immediately() {
        let mut calls = 0;
        let outcome: RetryOutcome<()> = with_bounded_retry(5, |_| {
            calls += 1;
            AttemptOutcome::Fatal("bad credentials".to_string())
        });
        assert_eq!(calls, 1);
        assert_eq!(outcome.result, Err("bad credentials".to_string()));
    }

    #[test]
    fn ask_structured_feeds_back_the_malformed_output() {
        let oracle = ScriptedOracle::new(["not json", "{\"ok\": true}"]);
        let exchange = OracleExchange::new("system", "user");
        let outcome = ask_structured(&oracle, &exchange, 2, |raw| {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|e| e.to_string())
        });

        assert!(outcome.result.is_ok());
        let exchanges = oracle.exchanges();
        assert_eq!(exchanges.len(), 2);
        let second = &exchanges[1].messages;
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[2].content, "not json");
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let oracle = ScriptedOracle::new(Vec::<String>::new());
        oracle.push_error(OracleError::Rejected {
            status: 401,
            body: "unauthorized".to_string(),
        });
        let exchange = OracleExchange::new("system", "user");
        let outcome = ask_structured(&oracle, &exchange, 2, |raw| Ok(raw.to_string()));
        assert!(outcome.result.is_err());
        assert_eq!(oracle.exchanges().len(), 1);
    }
}
