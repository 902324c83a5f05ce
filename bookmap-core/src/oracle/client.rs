use crate::config::OracleConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OracleMessage {
    pub role: Role,
    pub content: String,
}

/// One request to the oracle: a system instruction plus the conversation so far.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OracleExchange {
    pub messages: Vec<OracleMessage>,
}

impl OracleExchange {
    pub fn new(system: &str, user: &str) -> Self {
        Self {
            messages: vec![
                OracleMessage {
                    role: Role::System,
                    content: system.to_string(),
                },
                OracleMessage {
                    role: Role::User,
                    content: user.to_string(),
                },
            ],
        }
    }

    /// Follow-up that shows the oracle its previous output and what was wrong with it.
    pub fn with_correction(&self, previous_output: Option<&str>, instruction: &str) -> Self {
        let mut messages = self.messages.clone();
        if let Some(output) = previous_output {
            messages.push(OracleMessage {
                role: Role::Assistant,
                content: output.to_string(),
            });
        }
        messages.push(OracleMessage {
            role: Role::User,
            content: instruction.to_string(),
        });
        Self { messages }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle is not configured: {0}")]
    NotConfigured(String),
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("oracle rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("oracle response envelope was unreadable: {0}")]
    Envelope(String),
}

impl OracleError {
    /// Transient failures are worth another attempt; configuration and auth errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::NotConfigured(_) => false,
            OracleError::Transport(_) | OracleError::Envelope(_) => true,
            OracleError::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// External reasoning service that reviews candidate structure.
pub trait StructureOracle {
    fn name(&self) -> &str;
    fn complete(&self, exchange: &OracleExchange) -> Result<String, OracleError>;

    /// Called once a reply to `exchange` has parsed and validated.
    fn accept(&self, _exchange: &OracleExchange, _response: &str) {}
}

/// OpenAI-compatible chat completions client.
pub struct HttpOracle {
    endpoint: String,
    model: String,
    api_key: String,
    timeout: Duration,
    max_tokens: u32,
}

impl HttpOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            OracleError::NotConfigured(format!("environment variable {} is not set", config.api_key_env))
        })?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl StructureOracle for HttpOracle {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(&self, exchange: &OracleExchange) -> Result<String, OracleError> {
        let body = json!({
            "model": self.model,
            "messages": exchange.messages,
            "temperature": 0,
            "max_tokens": self.max_tokens,
        });
        debug!("Posting {} messages to {}", exchange.messages.len(), self.endpoint);

        let response = ureq::post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .timeout(self.timeout)
            .send_string(&body.to_string());

        let text = match response {
            Ok(resp) => resp
                .into_string()
                .map_err(|e| OracleError::Transport(e.to_string()))?,
            Err(ureq::Error::Status(status, resp)) => {
                return Err(OracleError::Rejected {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                })
            }
            Err(ureq::Error::Transport(t)) => return Err(OracleError::Transport(t.to_string())),
        };

        let envelope: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| OracleError::Envelope(e.to_string()))?;
        envelope["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OracleError::Envelope("missing choices[0].message.content".to_string()))
    }
}

/// Serves queued responses in order; used by tests and dry runs.
pub struct ScriptedOracle {
    responses: RefCell<VecDeque<Result<String, OracleError>>>,
    seen: RefCell<Vec<OracleExchange>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: RefCell::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn push_error(&self, error: OracleError) {
        self.responses.borrow_mut().push_back(Err(error));
    }

    /// Every exchange the oracle has been asked, in order.
    pub fn exchanges(&self) -> Vec<OracleExchange> {
        self.seen.borrow().clone()
    }
}

impl StructureOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, exchange: &OracleExchange) -> Result<String, OracleError> {
        self.seen.borrow_mut().push(exchange.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Transport("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_appends_previous_output_and_instruction() {
        let exchange = OracleExchange::new("system", "question");
        let corrected = exchange.with_correction(Some("{bad"), "return valid JSON");
        assert_eq!(corrected.messages.len(), 4);
        assert_eq!(corrected.messages[2].role, Role::Assistant);
        assert_eq!(corrected.messages[2].content, "{bad");
        assert_eq!(corrected.messages[3].role, Role::User);

        let without_output = exchange.with_correction(None, "try again");
        assert_eq!(without_output.messages.len(), 3);
    }

    #[test]
    fn retryability_follows_error_kind() {
        assert!(OracleError::Transport("reset".into()).is_retryable());
        assert!(OracleError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(OracleError::Rejected { status: 429, body: String::new() }.is_retryable());
        assert!(!OracleError::Rejected { status: 401, body: String::new() }.is_retryable());
        assert!(!OracleError::NotConfigured("no key".into()).is_retryable());
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let config = OracleConfig {
            api_key_env: "BOOKMAP_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpOracle::from_config(&config),
            Err(OracleError::NotConfigured(_))
        ));
    }

    #[test]
    fn scripted_oracle_replays_then_reports_exhaustion() {
        let oracle = ScriptedOracle::new(["one"]);
        let exchange = OracleExchange::new("s", "u");
        assert_eq!(oracle.complete(&exchange).unwrap(), "one");
        assert!(oracle.complete(&exchange).is_err());
        assert_eq!(oracle.exchanges().len(), 2);
    }
}
