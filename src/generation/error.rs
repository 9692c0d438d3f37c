// Failure kinds surfaced to whoever triggered a generation

use thiserror::Error;

use crate::api::{is_auth_status, TransportError};

const LENGTH_SIGNALS: &[&str] = &["token", "长度", "length", "too long", "maximum"];
const NETWORK_SIGNALS: &[&str] = &["network", "timeout", "连接", "connection"];
const AUTH_SIGNALS: &[&str] = &["api key", "apikey", "authentication", "认证", "unauthorized"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("API key not configured")]
    Configuration,
    #[error("content exceeds the model limit: {0}")]
    ContentTooLarge(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation failed: {0}")]
    Unknown(String),
}

impl GenerationError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Inline banner text, or `None` for cancellation which is never shown.
    pub const fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::Configuration => Some("发送失败"),
            Self::ContentTooLarge(_) => {
                Some("内容长度超出模型限制，请尝试减少输入内容或切换到支持更长文本的模型")
            }
            Self::Network(_) => Some("网络连接错误，请检查您的网络连接并重试"),
            Self::Authentication(_) => Some("API认证失败，请检查您的API密钥是否正确或有效"),
            Self::Cancelled => None,
            Self::Unknown(_) => Some("生成内容失败，请稍后重试"),
        }
    }

    pub fn from_transport(error: &TransportError) -> Self {
        match error {
            TransportError::Connection(message) => Self::Network(message.clone()),
            TransportError::Status { status, .. } if is_auth_status(*status) => {
                Self::Authentication(error.to_string())
            }
            TransportError::Upstream { code: Some(code), .. } if is_auth_status(*code) => {
                Self::Authentication(error.to_string())
            }
            _ => Self::from_message(&error.to_string()),
        }
    }

    /// Classify a failure by the signals in its text.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        let mentions = |signals: &[&str]| signals.iter().any(|s| lowered.contains(*s));

        if mentions(LENGTH_SIGNALS) {
            Self::ContentTooLarge(message.to_string())
        } else if mentions(NETWORK_SIGNALS) {
            Self::Network(message.to_string())
        } else if mentions(AUTH_SIGNALS) {
            Self::Authentication(message.to_string())
        } else {
            Self::Unknown(message.to_string())
        }
    }
}
