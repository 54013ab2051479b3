//! 整個客戶端共用的錯誤分類。
//!
//! 網路失敗、協議違規、自我驗證失敗、名稱衝突、密碼學錯誤與儲存錯誤各有獨立的變體，
//! 呼叫端可依變體決定中止或重試。

use std::fmt;

use thiserror::Error;

use crate::{key_pair::CryptoError, nonce::NonceError, storage::StorageError};

/// 協議層錯誤，保留嘗試的 URL、HTTP 狀態與送出的 payload 以便診斷。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub url: String,
    pub status: Option<String>,
    pub payload: Option<String>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            payload: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.message)?;
        if let Some(status) = &self.status {
            write!(f, " (status: {})", status)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " (payload: {})", payload)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {}

/// 客戶端操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("User interface error: {0}")]
    Ui(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// 以 URL 與訊息建立 `Error::Protocol`。
    pub fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError::new(url, message))
    }

    /// 是否為自我驗證失敗，批次流程以此判斷是否繼續下一個網域。
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(CryptoError::OpenSsl(e))
    }
}

impl From<NonceError> for Error {
    fn from(e: NonceError) -> Self {
        match e {
            NonceError::RequestFailed(e) => Error::Transport(e),
            NonceError::NoNonceHeader(url) => {
                Error::protocol(url, "no Replay-Nonce header found in response")
            }
            NonceError::InvalidHeaderValue(url) => {
                Error::protocol(url, "Replay-Nonce header is not valid ASCII")
            }
        }
    }
}

/// 本 crate 使用的結果類型。
pub type Result<T> = std::result::Result<T, Error>;
