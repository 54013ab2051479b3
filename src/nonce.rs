use reqwest::blocking::Client;
use thiserror::Error;
use tracing::debug;

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤，附帶請求的 URL。
    #[error("No Replay-Nonce header found in response from {0}")]
    NoNonceHeader(String),
    /// 當標頭值無法轉換成字串時回傳此錯誤。
    #[error("Invalid Replay-Nonce header value from {0}")]
    InvalidHeaderValue(String),
}

/// 定義取得 Nonce 的行為。
///
/// 每次簽章請求前都會對目標 URL 取得一次新的 nonce，不做快取或預取。
pub trait NonceT {
    fn get(&self, url: &str) -> Result<String, NonceError>;
}

/// 對目標 URL 發送 HEAD 請求並讀取 `Replay-Nonce` 標頭。
#[derive(Debug, Clone)]
pub struct HttpNonce {
    client: Client,
}

impl HttpNonce {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl NonceT for HttpNonce {
    fn get(&self, url: &str) -> Result<String, NonceError> {
        let response = self.client.head(url).send()?;
        debug!(url, status = %response.status(), "nonce request");

        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce
                .to_str()
                .map_err(|_| NonceError::InvalidHeaderValue(url.to_string()))?
                .to_string()),
            None => Err(NonceError::NoNonceHeader(url.to_string())),
        }
    }
}

/// 模擬 Nonce 實作，用於測試環境中提供固定的 Nonce 值。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: Option<String>,
}

impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    /// 模擬伺服器沒有回傳 `Replay-Nonce` 的情況。
    pub fn missing() -> Self {
        Self { value: None }
    }
}

impl NonceT for MockNonce {
    fn get(&self, url: &str) -> Result<String, NonceError> {
        self.value
            .clone()
            .ok_or_else(|| NonceError::NoNonceHeader(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_nonce() {
        let nonce = MockNonce::new("test-nonce-123");
        assert_eq!(nonce.get("http://ca.test/").unwrap(), "test-nonce-123");
        assert!(matches!(
            MockNonce::missing().get("http://ca.test/"),
            Err(NonceError::NoNonceHeader(_))
        ));
    }

    #[test]
    fn test_http_nonce_reads_header() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("HEAD", "/new-reg")
            .with_status(405)
            .with_header("Replay-Nonce", "abc123")
            .create();

        let nonce = HttpNonce::new(Client::new());
        let value = nonce.get(&format!("{}/new-reg", server.url())).unwrap();
        assert_eq!(value, "abc123");
        mock.assert();
    }

    #[test]
    fn test_http_nonce_without_header() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("HEAD", "/new-reg").with_status(200).create();

        let nonce = HttpNonce::new(Client::new());
        assert!(matches!(
            nonce.get(&format!("{}/new-reg", server.url())),
            Err(NonceError::NoNonceHeader(_))
        ));
    }
}
