//! 客戶端設定與其建構器。

use std::{env, path::PathBuf, time::Duration};

use crate::key_pair::KeyType;

/// 客戶端執行所需的設定值。
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// 協議伺服器的目錄 URL。
    pub directory_url: String,
    /// 新帳戶金鑰的類型。
    pub key_type: KeyType,
    /// 本地資料的存放目錄。
    pub storage_path: PathBuf,
    /// 批次模式下輪詢授權狀態的次數上限。
    pub poll_attempts: usize,
    /// 兩次輪詢之間的等待時間。
    pub poll_interval: Duration,
    /// 協議請求與驗證請求的逾時時間。
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl ClientConfig {
    /// 預設的目錄 URL（測試環境）。
    pub const DEFAULT_DIRECTORY_URL: &'static str =
        "https://acme-staging.api.letsencrypt.org/directory";
    /// 預設的 RSA 金鑰位數。
    pub const DEFAULT_RSA_BITS: u32 = 2048;
    pub const DEFAULT_POLL_ATTEMPTS: usize = 10;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

    /// 建立一個帶有預設值的建構器。
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// 根據 `$HOME` 取得預設的存儲路徑。
    fn default_storage_path() -> PathBuf {
        let app_name = env!("CARGO_PKG_NAME");
        let base_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib"));

        base_dir.join(".local/share").join(app_name)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build()
    }
}

/// 以 builder 模式建立 [`ClientConfig`]。
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig {
                directory_url: ClientConfig::DEFAULT_DIRECTORY_URL.to_string(),
                key_type: KeyType::Rsa {
                    bits: ClientConfig::DEFAULT_RSA_BITS,
                },
                storage_path: ClientConfig::default_storage_path(),
                poll_attempts: ClientConfig::DEFAULT_POLL_ATTEMPTS,
                poll_interval: ClientConfig::DEFAULT_POLL_INTERVAL,
                http_timeout: ClientConfig::DEFAULT_HTTP_TIMEOUT,
                user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            },
        }
    }

    pub fn directory_url(mut self, url: &str) -> Self {
        self.config.directory_url = url.to_string();
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.config.key_type = key_type;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = path.into();
        self
    }

    /// 設定輪詢次數與間隔。
    pub fn polling(mut self, attempts: usize, interval: Duration) -> Self {
        self.config.poll_attempts = attempts;
        self.config.poll_interval = interval;
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.config.user_agent = user_agent.to_string();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
