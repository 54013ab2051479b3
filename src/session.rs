//! 工作階段：持有設定、傳輸層與儲存層，並借出各個協議引擎。
//!
//! 目錄、帳戶、授權與憑證記錄都由儲存層以值保存；記錄之間只以名稱或 URL 互相參照。

use tracing::info;

use crate::{
    authorization::AuthorizationEngine,
    certificate::CertificateIssuer,
    config::ClientConfig,
    directory::{Directory, DirectoryCatalog},
    error::{Error, Result},
    key_pair::SigningKey,
    registration::{AccountRegistrar, Registration},
    store::{CredentialProvider, KvStore, PersistentStore},
    transport::Transport,
};

pub struct Session {
    config: ClientConfig,
    transport: Transport,
    store: Box<dyn PersistentStore>,
}

impl Session {
    /// 以設定中的 `storage_path` 開啟檔案儲存；密碼在第一次需要時才向 `credentials` 取得。
    pub fn open(config: ClientConfig, credentials: Box<dyn CredentialProvider>) -> Result<Self> {
        let store = KvStore::open_file(&config.storage_path, credentials)?;
        let transport = Transport::new(&config)?;
        Ok(Self::new(config, transport, Box::new(store)))
    }

    pub fn new(config: ClientConfig, transport: Transport, store: Box<dyn PersistentStore>) -> Self {
        Self {
            config,
            transport,
            store,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn store(&self) -> &dyn PersistentStore {
        self.store.as_ref()
    }

    pub fn directories(&self) -> DirectoryCatalog<'_> {
        DirectoryCatalog::new(&self.transport, self.store())
    }

    pub fn registrar(&self) -> AccountRegistrar<'_> {
        AccountRegistrar::new(&self.transport, self.store())
    }

    pub fn authorizations(&self) -> AuthorizationEngine<'_> {
        AuthorizationEngine::new(&self.transport, self.store(), &self.config)
    }

    pub fn certificates(&self) -> CertificateIssuer<'_> {
        CertificateIssuer::new(&self.transport, self.store())
    }

    /// 設定中的目錄。
    pub fn directory(&self, refresh: bool) -> Result<Directory> {
        self.directories().get(&self.config.directory_url, refresh)
    }

    /// 讀取名為 `name` 的帳戶，不存在時回傳 `Error::InvalidState`。
    pub fn registration(&self, name: &str) -> Result<Registration> {
        self.registrar().load(name)?.ok_or_else(|| {
            Error::InvalidState(format!("no registration named {:?}, register first", name))
        })
    }

    /// 以設定的金鑰類型產生新金鑰，並在設定的目錄註冊帳戶。
    pub fn register(&self, name: &str, contact: Vec<String>) -> Result<Registration> {
        let directory = self.directory(false)?;
        let key = SigningKey::generate(self.config.key_type)?;
        info!(name, key_type = ?self.config.key_type, "generated account key");
        self.registrar().create(&directory, name, key, contact)
    }
}
