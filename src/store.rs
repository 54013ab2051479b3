//! 持久化儲存契約與基於 [`Storage`] 的實作。
//!
//! 帶有私鑰的記錄（帳戶、憑證）以工作階段密碼封裝後寫入；
//! 授權與目錄為一般 JSON。每個帳戶底下維護授權與憑證的索引，
//! 索引順序即為新增順序，用來找出「最新」的授權。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use openssl::sha::sha256;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    authorization::{Authorization, AuthorizationStatus},
    certificate::Certificate,
    directory::Directory,
    error::{Error, Result},
    export::{SealedBlock, LABEL_CERTIFICATE_RECORD, LABEL_REGISTRATION},
    registration::Registration,
    storage::{FileStorage, Storage},
    ui::UserInterface,
};

/// 協議引擎使用的持久化儲存契約。
///
/// 查詢不到時回傳 `Ok(None)` 而非錯誤。
pub trait PersistentStore {
    fn load_directory(&self, root_url: &str) -> Result<Option<Directory>>;
    fn new_directory(&self, directory: &Directory) -> Result<()>;
    fn set_directory(&self, directory: &Directory) -> Result<()>;

    fn load_registration(&self, name: &str) -> Result<Option<Registration>>;
    /// 名稱已存在時回傳 `Error::Conflict`。
    fn new_registration(&self, registration: &Registration) -> Result<()>;
    fn set_registration(&self, registration: &Registration) -> Result<()>;

    fn new_authorization(&self, authorization: &Authorization) -> Result<()>;
    fn load_authorization_by_url(&self, registration: &str, url: &str)
        -> Result<Option<Authorization>>;
    /// 回傳該網域最新、未過期且狀態為 pending/processing/valid 的授權。
    fn load_authorization_by_dns(&self, registration: &str, dns: &str)
        -> Result<Option<Authorization>>;
    fn set_authorization(&self, authorization: &Authorization) -> Result<()>;
    fn authorization_infos(
        &self,
        registration: &str,
        status: Option<AuthorizationStatus>,
    ) -> Result<Vec<AuthorizationInfo>>;

    /// 同一帳戶下名稱重複時回傳 `Error::Conflict`。
    fn new_certificate(&self, certificate: &Certificate) -> Result<()>;
    fn load_certificate(&self, registration: &str, name_or_location: &str)
        -> Result<Option<Certificate>>;
    fn set_certificate(&self, certificate: &Certificate) -> Result<()>;
    /// `include_all` 為假時略過已撤銷或已過期的憑證。
    fn certificate_infos(&self, registration: &str, include_all: bool)
        -> Result<Vec<CertificateInfo>>;
}

/// 授權索引中的摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub location: String,
    pub dns: String,
    pub status: AuthorizationStatus,
    pub expires: Option<DateTime<Utc>>,
}

impl AuthorizationInfo {
    fn of(authorization: &Authorization) -> Self {
        Self {
            location: authorization.location.clone(),
            dns: authorization.dns().to_string(),
            status: authorization.resource.status,
            expires: authorization.resource.expires,
        }
    }

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        let live = matches!(
            self.status,
            AuthorizationStatus::Pending
                | AuthorizationStatus::Processing
                | AuthorizationStatus::Valid
        );
        live && self.expires.map_or(true, |expires| expires > now)
    }
}

/// 憑證索引中的摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub location: String,
    pub name: String,
    pub revoked: bool,
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateInfo {
    fn of(certificate: &Certificate) -> Self {
        Self {
            location: certificate.location.clone(),
            name: certificate.name.clone(),
            revoked: certificate.revoked,
            not_after: certificate.not_after().ok(),
        }
    }
}

/// 提供儲存工作階段的加密密碼。
pub trait CredentialProvider {
    fn password(&self) -> Result<String>;
}

/// 固定密碼。
#[derive(Debug, Clone)]
pub struct StaticPassword(String);

impl StaticPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }
}

impl CredentialProvider for StaticPassword {
    fn password(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// 透過使用者介面詢問密碼。
pub struct PromptPassword<U: UserInterface> {
    ui: U,
    text: String,
}

impl<U: UserInterface> PromptPassword<U> {
    pub fn new(ui: U, text: &str) -> Self {
        Self {
            ui,
            text: text.to_string(),
        }
    }
}

impl<U: UserInterface> CredentialProvider for PromptPassword<U> {
    fn password(&self) -> Result<String> {
        self.ui.password_prompt(&self.text)
    }
}

/// 以閉包提供密碼，例如讀取環境變數或 keyring。
pub struct PasswordFn<F>(pub F);

impl<F: Fn() -> Result<String>> CredentialProvider for PasswordFn<F> {
    fn password(&self) -> Result<String> {
        (self.0)()
    }
}

/// 以 [`Storage`] 為後端的 [`PersistentStore`]。
///
/// 第一次需要密碼時才詢問 `credentials`，成功取得的密碼在整個工作階段內重複使用。
pub struct KvStore<S: Storage> {
    storage: S,
    credentials: Box<dyn CredentialProvider>,
    password: OnceLock<String>,
}

/// 名稱與 URL 一律以 SHA-256 十六進位做為檔名，長度固定為 64 字元；原值保存在記錄內。
fn key_component(value: &str) -> String {
    hex::encode(sha256(value.as_bytes()))
}

impl KvStore<FileStorage> {
    /// 開啟位於 `path` 的檔案儲存。
    pub fn open_file(
        path: impl AsRef<std::path::Path>,
        credentials: Box<dyn CredentialProvider>,
    ) -> Result<Self> {
        Ok(Self::new(FileStorage::open(path)?, credentials))
    }
}

impl<S: Storage> KvStore<S> {
    pub fn new(storage: S, credentials: Box<dyn CredentialProvider>) -> Self {
        Self {
            storage,
            credentials,
            password: OnceLock::new(),
        }
    }

    fn password(&self) -> Result<String> {
        if let Some(password) = self.password.get() {
            return Ok(password.clone());
        }
        let password = self.credentials.password()?;
        Ok(self.password.get_or_init(|| password).clone())
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.read_optional(key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.storage.write(key, &serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    fn read_sealed<T: DeserializeOwned>(&self, key: &str, label: &str) -> Result<Option<T>> {
        let Some(data) = self.storage.read_optional(key)? else {
            return Ok(None);
        };
        let block = SealedBlock::from_pem(&String::from_utf8_lossy(&data), label)?;
        let plain = if block.is_sealed() {
            block.open(&self.password()?)?
        } else {
            block.open("")?
        };
        Ok(Some(serde_json::from_slice(&plain)?))
    }

    fn write_sealed<T: Serialize>(&self, key: &str, label: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        let block = SealedBlock::seal(label, &json, &self.password()?)?;
        self.storage.write(key, block.to_pem().as_bytes())?;
        Ok(())
    }

    fn directory_key(root_url: &str) -> String {
        format!("directories/{}", key_component(root_url))
    }

    fn registration_key(name: &str) -> String {
        format!("registrations/{}", key_component(name))
    }

    fn authorization_index_key(registration: &str) -> String {
        format!("authorizations/{}/index", key_component(registration))
    }

    fn authorization_key(registration: &str, location: &str) -> String {
        format!(
            "authorizations/{}/records/{}",
            key_component(registration),
            key_component(location)
        )
    }

    fn certificate_index_key(registration: &str) -> String {
        format!("certificates/{}/index", key_component(registration))
    }

    fn certificate_key(registration: &str, location: &str) -> String {
        format!(
            "certificates/{}/records/{}",
            key_component(registration),
            key_component(location)
        )
    }

    fn authorization_index(&self, registration: &str) -> Result<Vec<AuthorizationInfo>> {
        Ok(self
            .read_json(&Self::authorization_index_key(registration))?
            .unwrap_or_default())
    }

    fn certificate_index(&self, registration: &str) -> Result<Vec<CertificateInfo>> {
        Ok(self
            .read_json(&Self::certificate_index_key(registration))?
            .unwrap_or_default())
    }

    fn check_certificate_name(
        index: &[CertificateInfo],
        certificate: &Certificate,
    ) -> Result<()> {
        if certificate.name.is_empty() {
            return Ok(());
        }
        let taken = index
            .iter()
            .any(|info| info.name == certificate.name && info.location != certificate.location);
        if taken {
            return Err(Error::Conflict(format!(
                "certificate name {:?} already in use for registration {:?}",
                certificate.name, certificate.registration
            )));
        }
        Ok(())
    }

    fn require_location(location: &str, kind: &str) -> Result<()> {
        if location.is_empty() {
            return Err(Error::InvalidState(format!("{} without location", kind)));
        }
        Ok(())
    }
}

impl<S: Storage> PersistentStore for KvStore<S> {
    fn load_directory(&self, root_url: &str) -> Result<Option<Directory>> {
        self.read_json(&Self::directory_key(root_url))
    }

    fn new_directory(&self, directory: &Directory) -> Result<()> {
        let key = Self::directory_key(&directory.root_url);
        if self.storage.exists(&key)? {
            return Err(Error::Conflict(format!(
                "directory {} already stored",
                directory.root_url
            )));
        }
        self.write_json(&key, directory)
    }

    fn set_directory(&self, directory: &Directory) -> Result<()> {
        self.write_json(&Self::directory_key(&directory.root_url), directory)
    }

    fn load_registration(&self, name: &str) -> Result<Option<Registration>> {
        if name.is_empty() {
            return Ok(None);
        }
        self.read_sealed(&Self::registration_key(name), LABEL_REGISTRATION)
    }

    fn new_registration(&self, registration: &Registration) -> Result<()> {
        if registration.name.is_empty() {
            return Err(Error::InvalidState("registration without name".into()));
        }
        let key = Self::registration_key(&registration.name);
        if self.storage.exists(&key)? {
            return Err(Error::Conflict(format!(
                "there already is a registration with name {:?}",
                registration.name
            )));
        }
        debug!(name = %registration.name, "storing new registration");
        self.write_sealed(&key, LABEL_REGISTRATION, registration)
    }

    fn set_registration(&self, registration: &Registration) -> Result<()> {
        let key = Self::registration_key(&registration.name);
        if !self.storage.exists(&key)? {
            return Err(Error::InvalidState(format!(
                "registration {:?} is not stored",
                registration.name
            )));
        }
        self.write_sealed(&key, LABEL_REGISTRATION, registration)
    }

    fn new_authorization(&self, authorization: &Authorization) -> Result<()> {
        Self::require_location(&authorization.location, "authorization")?;
        let registration = &authorization.registration;
        let key = Self::authorization_key(registration, &authorization.location);
        if self.storage.exists(&key)? {
            return Err(Error::Conflict(format!(
                "authorization {} already stored",
                authorization.location
            )));
        }

        self.write_json(&key, authorization)?;
        let mut index = self.authorization_index(registration)?;
        index.push(AuthorizationInfo::of(authorization));
        self.write_json(&Self::authorization_index_key(registration), &index)
    }

    fn load_authorization_by_url(
        &self,
        registration: &str,
        url: &str,
    ) -> Result<Option<Authorization>> {
        if url.is_empty() {
            return Ok(None);
        }
        self.read_json(&Self::authorization_key(registration, url))
    }

    fn load_authorization_by_dns(
        &self,
        registration: &str,
        dns: &str,
    ) -> Result<Option<Authorization>> {
        let now = Utc::now();
        let index = self.authorization_index(registration)?;
        match index
            .iter()
            .rev()
            .find(|info| info.dns == dns && info.is_usable(now))
        {
            Some(info) => self.load_authorization_by_url(registration, &info.location),
            None => Ok(None),
        }
    }

    fn set_authorization(&self, authorization: &Authorization) -> Result<()> {
        Self::require_location(&authorization.location, "authorization")?;
        let registration = &authorization.registration;
        self.write_json(
            &Self::authorization_key(registration, &authorization.location),
            authorization,
        )?;

        let mut index = self.authorization_index(registration)?;
        let info = AuthorizationInfo::of(authorization);
        match index.iter_mut().find(|i| i.location == info.location) {
            Some(existing) => *existing = info,
            None => index.push(info),
        }
        self.write_json(&Self::authorization_index_key(registration), &index)
    }

    fn authorization_infos(
        &self,
        registration: &str,
        status: Option<AuthorizationStatus>,
    ) -> Result<Vec<AuthorizationInfo>> {
        let index = self.authorization_index(registration)?;
        Ok(match status {
            Some(status) => index.into_iter().filter(|i| i.status == status).collect(),
            None => index,
        })
    }

    fn new_certificate(&self, certificate: &Certificate) -> Result<()> {
        Self::require_location(&certificate.location, "certificate")?;
        let registration = &certificate.registration;
        let mut index = self.certificate_index(registration)?;
        if index.iter().any(|i| i.location == certificate.location) {
            return Err(Error::Conflict(format!(
                "certificate {} already stored",
                certificate.location
            )));
        }
        Self::check_certificate_name(&index, certificate)?;

        self.write_sealed(
            &Self::certificate_key(registration, &certificate.location),
            LABEL_CERTIFICATE_RECORD,
            certificate,
        )?;
        index.push(CertificateInfo::of(certificate));
        self.write_json(&Self::certificate_index_key(registration), &index)
    }

    fn load_certificate(
        &self,
        registration: &str,
        name_or_location: &str,
    ) -> Result<Option<Certificate>> {
        if name_or_location.is_empty() {
            return Ok(None);
        }
        let index = self.certificate_index(registration)?;
        let info = index
            .iter()
            .find(|i| i.location == name_or_location)
            .or_else(|| index.iter().find(|i| i.name == name_or_location));
        match info {
            Some(info) => self.read_sealed(
                &Self::certificate_key(registration, &info.location),
                LABEL_CERTIFICATE_RECORD,
            ),
            None => Ok(None),
        }
    }

    fn set_certificate(&self, certificate: &Certificate) -> Result<()> {
        Self::require_location(&certificate.location, "certificate")?;
        let registration = &certificate.registration;
        let mut index = self.certificate_index(registration)?;
        Self::check_certificate_name(&index, certificate)?;

        self.write_sealed(
            &Self::certificate_key(registration, &certificate.location),
            LABEL_CERTIFICATE_RECORD,
            certificate,
        )?;
        let info = CertificateInfo::of(certificate);
        match index.iter_mut().find(|i| i.location == info.location) {
            Some(existing) => *existing = info,
            None => index.push(info),
        }
        self.write_json(&Self::certificate_index_key(registration), &index)
    }

    fn certificate_infos(
        &self,
        registration: &str,
        include_all: bool,
    ) -> Result<Vec<CertificateInfo>> {
        let now = Utc::now();
        let index = self.certificate_index(registration)?;
        Ok(index
            .into_iter()
            .filter(|i| include_all || (!i.revoked && i.not_after.map_or(true, |t| t > now)))
            .collect())
    }
}
