use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::Result, store::PersistentStore, transport::Transport};

/// 目錄提供的具名操作端點。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    NewRegistration,
    RecoverRegistration,
    NewAuthorization,
    NewCertificate,
    RevokeCertificate,
}

impl Endpoint {
    /// 目錄 JSON 中對應的鍵名。
    pub fn key(self) -> &'static str {
        match self {
            Endpoint::NewRegistration => "new-reg",
            Endpoint::RecoverRegistration => "recover-reg",
            Endpoint::NewAuthorization => "new-authz",
            Endpoint::NewCertificate => "new-cert",
            Endpoint::RevokeCertificate => "revoke-cert",
        }
    }
}

/// 伺服器回傳的目錄內容，缺少的鍵保留為空字串。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectoryResource {
    #[serde(rename = "new-reg", default)]
    pub new_reg: String,
    #[serde(rename = "recover-reg", default)]
    pub recover_reg: String,
    #[serde(rename = "new-authz", default)]
    pub new_authz: String,
    #[serde(rename = "new-cert", default)]
    pub new_cert: String,
    #[serde(rename = "revoke-cert", default)]
    pub revoke_cert: String,
}

/// 某個協議根 URL 的目錄。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Directory {
    pub root_url: String,
    pub resource: DirectoryResource,
}

impl Directory {
    /// 以 GET 取得目錄；非 2xx 或 JSON 格式錯誤皆為協議錯誤。
    pub fn fetch(transport: &Transport, root_url: &str) -> Result<Self> {
        let response = transport.get(root_url, None)?;
        let resource: DirectoryResource = response.json()?;
        debug!(root_url, ?resource, "directory fetched");

        Ok(Self {
            root_url: root_url.to_string(),
            resource,
        })
    }

    /// 取得端點 URL，目錄未提供時回傳 `None`。
    pub fn endpoint(&self, endpoint: Endpoint) -> Option<&str> {
        let url = match endpoint {
            Endpoint::NewRegistration => &self.resource.new_reg,
            Endpoint::RecoverRegistration => &self.resource.recover_reg,
            Endpoint::NewAuthorization => &self.resource.new_authz,
            Endpoint::NewCertificate => &self.resource.new_cert,
            Endpoint::RevokeCertificate => &self.resource.revoke_cert,
        };
        Some(url.as_str()).filter(|url| !url.is_empty())
    }

    /// 取得必要的端點，目錄未提供時回傳協議錯誤。
    pub fn require(&self, endpoint: Endpoint) -> Result<&str> {
        self.endpoint(endpoint).ok_or_else(|| {
            crate::error::Error::protocol(
                &self.root_url,
                format!("directory has no {} endpoint", endpoint.key()),
            )
        })
    }
}

/// 每個根 URL 只取得一次目錄並存入儲存層，之後僅在明確要求時重新取得。
pub struct DirectoryCatalog<'a> {
    transport: &'a Transport,
    store: &'a dyn PersistentStore,
}

impl<'a> DirectoryCatalog<'a> {
    pub fn new(transport: &'a Transport, store: &'a dyn PersistentStore) -> Self {
        Self { transport, store }
    }

    /// 取得目錄；`refresh` 為真時一律重新向伺服器取得並覆寫儲存的版本。
    pub fn get(&self, root_url: &str, refresh: bool) -> Result<Directory> {
        let stored = self.store.load_directory(root_url)?;
        if let Some(directory) = &stored {
            if !refresh {
                return Ok(directory.clone());
            }
        }

        let directory = Directory::fetch(self.transport, root_url)?;
        if stored.is_some() {
            self.store.set_directory(&directory)?;
        } else {
            info!(root_url, "storing new directory");
            self.store.new_directory(&directory)?;
        }
        Ok(directory)
    }

    pub fn refresh(&self, root_url: &str) -> Result<Directory> {
        self.get(root_url, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ClientConfig, error::Error, store::tests::mem_store};

    #[test]
    fn test_all_endpoints_populated() {
        let resource: DirectoryResource = serde_json::from_str(
            r#"{
                "new-reg": "https://ca.test/new-reg",
                "recover-reg": "https://ca.test/recover-reg",
                "new-authz": "https://ca.test/new-authz",
                "new-cert": "https://ca.test/new-cert",
                "revoke-cert": "https://ca.test/revoke-cert"
            }"#,
        )
        .unwrap();
        assert_eq!(resource.new_reg, "https://ca.test/new-reg");
        assert_eq!(resource.recover_reg, "https://ca.test/recover-reg");
        assert_eq!(resource.new_authz, "https://ca.test/new-authz");
        assert_eq!(resource.new_cert, "https://ca.test/new-cert");
        assert_eq!(resource.revoke_cert, "https://ca.test/revoke-cert");
    }

    #[test]
    fn test_missing_key_is_empty() {
        let directory = Directory {
            root_url: "https://ca.test/directory".into(),
            resource: serde_json::from_str(r#"{"new-reg": "https://ca.test/new-reg"}"#).unwrap(),
        };
        assert_eq!(directory.resource.new_authz, "");
        assert_eq!(directory.endpoint(Endpoint::NewAuthorization), None);
        assert!(matches!(
            directory.require(Endpoint::NewAuthorization),
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            directory.endpoint(Endpoint::NewRegistration),
            Some("https://ca.test/new-reg")
        );
    }

    #[test]
    fn test_catalog_fetches_once_until_refresh() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/directory")
            .with_body(r#"{"new-authz": "https://ca.test/new-authz"}"#)
            .expect(2)
            .create();

        let transport = Transport::new(&ClientConfig::default()).unwrap();
        let store = mem_store();
        let catalog = DirectoryCatalog::new(&transport, &store);
        let root = format!("{}/directory", server.url());

        let first = catalog.get(&root, false).unwrap();
        let second = catalog.get(&root, false).unwrap();
        assert_eq!(first, second);
        catalog.refresh(&root).unwrap();
        mock.assert();
    }

    #[test]
    fn test_malformed_directory_is_protocol_error() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/directory").with_body("not json").create();

        let transport = Transport::new(&ClientConfig::default()).unwrap();
        let err = Directory::fetch(&transport, &format!("{}/directory", server.url())).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
