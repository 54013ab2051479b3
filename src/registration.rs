use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    directory::{Directory, Endpoint},
    error::{Error, Result},
    key_pair::SigningKey,
    resource::{NewRegistrationTag, RegistrationTag},
    store::PersistentStore,
    transport::{HttpResponse, Transport},
    ui::UserInterface,
};

/// 伺服器上的帳戶資源。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegistrationResource {
    #[serde(default)]
    pub resource: RegistrationTag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    /// 已同意的服務條款 URL。
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agreement: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authorizations: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificates: String,
}

/// 本地保存的帳戶記錄。
///
/// `name` 為本地別名，建立後不可變更；`signing_key` 只在建立時產生一次。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Registration {
    pub name: String,
    /// 所屬目錄的根 URL。
    pub directory_url: String,
    pub location: String,
    pub resource: RegistrationResource,
    #[serde(default)]
    pub terms_of_service: String,
    #[serde(default)]
    pub recovery_token: String,
    pub signing_key: SigningKey,
}

impl Registration {
    /// 尚未同意的服務條款連結；`force` 為真時即使已同意也回傳。
    pub fn terms_offer(&self, force: bool) -> Option<&str> {
        let tos = self.terms_of_service.as_str();
        if tos.is_empty() {
            return None;
        }
        if force || self.resource.agreement != tos {
            Some(tos)
        } else {
            None
        }
    }
}

#[derive(Serialize)]
struct NewRegistrationPayload {
    resource: NewRegistrationTag,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    contact: Vec<String>,
}

/// 更新帳戶時的 payload；有明確指定的 `contact` 即使為空也會送出，用來清除聯絡方式。
#[derive(Serialize)]
struct UpdateRegistrationPayload {
    resource: RegistrationTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<Vec<String>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    agreement: String,
}

/// 帳戶的建立、刷新與更新。
pub struct AccountRegistrar<'a> {
    transport: &'a Transport,
    store: &'a dyn PersistentStore,
}

impl<'a> AccountRegistrar<'a> {
    pub fn new(transport: &'a Transport, store: &'a dyn PersistentStore) -> Self {
        Self { transport, store }
    }

    /// 向目錄的 new-reg 端點註冊新帳戶並儲存。
    ///
    /// 名稱已存在時直接回傳 `Error::Conflict`，不發出任何請求。
    pub fn create(
        &self,
        directory: &Directory,
        name: &str,
        signing_key: SigningKey,
        contact: Vec<String>,
    ) -> Result<Registration> {
        if name.is_empty() {
            return Err(Error::InvalidState("registration name must not be empty".into()));
        }
        if self.store.load_registration(name)?.is_some() {
            return Err(Error::Conflict(format!(
                "there already is a registration with name {:?}",
                name
            )));
        }

        let url = directory.require(Endpoint::NewRegistration)?;
        let payload = NewRegistrationPayload {
            resource: NewRegistrationTag,
            contact,
        };
        let response = self.transport.post_signed(url, &signing_key, &payload, None)?;

        let previous = Registration {
            name: name.to_string(),
            directory_url: directory.root_url.clone(),
            location: String::new(),
            resource: RegistrationResource::default(),
            terms_of_service: String::new(),
            recovery_token: String::new(),
            signing_key,
        };
        let registration = Self::merge_response(url, &previous, response)?;

        self.store.new_registration(&registration)?;
        info!(name, location = %registration.location, "registration created");
        Ok(registration)
    }

    pub fn load(&self, name: &str) -> Result<Option<Registration>> {
        self.store.load_registration(name)
    }

    /// 以空 payload 的簽章 POST 取得伺服器端的帳戶狀態。
    pub fn refresh(&self, registration: &mut Registration) -> Result<()> {
        let payload = RegistrationResource::default();
        self.send(registration, &payload)
    }

    /// 只合併有提供的欄位後重新送出；兩者皆為 `None` 時不做任何事。
    pub fn update(
        &self,
        registration: &mut Registration,
        contact: Option<Vec<String>>,
        agreement: Option<String>,
    ) -> Result<()> {
        if contact.is_none() && agreement.is_none() {
            return Ok(());
        }

        let current = &registration.resource;
        let contact = match contact {
            Some(contact) => Some(contact),
            None if current.contact.is_empty() => None,
            None => Some(current.contact.clone()),
        };
        let payload = UpdateRegistrationPayload {
            resource: RegistrationTag,
            contact,
            agreement: agreement.unwrap_or_else(|| current.agreement.clone()),
        };
        self.send(registration, &payload)
    }

    /// 將目前的服務條款連結設為已同意。
    pub fn accept_terms(&self, registration: &mut Registration) -> Result<()> {
        if registration.terms_of_service.is_empty() {
            return Err(Error::InvalidState(
                "server did not offer any terms of service".into(),
            ));
        }
        let tos = registration.terms_of_service.clone();
        self.update(registration, None, Some(tos))
    }

    /// 顯示服務條款並詢問是否同意；`auto_agree` 時不詢問直接同意。
    ///
    /// 回傳帳戶是否同意了目前的服務條款。
    pub fn review_terms(
        &self,
        registration: &mut Registration,
        ui: &dyn UserInterface,
        force: bool,
        auto_agree: bool,
    ) -> Result<bool> {
        let Some(tos) = registration.terms_offer(force).map(str::to_string) else {
            return Ok(!registration.terms_of_service.is_empty()
                && registration.resource.agreement == registration.terms_of_service);
        };

        let agree = auto_agree
            || ui.yes_no(
                "Terms of service",
                &format!("Do you agree to the terms of service at {}?", tos),
                false,
            )?;
        if agree {
            self.accept_terms(registration)?;
        }
        Ok(agree)
    }

    fn send<P: Serialize>(&self, registration: &mut Registration, payload: &P) -> Result<()> {
        let url = registration.location.clone();
        if url.is_empty() {
            return Err(Error::InvalidState(format!(
                "registration {:?} has no location",
                registration.name
            )));
        }

        let response =
            self.transport
                .post_signed(&url, &registration.signing_key, payload, None)?;
        let updated = Self::merge_response(&url, registration, response)?;
        self.store.set_registration(&updated)?;
        debug!(name = %updated.name, "registration updated");
        *registration = updated;
        Ok(())
    }

    /// 以回應內容建立新的帳戶記錄，本地專屬欄位沿用舊記錄。
    fn merge_response(
        url: &str,
        previous: &Registration,
        response: HttpResponse,
    ) -> Result<Registration> {
        let resource: RegistrationResource = response.json()?;

        let location = match &response.location {
            Some(location) if previous.location != url => location.clone(),
            _ => previous.location.clone(),
        };
        if location.is_empty() {
            return Err(Error::protocol(url, "invalid registration location"));
        }

        let terms_of_service = response
            .link("terms-of-service")
            .map(str::to_string)
            .unwrap_or_else(|| previous.terms_of_service.clone());

        Ok(Registration {
            name: previous.name.clone(),
            directory_url: previous.directory_url.clone(),
            location,
            resource,
            terms_of_service,
            recovery_token: previous.recovery_token.clone(),
            signing_key: previous.signing_key.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use reqwest::blocking::Client;

    use super::*;
    use crate::{
        directory::DirectoryResource,
        key_pair::{Curve, KeyType},
        nonce::MockNonce,
        store::tests::mem_store,
        ui::tests::ScriptedUi,
    };
    use mockito::Matcher;

    pub(crate) fn sample_registration(name: &str) -> Registration {
        Registration {
            name: name.to_string(),
            directory_url: "https://ca.test/directory".into(),
            location: "https://ca.test/reg/1".into(),
            resource: RegistrationResource {
                contact: vec!["mailto:admin@example.com".into()],
                ..Default::default()
            },
            terms_of_service: "https://ca.test/terms".into(),
            recovery_token: "recovery".into(),
            signing_key: SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap(),
        }
    }

    fn transport() -> Transport {
        Transport::with_nonce_source(Client::new(), Box::new(MockNonce::new("nonce")))
    }

    fn directory(server: &mockito::Server) -> Directory {
        Directory {
            root_url: format!("{}/directory", server.url()),
            resource: DirectoryResource {
                new_reg: format!("{}/new-reg", server.url()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_create_stores_registration() {
        let mut server = mockito::Server::new();
        let location = format!("{}/reg/7", server.url());
        let mock = server
            .mock("POST", "/new-reg")
            .match_body(Matcher::Regex("protected".into()))
            .with_status(201)
            .with_header("Location", &location)
            .with_header("Link", r#"<https://ca.test/terms>;rel="terms-of-service""#)
            .with_body(r#"{"resource":"reg","contact":["mailto:a@example.com"]}"#)
            .create();

        let store = mem_store();
        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let reg = registrar
            .create(
                &directory(&server),
                "main",
                key.clone(),
                vec!["mailto:a@example.com".into()],
            )
            .unwrap();
        mock.assert();

        assert_eq!(reg.location, location);
        assert_eq!(reg.terms_of_service, "https://ca.test/terms");
        assert_eq!(reg.signing_key, key);
        assert_eq!(registrar.load("main").unwrap(), Some(reg));
    }

    #[test]
    fn test_create_rejects_duplicate_name_before_sending() {
        let mut server = mockito::Server::new();
        let mock = server.mock("POST", "/new-reg").expect(0).create();

        let store = mem_store();
        store.new_registration(&sample_registration("main")).unwrap();
        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let err = registrar
            .create(&directory(&server), "main", key, vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        mock.assert();
    }

    #[test]
    fn test_create_without_location_fails() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/new-reg")
            .with_status(201)
            .with_body(r#"{"resource":"reg"}"#)
            .create();

        let store = mem_store();
        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let err = registrar
            .create(&directory(&server), "main", key, vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(store.load_registration("main").unwrap(), None);
    }

    #[test]
    fn test_update_without_changes_is_noop() {
        let store = mem_store();
        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        let mut reg = sample_registration("main");
        let before = reg.clone();
        registrar.update(&mut reg, None, None).unwrap();
        assert_eq!(reg, before);
    }

    #[test]
    fn test_update_merges_and_keeps_local_fields() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/reg/1")
            .with_status(202)
            .with_body(
                r#"{"resource":"reg","contact":["mailto:admin@example.com"],"agreement":"https://ca.test/terms"}"#,
            )
            .create();

        let store = mem_store();
        let mut reg = sample_registration("main");
        reg.location = format!("{}/reg/1", server.url());
        store.new_registration(&reg).unwrap();

        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        registrar
            .update(&mut reg, None, Some("https://ca.test/terms".into()))
            .unwrap();
        mock.assert();

        assert_eq!(reg.resource.agreement, "https://ca.test/terms");
        assert_eq!(reg.resource.contact, vec!["mailto:admin@example.com"]);
        assert_eq!(reg.recovery_token, "recovery");
        assert_eq!(reg.name, "main");
        assert_eq!(reg.location, format!("{}/reg/1", server.url()));
        assert_eq!(store.load_registration("main").unwrap(), Some(reg));
    }

    #[test]
    fn test_refresh_sends_bare_resource() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/reg/1")
            .with_status(200)
            .with_header("Location", "https://elsewhere.test/reg/1")
            .with_body(r#"{"resource":"reg","authorizations":"https://ca.test/reg/1/authz"}"#)
            .create();

        let store = mem_store();
        let mut reg = sample_registration("main");
        reg.location = format!("{}/reg/1", server.url());
        store.new_registration(&reg).unwrap();

        let transport = transport();
        AccountRegistrar::new(&transport, &store)
            .refresh(&mut reg)
            .unwrap();
        mock.assert();

        assert_eq!(reg.location, format!("{}/reg/1", server.url()));
        assert_eq!(reg.resource.authorizations, "https://ca.test/reg/1/authz");
        assert!(reg.resource.contact.is_empty());
    }

    #[test]
    fn test_update_can_clear_contacts() {
        let mut server = mockito::Server::new();
        let expected = crate::jws::b64url(r#"{"resource":"reg","contact":[]}"#);
        let mock = server
            .mock("POST", "/reg/1")
            .match_body(Matcher::PartialJson(serde_json::json!({ "payload": expected })))
            .with_status(202)
            .with_body(r#"{"resource":"reg"}"#)
            .create();

        let store = mem_store();
        let mut reg = sample_registration("main");
        reg.location = format!("{}/reg/1", server.url());
        store.new_registration(&reg).unwrap();

        let transport = transport();
        AccountRegistrar::new(&transport, &store)
            .update(&mut reg, Some(vec![]), None)
            .unwrap();
        mock.assert();
        assert!(reg.resource.contact.is_empty());
    }

    #[test]
    fn test_terms_offer() {
        let mut reg = sample_registration("main");
        assert_eq!(reg.terms_offer(false), Some("https://ca.test/terms"));
        reg.resource.agreement = "https://ca.test/terms".into();
        assert_eq!(reg.terms_offer(false), None);
        assert_eq!(reg.terms_offer(true), Some("https://ca.test/terms"));
        reg.terms_of_service.clear();
        assert_eq!(reg.terms_offer(true), None);
    }

    #[test]
    fn test_review_terms_declined_sends_nothing() {
        let store = mem_store();
        let transport = transport();
        let registrar = AccountRegistrar::new(&transport, &store);
        let mut reg = sample_registration("main");
        let ui = ScriptedUi::new(&["n"]);
        assert!(!registrar.review_terms(&mut reg, &ui, false, false).unwrap());
        assert!(reg.resource.agreement.is_empty());
        assert!(ui.shown.borrow()[0].contains("https://ca.test/terms"));
    }
}
