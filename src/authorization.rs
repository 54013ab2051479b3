//! 網域授權的資料模型與狀態機。
//!
//! 授權由伺服器建立並推進狀態；客戶端只透過送出挑戰回應來推動，
//! 其餘時間以 GET 刷新本地記錄。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, thread,
};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::{
    challenge::{responder_for, Challenge, ChallengeData, ChallengeResponder, VerificationClient},
    config::ClientConfig,
    directory::{DirectoryCatalog, Endpoint},
    error::{Error, Result},
    registration::Registration,
    resource::{AuthorizationTag, NewAuthorizationTag},
    store::{AuthorizationInfo, PersistentStore},
    transport::Transport,
};

const DNS_IDENTIFIER: &str = "dns";

/// `{"type": "dns", "value": <name>}` 形式的識別子。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsIdentifier(pub String);

impl Serialize for DnsIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Identifier {
            kind: DNS_IDENTIFIER.to_string(),
            value: self.0.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DnsIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let identifier = Identifier::deserialize(deserializer)?;
        if identifier.kind != DNS_IDENTIFIER {
            return Err(de::Error::custom(format!(
                "unsupported identifier type {:?}",
                identifier.kind
            )));
        }
        Ok(DnsIdentifier(identifier.value))
    }
}

#[derive(Serialize, Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

/// 授權狀態。
///
/// 線上的 `"pending"`、空字串或缺少欄位都解碼為 [`Pending`](Self::Pending)，
/// 編碼時一律寫出 `"pending"`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthorizationStatus {
    #[default]
    Pending,
    Unknown,
    Processing,
    Valid,
    Invalid,
    Revoked,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Unknown => "unknown",
            AuthorizationStatus::Processing => "processing",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Revoked => "revoked",
        }
    }

    pub fn is_pending(&self) -> bool {
        *self == AuthorizationStatus::Pending
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthorizationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthorizationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        match value.as_str() {
            "" | "pending" => Ok(AuthorizationStatus::Pending),
            "unknown" => Ok(AuthorizationStatus::Unknown),
            "processing" => Ok(AuthorizationStatus::Processing),
            "valid" => Ok(AuthorizationStatus::Valid),
            "invalid" => Ok(AuthorizationStatus::Invalid),
            "revoked" => Ok(AuthorizationStatus::Revoked),
            other => Err(de::Error::custom(format!(
                "unknown authorization status {:?}",
                other
            ))),
        }
    }
}

/// 伺服器上的授權資源。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResource {
    #[serde(default)]
    pub resource: AuthorizationTag,
    pub identifier: DnsIdentifier,
    #[serde(default)]
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub challenges: Vec<Challenge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub combinations: Vec<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// 本地保存的授權記錄。
///
/// `registration` 為所屬帳戶的名稱；`challenge_data` 以挑戰 URI 為鍵，
/// 保存已推導或已送出的回應資料。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub location: String,
    pub registration: String,
    pub resource: AuthorizationResource,
    #[serde(default)]
    pub challenge_data: BTreeMap<String, ChallengeData>,
}

impl Authorization {
    pub fn dns(&self) -> &str {
        &self.resource.identifier.0
    }

    /// 組合中每個索引都已驗證或位於 `trying` 中時可行。
    ///
    /// 超出範圍的索引使該組合不可行。
    pub fn combination_possible(&self, combination: &[usize], trying: &BTreeSet<usize>) -> bool {
        combination.iter().all(|&index| {
            trying.contains(&index)
                || self
                    .resource
                    .challenges
                    .get(index)
                    .is_some_and(Challenge::is_validated)
        })
    }

    /// 至少有一個組合可行。
    pub fn is_satisfiable(&self, trying: &BTreeSet<usize>) -> bool {
        self.resource
            .combinations
            .iter()
            .any(|combination| self.combination_possible(combination, trying))
    }

    pub fn challenge_index(&self, uri: &str) -> Option<usize> {
        if uri.is_empty() {
            return None;
        }
        self.resource
            .challenges
            .iter()
            .position(|challenge| challenge.uri() == uri)
    }
}

#[derive(Serialize)]
struct NewAuthorizationPayload {
    resource: NewAuthorizationTag,
    identifier: DnsIdentifier,
}

/// 輪詢的結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 狀態已離開 pending。
    Finished(AuthorizationStatus),
    /// 次數用盡仍為 pending。
    TimedOut,
}

/// 授權的建立、刷新、挑戰回應與輪詢。
pub struct AuthorizationEngine<'a> {
    transport: &'a Transport,
    store: &'a dyn PersistentStore,
    config: &'a ClientConfig,
}

impl<'a> AuthorizationEngine<'a> {
    pub fn new(
        transport: &'a Transport,
        store: &'a dyn PersistentStore,
        config: &'a ClientConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }

    /// 向 new-authz 端點為 `dns` 申請新的授權並儲存。
    pub fn create(&self, registration: &Registration, dns: &str) -> Result<Authorization> {
        let directory = DirectoryCatalog::new(self.transport, self.store)
            .get(&registration.directory_url, false)?;
        let url = directory.require(Endpoint::NewAuthorization)?;
        let payload = NewAuthorizationPayload {
            resource: NewAuthorizationTag,
            identifier: DnsIdentifier(dns.to_string()),
        };

        let response =
            self.transport
                .post_signed(url, &registration.signing_key, &payload, None)?;
        let location = response.require_location()?;
        let resource: AuthorizationResource = response.json()?;

        let authorization = Authorization {
            location,
            registration: registration.name.clone(),
            resource,
            challenge_data: BTreeMap::new(),
        };
        self.store.new_authorization(&authorization)?;
        info!(dns, location = %authorization.location, "authorization created");
        Ok(authorization)
    }

    /// 以 GET 取回伺服器狀態並覆寫資源；已保存的挑戰資料保留。
    pub fn refresh(&self, authorization: &mut Authorization) -> Result<()> {
        let resource: AuthorizationResource =
            self.transport.get(&authorization.location, None)?.json()?;
        debug!(
            location = %authorization.location,
            from = %authorization.resource.status,
            to = %resource.status,
            "authorization refreshed"
        );
        authorization.resource = resource;
        self.store.set_authorization(authorization)
    }

    /// 為第 `index` 個挑戰建立回應器，並帶入先前保存的回應資料。
    pub fn respond(
        &self,
        authorization: &Authorization,
        registration: &Registration,
        index: usize,
    ) -> Result<Box<dyn ChallengeResponder>> {
        if authorization.registration != registration.name {
            return Err(Error::InvalidState(format!(
                "authorization {} belongs to registration {:?}, not {:?}",
                authorization.location, authorization.registration, registration.name
            )));
        }
        let challenge = authorization.resource.challenges.get(index).ok_or_else(|| {
            Error::InvalidState(format!(
                "authorization {} has no challenge with index {}",
                authorization.location, index
            ))
        })?;

        let previous = authorization.challenge_data.get(challenge.uri());
        let client = VerificationClient::new(self.config.http_timeout)?;
        responder_for(
            challenge,
            authorization.dns(),
            &registration.signing_key,
            previous,
            client,
        )
    }

    /// 保存回應器目前的回應資料；挑戰必須屬於此授權。
    pub fn save_challenge_data(
        &self,
        authorization: &mut Authorization,
        responder: &dyn ChallengeResponder,
    ) -> Result<()> {
        let uri = &responder.challenge().uri;
        if authorization.challenge_index(uri).is_none() {
            return Err(Error::InvalidState(format!(
                "challenge {:?} doesn't belong to authorization {}",
                uri, authorization.location
            )));
        }
        authorization
            .challenge_data
            .insert(uri.clone(), responder.challenge_data());
        self.store.set_authorization(authorization)
    }

    /// 保存回應資料、送往挑戰 URI，再刷新授權。
    pub fn update_challenge(
        &self,
        authorization: &mut Authorization,
        registration: &Registration,
        responder: &dyn ChallengeResponder,
    ) -> Result<()> {
        self.save_challenge_data(authorization, responder)?;

        let uri = responder.challenge().uri.clone();
        let payload = responder.send_payload()?;
        self.transport
            .post_signed(&uri, &registration.signing_key, &payload, None)?;
        info!(uri, dns = authorization.dns(), "challenge response submitted");

        self.refresh(authorization)
    }

    pub fn load_by_url(
        &self,
        registration: &Registration,
        url: &str,
    ) -> Result<Option<Authorization>> {
        self.store.load_authorization_by_url(&registration.name, url)
    }

    /// 取得網域最新可用的授權；`refresh` 時先同步伺服器的授權清單再刷新找到的記錄。
    pub fn get_by_dns(
        &self,
        registration: &Registration,
        dns: &str,
        refresh: bool,
    ) -> Result<Option<Authorization>> {
        if refresh {
            self.fetch_all(registration, false)?;
        }
        let mut found = self
            .store
            .load_authorization_by_dns(&registration.name, dns)?;
        if refresh {
            if let Some(authorization) = found.as_mut() {
                self.refresh(authorization)?;
            }
        }
        Ok(found)
    }

    /// 沿用網域最新可用的授權，沒有時建立新的。
    pub fn authorize_dns(&self, registration: &Registration, dns: &str) -> Result<Authorization> {
        match self.get_by_dns(registration, dns, true)? {
            Some(authorization) => {
                debug!(dns, location = %authorization.location, "reusing authorization");
                Ok(authorization)
            }
            None => self.create(registration, dns),
        }
    }

    /// 匯入伺服器上的授權；已存在時依 `refresh` 決定是否刷新。
    pub fn import_by_url(
        &self,
        registration: &Registration,
        url: &str,
        refresh: bool,
    ) -> Result<Authorization> {
        if let Some(mut authorization) = self.load_by_url(registration, url)? {
            if refresh {
                self.refresh(&mut authorization)?;
            }
            return Ok(authorization);
        }

        let resource: AuthorizationResource = self.transport.get(url, None)?.json()?;
        let authorization = Authorization {
            location: url.to_string(),
            registration: registration.name.clone(),
            resource,
            challenge_data: BTreeMap::new(),
        };
        self.store.new_authorization(&authorization)?;
        info!(url, dns = authorization.dns(), "authorization imported");
        Ok(authorization)
    }

    /// 匯入帳戶 `authorizations` 清單中的所有授權。
    pub fn fetch_all(&self, registration: &Registration, update_all: bool) -> Result<()> {
        let urls = self
            .transport
            .get_list(&registration.resource.authorizations, "authorizations")?;
        for url in urls {
            self.import_by_url(registration, &url, update_all)?;
        }
        Ok(())
    }

    pub fn infos(
        &self,
        registration: &Registration,
        status: Option<AuthorizationStatus>,
    ) -> Result<Vec<AuthorizationInfo>> {
        self.store.authorization_infos(&registration.name, status)
    }

    /// 依設定的次數與間隔刷新，直到狀態離開 pending。
    ///
    /// 刷新失敗只記錄警告，不中斷輪詢。
    pub fn poll(&self, authorization: &mut Authorization) -> PollOutcome {
        for attempt in 0..self.config.poll_attempts {
            if !authorization.resource.status.is_pending() {
                break;
            }
            thread::sleep(self.config.poll_interval);
            if let Err(e) = self.refresh(authorization) {
                warn!(
                    location = %authorization.location,
                    attempt,
                    error = %e,
                    "failed to refresh authorization"
                );
            }
        }

        match authorization.resource.status {
            AuthorizationStatus::Pending => PollOutcome::TimedOut,
            status => PollOutcome::Finished(status),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use mockito::Matcher;
    use reqwest::blocking::Client;
    use serde_json::json;

    use super::*;
    use crate::{
        challenge::{TokenChallenge, HTTP01},
        directory::{Directory, DirectoryResource},
        nonce::MockNonce,
        registration::tests::sample_registration,
        store::tests::mem_store,
    };

    pub(crate) fn sample_authorization(registration: &str, dns: &str) -> Authorization {
        Authorization {
            location: "https://ca.test/authz/1".into(),
            registration: registration.to_string(),
            resource: AuthorizationResource {
                identifier: DnsIdentifier(dns.to_string()),
                status: AuthorizationStatus::Pending,
                challenges: vec![Challenge::Http01(TokenChallenge {
                    kind: HTTP01.into(),
                    uri: "https://ca.test/challenge/1".into(),
                    token: "tok".into(),
                    ..Default::default()
                })],
                combinations: vec![vec![0]],
                expires: Some(Utc::now() + ChronoDuration::days(7)),
                ..Default::default()
            },
            challenge_data: BTreeMap::new(),
        }
    }

    fn transport() -> Transport {
        Transport::with_nonce_source(Client::new(), Box::new(MockNonce::new("nonce")))
    }

    fn quick_config() -> ClientConfig {
        ClientConfig::builder()
            .polling(3, Duration::ZERO)
            .http_timeout(Duration::from_secs(5))
            .build()
    }

    fn pending_body(server: &mockito::Server, status: &str) -> String {
        json!({
            "resource": "authz",
            "identifier": {"type": "dns", "value": "example.com"},
            "status": status,
            "challenges": [
                {"type": "http-01", "uri": format!("{}/challenge/1", server.url()), "token": "tok"}
            ],
            "combinations": [[0]]
        })
        .to_string()
    }

    fn seed_directory(store: &dyn PersistentStore, server: &mockito::Server) -> String {
        let root_url = format!("{}/directory", server.url());
        store
            .new_directory(&Directory {
                root_url: root_url.clone(),
                resource: DirectoryResource {
                    new_authz: format!("{}/new-authz", server.url()),
                    ..Default::default()
                },
            })
            .unwrap();
        root_url
    }

    #[test]
    fn test_status_pending_asymmetry() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default)]
            status: AuthorizationStatus,
        }
        for raw in [r#"{"status":"pending"}"#, r#"{"status":""}"#, r#"{}"#] {
            let holder: Holder = serde_json::from_str(raw).unwrap();
            assert_eq!(holder.status, AuthorizationStatus::Pending);
        }
        assert_eq!(
            serde_json::to_string(&AuthorizationStatus::Pending).unwrap(),
            r#""pending""#
        );
        assert_eq!(
            serde_json::from_str::<AuthorizationStatus>(r#""valid""#).unwrap(),
            AuthorizationStatus::Valid
        );
        assert!(serde_json::from_str::<AuthorizationStatus>(r#""done""#).is_err());
    }

    #[test]
    fn test_identifier_must_be_dns() {
        let ok: DnsIdentifier =
            serde_json::from_value(json!({"type": "dns", "value": "example.com"})).unwrap();
        assert_eq!(ok, DnsIdentifier("example.com".into()));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "dns", "value": "example.com"})
        );
        assert!(
            serde_json::from_value::<DnsIdentifier>(json!({"type": "ip", "value": "1.2.3.4"}))
                .is_err()
        );
    }

    #[test]
    fn test_combination_satisfiability() {
        let validated = |validated: &str| {
            Challenge::Dvsni(TokenChallenge {
                kind: "dvsni".into(),
                validated: validated.into(),
                ..Default::default()
            })
        };
        let mut auth = sample_authorization("main", "example.com");
        auth.resource.combinations = vec![vec![0], vec![1, 2]];
        auth.resource.challenges = vec![
            validated(""),
            validated("2015-01-01T00:00:00Z"),
            validated("2015-01-01T00:00:00Z"),
        ];
        assert!(auth.is_satisfiable(&BTreeSet::new()));

        auth.resource.challenges[2] = validated("");
        assert!(!auth.is_satisfiable(&BTreeSet::new()));
        assert!(auth.is_satisfiable(&BTreeSet::from([2])));
        assert!(auth.is_satisfiable(&BTreeSet::from([0])));

        auth.resource.combinations = vec![vec![5]];
        assert!(!auth.is_satisfiable(&BTreeSet::new()));
    }

    #[test]
    fn test_create_stores_pending_authorization() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/new-authz")
            .match_body(Matcher::Regex("protected".into()))
            .with_status(201)
            .with_header("Location", &format!("{}/authz/9", server.url()))
            .with_body(pending_body(&server, "pending"))
            .create();

        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let mut reg = sample_registration("main");
        reg.directory_url = seed_directory(&store, &server);

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let auth = engine.create(&reg, "example.com").unwrap();
        mock.assert();

        assert_eq!(auth.location, format!("{}/authz/9", server.url()));
        assert_eq!(auth.resource.status, AuthorizationStatus::Pending);
        assert_eq!(auth.dns(), "example.com");
        assert_eq!(engine.load_by_url(&reg, &auth.location).unwrap(), Some(auth));
    }

    #[test]
    fn test_create_without_location_fails() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/new-authz")
            .with_status(201)
            .with_body(pending_body(&server, "pending"))
            .create();

        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let mut reg = sample_registration("main");
        reg.directory_url = seed_directory(&store, &server);

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let err = engine.create(&reg, "example.com").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(engine.infos(&reg, None).unwrap().is_empty());
    }

    #[test]
    fn test_refresh_keeps_challenge_data() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/authz/1")
            .with_body(pending_body(&server, "valid"))
            .create();

        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let reg = sample_registration("main");
        let mut auth = sample_authorization("main", "example.com");
        auth.location = format!("{}/authz/1", server.url());
        store.new_authorization(&auth).unwrap();

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let responder = engine.respond(&auth, &reg, 0).unwrap();
        engine.save_challenge_data(&mut auth, responder.as_ref()).unwrap();
        engine.refresh(&mut auth).unwrap();

        assert_eq!(auth.resource.status, AuthorizationStatus::Valid);
        assert!(auth.challenge_data.contains_key("https://ca.test/challenge/1"));
        assert_eq!(engine.load_by_url(&reg, &auth.location).unwrap(), Some(auth));
    }

    #[test]
    fn test_save_rejects_foreign_challenge() {
        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let reg = sample_registration("main");
        let mut auth = sample_authorization("main", "example.com");
        store.new_authorization(&auth).unwrap();

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let responder = engine.respond(&auth, &reg, 0).unwrap();
        auth.resource.challenges.clear();
        let err = engine
            .save_challenge_data(&mut auth, responder.as_ref())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(matches!(
            engine.respond(&auth, &reg, 0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_respond_checks_owner() {
        let transport = transport();
        let store = mem_store();
        let config = quick_config();
        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let auth = sample_authorization("main", "example.com");
        assert!(matches!(
            engine.respond(&auth, &sample_registration("other"), 0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_poll_times_out_and_finishes() {
        let mut server = mockito::Server::new();
        let still_pending = server
            .mock("GET", "/authz/1")
            .with_body(pending_body(&server, "pending"))
            .expect(3)
            .create();

        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let mut auth = sample_authorization("main", "example.com");
        auth.location = format!("{}/authz/1", server.url());
        store.new_authorization(&auth).unwrap();

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        assert_eq!(engine.poll(&mut auth), PollOutcome::TimedOut);
        still_pending.assert();
        still_pending.remove();

        let _valid = server
            .mock("GET", "/authz/1")
            .with_body(pending_body(&server, "invalid"))
            .create();
        assert_eq!(
            engine.poll(&mut auth),
            PollOutcome::Finished(AuthorizationStatus::Invalid)
        );
        assert_eq!(
            engine.poll(&mut auth),
            PollOutcome::Finished(AuthorizationStatus::Invalid)
        );
    }

    #[test]
    fn test_fetch_all_and_lookup_by_dns() {
        let mut server = mockito::Server::new();
        let _list = server
            .mock("GET", "/reg/1/authz")
            .with_body(json!({"authorizations": [format!("{}/authz/5", server.url())]}).to_string())
            .create();
        let remote = server
            .mock("GET", "/authz/5")
            .with_body(pending_body(&server, "valid"))
            .expect(2)
            .create();
        let create = server.mock("POST", "/new-authz").expect(0).create();

        let store = mem_store();
        let transport = transport();
        let config = quick_config();
        let mut reg = sample_registration("main");
        reg.directory_url = seed_directory(&store, &server);
        reg.resource.authorizations = format!("{}/reg/1/authz", server.url());

        let engine = AuthorizationEngine::new(&transport, &store, &config);
        let auth = engine.authorize_dns(&reg, "example.com").unwrap();
        remote.assert();
        create.assert();

        assert_eq!(auth.location, format!("{}/authz/5", server.url()));
        assert_eq!(auth.resource.status, AuthorizationStatus::Valid);
        assert_eq!(
            engine
                .infos(&reg, Some(AuthorizationStatus::Valid))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.get_by_dns(&reg, "other.com", false).unwrap(), None);
    }
}
