//! 網域控制權挑戰。
//!
//! 伺服器回傳的挑戰依 `type` 欄位分派為 http-01、simpleHttp、dvsni 或未知類型；
//! 每個可自動化的類型各有一個 [`ChallengeResponder`] 實作，負責推導、顯示、
//! 自我驗證並產生送出的回應資料。

pub mod dvsni;
pub mod http01;
pub mod simple_http;

use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use reqwest::{blocking::Client, header::CONTENT_TYPE, StatusCode};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    jws::Jws,
    key_pair::SigningKey,
    resource::ChallengeTag,
    ui::UserInterface,
};

pub use dvsni::{DvsniData, DvsniResponder};
pub use http01::{Http01Data, Http01Responder};
pub use simple_http::{SimpleHttpData, SimpleHttpResponder};

pub const HTTP01: &str = "http-01";
pub const SIMPLE_HTTP: &str = "simpleHttp";
pub const DVSNI: &str = "dvsni";

/// 帶 token 的挑戰欄位，三種已知類型共用。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenChallenge {
    #[serde(default)]
    pub resource: ChallengeTag,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// 驗證完成時間，未驗證時為空字串。
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub validated: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// 依 `type` 分派的挑戰。未知類型保留所有原始欄位以便原樣寫回。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Http01(TokenChallenge),
    SimpleHttp(TokenChallenge),
    Dvsni(TokenChallenge),
    Unknown(Map<String, Value>),
}

impl Challenge {
    fn token_challenge(&self) -> Option<&TokenChallenge> {
        match self {
            Challenge::Http01(c) | Challenge::SimpleHttp(c) | Challenge::Dvsni(c) => Some(c),
            Challenge::Unknown(_) => None,
        }
    }

    fn unknown_field(&self, name: &str) -> &str {
        match self {
            Challenge::Unknown(map) => map.get(name).and_then(Value::as_str).unwrap_or(""),
            _ => "",
        }
    }

    pub fn kind(&self) -> &str {
        match self.token_challenge() {
            Some(c) => &c.kind,
            None => self.unknown_field("type"),
        }
    }

    pub fn status(&self) -> &str {
        match self.token_challenge() {
            Some(c) => &c.status,
            None => self.unknown_field("status"),
        }
    }

    pub fn validated(&self) -> &str {
        match self.token_challenge() {
            Some(c) => &c.validated,
            None => self.unknown_field("validated"),
        }
    }

    pub fn uri(&self) -> &str {
        match self.token_challenge() {
            Some(c) => &c.uri,
            None => self.unknown_field("uri"),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token_challenge().map(|c| c.token.as_str())
    }

    pub fn is_validated(&self) -> bool {
        !self.validated().is_empty()
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::deserialize(deserializer)?;
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let token = |map: Map<String, Value>| {
            serde_json::from_value::<TokenChallenge>(Value::Object(map))
                .map_err(<D::Error as de::Error>::custom)
        };
        match kind.as_str() {
            HTTP01 => token(map).map(Challenge::Http01),
            SIMPLE_HTTP => token(map).map(Challenge::SimpleHttp),
            DVSNI => token(map).map(Challenge::Dvsni),
            _ => Ok(Challenge::Unknown(map)),
        }
    }
}

impl Serialize for Challenge {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Challenge::Http01(c) | Challenge::SimpleHttp(c) | Challenge::Dvsni(c) => {
                c.serialize(serializer)
            }
            Challenge::Unknown(map) => {
                let mut map = map.clone();
                map.insert("resource".into(), Value::from(ChallengeTag::VALUE));
                map.serialize(serializer)
            }
        }
    }
}

/// 送往挑戰 URI 的回應資料，與挑戰類型一對一，並持久化保存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChallengeData {
    #[serde(rename = "http-01")]
    Http01(Http01Data),
    #[serde(rename = "simpleHttp")]
    SimpleHttp(SimpleHttpData),
    #[serde(rename = "dvsni")]
    Dvsni(DvsniData),
}

impl ChallengeData {
    pub fn kind(&self) -> &'static str {
        match self {
            ChallengeData::Http01(_) => HTTP01,
            ChallengeData::SimpleHttp(_) => SIMPLE_HTTP,
            ChallengeData::Dvsni(_) => DVSNI,
        }
    }
}

/// 單一挑戰的回應流程。
pub trait ChallengeResponder {
    /// 由 token 與帳戶金鑰重新推導回應資料。
    fn reset_response(&mut self) -> Result<()>;

    /// 在顯示指示前收集需要的互動參數。
    fn initialize_response(&mut self, ui: &dyn UserInterface) -> Result<()>;

    /// 告訴操作者需要公開的內容。
    fn show_instructions(&self, ui: &dyn UserInterface) -> Result<()>;

    /// 送出前先自行確認內容已可取得，失敗時回傳 `Error::Validation`。
    fn verify(&self) -> Result<()>;

    fn challenge_data(&self) -> ChallengeData;

    fn challenge(&self) -> &TokenChallenge;

    fn send_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.challenge_data())?)
    }
}

/// 依挑戰類型建立回應器；`previous` 為先前保存的回應資料。
pub fn responder_for(
    challenge: &Challenge,
    dns: &str,
    key: &SigningKey,
    previous: Option<&ChallengeData>,
    client: VerificationClient,
) -> Result<Box<dyn ChallengeResponder>> {
    let responder: Box<dyn ChallengeResponder> = match challenge {
        Challenge::Http01(c) => Box::new(Http01Responder::new(c, dns, key, previous, client)?),
        Challenge::SimpleHttp(c) => {
            Box::new(SimpleHttpResponder::new(c, dns, key, previous, client))
        }
        Challenge::Dvsni(c) => Box::new(DvsniResponder::new(c, dns, key, previous, client)?),
        Challenge::Unknown(_) => {
            return Err(Error::InvalidState(format!(
                "challenge type {:?} is not supported",
                challenge.kind()
            )))
        }
    };
    Ok(responder)
}

/// 自我驗證時取得的 HTTP 回應。
#[derive(Debug, Clone)]
pub struct VerificationResponse {
    pub status: StatusCode,
    /// 去掉參數後的媒體類型，沒有標頭時為空字串。
    pub content_type: String,
    pub body: Vec<u8>,
}

/// 自我驗證使用的網路客戶端。
///
/// 寬鬆客戶端不驗證伺服器憑證，只用在 simpleHttp 與 dvsni 的自我檢查。
#[derive(Debug, Clone)]
pub struct VerificationClient {
    strict: Client,
    relaxed: Client,
    timeout: Duration,
}

impl VerificationClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let strict = Client::builder().timeout(timeout).build()?;
        let relaxed = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            strict,
            relaxed,
            timeout,
        })
    }

    /// GET `url`，非 200 回應視為驗證失敗。
    pub fn fetch(&self, url: &str, accept_invalid_certs: bool) -> Result<VerificationResponse> {
        let client = if accept_invalid_certs {
            &self.relaxed
        } else {
            &self.strict
        };
        let response = client
            .get(url)
            .send()
            .map_err(|e| Error::Validation(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Validation(format!("GET {} failed: {}", url, status)));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(media_type)
            .unwrap_or_default();
        let body = response
            .bytes()
            .map_err(|e| Error::Validation(format!("reading {} failed: {}", url, e)))?
            .to_vec();

        Ok(VerificationResponse {
            status,
            content_type,
            body,
        })
    }

    /// 以指定 SNI 名稱建立 TLS 連線（不驗證憑證），回傳第一張對端憑證的 DNS 名稱。
    pub fn peer_dns_names(&self, host: &str, port: u16, sni: &str) -> Result<Vec<String>> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            Error::Validation(format!("{} with {}:{} failed: {}", what, host, port, e))
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| fail("resolving", &e))?
            .next()
            .ok_or_else(|| Error::Validation(format!("no address for {}:{}", host, port)))?;
        let stream =
            TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| fail("connection", &e))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE);
        let connector = builder.build();
        let tls = connector
            .configure()?
            .verify_hostname(false)
            .connect(sni, stream)
            .map_err(|e| fail("TLS handshake", &e))?;

        let cert = tls.ssl().peer_certificate().ok_or_else(|| {
            Error::Validation(format!("server {}:{} returned no certificates", host, port))
        })?;
        Ok(cert
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// 取出 `Content-Type` 的媒體類型部分。
pub(crate) fn media_type(value: &str) -> String {
    value.split(';').next().unwrap_or("").trim().to_string()
}

/// 讀取並以帳戶金鑰驗證 JWS 文件，回傳 payload。
pub(crate) fn verify_signed_document(url: &str, body: &[u8], key: &SigningKey) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::Validation(format!("document at {} is not text: {}", url, e)))?;
    Jws::parse(text)
        .and_then(|jws| jws.verify(key))
        .map_err(|e| {
            Error::Validation(format!(
                "couldn't parse / verify signature of document at {}: {}",
                url, e
            ))
        })
}

/// 挑戰文件的 well-known 路徑。
pub(crate) fn well_known_url(scheme: &str, dns: &str, token: &str) -> String {
    format!("{}://{}/.well-known/acme-challenge/{}", scheme, dns, token)
}
