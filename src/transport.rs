//! 簽章請求的傳輸層：取得 nonce、簽章、送出並解析回應中的協議標頭。

use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;
use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE, LINK, LOCATION},
    StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    config::ClientConfig,
    error::{Error, ProtocolError, Result},
    key_pair::SigningKey,
    nonce::{HttpNonce, NonceT},
};

/// 憑證交換使用的媒體類型。
pub const PKIX_CERT: &str = "application/pkix-cert";

static LINK_RE: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();

/// 解析後的 HTTP 回應，保留協議需要的標頭資訊。
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub status: StatusCode,
    pub location: Option<String>,
    pub content_type: Option<String>,
    /// `Link` 標頭中 rel 名稱對應的 URL。
    pub links: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn read(url: &str, response: Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers();
        let header_str = |name| {
            headers
                .get(name)
                .and_then(|v: &reqwest::header::HeaderValue| v.to_str().ok())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };
        let location = header_str(LOCATION);
        let content_type = header_str(CONTENT_TYPE);
        let links = parse_links(
            headers
                .get_all(LINK)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let body = response.bytes()?.to_vec();

        debug!(url, status = %status, ?location, ?content_type, "response received");
        Ok(Self {
            url: url.to_string(),
            status,
            location,
            content_type,
            links,
            body,
        })
    }

    pub fn status_text(&self) -> String {
        self.status.to_string()
    }

    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links.get(rel).map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 將回應本文解碼為 JSON，失敗時視為協議錯誤。
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::Protocol(
                ProtocolError::new(&self.url, format!("failed decoding response: {}", e))
                    .with_status(self.status_text()),
            )
        })
    }

    /// 要求回應帶有非空的 `Location` 標頭。
    pub fn require_location(&self) -> Result<String> {
        self.location.clone().ok_or_else(|| {
            Error::Protocol(
                ProtocolError::new(&self.url, "response is missing the Location header")
                    .with_status(self.status_text()),
            )
        })
    }

    fn ensure_success(self, payload: Option<&str>) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let mut err = ProtocolError::new(
            &self.url,
            format!("request failed: {}", self.text().trim()),
        )
        .with_status(self.status_text());
        if let Some(payload) = payload {
            err = err.with_payload(payload);
        }
        Err(Error::Protocol(err))
    }
}

fn link_patterns() -> Option<&'static (Regex, Regex)> {
    LINK_RE
        .get_or_init(|| {
            let link = Regex::new(
                r#"<([^>]*)>((?:\s*;\s*[^;,=\s]+\s*=\s*(?:"[^"]*"|[^;,\s]*))*)"#,
            )
            .ok()?;
            let param = Regex::new(r#";\s*([^;,=\s]+)\s*=\s*(?:"([^"]*)"|([^;,\s]*))"#).ok()?;
            Some((link, param))
        })
        .as_ref()
}

/// 解析 `Link` 標頭，回傳 rel 名稱到 URL 的對應。
///
/// 同一個標頭值可以用逗號連接多個連結；`rel` 可含多個以空白分隔的關係名稱。
pub fn parse_links<'a>(values: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut links = HashMap::new();
    let Some((link_re, param_re)) = link_patterns() else {
        return links;
    };

    for value in values {
        for caps in link_re.captures_iter(value) {
            let url = &caps[1];
            for param in param_re.captures_iter(&caps[2]) {
                if !param[1].eq_ignore_ascii_case("rel") {
                    continue;
                }
                let rels = param.get(2).or_else(|| param.get(3)).map_or("", |m| m.as_str());
                for rel in rels.split_whitespace() {
                    links.insert(rel.to_string(), url.to_string());
                }
            }
        }
    }
    links
}

/// 簽章請求傳輸層。
///
/// 每個變更狀態的請求都會先向目標 URL 取得新的 nonce，再簽章並以 POST 送出。
pub struct Transport {
    client: Client,
    nonce: Box<dyn NonceT>,
}

impl Transport {
    /// 依設定建立 HTTP 客戶端，並以 HEAD 請求取得 nonce。
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;
        let nonce = Box::new(HttpNonce::new(client.clone()));
        Ok(Self { client, nonce })
    }

    pub fn with_nonce_source(client: Client, nonce: Box<dyn NonceT>) -> Self {
        Self { client, nonce }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 取得 nonce、簽章 payload 並 POST 到 `url`。
    ///
    /// 沒有 nonce 時不會簽章也不會送出；非 2xx 回應視為協議錯誤並附上送出的 payload。
    pub fn post_signed<P: Serialize + ?Sized>(
        &self,
        url: &str,
        key: &SigningKey,
        payload: &P,
        accept: Option<&str>,
    ) -> Result<HttpResponse> {
        let payload_json = serde_json::to_string(payload)?;
        debug!(url, payload = %payload_json, "signed request");

        let nonce = self.nonce.get(url).map_err(|e| match Error::from(e) {
            Error::Protocol(p) => Error::Protocol(p.with_payload(payload_json.clone())),
            other => other,
        })?;
        let body = key.sign(payload_json.as_bytes(), &nonce)?.to_json()?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        HttpResponse::read(url, request.send()?)?.ensure_success(Some(&payload_json))
    }

    /// 不簽章的 GET 請求。
    pub fn get(&self, url: &str, accept: Option<&str>) -> Result<HttpResponse> {
        debug!(url, "GET");
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        HttpResponse::read(url, request.send()?)?.ensure_success(None)
    }

    /// 取得 `{"<field>": [url, ...]}` 形式的清單；`url` 為空時回傳空清單。
    pub fn get_list(&self, url: &str, field: &str) -> Result<Vec<String>> {
        if url.is_empty() {
            return Ok(Vec::new());
        }
        let mut object: Map<String, Value> = self.get(url, None)?.json()?;
        match object.remove(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(list) => serde_json::from_value(list).map_err(|e| {
                Error::protocol(url, format!("failed decoding {} list: {}", field, e))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jws::Jws,
        key_pair::{Curve, KeyType},
        nonce::MockNonce,
    };
    use mockito::Matcher;
    use serde_json::json;

    fn key() -> SigningKey {
        SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap()
    }

    #[test]
    fn test_parse_links() {
        let links = parse_links(
            [
                r#"<https://ca.test/issuer>;rel="up""#,
                r#" <https://ca.test/terms> ; rel = "terms-of-service""#,
                "garbage",
            ]
            .into_iter(),
        );
        assert_eq!(links.get("up").unwrap(), "https://ca.test/issuer");
        assert_eq!(links.get("terms-of-service").unwrap(), "https://ca.test/terms");
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_parse_links_in_one_header_value() {
        let links = parse_links(std::iter::once(
            r#"<https://ca.test/issuer>;rel="up", <https://ca.test/terms>;rel="terms-of-service""#,
        ));
        assert_eq!(links.get("up").unwrap(), "https://ca.test/issuer");
        assert_eq!(links.get("terms-of-service").unwrap(), "https://ca.test/terms");

        let links = parse_links(std::iter::once(
            "<https://ca.test/a>; rel=next, <https://ca.test/b>; title=\"x, y\"; rel=\"up alternate\"",
        ));
        assert_eq!(links.get("next").unwrap(), "https://ca.test/a");
        assert_eq!(links.get("up").unwrap(), "https://ca.test/b");
        assert_eq!(links.get("alternate").unwrap(), "https://ca.test/b");
        assert_eq!(links.len(), 3);
    }

    #[test]
    fn test_post_signed_sends_flattened_jws() {
        let mut server = mockito::Server::new();
        let key = key();
        let _nonce = server
            .mock("HEAD", "/new-reg")
            .with_header("Replay-Nonce", "nonce-42")
            .create();
        let post = server
            .mock("POST", "/new-reg")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Regex(r#""protected":"#.to_string()))
            .with_status(201)
            .with_header("Location", "https://ca.test/reg/1")
            .with_header("Link", r#"<https://ca.test/terms>;rel="terms-of-service""#)
            .with_body(r#"{"resource":"reg"}"#)
            .create();

        let transport = Transport::new(&ClientConfig::default()).unwrap();
        let url = format!("{}/new-reg", server.url());
        let response = transport
            .post_signed(&url, &key, &json!({"resource": "new-reg"}), None)
            .unwrap();

        post.assert();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.location.as_deref(), Some("https://ca.test/reg/1"));
        assert_eq!(response.link("terms-of-service"), Some("https://ca.test/terms"));
    }

    #[test]
    fn test_missing_nonce_never_sends_body() {
        let mut server = mockito::Server::new();
        let _head = server.mock("HEAD", "/new-authz").with_status(200).create();
        let post = server.mock("POST", "/new-authz").expect(0).create();

        let transport = Transport::new(&ClientConfig::default()).unwrap();
        let url = format!("{}/new-authz", server.url());
        let err = transport
            .post_signed(&url, &key(), &json!({"resource": "new-authz"}), None)
            .unwrap_err();

        match err {
            Error::Protocol(p) => {
                assert_eq!(p.url, url);
                assert!(p.payload.unwrap().contains("new-authz"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        post.assert();
    }

    #[test]
    fn test_non_success_carries_status_and_payload() {
        let mut server = mockito::Server::new();
        let _post = server
            .mock("POST", "/reg/1")
            .with_status(403)
            .with_body(r#"{"detail":"unauthorized"}"#)
            .create();

        let transport = Transport::with_nonce_source(Client::new(), Box::new(MockNonce::new("n")));
        let url = format!("{}/reg/1", server.url());
        let err = transport
            .post_signed(&url, &key(), &json!({"resource": "reg"}), None)
            .unwrap_err();

        match err {
            Error::Protocol(p) => {
                assert!(p.status.unwrap().starts_with("403"));
                assert_eq!(p.payload.as_deref(), Some(r#"{"resource":"reg"}"#));
                assert!(p.message.contains("unauthorized"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_get_list() {
        let mut server = mockito::Server::new();
        let _list = server
            .mock("GET", "/reg/1/authz")
            .with_body(r#"{"authorizations":["https://ca.test/authz/1","https://ca.test/authz/2"]}"#)
            .create();
        let _broken = server
            .mock("GET", "/reg/1/cert")
            .with_body(r#"{"certificates":"nope"}"#)
            .create();

        let transport = Transport::new(&ClientConfig::default()).unwrap();
        let list = transport
            .get_list(&format!("{}/reg/1/authz", server.url()), "authorizations")
            .unwrap();
        assert_eq!(list, vec!["https://ca.test/authz/1", "https://ca.test/authz/2"]);
        assert!(transport.get_list("", "authorizations").unwrap().is_empty());
        assert!(matches!(
            transport.get_list(&format!("{}/reg/1/cert", server.url()), "certificates"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_signed_body_carries_nonce() {
        let mut server = mockito::Server::new();
        let key = key();
        let post = server
            .mock("POST", "/authz")
            .with_status(200)
            .with_body("{}")
            .create();

        let transport =
            Transport::with_nonce_source(Client::new(), Box::new(MockNonce::new("fixed")));
        transport
            .post_signed(&format!("{}/authz", server.url()), &key, &json!({}), None)
            .unwrap();
        post.assert();

        // 直接驗證相同的簽章流程會帶出 nonce
        let jws = Jws::sign(&key, b"{}", "fixed").unwrap();
        assert_eq!(jws.header().unwrap().nonce, "fixed");
    }
}
