use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    well_known_url, ChallengeData, ChallengeResponder, TokenChallenge, VerificationClient,
};
use crate::{
    error::{Error, Result},
    key_pair::SigningKey,
    resource::ChallengeTag,
    ui::UserInterface,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http01Data {
    #[serde(default)]
    pub resource: ChallengeTag,
    #[serde(rename = "keyAuthorization")]
    pub key_authorization: String,
}

/// http-01：在 `http://<dns>/.well-known/acme-challenge/<token>` 提供 key authorization。
pub struct Http01Responder {
    dns: String,
    key: SigningKey,
    challenge: TokenChallenge,
    data: Http01Data,
    client: VerificationClient,
}

impl Http01Responder {
    pub fn new(
        challenge: &TokenChallenge,
        dns: &str,
        key: &SigningKey,
        previous: Option<&ChallengeData>,
        client: VerificationClient,
    ) -> Result<Self> {
        let mut responder = Self {
            dns: dns.to_string(),
            key: key.clone(),
            challenge: challenge.clone(),
            data: Http01Data::default(),
            client,
        };
        match previous {
            Some(ChallengeData::Http01(data)) => responder.data = data.clone(),
            Some(other) => {
                warn!(uri = %challenge.uri, kind = other.kind(), "ignoring mismatching challenge data");
                responder.reset_response()?;
            }
            None => responder.reset_response()?,
        }
        Ok(responder)
    }

    /// `token + "." + base64url(JWK 縮影)`。
    pub fn key_authorization(token: &str, key: &SigningKey) -> Result<String> {
        Ok(format!("{}.{}", token, key.thumbprint_b64()?))
    }

    pub fn well_known_url(&self) -> String {
        well_known_url("http", &self.dns, &self.challenge.token)
    }
}

impl ChallengeResponder for Http01Responder {
    fn reset_response(&mut self) -> Result<()> {
        self.data = Http01Data {
            resource: ChallengeTag,
            key_authorization: Self::key_authorization(&self.challenge.token, &self.key)?,
        };
        Ok(())
    }

    fn initialize_response(&mut self, _ui: &dyn UserInterface) -> Result<()> {
        Ok(())
    }

    fn show_instructions(&self, ui: &dyn UserInterface) -> Result<()> {
        ui.prompt(&format!(
            "Make the text on the next line available (without quotes) as {}\n{}\nPress enter when done",
            self.well_known_url(),
            self.data.key_authorization
        ))?;
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let url = self.well_known_url();
        let response = self.client.fetch(&url, false)?;

        if !response.content_type.is_empty() && response.content_type != "text/plain" {
            return Err(Error::Validation(format!(
                "document at {} has wrong content-type {:?}, expected none or text/plain",
                url, response.content_type
            )));
        }

        let body = String::from_utf8_lossy(&response.body);
        let body = body.trim();
        if body != self.data.key_authorization {
            return Err(Error::Validation(format!(
                "content of document at {} doesn't match expected data {}: got {:?}",
                url, self.data.key_authorization, body
            )));
        }
        debug!(url, "http-01 document verified");
        Ok(())
    }

    fn challenge_data(&self) -> ChallengeData {
        ChallengeData::Http01(self.data.clone())
    }

    fn challenge(&self) -> &TokenChallenge {
        &self.challenge
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use openssl::sha::sha256;
    use serde_json::json;

    use super::*;
    use crate::{
        jws::b64url,
        key_pair::{Curve, KeyType},
    };

    fn challenge(token: &str) -> TokenChallenge {
        TokenChallenge {
            kind: crate::challenge::HTTP01.into(),
            uri: "https://ca.test/challenge/1".into(),
            token: token.into(),
            ..Default::default()
        }
    }

    fn client() -> VerificationClient {
        VerificationClient::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_key_authorization_is_deterministic() {
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let expected = format!(
            "abc.{}",
            b64url(sha256(key.jwk().unwrap().thumbprint_input().unwrap().as_bytes()))
        );

        let first = Http01Responder::new(&challenge("abc"), "example.com", &key, None, client())
            .unwrap();
        let mut second =
            Http01Responder::new(&challenge("abc"), "example.com", &key, None, client()).unwrap();
        second.reset_response().unwrap();

        assert_eq!(first.data.key_authorization, expected);
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn test_previous_data_is_reused() {
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let previous = ChallengeData::Http01(Http01Data {
            resource: ChallengeTag,
            key_authorization: "abc.stored".into(),
        });
        let responder =
            Http01Responder::new(&challenge("abc"), "example.com", &key, Some(&previous), client())
                .unwrap();
        assert_eq!(responder.challenge_data(), previous);
        assert_eq!(
            responder.send_payload().unwrap(),
            json!({"type": "http-01", "resource": "challenge", "keyAuthorization": "abc.stored"})
        );
    }

    #[test]
    fn test_verify_against_served_document() {
        let mut server = mockito::Server::new();
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let responder =
            Http01Responder::new(&challenge("abc"), &server.host_with_port(), &key, None, client())
                .unwrap();
        let _doc = server
            .mock("GET", "/.well-known/acme-challenge/abc")
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(format!("{}\n", responder.data.key_authorization))
            .create();

        responder.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_content() {
        let mut server = mockito::Server::new();
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let responder =
            Http01Responder::new(&challenge("abc"), &server.host_with_port(), &key, None, client())
                .unwrap();
        let _doc = server
            .mock("GET", "/.well-known/acme-challenge/abc")
            .with_body("abc.wrong")
            .create();
        assert!(responder.verify().unwrap_err().is_validation());
    }

    #[test]
    fn test_verify_rejects_wrong_content_type_and_status() {
        let mut server = mockito::Server::new();
        let key = SigningKey::generate(KeyType::Ec(Curve::P256)).unwrap();
        let responder =
            Http01Responder::new(&challenge("abc"), &server.host_with_port(), &key, None, client())
                .unwrap();
        let html = server
            .mock("GET", "/.well-known/acme-challenge/abc")
            .with_header("Content-Type", "text/html")
            .with_body(responder.data.key_authorization.clone())
            .create();
        assert!(responder.verify().unwrap_err().is_validation());
        html.remove();

        let _missing = server
            .mock("GET", "/.well-known/acme-challenge/abc")
            .with_status(404)
            .create();
        assert!(responder.verify().unwrap_err().is_validation());
    }
}
