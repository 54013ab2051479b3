use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    verify_signed_document, well_known_url, ChallengeData, ChallengeResponder, TokenChallenge,
    VerificationClient, SIMPLE_HTTP,
};
use crate::{
    error::{Error, Result},
    key_pair::SigningKey,
    resource::ChallengeTag,
    ui::UserInterface,
};

const JOSE_JSON: &str = "application/jose+json";

fn default_tls() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleHttpData {
    #[serde(default)]
    pub resource: ChallengeTag,
    #[serde(default = "default_tls")]
    pub tls: bool,
}

impl Default for SimpleHttpData {
    fn default() -> Self {
        Self {
            resource: ChallengeTag,
            tls: true,
        }
    }
}

/// 公開文件中簽章的內容。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimpleHttpFile {
    #[serde(rename = "type")]
    kind: String,
    tls: bool,
    token: String,
}

/// simpleHttp：在 well-known 路徑提供以帳戶金鑰簽章的 `{type, tls, token}`。
pub struct SimpleHttpResponder {
    dns: String,
    key: SigningKey,
    challenge: TokenChallenge,
    data: SimpleHttpData,
    client: VerificationClient,
}

impl SimpleHttpResponder {
    pub fn new(
        challenge: &TokenChallenge,
        dns: &str,
        key: &SigningKey,
        previous: Option<&ChallengeData>,
        client: VerificationClient,
    ) -> Self {
        let data = match previous {
            Some(ChallengeData::SimpleHttp(data)) => data.clone(),
            Some(other) => {
                warn!(uri = %challenge.uri, kind = other.kind(), "ignoring mismatching challenge data");
                SimpleHttpData::default()
            }
            None => SimpleHttpData::default(),
        };
        Self {
            dns: dns.to_string(),
            key: key.clone(),
            challenge: challenge.clone(),
            data,
            client,
        }
    }

    pub fn well_known_url(&self) -> String {
        let scheme = if self.data.tls { "https" } else { "http" };
        well_known_url(scheme, &self.dns, &self.challenge.token)
    }

    fn file_data(&self) -> SimpleHttpFile {
        SimpleHttpFile {
            kind: SIMPLE_HTTP.to_string(),
            tls: self.data.tls,
            token: self.challenge.token.clone(),
        }
    }

    /// 需要公開的文件內容：JWS JSON 序列化，不含 nonce。
    pub fn verification_file(&self) -> Result<String> {
        let payload = serde_json::to_vec(&self.file_data())?;
        Ok(self.key.sign(&payload, "")?.to_json()?)
    }
}

impl ChallengeResponder for SimpleHttpResponder {
    fn reset_response(&mut self) -> Result<()> {
        self.data.tls = true;
        Ok(())
    }

    fn initialize_response(&mut self, ui: &dyn UserInterface) -> Result<()> {
        self.data.tls = ui.yes_no(
            "",
            "Use TLS for simple http(s) domain name verification?",
            true,
        )?;
        Ok(())
    }

    fn show_instructions(&self, ui: &dyn UserInterface) -> Result<()> {
        ui.prompt(&format!(
            "Make the text on the next line available (without quotes) as {}\n{}\nPress enter when done",
            self.well_known_url(),
            self.verification_file()?
        ))?;
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let url = self.well_known_url();
        let response = self.client.fetch(&url, self.data.tls)?;

        if !response.content_type.is_empty() && response.content_type != JOSE_JSON {
            return Err(Error::Validation(format!(
                "document at {} has wrong content-type {:?}, expected none or {}",
                url, response.content_type, JOSE_JSON
            )));
        }

        let payload = verify_signed_document(&url, &response.body, &self.key)?;
        let found: SimpleHttpFile = serde_json::from_slice(&payload).map_err(|e| {
            Error::Validation(format!(
                "couldn't parse payload of signature of document at {}: {}",
                url, e
            ))
        })?;
        let expected = self.file_data();
        if found != expected {
            return Err(Error::Validation(format!(
                "payload of signature of document at {} is not valid (expected {:?}, not {:?})",
                url, expected, found
            )));
        }
        debug!(url, "simpleHttp document verified");
        Ok(())
    }

    fn challenge_data(&self) -> ChallengeData {
        ChallengeData::SimpleHttp(self.data.clone())
    }

    fn challenge(&self) -> &TokenChallenge {
        &self.challenge
    }
}
