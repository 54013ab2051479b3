use openssl::sha::sha256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChallengeData, ChallengeResponder, TokenChallenge, VerificationClient, DVSNI};
use crate::{
    csr::self_signed_certificate,
    error::{Error, Result},
    jws::Jws,
    key_pair::{KeyType, SigningKey},
    resource::ChallengeTag,
    ui::UserInterface,
};

const SNI_SUFFIX: &str = ".acme.invalid";
const HELPER_KEY_BITS: u32 = 2048;
const HELPER_CERT_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvsniData {
    #[serde(default)]
    pub resource: ChallengeTag,
    pub validation: Jws,
}

#[derive(Serialize)]
struct DvsniFile<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    token: &'a str,
}

/// dvsni：在 `<dns>:443` 對推導出的 SNI 名稱提供含該名稱的自簽憑證。
pub struct DvsniResponder {
    dns: String,
    port: u16,
    key: SigningKey,
    challenge: TokenChallenge,
    data: DvsniData,
    client: VerificationClient,
}

impl DvsniResponder {
    pub fn new(
        challenge: &TokenChallenge,
        dns: &str,
        key: &SigningKey,
        previous: Option<&ChallengeData>,
        client: VerificationClient,
    ) -> Result<Self> {
        let data = match previous {
            Some(ChallengeData::Dvsni(data)) => data.clone(),
            Some(other) => {
                warn!(uri = %challenge.uri, kind = other.kind(), "re-deriving mismatching challenge data");
                Self::derive(&challenge.token, key)?
            }
            None => Self::derive(&challenge.token, key)?,
        };
        Ok(Self {
            dns: dns.to_string(),
            port: 443,
            key: key.clone(),
            challenge: challenge.clone(),
            data,
            client,
        })
    }

    /// 自我驗證連線的 TLS 埠，預設 443。
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn derive(token: &str, key: &SigningKey) -> Result<DvsniData> {
        let payload = serde_json::to_vec(&DvsniFile { kind: DVSNI, token })?;
        Ok(DvsniData {
            resource: ChallengeTag,
            validation: key.sign(&payload, "")?,
        })
    }

    /// `Z[0:32] + "." + Z[32:64] + ".acme.invalid"`，Z 為 compact 簽章第三段的 SHA-256 十六進位。
    pub fn subject_alt_name(&self) -> String {
        let compact = self.data.validation.compact();
        let signature = compact.split('.').nth(2).unwrap_or("");
        let z = hex::encode(sha256(signature.as_bytes()));
        format!("{}.{}{}", &z[0..32], &z[32..64], SNI_SUFFIX)
    }

    /// 產生可直接使用的自簽憑證與私鑰 PEM。
    fn helper_certificate(&self) -> Result<String> {
        let key = SigningKey::generate(KeyType::Rsa {
            bits: HELPER_KEY_BITS,
        })?;
        let cert = self_signed_certificate(&key, &[self.subject_alt_name()], HELPER_CERT_DAYS)?;
        let mut pem = String::from_utf8_lossy(&cert.to_pem()?).into_owned();
        pem.push_str(&String::from_utf8_lossy(&key.to_pem()?));
        Ok(pem)
    }
}

impl ChallengeResponder for DvsniResponder {
    fn reset_response(&mut self) -> Result<()> {
        self.data = Self::derive(&self.challenge.token, &self.key)?;
        Ok(())
    }

    fn initialize_response(&mut self, _ui: &dyn UserInterface) -> Result<()> {
        Ok(())
    }

    fn show_instructions(&self, ui: &dyn UserInterface) -> Result<()> {
        let mut text = format!(
            "{}:{} needs to present a (self-signed) certificate for SNI name (\"vhost\") {}\n",
            self.dns,
            self.port,
            self.subject_alt_name()
        );
        match self.helper_certificate() {
            Ok(pem) => text.push_str(&format!(
                "You can use the following {}-bit RSA certificate:\n{}",
                HELPER_KEY_BITS, pem
            )),
            Err(e) => text.push_str(&format!(
                "Couldn't generate example certificate (build your own instead): {}\n",
                e
            )),
        }
        text.push_str("Press enter when done");
        ui.prompt(&text)?;
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let sni = self.subject_alt_name();
        let names = self.client.peer_dns_names(&self.dns, self.port, &sni)?;
        if !names.iter().any(|name| *name == sni) {
            return Err(Error::Validation(format!(
                "certificate on {}:{} for SNI name {} didn't contain the SNI name in SubjectAltName: DNSNames={:?}",
                self.dns, self.port, sni, names
            )));
        }
        debug!(dns = %self.dns, sni, "dvsni certificate verified");
        Ok(())
    }

    fn challenge_data(&self) -> ChallengeData {
        ChallengeData::Dvsni(self.data.clone())
    }

    fn challenge(&self) -> &TokenChallenge {
        &self.challenge
    }
}
