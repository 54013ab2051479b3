//! 以密碼保護的 PEM 區塊匯出與匯入帳戶、授權與憑證記錄。
//!
//! JSON 內容以 PBKDF2-HMAC-SHA256 推導的金鑰做 AES-256-GCM 加密，
//! 鹽值與 IV 每次隨機產生；密碼為空字串時區塊不加密。
//! 私鑰另以 PKCS#8 加密 PEM 匯出。

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::{
    hash::MessageDigest,
    pkcs5::pbkdf2_hmac,
    rand::rand_bytes,
    symm::{decrypt_aead, encrypt_aead, Cipher},
    x509::X509,
};
use serde::{Deserialize, Serialize};

use crate::{
    authorization::Authorization,
    certificate::Certificate,
    error::{Error, Result},
    key_pair::{CryptoError, SigningKey},
    registration::{Registration, RegistrationResource},
    storage::StorageError,
    store::CredentialProvider,
};

pub const LABEL_REGISTRATION: &str = "ACME JSON REGISTRATION";
pub const LABEL_AUTHORIZATION: &str = "ACME JSON AUTHORIZATION";
pub const LABEL_CERTIFICATE_RECORD: &str = "ACME JSON CERTIFICATE";

const PBKDF2_ITERATIONS: usize = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENCRYPTION_HEADER: &str = "Encryption";
const ENCRYPTION_SCHEME: &str = "AES-256-GCM,PBKDF2-SHA256";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Encryption {
    iterations: usize,
    salt: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
}

/// 帶標籤的 PEM 區塊，內容可能經過加密。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub label: String,
    encryption: Option<Encryption>,
    data: Vec<u8>,
}

fn derive_key(password: &str, salt: &[u8], iterations: usize) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2_hmac(
        password.as_bytes(),
        salt,
        iterations,
        MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}

fn corrupted(message: impl Into<String>) -> Error {
    Error::Storage(StorageError::Corrupted(message.into()))
}

impl SealedBlock {
    /// 以密碼封裝內容；密碼為空時僅加上標籤。
    pub fn seal(label: &str, plaintext: &[u8], password: &str) -> Result<Self> {
        if password.is_empty() {
            return Ok(Self {
                label: label.to_string(),
                encryption: None,
                data: plaintext.to_vec(),
            });
        }

        let mut salt = vec![0u8; SALT_LEN];
        let mut iv = vec![0u8; IV_LEN];
        rand_bytes(&mut salt)?;
        rand_bytes(&mut iv)?;
        let key = derive_key(password, &salt, PBKDF2_ITERATIONS)?;

        let mut tag = vec![0u8; TAG_LEN];
        let data = encrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(iv.as_slice()),
            label.as_bytes(),
            plaintext,
            &mut tag,
        )?;

        Ok(Self {
            label: label.to_string(),
            encryption: Some(Encryption {
                iterations: PBKDF2_ITERATIONS,
                salt,
                iv,
                tag,
            }),
            data,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.encryption.is_some()
    }

    /// 解開區塊；標籤作為附加驗證資料，因此改動標籤也會使解密失敗。
    pub fn open(&self, password: &str) -> Result<Vec<u8>> {
        let Some(enc) = &self.encryption else {
            return Ok(self.data.clone());
        };
        let key = derive_key(password, &enc.salt, enc.iterations)?;
        decrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(enc.iv.as_slice()),
            self.label.as_bytes(),
            &self.data,
            &enc.tag,
        )
        .map_err(|_| {
            Error::Crypto(CryptoError::Decrypt(format!(
                "cannot decrypt {} block (wrong password?)",
                self.label
            )))
        })
    }

    /// 依需要向 `credentials` 取得密碼並解開區塊。
    pub fn open_with(&self, credentials: &dyn CredentialProvider) -> Result<Vec<u8>> {
        if self.is_sealed() {
            self.open(&credentials.password()?)
        } else {
            Ok(self.data.clone())
        }
    }

    pub fn to_pem(&self) -> String {
        let mut out = format!("-----BEGIN {}-----\n", self.label);
        if let Some(enc) = &self.encryption {
            out.push_str(&format!(
                "{}: {},{},{},{},{}\n\n",
                ENCRYPTION_HEADER,
                ENCRYPTION_SCHEME,
                enc.iterations,
                hex::encode(&enc.salt),
                hex::encode(&enc.iv),
                hex::encode(&enc.tag)
            ));
        }
        let encoded = STANDARD.encode(&self.data);
        for chunk in encoded.as_bytes().chunks(64) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out.push_str(&format!("-----END {}-----\n", self.label));
        out
    }

    /// 解析單一 PEM 區塊並檢查標籤。
    pub fn from_pem(text: &str, expected_label: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let begin = lines.next().ok_or_else(|| corrupted("empty PEM data"))?;
        let label = begin
            .strip_prefix("-----BEGIN ")
            .and_then(|l| l.strip_suffix("-----"))
            .ok_or_else(|| corrupted("missing PEM BEGIN line"))?;
        if label != expected_label {
            return Err(corrupted(format!(
                "unexpected PEM block {:?}, expected {:?}",
                label, expected_label
            )));
        }

        let end = format!("-----END {}-----", label);
        let mut encryption = None;
        let mut body = String::new();
        let mut finished = false;
        for line in lines.by_ref() {
            if line == end {
                finished = true;
                break;
            }
            if let Some(value) = line
                .strip_prefix(ENCRYPTION_HEADER)
                .and_then(|l| l.strip_prefix(':'))
            {
                encryption = Some(Self::parse_encryption(value.trim())?);
            } else {
                body.push_str(line);
            }
        }
        if !finished {
            return Err(corrupted("missing PEM END line"));
        }
        if lines.next().is_some() {
            return Err(corrupted("expected a single PEM block"));
        }

        let data = STANDARD
            .decode(body)
            .map_err(|e| corrupted(format!("invalid PEM body: {}", e)))?;
        Ok(Self {
            label: label.to_string(),
            encryption,
            data,
        })
    }

    fn parse_encryption(value: &str) -> Result<Encryption> {
        let fields: Vec<&str> = value.split(',').collect();
        match fields.as_slice() {
            ["AES-256-GCM", "PBKDF2-SHA256", iterations, salt, iv, tag] => {
                let decode = |s: &str| hex::decode(s).map_err(|e| corrupted(e.to_string()));
                Ok(Encryption {
                    iterations: iterations
                        .parse()
                        .map_err(|_| corrupted("invalid iteration count"))?,
                    salt: decode(*salt)?,
                    iv: decode(*iv)?,
                    tag: decode(*tag)?,
                })
            }
            _ => Err(corrupted(format!("unsupported encryption header {:?}", value))),
        }
    }
}

fn key_to_pem(key: &SigningKey, password: &str) -> Result<String> {
    let pem = if password.is_empty() {
        key.to_pem()?
    } else {
        key.to_pem_with_passphrase(password.as_bytes())?
    };
    String::from_utf8(pem).map_err(|e| corrupted(e.to_string()))
}

fn key_from_pem(pem: &str, credentials: &dyn CredentialProvider) -> Result<SigningKey> {
    if pem.contains("ENCRYPTED") {
        let password = credentials.password()?;
        Ok(SigningKey::from_pem_with_passphrase(
            pem.as_bytes(),
            password.as_bytes(),
        )?)
    } else {
        Ok(SigningKey::from_pem(pem.as_bytes())?)
    }
}

#[derive(Serialize, Deserialize)]
struct RegistrationExportJson {
    resource: RegistrationResource,
    terms_of_service: String,
    recovery_token: String,
}

/// 帳戶匯出格式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationExport {
    pub name: String,
    pub directory_url: String,
    pub location: String,
    pub json_pem: String,
    pub signing_key_pem: String,
}

impl RegistrationExport {
    pub fn export(registration: &Registration, password: &str) -> Result<Self> {
        let json = serde_json::to_vec(&RegistrationExportJson {
            resource: registration.resource.clone(),
            terms_of_service: registration.terms_of_service.clone(),
            recovery_token: registration.recovery_token.clone(),
        })?;

        Ok(Self {
            name: registration.name.clone(),
            directory_url: registration.directory_url.clone(),
            location: registration.location.clone(),
            json_pem: SealedBlock::seal(LABEL_REGISTRATION, &json, password)?.to_pem(),
            signing_key_pem: key_to_pem(&registration.signing_key, password)?,
        })
    }

    pub fn import(&self, credentials: &dyn CredentialProvider) -> Result<Registration> {
        let json = SealedBlock::from_pem(&self.json_pem, LABEL_REGISTRATION)?.open_with(credentials)?;
        let raw: RegistrationExportJson = serde_json::from_slice(&json)?;

        Ok(Registration {
            name: self.name.clone(),
            directory_url: self.directory_url.clone(),
            location: self.location.clone(),
            resource: raw.resource,
            terms_of_service: raw.terms_of_service,
            recovery_token: raw.recovery_token,
            signing_key: key_from_pem(&self.signing_key_pem, credentials)?,
        })
    }
}

/// 授權匯出格式：整筆授權記錄（含已送出的挑戰資料）的 JSON 區塊。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationExport {
    pub json_pem: String,
}

impl AuthorizationExport {
    pub fn export(authorization: &Authorization, password: &str) -> Result<Self> {
        let json = serde_json::to_vec(authorization)?;
        Ok(Self {
            json_pem: SealedBlock::seal(LABEL_AUTHORIZATION, &json, password)?.to_pem(),
        })
    }

    pub fn import(&self, credentials: &dyn CredentialProvider) -> Result<Authorization> {
        let json =
            SealedBlock::from_pem(&self.json_pem, LABEL_AUTHORIZATION)?.open_with(credentials)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// 憑證匯出格式：憑證本身以一般 PEM 輸出，私鑰以加密 PEM 輸出。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateExport {
    pub name: String,
    pub registration: String,
    pub revoked: bool,
    pub location: String,
    pub link_issuer: String,
    pub certificate_pem: String,
    pub private_key_pem: Option<String>,
}

impl CertificateExport {
    pub fn export(certificate: &Certificate, password: &str) -> Result<Self> {
        let private_key_pem = certificate
            .private_key
            .as_ref()
            .map(|key| key_to_pem(key, password))
            .transpose()?;
        let certificate_pem = String::from_utf8(certificate.x509()?.to_pem()?)
            .map_err(|e| corrupted(e.to_string()))?;

        Ok(Self {
            name: certificate.name.clone(),
            registration: certificate.registration.clone(),
            revoked: certificate.revoked,
            location: certificate.location.clone(),
            link_issuer: certificate.link_issuer.clone(),
            certificate_pem,
            private_key_pem,
        })
    }

    pub fn import(&self, credentials: &dyn CredentialProvider) -> Result<Certificate> {
        let x509 = X509::from_pem(self.certificate_pem.as_bytes())?;
        let private_key = self
            .private_key_pem
            .as_deref()
            .map(|pem| key_from_pem(pem, credentials))
            .transpose()?;

        Ok(Certificate {
            name: self.name.clone(),
            registration: self.registration.clone(),
            revoked: self.revoked,
            location: self.location.clone(),
            link_issuer: self.link_issuer.clone(),
            der: x509.to_der()?,
            private_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authorization::tests::sample_authorization,
        certificate::tests::sample_certificate,
        registration::tests::sample_registration,
        store::StaticPassword,
    };

    #[test]
    fn test_sealed_block_roundtrip() -> Result<()> {
        let block = SealedBlock::seal(LABEL_AUTHORIZATION, b"{\"a\":1}", "pw")?;
        assert!(block.is_sealed());
        let pem = block.to_pem();
        assert!(pem.starts_with("-----BEGIN ACME JSON AUTHORIZATION-----"));

        let parsed = SealedBlock::from_pem(&pem, LABEL_AUTHORIZATION)?;
        assert_eq!(parsed, block);
        assert_eq!(parsed.open("pw")?, b"{\"a\":1}");
        assert!(matches!(
            parsed.open("nope"),
            Err(Error::Crypto(CryptoError::Decrypt(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_crlf_and_blank_lines_are_accepted() -> Result<()> {
        let block = SealedBlock::seal(LABEL_REGISTRATION, &[7u8; 120], "pw")?;
        let pem = block.to_pem().replace('\n', "\r\n\r\n");
        let parsed = SealedBlock::from_pem(&format!("\r\n{}\r\n", pem), LABEL_REGISTRATION)?;
        assert_eq!(parsed, block);
        assert_eq!(parsed.open("pw")?, vec![7u8; 120]);
        Ok(())
    }

    #[test]
    fn test_random_salt_and_iv() -> Result<()> {
        let a = SealedBlock::seal(LABEL_REGISTRATION, b"same", "pw")?;
        let b = SealedBlock::seal(LABEL_REGISTRATION, b"same", "pw")?;
        assert_ne!(a.to_pem(), b.to_pem());
        assert_eq!(a.open("pw")?, b.open("pw")?);
        Ok(())
    }

    #[test]
    fn test_empty_password_is_plain() -> Result<()> {
        let block = SealedBlock::seal(LABEL_REGISTRATION, b"plain", "")?;
        assert!(!block.is_sealed());
        assert!(!block.to_pem().contains(ENCRYPTION_HEADER));
        assert_eq!(block.open("ignored")?, b"plain");
        Ok(())
    }

    #[test]
    fn test_wrong_label_is_rejected() -> Result<()> {
        let pem = SealedBlock::seal(LABEL_REGISTRATION, b"x", "")?.to_pem();
        assert!(SealedBlock::from_pem(&pem, LABEL_AUTHORIZATION).is_err());
        let twice = format!("{}{}", pem, pem);
        assert!(SealedBlock::from_pem(&twice, LABEL_REGISTRATION).is_err());
        Ok(())
    }

    #[test]
    fn test_registration_export_roundtrip() -> Result<()> {
        let registration = sample_registration("main");
        let export = RegistrationExport::export(&registration, "hunter2")?;
        assert!(export.signing_key_pem.contains("ENCRYPTED"));

        let imported = export.import(&StaticPassword::new("hunter2"))?;
        assert_eq!(imported, registration);

        assert!(export.import(&StaticPassword::new("wrong")).is_err());
        Ok(())
    }

    #[test]
    fn test_authorization_export_roundtrip() -> Result<()> {
        let authorization = sample_authorization("main", "example.com");
        let export = AuthorizationExport::export(&authorization, "pw")?;
        assert_eq!(export.import(&StaticPassword::new("pw"))?, authorization);
        Ok(())
    }

    #[test]
    fn test_certificate_export_roundtrip() -> Result<()> {
        let certificate = sample_certificate("main", "www", "https://ca.test/cert/1");
        let export = CertificateExport::export(&certificate, "pw")?;
        assert!(export.private_key_pem.as_deref().unwrap().contains("ENCRYPTED"));

        let imported = export.import(&StaticPassword::new("pw"))?;
        assert_eq!(imported, certificate);
        Ok(())
    }
}
