use std::fmt;

use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sha::sha256,
    symm::Cipher,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{
    jwk::Jwk,
    jws::{b64url, Jws},
    signature::SignatureAlgorithmFactory,
};

/// 金鑰與簽章相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),
    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed JWS: {0}")]
    MalformedJws(String),
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// 本模組使用的結果類型。
pub type Result<T> = std::result::Result<T, CryptoError>;

/// 支援的橢圓曲線。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl Curve {
    fn nid(self) -> Nid {
        match self {
            Curve::P224 => Nid::SECP224R1,
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }

    pub(crate) fn from_nid(nid: Nid) -> Option<Self> {
        [Curve::P224, Curve::P256, Curve::P384, Curve::P521]
            .into_iter()
            .find(|curve| curve.nid() == nid)
    }

    /// JWK 中 `crv` 欄位使用的名稱。
    pub fn jwk_name(self) -> &'static str {
        match self {
            Curve::P224 => "P-224",
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }
}

/// 產生新金鑰時使用的類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa { bits: u32 },
    Ec(Curve),
}

/// 帳戶或憑證使用的非對稱私鑰。
///
/// 建立後即為唯讀，可安全地在多個操作間共用；`Clone` 只增加 OpenSSL 的參考計數。
#[derive(Clone)]
pub struct SigningKey {
    key: PKey<Private>,
}

impl SigningKey {
    /// 根據指定類型產生新的私鑰。
    pub fn generate(key_type: KeyType) -> Result<Self> {
        let key = match key_type {
            KeyType::Rsa { bits } => PKey::from_rsa(Rsa::generate(bits)?)?,
            KeyType::Ec(curve) => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        Self::from_pkey(key)
    }

    /// 包裝既有的 OpenSSL 私鑰，僅接受 RSA 與受支援曲線的 EC 金鑰。
    pub fn from_pkey(key: PKey<Private>) -> Result<Self> {
        match key.id() {
            Id::RSA => Ok(Self { key }),
            Id::EC => {
                let nid = key.ec_key()?.group().curve_name();
                match nid.and_then(Curve::from_nid) {
                    Some(_) => Ok(Self { key }),
                    None => Err(CryptoError::UnsupportedKey("unsupported EC curve".into())),
                }
            }
            other => Err(CryptoError::UnsupportedKey(format!(
                "key type id {}",
                other.as_raw()
            ))),
        }
    }

    /// 從 PEM 格式（PKCS#8 或傳統格式）讀取私鑰。
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::from_pkey(PKey::private_key_from_pem(pem)?)
    }

    /// 從以密碼加密的 PEM 讀取私鑰。
    pub fn from_pem_with_passphrase(pem: &[u8], passphrase: &[u8]) -> Result<Self> {
        let key = PKey::private_key_from_pem_passphrase(pem, passphrase)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        Self::from_pkey(key)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    /// 以 AES-256-CBC 與指定密碼加密輸出 PKCS#8 PEM。
    pub fn to_pem_with_passphrase(&self, passphrase: &[u8]) -> Result<Vec<u8>> {
        Ok(self
            .key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), passphrase)?)
    }

    pub fn pkey(&self) -> &PKey<Private> {
        &self.key
    }

    /// EC 金鑰的曲線，RSA 金鑰回傳 `None`。
    pub fn curve(&self) -> Option<Curve> {
        if self.key.id() != Id::EC {
            return None;
        }
        self.key
            .ec_key()
            .ok()
            .and_then(|ec| ec.group().curve_name())
            .and_then(Curve::from_nid)
    }

    /// 此金鑰簽章時使用的 JWS `alg` 名稱。
    pub fn algorithm(&self) -> Result<&'static str> {
        Ok(SignatureAlgorithmFactory::for_key(self)?.name())
    }

    pub fn jwk(&self) -> Result<Jwk> {
        Jwk::from_key(&self.key)
    }

    /// 公鑰 JWK 的 SHA-256 縮影（RFC 7638）。
    pub fn thumbprint(&self) -> Result<[u8; 32]> {
        Ok(sha256(self.jwk()?.thumbprint_input()?.as_bytes()))
    }

    /// 以 URL-safe Base64 編碼的縮影。
    pub fn thumbprint_b64(&self) -> Result<String> {
        Ok(b64url(self.thumbprint()?))
    }

    /// 對 payload 簽章並產生 JWS，`nonce` 為空字串時省略該標頭。
    pub fn sign(&self, payload: &[u8], nonce: &str) -> Result<Jws> {
        Jws::sign(self, payload, nonce)
    }

    fn der(&self) -> Option<Vec<u8>> {
        self.key.private_key_to_der().ok()
    }
}

impl PartialEq for SigningKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.der(), other.der()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.key.id().as_raw())
            .field("bits", &self.key.bits())
            .finish()
    }
}

// 記錄以 PEM 字串形式序列化，整筆記錄的加密由儲存層負責。
impl Serialize for SigningKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let pem = self.to_pem().map_err(serde::ser::Error::custom)?;
        let pem = String::from_utf8(pem).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&pem)
    }
}

impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pem = String::deserialize(deserializer)?;
        SigningKey::from_pem(pem.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_rsa_and_ec() -> Result<()> {
        let rsa = SigningKey::generate(KeyType::Rsa { bits: 2048 })?;
        assert_eq!(rsa.algorithm()?, "PS512");
        assert_eq!(rsa.curve(), None);

        let ec = SigningKey::generate(KeyType::Ec(Curve::P256))?;
        assert_eq!(ec.algorithm()?, "ES256");
        assert_eq!(ec.curve(), Some(Curve::P256));

        let ec = SigningKey::generate(KeyType::Ec(Curve::P521))?;
        assert_eq!(ec.algorithm()?, "ES512");
        Ok(())
    }

    #[test]
    fn test_pem_roundtrip_with_and_without_passphrase() -> Result<()> {
        let key = SigningKey::generate(KeyType::Ec(Curve::P384))?;

        let plain = SigningKey::from_pem(&key.to_pem()?)?;
        assert_eq!(plain, key);

        let sealed = key.to_pem_with_passphrase(b"secret")?;
        assert!(String::from_utf8_lossy(&sealed).contains("ENCRYPTED"));
        let opened = SigningKey::from_pem_with_passphrase(&sealed, b"secret")?;
        assert_eq!(opened, key);

        assert!(matches!(
            SigningKey::from_pem_with_passphrase(&sealed, b"wrong"),
            Err(CryptoError::Decrypt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_thumbprint_is_stable() -> Result<()> {
        let key = SigningKey::generate(KeyType::Ec(Curve::P256))?;
        assert_eq!(key.thumbprint_b64()?, key.thumbprint_b64()?);
        assert_eq!(key.thumbprint_b64()?.len(), 43);

        let other = SigningKey::generate(KeyType::Ec(Curve::P256))?;
        assert_ne!(key.thumbprint()?, other.thumbprint()?);
        Ok(())
    }

    #[test]
    fn test_serde_uses_pem() -> Result<()> {
        let key = SigningKey::generate(KeyType::Ec(Curve::P256))?;
        let json = serde_json::to_string(&key)?;
        assert!(json.contains("BEGIN PRIVATE KEY"));
        let back: SigningKey = serde_json::from_str(&json)?;
        assert_eq!(back, key);
        Ok(())
    }
}
