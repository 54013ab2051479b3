//! 此模組提供 JSON Web Signature (JWS) 的建立、序列化、解析與驗證。
//!
//! 協議請求使用 flattened JSON 序列化 `{protected, payload, signature}`；
//! compact 形式 `protected.payload.signature` 用於 dvsni 的 SNI 名稱推導。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{
    jwk::Jwk,
    key_pair::{CryptoError, Result, SigningKey},
    signature::{create_signature, verify_signature},
};

/// URL-safe、無補位的 Base64 編碼。
pub fn b64url(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64url_decode(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))
}

/// JWS 的受保護標頭。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    pub jwk: Jwk,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

/// 已簽章的 JWS 物件，各欄位皆為 Base64 URL 編碼字串。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl Jws {
    /// 以金鑰對 payload 簽章；`nonce` 為空時標頭不含 nonce。
    pub fn sign(key: &SigningKey, payload: &[u8], nonce: &str) -> Result<Self> {
        let header = ProtectedHeader {
            alg: key.algorithm()?.to_string(),
            jwk: key.jwk()?,
            nonce: nonce.to_string(),
        };
        let protected = b64url(serde_json::to_vec(&header)?);
        let payload = b64url(payload);
        let signing_input = format!("{}.{}", protected, payload);
        let signature = b64url(create_signature(signing_input.as_bytes(), key)?);

        Ok(Self {
            protected,
            payload,
            signature,
        })
    }

    /// 解析 JWS 文字，接受 flattened JSON 與 compact 兩種形式。
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.starts_with('{') {
            return Ok(serde_json::from_str(text)?);
        }

        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [protected, payload, signature] => Ok(Self {
                protected: protected.to_string(),
                payload: payload.to_string(),
                signature: signature.to_string(),
            }),
            _ => Err(CryptoError::MalformedJws(format!(
                "expected 3 segments, found {}",
                parts.len()
            ))),
        }
    }

    pub fn compact(&self) -> String {
        format!("{}.{}.{}", self.protected, self.payload, self.signature)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn header(&self) -> Result<ProtectedHeader> {
        Ok(serde_json::from_slice(&b64url_decode(&self.protected)?)?)
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(b64url_decode(&self.payload)?)
    }

    /// 以指定金鑰驗證簽章，成功時回傳解碼後的 payload。
    ///
    /// 標頭中的 `alg` 與 `jwk` 必須與金鑰相符，否則視為驗證失敗。
    pub fn verify(&self, key: &SigningKey) -> Result<Vec<u8>> {
        let header = self.header()?;
        if header.alg != key.algorithm()? || header.jwk != key.jwk()? {
            return Err(CryptoError::BadSignature);
        }

        let signing_input = format!("{}.{}", self.protected, self.payload);
        let signature = b64url_decode(&self.signature)?;
        verify_signature(signing_input.as_bytes(), &signature, key)?;

        self.payload_bytes()
    }
}
