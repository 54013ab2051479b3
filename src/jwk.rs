use openssl::{
    bn::{BigNum, BigNumContext},
    pkey::{HasPublic, Id, PKeyRef},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    jws::b64url,
    key_pair::{CryptoError, Curve, Result},
};

/// JSON Web Key 的公鑰表示，依 `kty` 區分 RSA 與 EC。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    /// 從 OpenSSL 金鑰的公開部分建立 JWK。
    pub fn from_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: b64url(rsa.n().to_vec()),
                    e: b64url(rsa.e().to_vec()),
                }))
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let group = ec.group();
                let curve = group
                    .curve_name()
                    .and_then(Curve::from_nid)
                    .ok_or_else(|| CryptoError::UnsupportedKey("unsupported EC curve".into()))?;

                // 座標依欄位大小補零，P-521 為 66 位元組
                let size = ((group.degree() + 7) / 8) as i32;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)?;

                Ok(Jwk::Ec(EcJwk {
                    crv: curve.jwk_name().to_string(),
                    x: b64url(x.to_vec_padded(size)?),
                    y: b64url(y.to_vec_padded(size)?),
                }))
            }
            _ => Err(CryptoError::UnsupportedKey("only RSA and EC keys have a JWK".into())),
        }
    }

    /// 產生 RFC 7638 縮影用的正規化 JSON：只含必要成員且依字典序排列。
    pub fn thumbprint_input(&self) -> Result<String> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
        }

        Ok(serde_json::to_string(&Value::Object(map))?)
    }
}
