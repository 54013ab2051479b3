use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    pkey::{Id, PKeyRef, Private},
    rsa::Padding,
    sign::{RsaPssSaltlen, Signer, Verifier},
};

use crate::key_pair::{CryptoError, Curve, Result, SigningKey};

/// 定義簽名演算法的介面。
///
/// 每種金鑰類型各自實作簽章與驗證，輸出為 JWS 所需的原始簽章位元組。
pub(crate) trait SignatureAlgorithmT {
    /// JWS `alg` 名稱。
    fn name(&self) -> &'static str;

    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>>;

    fn verify(&self, data: &[u8], signature: &[u8], key: &PKeyRef<Private>) -> Result<bool>;
}

/// RSA 金鑰固定使用 PS512（SHA-512、PSS、salt 長度等於摘要長度）。
struct RsaPssSignature;

impl SignatureAlgorithmT for RsaPssSignature {
    fn name(&self) -> &'static str {
        "PS512"
    }

    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha512(), key)?;
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &PKeyRef<Private>) -> Result<bool> {
        let mut verifier = Verifier::new(MessageDigest::sha512(), key)?;
        verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
        verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature)?)
    }
}

/// ECDSA 簽章，雜湊強度依曲線而定；JWS 需要固定長度的 `r || s`，而非 DER。
struct EcdsaSignature {
    name: &'static str,
    digest: MessageDigest,
    size: usize,
}

impl EcdsaSignature {
    fn for_curve(curve: Curve) -> Self {
        match curve {
            Curve::P224 => Self {
                name: "ES256",
                digest: MessageDigest::sha256(),
                size: 28,
            },
            Curve::P256 => Self {
                name: "ES256",
                digest: MessageDigest::sha256(),
                size: 32,
            },
            Curve::P384 => Self {
                name: "ES384",
                digest: MessageDigest::sha384(),
                size: 48,
            },
            Curve::P521 => Self {
                name: "ES512",
                digest: MessageDigest::sha512(),
                size: 66,
            },
        }
    }
}

impl SignatureAlgorithmT for EcdsaSignature {
    fn name(&self) -> &'static str {
        self.name
    }

    fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>> {
        let mut signer = Signer::new(self.digest, key)?;
        signer.update(data)?;
        let der = signer.sign_to_vec()?;

        let sig = EcdsaSig::from_der(&der)?;
        let mut raw = sig.r().to_vec_padded(self.size as i32)?;
        raw.extend(sig.s().to_vec_padded(self.size as i32)?);
        Ok(raw)
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &PKeyRef<Private>) -> Result<bool> {
        if signature.len() != 2 * self.size {
            return Ok(false);
        }
        let r = BigNum::from_slice(&signature[..self.size])?;
        let s = BigNum::from_slice(&signature[self.size..])?;
        let der = EcdsaSig::from_private_components(r, s)?.to_der()?;

        let mut verifier = Verifier::new(self.digest, key)?;
        verifier.update(data)?;
        Ok(verifier.verify(&der)?)
    }
}

/// 簽名演算法工廠，根據金鑰選擇對應的實作。
pub(crate) struct SignatureAlgorithmFactory;

impl SignatureAlgorithmFactory {
    pub(crate) fn for_key(key: &SigningKey) -> Result<Box<dyn SignatureAlgorithmT>> {
        match key.pkey().id() {
            Id::RSA => Ok(Box::new(RsaPssSignature)),
            Id::EC => {
                let curve = key
                    .curve()
                    .ok_or_else(|| CryptoError::UnsupportedKey("unsupported EC curve".into()))?;
                Ok(Box::new(EcdsaSignature::for_curve(curve)))
            }
            _ => Err(CryptoError::UnsupportedKey("no signature algorithm for key".into())),
        }
    }
}

/// 對 `signing_input` 簽章並回傳原始簽章位元組。
pub(crate) fn create_signature(signing_input: &[u8], key: &SigningKey) -> Result<Vec<u8>> {
    SignatureAlgorithmFactory::for_key(key)?.sign(signing_input, key.pkey())
}

/// 以金鑰的公開部分驗證簽章。
pub(crate) fn verify_signature(
    signing_input: &[u8],
    signature: &[u8],
    key: &SigningKey,
) -> Result<()> {
    if SignatureAlgorithmFactory::for_key(key)?.verify(signing_input, signature, key.pkey())? {
        Ok(())
    } else {
        Err(CryptoError::BadSignature)
    }
}
