use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509Name, X509Req, X509},
};

use crate::{
    error::{Error, Result},
    key_pair::SigningKey,
};

/// X.509 的 CN 長度上限；較長的名稱只放在 SAN。
const MAX_COMMON_NAME_LEN: usize = 64;

fn subject_name(common_name: &str) -> Result<X509Name> {
    let mut name = X509Name::builder()?;
    if common_name.len() <= MAX_COMMON_NAME_LEN {
        name.append_entry_by_text("CN", common_name)?;
    }
    Ok(name.build())
}

/// 以 DNS 主體替代名稱 (SAN) 建立憑證簽名請求。
///
/// # 範例
///
/// ```no_run
/// # use acme_draft_client::{csr::Csr, key_pair::{KeyType, SigningKey}};
/// let key = SigningKey::generate(KeyType::Rsa { bits: 2048 })?;
/// let der = Csr::new()
///     .add_name("example.com")
///     .add_name("www.example.com")
///     .build(&key)?
///     .to_der()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Csr {
    names: Vec<String>,
}

impl Csr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// 新增一個 DNS 名稱；第一個名稱同時作為主體 CN。
    pub fn add_name(mut self, dns_name: &str) -> Self {
        self.names.push(dns_name.to_string());
        self
    }

    /// 至少需要一個名稱，否則回傳 `Error::InvalidState`。
    pub fn build(self, key: &SigningKey) -> Result<X509Req> {
        let Some(common_name) = self.names.first() else {
            return Err(Error::InvalidState("CSR needs at least one DNS name".into()));
        };

        let mut builder = X509Req::builder()?;
        let subject = subject_name(common_name)?;
        builder.set_subject_name(&subject)?;

        let mut san = SubjectAlternativeName::new();
        for name in &self.names {
            san.dns(name);
        }
        let extension = san.build(&builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(extension)?;
        builder.add_extensions(&extensions)?;

        builder.set_pubkey(key.pkey())?;
        builder.sign(key.pkey(), MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

/// 產生含指定 DNS 名稱的自簽憑證。
pub fn self_signed_certificate(key: &SigningKey, names: &[String], days: u32) -> Result<X509> {
    let Some(common_name) = names.first() else {
        return Err(Error::InvalidState("certificate needs at least one DNS name".into()));
    };

    let name = subject_name(common_name)?;

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key.pkey())?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let mut san = SubjectAlternativeName::new();
    for name in names {
        san.dns(name);
    }
    let extension = san.build(&builder.x509v3_context(None, None))?;
    builder.append_extension(extension)?;

    builder.sign(key.pkey(), MessageDigest::sha256())?;
    Ok(builder.build())
}
