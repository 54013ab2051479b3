use chrono::{DateTime, SecondsFormat, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    csr::Csr,
    directory::{DirectoryCatalog, Endpoint},
    error::{Error, Result},
    jws::b64url,
    key_pair::SigningKey,
    registration::Registration,
    resource::{NewCertificateTag, RevokeCertificateTag},
    store::{CertificateInfo, PersistentStore},
    transport::{HttpResponse, Transport, PKIX_CERT},
};

/// 本地保存的憑證記錄。
///
/// `name` 在同一帳戶下唯一，匯入的憑證名稱為空；撤銷後只標記 `revoked`，不刪除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub name: String,
    /// 所屬帳戶的名稱。
    pub registration: String,
    #[serde(default)]
    pub revoked: bool,
    pub location: String,
    /// 簽發者憑證的 URL（`Link: rel="up"`）。
    #[serde(default)]
    pub link_issuer: String,
    /// DER 編碼的憑證。
    #[serde(with = "der_base64")]
    pub der: Vec<u8>,
    #[serde(default)]
    pub private_key: Option<SigningKey>,
}

mod der_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(der: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(der))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(de::Error::custom)
    }
}

impl Certificate {
    pub fn x509(&self) -> Result<X509> {
        Ok(X509::from_der(&self.der)?)
    }

    /// 憑證的到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let x509 = self.x509()?;
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(x509.not_after())?;
        let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
        DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
            Error::InvalidState(format!("certificate {} has an invalid expiry", self.location))
        })
    }

    /// 剩餘有效時間不超過 `threshold_days` 天（或已過期）時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        let remaining = self.not_after()? - Utc::now();
        Ok(remaining.num_seconds() <= i64::from(threshold_days) * 86_400)
    }

    pub fn is_expired(&self) -> Result<bool> {
        Ok(self.not_after()? <= Utc::now())
    }
}

#[derive(Serialize)]
struct NewCertificatePayload {
    resource: NewCertificateTag,
    csr: String,
}

#[derive(Serialize)]
struct RevokeCertificatePayload {
    resource: RevokeCertificateTag,
    certificate: String,
}

/// 憑證的申請、刷新、撤銷與續期命名。
pub struct CertificateIssuer<'a> {
    transport: &'a Transport,
    store: &'a dyn PersistentStore,
}

impl<'a> CertificateIssuer<'a> {
    pub fn new(transport: &'a Transport, store: &'a dyn PersistentStore) -> Self {
        Self { transport, store }
    }

    /// 送出 DER 編碼的 CSR，並以 `name` 儲存簽發的憑證。
    ///
    /// 回應必須帶有 `Location` 且內容類型恰為 `application/pkix-cert`。
    pub fn request(
        &self,
        registration: &Registration,
        name: &str,
        csr_der: &[u8],
        private_key: Option<SigningKey>,
    ) -> Result<Certificate> {
        let directory = DirectoryCatalog::new(self.transport, self.store)
            .get(&registration.directory_url, false)?;
        let url = directory.require(Endpoint::NewCertificate)?;
        let payload = NewCertificatePayload {
            resource: NewCertificateTag,
            csr: b64url(csr_der),
        };

        let response = self.transport.post_signed(
            url,
            &registration.signing_key,
            &payload,
            Some(PKIX_CERT),
        )?;
        let location = response.require_location()?;
        let der = Self::certificate_body(&response)?;

        let certificate = Certificate {
            name: name.to_string(),
            registration: registration.name.clone(),
            revoked: false,
            location,
            link_issuer: response.link("up").unwrap_or_default().to_string(),
            der,
            private_key,
        };
        self.store.new_certificate(&certificate)?;
        info!(name, location = %certificate.location, "certificate issued");
        Ok(certificate)
    }

    /// 以 GET 重新下載憑證。
    pub fn refresh(&self, certificate: &mut Certificate) -> Result<()> {
        let response = self.transport.get(&certificate.location, Some(PKIX_CERT))?;
        certificate.der = Self::certificate_body(&response)?;
        if let Some(issuer) = response.link("up") {
            certificate.link_issuer = issuer.to_string();
        }
        self.store.set_certificate(certificate)?;
        debug!(location = %certificate.location, "certificate refreshed");
        Ok(())
    }

    /// 以帳戶金鑰簽章撤銷憑證；只有 HTTP 200 視為成功。
    pub fn revoke(&self, registration: &Registration, certificate: &mut Certificate) -> Result<()> {
        let directory = DirectoryCatalog::new(self.transport, self.store)
            .get(&registration.directory_url, false)?;
        let url = directory.require(Endpoint::RevokeCertificate)?;
        let payload = RevokeCertificatePayload {
            resource: RevokeCertificateTag,
            certificate: b64url(&certificate.der),
        };

        let response = self
            .transport
            .post_signed(url, &registration.signing_key, &payload, None)?;
        if response.status.as_u16() != 200 {
            return Err(Error::protocol(
                url,
                format!("unexpected revocation status {}", response.status_text()),
            ));
        }

        certificate.revoked = true;
        self.store.set_certificate(certificate)?;
        info!(location = %certificate.location, "certificate revoked");
        Ok(())
    }

    pub fn load(
        &self,
        registration: &Registration,
        name_or_location: &str,
    ) -> Result<Option<Certificate>> {
        self.store.load_certificate(&registration.name, name_or_location)
    }

    /// 將憑證改名為 `<name>#<到期時間>`，讓出原名稱給新的憑證。
    pub fn supersede(&self, certificate: &mut Certificate) -> Result<()> {
        if certificate.name.is_empty() {
            return Ok(());
        }
        let suffix = certificate
            .not_after()?
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let renamed = format!("{}#{}", certificate.name, suffix);
        debug!(from = %certificate.name, to = %renamed, "superseding certificate");
        certificate.name = renamed;
        self.store.set_certificate(certificate)
    }

    /// 尚未撤銷、且已有同名新憑證取代的舊憑證，附上新憑證的名稱。
    pub fn superseded(&self, registration: &Registration) -> Result<Vec<(CertificateInfo, String)>> {
        let mut found = Vec::new();
        for info in self.infos(registration, false)? {
            let Some((name, _)) = info.name.split_once('#') else {
                continue;
            };
            let name = name.to_string();
            if self.load(registration, &name)?.is_some() {
                found.push((info, name));
            }
        }
        Ok(found)
    }

    /// 產生 CSR 並申請 `domains` 的憑證。
    ///
    /// 名稱已被使用時，`replace` 為假回傳 `Error::Conflict`，否則先讓舊憑證改名。
    pub fn issue(
        &self,
        registration: &Registration,
        name: &str,
        domains: &[String],
        key: SigningKey,
        replace: bool,
    ) -> Result<Certificate> {
        if !name.is_empty() {
            if let Some(mut existing) = self.load(registration, name)? {
                if !replace {
                    return Err(Error::Conflict(format!(
                        "there already is a certificate with name {:?}",
                        name
                    )));
                }
                self.supersede(&mut existing)?;
            }
        }

        let csr = Csr::with_names(domains.iter().cloned())
            .build(&key)?
            .to_der()?;
        self.request(registration, name, &csr, Some(key))
    }

    /// 匯入伺服器上的憑證；已存在時依 `refresh` 決定是否重新下載。
    pub fn import_by_url(
        &self,
        registration: &Registration,
        url: &str,
        refresh: bool,
    ) -> Result<Certificate> {
        if let Some(mut certificate) = self.load(registration, url)? {
            if refresh {
                self.refresh(&mut certificate)?;
            }
            return Ok(certificate);
        }

        let response = self.transport.get(url, Some(PKIX_CERT))?;
        let certificate = Certificate {
            name: String::new(),
            registration: registration.name.clone(),
            revoked: false,
            location: url.to_string(),
            link_issuer: response.link("up").unwrap_or_default().to_string(),
            der: Self::certificate_body(&response)?,
            private_key: None,
        };
        self.store.new_certificate(&certificate)?;
        info!(url, "certificate imported");
        Ok(certificate)
    }

    /// 匯入帳戶 `certificates` 清單中的所有憑證。
    pub fn fetch_all(&self, registration: &Registration, update_all: bool) -> Result<()> {
        let urls = self
            .transport
            .get_list(&registration.resource.certificates, "certificates")?;
        for url in urls {
            self.import_by_url(registration, &url, update_all)?;
        }
        Ok(())
    }

    pub fn infos(
        &self,
        registration: &Registration,
        include_all: bool,
    ) -> Result<Vec<CertificateInfo>> {
        self.store.certificate_infos(&registration.name, include_all)
    }

    fn certificate_body(response: &HttpResponse) -> Result<Vec<u8>> {
        if response.content_type.as_deref() != Some(PKIX_CERT) {
            return Err(Error::protocol(
                &response.url,
                format!(
                    "unexpected content type {:?}, expected {}",
                    response.content_type, PKIX_CERT
                ),
            ));
        }
        X509::from_der(&response.body).map_err(|e| {
            Error::protocol(&response.url, format!("failed parsing certificate: {}", e))
        })?;
        Ok(response.body.clone())
    }
}
