//! 協議訊息中的 `resource` 鑑別欄位。
//!
//! 每個標籤型別序列化為固定字串；解碼時若欄位存在則值必須相符，
//! 搭配 `#[serde(default)]` 使用時允許欄位缺席。

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

macro_rules! resource_tag {
    ($(#[$meta:meta])* $name:ident => $value:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl $name {
            pub const VALUE: &'static str = $value;
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                if value == $value {
                    Ok($name)
                } else {
                    Err(de::Error::custom(format!(
                        "expected resource {}, got {:?}",
                        $value, value
                    )))
                }
            }
        }
    };
}

resource_tag!(NewRegistrationTag => "new-reg");
resource_tag!(RecoverRegistrationTag => "recover-reg");
resource_tag!(NewAuthorizationTag => "new-authz");
resource_tag!(NewCertificateTag => "new-cert");
resource_tag!(RevokeCertificateTag => "revoke-cert");
resource_tag!(
    /// 既有帳戶資源。
    RegistrationTag => "reg"
);
resource_tag!(AuthorizationTag => "authz");
resource_tag!(ChallengeTag => "challenge");
resource_tag!(CertificateTag => "cert");
