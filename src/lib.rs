//! # ACME Draft Protocol Client
//!
//! 本庫實作早期草案版 ACME 協議的客戶端引擎：以 JWS 簽章的 JSON 請求完成
//! 帳戶註冊、網域授權（挑戰回應）以及憑證的簽發與撤銷。
//!
//! - **transport**: 每個變更狀態的請求都先取得新的 `Replay-Nonce`，再簽章並送出。
//! - **directory**: 取得並快取協議根 URL 的端點目錄。
//! - **registration**: 帳戶的建立、刷新、更新與服務條款同意。
//! - **authorization**: 授權的建立、刷新、輪詢與挑戰組合判斷。
//! - **challenge**: http-01、simpleHttp、dvsni 三種挑戰的推導、顯示與自我驗證。
//! - **certificate**: 送出 CSR、下載、撤銷與續期命名。
//! - **store**: 持久化契約；含私鑰的記錄以工作階段密碼加密保存。
//!
//! ## 示例
//!
//! ```no_run
//! use acme_draft_client::{
//!     authorization::AuthorizationStatus,
//!     config::ClientConfig,
//!     flow::{authorize_batch, BatchOutcome},
//!     session::Session,
//!     store::StaticPassword,
//!     ui::Unattended,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .directory_url("https://acme-staging.api.letsencrypt.org/directory")
//!         .storage_path("/tmp/acme-draft-client")
//!         .build();
//!     let session = Session::open(config, Box::new(StaticPassword::new("secret")))?;
//!
//!     // 1. 註冊帳戶並同意服務條款
//!     let mut registration = session.register("main", vec!["mailto:admin@example.com".into()])?;
//!     session
//!         .registrar()
//!         .review_terms(&mut registration, &Unattended, false, true)?;
//!
//!     // 2. 批次授權網域
//!     let domains = vec!["example.com".to_string()];
//!     let results = authorize_batch(&session, &registration, &domains, &Unattended, true);
//!     let all_valid = results
//!         .iter()
//!         .all(|(_, outcome)| *outcome == BatchOutcome::Finished(AuthorizationStatus::Valid));
//!     if !all_valid {
//!         return Err(format!("authorization incomplete: {:?}", results).into());
//!     }
//!
//!     // 3. 申請憑證
//!     let key = acme_draft_client::key_pair::SigningKey::generate(
//!         acme_draft_client::key_pair::KeyType::Rsa { bits: 2048 },
//!     )?;
//!     let certificate = session
//!         .certificates()
//!         .issue(&registration, "www", &domains, key, false)?;
//!     println!("issued {}", certificate.location);
//!
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod csr;
pub mod directory;
pub mod error;
pub mod export;
pub mod flow;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod registration;
pub mod resource;
pub mod session;
pub mod signature;
pub mod storage;
pub mod store;
pub mod transport;
pub mod ui;

pub use error::{Error, Result};
