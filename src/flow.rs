//! 授權流程：批次自動授權與單一挑戰的互動回應。

use std::collections::BTreeSet;

use tracing::{error, info, warn};

use crate::{
    authorization::{Authorization, AuthorizationEngine, AuthorizationStatus, PollOutcome},
    challenge::HTTP01,
    error::Result,
    registration::Registration,
    session::Session,
    ui::UserInterface,
};

/// 批次流程中單一網域的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// 授權已離開 pending。
    Finished(AuthorizationStatus),
    /// 輪詢次數用盡仍為 pending。
    TimedOut,
    /// 沒有任何組合能以自動化的挑戰完成。
    Unsupported,
    /// 自我驗證失敗，未送出回應。
    VerifyFailed,
    Failed(String),
}

/// 依序為每個網域取得授權，自動回應 http-01 挑戰並輪詢結果。
///
/// 單一網域的失敗只會記錄並反映在結果中，不影響其他網域。
pub fn authorize_batch(
    session: &Session,
    registration: &Registration,
    domains: &[String],
    ui: &dyn UserInterface,
    refresh: bool,
) -> Vec<(String, BatchOutcome)> {
    let engine = session.authorizations();
    domains
        .iter()
        .map(|dns| {
            let outcome = authorize_domain(&engine, registration, dns, ui, refresh)
                .unwrap_or_else(|e| {
                    error!(dns = %dns, error = %e, "authorization failed");
                    BatchOutcome::Failed(e.to_string())
                });
            (dns.clone(), outcome)
        })
        .collect()
}

fn authorize_domain(
    engine: &AuthorizationEngine<'_>,
    registration: &Registration,
    dns: &str,
    ui: &dyn UserInterface,
    refresh: bool,
) -> Result<BatchOutcome> {
    let mut authorization = match engine.get_by_dns(registration, dns, refresh)? {
        Some(authorization) => authorization,
        None => engine.create(registration, dns)?,
    };

    let status = authorization.resource.status;
    if !status.is_pending() {
        ui.message(&format!("Authorization for {} is {}", dns, status))?;
        return Ok(BatchOutcome::Finished(status));
    }

    let mut trying = BTreeSet::new();
    for index in 0..authorization.resource.challenges.len() {
        let Some(challenge) = authorization.resource.challenges.get(index) else {
            break;
        };
        if challenge.is_validated() {
            trying.insert(index);
            continue;
        }
        if challenge.kind() != HTTP01 {
            continue;
        }

        let mut responder = engine.respond(&authorization, registration, index)?;
        responder.initialize_response(ui)?;
        if let Err(e) = responder.verify() {
            if !e.is_validation() {
                return Err(e);
            }
            engine.save_challenge_data(&mut authorization, responder.as_ref())?;
            warn!(dns, error = %e, "challenge verification failed");
            ui.message(&format!("Verification of {} failed: {}", dns, e))?;
            return Ok(BatchOutcome::VerifyFailed);
        }

        match engine.update_challenge(&mut authorization, registration, responder.as_ref()) {
            Ok(()) => {
                trying.insert(index);
                let status = authorization.resource.status;
                if !status.is_pending() {
                    info!(dns, %status, "authorization left pending after response");
                    ui.message(&format!("Authorization for {} is {}", dns, status))?;
                    return Ok(BatchOutcome::Finished(status));
                }
            }
            Err(e) => {
                warn!(
                    dns,
                    uri = %responder.challenge().uri,
                    error = %e,
                    "challenge response rejected, skipping"
                );
            }
        }
    }

    if !authorization.is_satisfiable(&trying) {
        warn!(dns, "no challenge combination can be automated");
        ui.message(&format!(
            "Cannot batch authorize {} due to unsupported challenge types",
            dns
        ))?;
        return Ok(BatchOutcome::Unsupported);
    }

    match engine.poll(&mut authorization) {
        PollOutcome::Finished(status) => {
            info!(dns, %status, "authorization finished");
            ui.message(&format!("Authorization for {} is {}", dns, status))?;
            Ok(BatchOutcome::Finished(status))
        }
        PollOutcome::TimedOut => {
            warn!(dns, "authorization timed out");
            ui.message(&format!("Authorization for {} timed out", dns))?;
            Ok(BatchOutcome::TimedOut)
        }
    }
}

/// 互動回應的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// 已送出回應，附上刷新後的狀態。
    Submitted(AuthorizationStatus),
    /// 自我驗證失敗；回應資料已保存，可稍後重試。
    VerifyFailed(String),
}

/// 引導操作者完成第 `index` 個挑戰並送出。
///
/// 伺服器拒絕回應時直接回傳錯誤。
pub fn respond_interactive(
    engine: &AuthorizationEngine<'_>,
    authorization: &mut Authorization,
    registration: &Registration,
    index: usize,
    ui: &dyn UserInterface,
) -> Result<ResponseOutcome> {
    let mut responder = engine.respond(authorization, registration, index)?;
    responder.initialize_response(ui)?;
    responder.show_instructions(ui)?;

    if let Err(e) = responder.verify() {
        if !e.is_validation() {
            return Err(e);
        }
        engine.save_challenge_data(authorization, responder.as_ref())?;
        ui.message(&format!("Verification failed: {}", e))?;
        return Ok(ResponseOutcome::VerifyFailed(e.to_string()));
    }

    engine.update_challenge(authorization, registration, responder.as_ref())?;
    let status = authorization.resource.status;
    info!(dns = authorization.dns(), %status, "challenge response submitted");
    Ok(ResponseOutcome::Submitted(status))
}
