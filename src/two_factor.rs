//! Two-factor verification seam.
//!
//! TOTP and backup-code mechanics live upstream; this subsystem consumes
//! only the pass/fail outcome and feeds it into the risk model.

use crate::security_monitor::SecurityMonitor;
use async_trait::async_trait;
use std::net::IpAddr;

#[async_trait]
pub trait TwoFactorVerifier: Send + Sync {
    async fn verify_totp(&self, token: &str, secret: &str) -> bool;
    async fn verify_backup_code(&self, code: &str, code_hashes: &[String]) -> bool;
}

/// Verify a TOTP token and feed the outcome into the security monitor in
/// one step. Returns the verifier's verdict unchanged.
pub async fn verify_totp_and_track(
    verifier: &dyn TwoFactorVerifier,
    monitor: &SecurityMonitor,
    user_id: &str,
    ip: IpAddr,
    token: &str,
    secret: &str,
) -> bool {
    let success = verifier.verify_totp(token, secret).await;
    monitor.track_two_factor_attempt(success, user_id, ip).await;
    success
}

/// Backup-code counterpart of [`verify_totp_and_track`].
pub async fn verify_backup_code_and_track(
    verifier: &dyn TwoFactorVerifier,
    monitor: &SecurityMonitor,
    user_id: &str,
    ip: IpAddr,
    code: &str,
    code_hashes: &[String],
) -> bool {
    let success = verifier.verify_backup_code(code, code_hashes).await;
    monitor.track_two_factor_attempt(success, user_id, ip).await;
    success
}
