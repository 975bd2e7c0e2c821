//! Call authorization
//!
//! Voice calls are gated by account age: accounts registered at or before a
//! cutoff keep access, newer ones are feature-locked. The gate can be
//! switched off entirely. Identity lookups go through [`UserDirectory`],
//! which the embedding service implements against its own user store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};

use super::protocol::ErrorCode;
use crate::config::AccessConfig;

/// Minimal view of a user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub is_active: bool,
    /// Registration time as stored, e.g. `2024-01-15 10:30:45.123456+00`
    pub created_at: String,
}

/// Identity and relationship lookups provided by the host service
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a session token to a user id
    async fn authenticate(&self, token: &str) -> Option<String>;

    async fn find_user(&self, user_id: &str) -> Option<UserRecord>;

    /// Whether `caller` is allowed to ring `callee` (friendship, blocks)
    async fn may_call(&self, caller_id: &str, callee_id: &str) -> bool;
}

/// Decides whether a call attempt may proceed
#[async_trait]
pub trait CallPolicy: Send + Sync {
    async fn authorize_call(&self, caller_id: &str, callee_id: &str) -> Result<(), ErrorCode>;
}

/// Allows every call
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl CallPolicy for AllowAll {
    async fn authorize_call(&self, _caller_id: &str, _callee_id: &str) -> Result<(), ErrorCode> {
        Ok(())
    }
}

/// Registration cutoff gate
#[derive(Debug, Clone)]
pub struct VoipAccessControl {
    cutoff_timestamp: i64,
    enabled: bool,
}

impl VoipAccessControl {
    pub fn new(cutoff_timestamp: i64, enabled: bool) -> Self {
        if enabled {
            tracing::info!(cutoff = cutoff_timestamp, "VoIP access control enabled");
        } else {
            tracing::info!("VoIP access control disabled, all users allowed");
        }
        Self {
            cutoff_timestamp,
            enabled,
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(config.cutoff_timestamp, config.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn cutoff_timestamp(&self) -> i64 {
        self.cutoff_timestamp
    }

    pub fn set_cutoff_timestamp(&mut self, timestamp: i64) {
        self.cutoff_timestamp = timestamp;
    }

    pub fn check_access_by_timestamp(&self, registered_at: i64) -> bool {
        registered_at <= self.cutoff_timestamp
    }

    /// Unknown, inactive, or unparseable accounts are denied
    pub fn check_user_access(&self, user: Option<&UserRecord>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(user) = user else {
            tracing::warn!("VoIP access check: user not found");
            return false;
        };
        if !user.is_active {
            tracing::warn!(user_id = %user.id, "VoIP access check: user inactive");
            return false;
        }

        let Some(registered_at) = parse_timestamp(&user.created_at) else {
            tracing::error!(user_id = %user.id, created_at = %user.created_at, "Unparseable registration time");
            return false;
        };

        let allowed = self.check_access_by_timestamp(registered_at);
        if allowed {
            tracing::debug!(user_id = %user.id, "VoIP access granted");
        } else {
            tracing::info!(
                user_id = %user.id,
                registered = %user.created_at,
                cutoff = self.cutoff_timestamp,
                "VoIP access denied"
            );
        }
        allowed
    }
}

/// Parse a registration timestamp to Unix seconds.
///
/// Accepts RFC 3339 and the PostgreSQL `timestamptz` text form with or
/// without fractional seconds. A missing offset is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp());
    }

    const ZONED: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
    for format in ZONED {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.timestamp());
        }
    }

    const NAIVE: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    for format in NAIVE {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc().timestamp());
        }
    }

    None
}

/// Call policy backed by the access gate and the user directory
pub struct DirectoryCallPolicy<D> {
    directory: D,
    access: VoipAccessControl,
}

impl<D: UserDirectory> DirectoryCallPolicy<D> {
    pub fn new(directory: D, access: VoipAccessControl) -> Self {
        Self { directory, access }
    }

    pub fn access(&self) -> &VoipAccessControl {
        &self.access
    }
}

#[async_trait]
impl<D: UserDirectory> CallPolicy for DirectoryCallPolicy<D> {
    async fn authorize_call(&self, caller_id: &str, callee_id: &str) -> Result<(), ErrorCode> {
        let caller = self.directory.find_user(caller_id).await;
        if !self.access.check_user_access(caller.as_ref()) {
            return Err(ErrorCode::FeatureLocked);
        }

        let callee = match self.directory.find_user(callee_id).await {
            Some(user) if user.is_active => user,
            _ => return Err(ErrorCode::UserNotFound),
        };
        if !self.access.check_user_access(Some(&callee)) {
            return Err(ErrorCode::FeatureLocked);
        }

        if !self.directory.may_call(caller_id, callee_id).await {
            return Err(ErrorCode::PermissionDenied);
        }
        Ok(())
    }
}
