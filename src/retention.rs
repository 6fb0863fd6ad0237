//! Retention and legal-hold policy engine.
//!
//! Pure functions, no I/O and no state. Every backend adapter consults this
//! module before honoring a retention-affecting request; the simulated and
//! real media may enforce the same rules again natively.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Regulatory default retention: 2557 days, roughly seven years.
pub const DEFAULT_RETENTION_DAYS: u32 = 2557;

/// Longest retention accepted: 36525 days, one hundred years. Indefinite
/// preservation is what legal hold is for.
pub const MAX_RETENTION_DAYS: u32 = 36_525;

/// Retention mode determining who may shorten or remove retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionMode {
    /// Nobody, including privileged callers, can shorten or remove retention.
    #[default]
    Compliance,
    /// Authorized callers may shorten or remove retention.
    Governance,
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionMode::Compliance => write!(f, "COMPLIANCE"),
            RetentionMode::Governance => write!(f, "GOVERNANCE"),
        }
    }
}

impl FromStr for RetentionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPLIANCE" => Ok(RetentionMode::Compliance),
            "GOVERNANCE" => Ok(RetentionMode::Governance),
            other => Err(format!("unknown retention mode '{}'", other)),
        }
    }
}

/// Requested retention for a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub mode: RetentionMode,
}

impl RetentionPolicy {
    pub fn compliance(retention_days: u32) -> Self {
        Self {
            retention_days,
            mode: RetentionMode::Compliance,
        }
    }

    pub fn governance(retention_days: u32) -> Self {
        Self {
            retention_days,
            mode: RetentionMode::Governance,
        }
    }

    /// Resolves the policy against a point in time.
    pub fn apply(&self, now: DateTime<Utc>) -> StorageResult<AppliedRetention> {
        Ok(AppliedRetention {
            mode: self.mode,
            retain_until: compute_expiry(now, self.retention_days)?,
        })
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::compliance(DEFAULT_RETENTION_DAYS)
    }
}

/// Retention as recorded on an object: a mode and an absolute expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRetention {
    pub mode: RetentionMode,
    pub retain_until: DateTime<Utc>,
}

impl AppliedRetention {
    /// Whole days left until expiry, rounded up; zero once expired.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> u32 {
        remaining_days(self.retain_until, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.retain_until
    }
}

/// `now + retention_days`. Fails `NOT_SUPPORTED` above
/// [`MAX_RETENTION_DAYS`].
pub fn compute_expiry(now: DateTime<Utc>, retention_days: u32) -> StorageResult<DateTime<Utc>> {
    let too_long = || {
        StorageError::NotSupported(format!(
            "retention of {} days exceeds the maximum of {} days",
            retention_days, MAX_RETENTION_DAYS
        ))
    };
    if retention_days > MAX_RETENTION_DAYS {
        return Err(too_long());
    }
    Duration::try_days(i64::from(retention_days))
        .and_then(|days| now.checked_add_signed(days))
        .ok_or_else(too_long)
}

/// Converts an absolute expiry back into remaining days, rounding up.
pub fn remaining_days(expiry: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    if expiry <= now {
        return 0;
    }
    let secs = (expiry - now).num_seconds();
    let days = (secs + 86_399) / 86_400;
    u32::try_from(days).unwrap_or(u32::MAX)
}

/// Whether retention applied in `mode` may ever be shortened.
pub fn can_shorten(mode: RetentionMode) -> bool {
    match mode {
        RetentionMode::Compliance => false,
        RetentionMode::Governance => true,
    }
}

/// Whether an object may be deleted right now.
///
/// A legal hold blocks deletion regardless of expiry; otherwise the object is
/// deletable once `now` has reached `expiry`. No expiry means no retention.
pub fn is_deletable(expiry: Option<DateTime<Utc>>, legal_hold: bool, now: DateTime<Utc>) -> bool {
    if legal_hold {
        return false;
    }
    match expiry {
        Some(expiry) => now >= expiry,
        None => true,
    }
}

/// Validates a change from `current` retention to `requested`.
///
/// Compliance retention only moves later and is never downgraded to
/// governance. Governance retention may be shortened or downgraded only when
/// `bypass_governance` is set by an authorized caller.
pub fn validate_change(
    current: Option<&AppliedRetention>,
    requested: &AppliedRetention,
    bypass_governance: bool,
) -> StorageResult<()> {
    let Some(current) = current else {
        return Ok(());
    };

    let shortens = requested.retain_until < current.retain_until;
    let downgrades =
        current.mode == RetentionMode::Compliance && requested.mode == RetentionMode::Governance;

    if !can_shorten(current.mode) {
        if shortens {
            return Err(StorageError::PermissionDenied(format!(
                "compliance retention until {} cannot be shortened to {}",
                current.retain_until, requested.retain_until
            )));
        }
        if downgrades {
            return Err(StorageError::PermissionDenied(
                "compliance retention cannot be downgraded to governance".to_string(),
            ));
        }
        return Ok(());
    }

    if shortens && !bypass_governance {
        return Err(StorageError::PermissionDenied(format!(
            "governance retention until {} can only be shortened with an authorized bypass",
            current.retain_until
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_compute_expiry() {
        let expiry = compute_expiry(t0(), 30).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap());
        assert_eq!(compute_expiry(t0(), 0).unwrap(), t0());
    }

    #[test]
    fn test_compute_expiry_bounded() {
        let longest = compute_expiry(t0(), MAX_RETENTION_DAYS).unwrap();
        assert_eq!(longest.year(), 2124);

        for days in [MAX_RETENTION_DAYS + 1, u32::MAX] {
            let err = compute_expiry(t0(), days).unwrap_err();
            assert_eq!(err.code(), "NOT_SUPPORTED");
            assert!(RetentionPolicy::governance(days).apply(t0()).is_err());
        }
    }

    #[test]
    fn test_can_shorten() {
        assert!(!can_shorten(RetentionMode::Compliance));
        assert!(can_shorten(RetentionMode::Governance));
    }

    #[test]
    fn test_legal_hold_overrides_expiry() {
        let expired = t0() - Duration::days(1);
        assert!(!is_deletable(Some(expired), true, t0()));
        assert!(is_deletable(Some(expired), false, t0()));
    }

    #[test]
    fn test_not_deletable_before_expiry() {
        let future = t0() + Duration::days(1);
        assert!(!is_deletable(Some(future), false, t0()));
        assert!(is_deletable(None, false, t0()));
        assert!(!is_deletable(None, true, t0()));
    }

    #[test]
    fn test_compliance_only_extends() {
        let current = RetentionPolicy::compliance(30).apply(t0()).unwrap();

        let longer = RetentionPolicy::compliance(60).apply(t0()).unwrap();
        assert!(validate_change(Some(&current), &longer, false).is_ok());

        let shorter = RetentionPolicy::compliance(10).apply(t0()).unwrap();
        let err = validate_change(Some(&current), &shorter, true).unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let downgrade = RetentionPolicy::governance(90).apply(t0()).unwrap();
        assert!(validate_change(Some(&current), &downgrade, true).is_err());
    }

    #[test]
    fn test_governance_shortening_needs_bypass() {
        let current = RetentionPolicy::governance(30).apply(t0()).unwrap();
        let shorter = RetentionPolicy::governance(5).apply(t0()).unwrap();
        assert!(validate_change(Some(&current), &shorter, false).is_err());
        assert!(validate_change(Some(&current), &shorter, true).is_ok());

        let upgrade = RetentionPolicy::compliance(30).apply(t0()).unwrap();
        assert!(validate_change(Some(&current), &upgrade, false).is_ok());
    }

    #[test]
    fn test_remaining_days_rounds_up() {
        let expiry = t0() + Duration::hours(25);
        assert_eq!(remaining_days(expiry, t0()), 2);
        assert_eq!(remaining_days(t0() - Duration::hours(1), t0()), 0);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("compliance".parse::<RetentionMode>().unwrap(), RetentionMode::Compliance);
        assert_eq!("GOVERNANCE".parse::<RetentionMode>().unwrap(), RetentionMode::Governance);
        assert!("strict".parse::<RetentionMode>().is_err());
    }
}
