//! Image timestamp policies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use quarry_common::{QuarryError, QuarryResult};

/// Format of every timestamp written into an image.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Build-invariant instant behind the `deterministic` policy
/// (2011-11-11 11:11:11 UTC). Images use the start of its day.
pub const DETERMINISTIC_EPOCH: i64 = 1_321_009_871;

/// How the `created` timestamp of an image is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampPolicy {
    /// Wall clock at build time, second precision.
    #[default]
    Now,
    /// The fixed date of [`DETERMINISTIC_EPOCH`] at midnight UTC.
    Deterministic,
    /// A caller-supplied UTC timestamp, not before the Unix epoch.
    Explicit(NaiveDateTime),
}

/// A timestamp resolved once per build and shared by every document and
/// archive entry of that build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTimestamp {
    /// `YYYY-MM-DDTHH:MM:SSZ`.
    pub created: String,
    /// Seconds since the Unix epoch, used as archive mtime.
    pub mtime: u64,
}

impl TimestampPolicy {
    /// Resolve the policy into a concrete timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidTimestamp`] for an explicit timestamp
    /// before the Unix epoch, and an internal error if the deterministic
    /// epoch cannot be represented.
    pub fn resolve(&self) -> QuarryResult<BuildTimestamp> {
        let instant = match self {
            Self::Now => {
                let now = Utc::now().naive_utc();
                now.with_nanosecond(0).unwrap_or(now)
            }
            Self::Deterministic => DateTime::from_timestamp(DETERMINISTIC_EPOCH, 0)
                .and_then(|epoch| epoch.date_naive().and_hms_opt(0, 0, 0))
                .ok_or_else(|| QuarryError::Internal {
                    message: "deterministic epoch out of range".to_string(),
                })?,
            Self::Explicit(instant) => *instant,
        };

        Ok(BuildTimestamp {
            created: instant.format(TIMESTAMP_FORMAT).to_string(),
            mtime: archive_mtime(&instant)?,
        })
    }
}

/// Archive mtimes are unsigned, so the instant must not precede the epoch.
fn archive_mtime(instant: &NaiveDateTime) -> QuarryResult<u64> {
    u64::try_from(instant.and_utc().timestamp()).map_err(|_| QuarryError::InvalidTimestamp {
        value: instant.format(TIMESTAMP_FORMAT).to_string(),
    })
}

impl FromStr for TimestampPolicy {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "now" => Ok(Self::Now),
            "deterministic" => Ok(Self::Deterministic),
            other => NaiveDateTime::parse_from_str(other, TIMESTAMP_FORMAT)
                .ok()
                .filter(|instant| archive_mtime(instant).is_ok())
                .map(Self::Explicit)
                .ok_or_else(|| QuarryError::InvalidTimestamp {
                    value: other.to_string(),
                }),
        }
    }
}

impl fmt::Display for TimestampPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => f.write_str("now"),
            Self::Deterministic => f.write_str("deterministic"),
            Self::Explicit(instant) => write!(f, "{}", instant.format(TIMESTAMP_FORMAT)),
        }
    }
}
