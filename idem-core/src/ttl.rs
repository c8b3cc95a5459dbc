//! Time-to-live grammar.
//!
//! A TTL is written either as `<integer><unit>` with unit `s`, `m`, `h` or `d`
//! (`"30s"`, `"15m"`, `"2d"`), or as the time part of an ISO-8601 duration
//! without its `PT` designator (`"1h30m"`, `"90S"`, `"0.5s"` after
//! upper-casing becomes `PT1H30M`, `PT90S`, `PT0.5S`).
//!
//! # Fallback
//!
//! [`Ttl::parse`] never fails. Anything it cannot read (including zero and
//! durations too large to represent) resolves to [`DEFAULT_TTL`], fifteen
//! minutes. This is deliberate and easy to trip over: a typo such as `"15 m"`
//! silently becomes the default. Callers that want to reject bad input use
//! [`Ttl::parse_strict`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// TTL applied when a TTL string cannot be parsed.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

static UNIT_FORM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([smhd])$").expect("Invalid TTL unit regex"));

static ISO_TIME_FORM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)(?:[.,](\d{1,9}))?S)?$")
        .expect("Invalid ISO-8601 duration regex")
});

/// Why a TTL string was rejected by [`Ttl::parse_strict`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TtlParseError {
    #[error("TTL string is empty")]
    Empty,

    #[error("Unrecognized TTL '{raw}'")]
    Unrecognized { raw: String },

    #[error("TTL '{raw}' is zero")]
    Zero { raw: String },

    #[error("TTL '{raw}' overflows")]
    Overflow { raw: String },
}

/// A strictly positive time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ttl(Duration);

impl Ttl {
    /// Wrap a duration. Returns `None` for zero.
    pub fn new(duration: Duration) -> Option<Self> {
        if duration.is_zero() {
            None
        } else {
            Some(Self(duration))
        }
    }

    pub fn from_secs(secs: u64) -> Option<Self> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Option<Self> {
        Self::new(Duration::from_millis(millis))
    }

    /// Parse a TTL string, falling back to [`DEFAULT_TTL`] on any failure.
    pub fn parse(raw: &str) -> Self {
        match Self::parse_strict(raw) {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::warn!(raw = raw, error = %e, "unparsable TTL, using 15 minute default");
                Self::default()
            }
        }
    }

    /// Parse a TTL string, reporting why it was rejected.
    pub fn parse_strict(raw: &str) -> Result<Self, TtlParseError> {
        if raw.is_empty() {
            return Err(TtlParseError::Empty);
        }

        let duration = if let Some(caps) = UNIT_FORM.captures(raw) {
            let amount: u64 = caps[1].parse().map_err(|_| TtlParseError::Overflow {
                raw: raw.to_string(),
            })?;
            let unit_secs = match &caps[2] {
                "s" => 1,
                "m" => 60,
                "h" => 60 * 60,
                _ => 24 * 60 * 60,
            };
            amount
                .checked_mul(unit_secs)
                .map(Duration::from_secs)
                .ok_or_else(|| TtlParseError::Overflow {
                    raw: raw.to_string(),
                })?
        } else {
            parse_iso_time(raw)?
        };

        Self::new(duration).ok_or_else(|| TtlParseError::Zero {
            raw: raw.to_string(),
        })
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Whole milliseconds, saturating at `u64::MAX`.
    pub fn as_millis_u64(&self) -> u64 {
        u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self(DEFAULT_TTL)
    }
}

impl From<Ttl> for Duration {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

fn parse_iso_time(raw: &str) -> Result<Duration, TtlParseError> {
    let literal = format!("PT{}", raw.to_uppercase());
    let unrecognized = || TtlParseError::Unrecognized {
        raw: raw.to_string(),
    };
    let overflow = || TtlParseError::Overflow {
        raw: raw.to_string(),
    };

    let caps = ISO_TIME_FORM.captures(&literal).ok_or_else(unrecognized)?;
    // "PT" alone matches the regex with every group empty.
    if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() {
        return Err(unrecognized());
    }

    let component = |idx: usize, unit_secs: u64| -> Result<u64, TtlParseError> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse::<u64>()
                .ok()
                .and_then(|v| v.checked_mul(unit_secs))
                .ok_or_else(overflow),
            None => Ok(0),
        }
    };

    let secs = component(1, 3600)?
        .checked_add(component(2, 60)?)
        .and_then(|s| s.checked_add(component(3, 1).ok()?))
        .ok_or_else(overflow)?;

    let nanos = match caps.get(4) {
        Some(frac) => {
            let digits = frac.as_str();
            let scale = 10u32.pow(9 - digits.len() as u32);
            digits.parse::<u32>().map_err(|_| unrecognized())? * scale
        }
        None => 0,
    };

    Ok(Duration::new(secs, nanos))
}
