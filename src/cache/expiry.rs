//! Max-age to expiry mapping.

use time::{Duration, OffsetDateTime};

use super::metadata::MaxAge;

/// Absolute expiry of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Permanent,
    At(OffsetDateTime),
}

impl Expiry {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self {
            Expiry::Permanent => false,
            Expiry::At(at) => now >= *at,
        }
    }
}

/// Expiry for an entry written at `now`, the request start time.
pub fn to_expiry(max_age: MaxAge, now: OffsetDateTime) -> Expiry {
    match max_age {
        MaxAge::Permanent => Expiry::Permanent,
        MaxAge::Seconds(seconds) => Expiry::At(now + Duration::seconds(i64::from(seconds))),
    }
}
