//! OpenPGP time fields are unsigned 32-bit seconds since the epoch; key
//! expiry is an offset from key creation.

use jiff::Timestamp;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(display("failed to convert {seconds} seconds since epoch into a timestamp"))]
/// Error while turning an OpenPGP time field into a timestamp
pub struct TimestampError {
    seconds: i64,
    source: jiff::Error,
}

fn at(seconds: i64) -> Result<Timestamp, TimestampError> {
    Timestamp::from_second(seconds).context(TimestampSnafu { seconds })
}

pub(crate) fn from_epoch(seconds: u32) -> Result<Timestamp, TimestampError> {
    at(i64::from(seconds))
}

/// Expiry of a key created at `created`, `None` when the offset is zero.
pub(crate) fn expiration(created: u32, offset: u32) -> Result<Option<Timestamp>, TimestampError> {
    match offset {
        0 => Ok(None),
        offset => at(i64::from(created) + i64::from(offset)).map(Some),
    }
}
