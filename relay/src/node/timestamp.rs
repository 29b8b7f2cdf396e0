use std::{
    fmt,
    ops::{Add, Deref, Sub},
};

use localtime::{LocalDuration, LocalTime};
use sqlite as sql;

/// Milliseconds since epoch.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<LocalDuration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: LocalDuration) -> Self::Output {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl Sub<LocalDuration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, duration: LocalDuration) -> Self::Output {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl Timestamp {
    /// UNIX epoch.
    pub const EPOCH: Self = Self(0);
    /// Maximum value.
    // Nb. This is the maximum value that fits in a signed 64-bit integer (`i64`),
    // which is what sqlite stores.
    pub const MAX: Self = Self(i64::MAX as u64);

    /// The current time.
    pub fn now() -> Self {
        LocalTime::now().into()
    }

    /// Time elapsed between this timestamp and `now`. Zero if this timestamp is in the future.
    pub fn elapsed(&self, now: Timestamp) -> LocalDuration {
        LocalDuration::from_millis(now.0.saturating_sub(self.0) as u128)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Deref for Timestamp {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<LocalTime> for Timestamp {
    fn from(t: LocalTime) -> Self {
        Self(t.as_millis())
    }
}

impl From<u64> for Timestamp {
    fn from(u: u64) -> Self {
        Self(u)
    }
}

impl TryFrom<&sql::Value> for Timestamp {
    type Error = sql::Error;

    fn try_from(value: &sql::Value) -> Result<Self, Self::Error> {
        match value {
            sql::Value::Integer(i) => match (*i).try_into() {
                Ok(u) => Ok(Timestamp(u)),
                Err(e) => Err(sql::Error {
                    code: None,
                    message: Some(format!("sql: invalid integer for timestamp: {e}")),
                }),
            },
            _ => Err(sql::Error {
                code: None,
                message: Some("sql: invalid type for timestamp".to_owned()),
            }),
        }
    }
}

impl sql::BindableWithIndex for Timestamp {
    fn bind<I: sql::ParameterIndex>(self, stmt: &mut sql::Statement<'_>, i: I) -> sql::Result<()> {
        match i64::try_from(self.0) {
            Ok(integer) => integer.bind(stmt, i),
            Err(e) => Err(sql::Error {
                code: None,
                message: Some(format!("sql: invalid timestamp: {e}")),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_elapsed_saturates() {
        let t = Timestamp::from(10_000);

        assert_eq!(t.elapsed(Timestamp::from(15_000)), LocalDuration::from_secs(5));
        assert_eq!(t.elapsed(Timestamp::from(5_000)), LocalDuration::from_secs(0));
        assert_eq!(Timestamp::EPOCH - LocalDuration::from_secs(1), Timestamp::EPOCH);
    }
}
