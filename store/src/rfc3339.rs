//! Timestamp encoding shared by every table: `DateTime<Utc>` in, RFC3339
//! text out, so the same schema works unchanged against sqlite or postgres
//! through `sqlx::Any`.

use anyhow::Context;
use chrono::{DateTime, Utc};

pub fn to_string(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC3339 timestamp: {s}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_trips() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap();
        assert_eq!(parse(&to_string(dt)).unwrap(), dt);
    }
}
