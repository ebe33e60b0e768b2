use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};

use crate::model::{Ms, TokenPurpose};

/// Deployment settings, passed into the engine at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Zone in which slot times-of-day are interpreted.
    pub utc_offset: FixedOffset,
    /// Lower bound of the window queried from the external calendar.
    pub working_day_start: NaiveTime,
    pub working_day_end: NaiveTime,
    /// Bound on every call into the calendar gateway.
    pub calendar_timeout: Duration,
    pub verification_ttl: Duration,
    pub reset_ttl: Duration,
    pub default_slot_price_cents: u32,
    /// Base URL used in emailed verification / reset links.
    pub frontend_url: String,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            working_day_start: hm(9, 0),
            working_day_end: hm(20, 0),
            calendar_timeout: Duration::from_secs(3),
            verification_ttl: Duration::from_secs(24 * 3600),
            reset_ttl: Duration::from_secs(2 * 3600),
            default_slot_price_cents: 20_000,
            frontend_url: "http://localhost:3000".into(),
            compact_threshold: 1000,
        }
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_time(key: &str) -> Option<NaiveTime> {
    std::env::var(key)
        .ok()
        .and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
}

impl Config {
    /// Read `SLOTD_*` variables; anything missing or unparsable keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let utc_offset = env_parse::<i32>("SLOTD_UTC_OFFSET_MINUTES")
            .and_then(|m| m.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .unwrap_or(defaults.utc_offset);
        let mut working_day_start =
            env_time("SLOTD_WORKING_DAY_START").unwrap_or(defaults.working_day_start);
        let mut working_day_end =
            env_time("SLOTD_WORKING_DAY_END").unwrap_or(defaults.working_day_end);
        if working_day_start >= working_day_end {
            tracing::warn!(
                "working day {working_day_start}..{working_day_end} is empty, using defaults"
            );
            working_day_start = defaults.working_day_start;
            working_day_end = defaults.working_day_end;
        }

        Self {
            utc_offset,
            working_day_start,
            working_day_end,
            calendar_timeout: env_parse("SLOTD_CALENDAR_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.calendar_timeout),
            verification_ttl: env_parse("SLOTD_VERIFICATION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.verification_ttl),
            reset_ttl: env_parse("SLOTD_RESET_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reset_ttl),
            default_slot_price_cents: env_parse("SLOTD_DEFAULT_PRICE_CENTS")
                .unwrap_or(defaults.default_slot_price_cents),
            frontend_url: std::env::var("SLOTD_FRONTEND_URL").unwrap_or(defaults.frontend_url),
            compact_threshold: env_parse("SLOTD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn token_ttl(&self, purpose: TokenPurpose) -> Duration {
        match purpose {
            TokenPurpose::EmailVerification => self.verification_ttl,
            TokenPurpose::PasswordReset => self.reset_ttl,
        }
    }

    pub fn token_ttl_ms(&self, purpose: TokenPurpose) -> Ms {
        Ms::try_from(self.token_ttl(purpose).as_millis()).unwrap_or(Ms::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.utc_offset.local_minus_utc(), 0);
        assert_eq!(c.working_day_start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(c.working_day_end, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
        assert_eq!(c.token_ttl_ms(TokenPurpose::EmailVerification), 24 * 3_600_000);
        assert_eq!(c.token_ttl_ms(TokenPurpose::PasswordReset), 2 * 3_600_000);
    }
}
