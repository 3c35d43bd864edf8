//! Header-driven cacheability policy.
//!
//! Headers are evaluated in order:
//!
//! - `Cache-Control` with `max-age=N`: `N <= 0` is not cacheable, otherwise
//!   `now + N` (saturating) becomes a candidate expiry
//! - `Cache-Control` containing `private` or `no-cache`: not cacheable
//! - `Cache-Control` containing `public` or `no-store`: cacheable, stop
//!   evaluating
//! - `Pragma: no-cache`: not cacheable
//! - `Expires: <date>`: the parsed date becomes a candidate expiry
//!
//! Candidate expiries only replace an earlier one. With no disqualifying
//! directive the response is cacheable with whatever expiry accumulated.

use chrono::{DateTime, Duration, Utc};

/// Outcome of the cacheability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    /// The response may be stored, optionally until `expires`.
    Cacheable {
        /// Latest expiry derived from the headers.
        expires: Option<DateTime<Utc>>,
    },
    /// The response must not be stored.
    NotCacheable,
}

impl Cacheability {
    /// Whether the response may be stored.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Cacheability::Cacheable { .. })
    }
}

/// Evaluate the policy over response headers as of `now`.
pub fn evaluate(headers: &[(String, String)], now: DateTime<Utc>) -> Cacheability {
    let mut expires: Option<DateTime<Utc>> = None;

    for (name, raw_value) in headers {
        let value = raw_value.to_lowercase();

        match name.to_lowercase().as_str() {
            "cache-control" => {
                if let Some(seconds) = parse_max_age(&value) {
                    if seconds <= 0 {
                        return Cacheability::NotCacheable;
                    }
                    extend(&mut expires, max_age_expiry(now, seconds));
                }

                if value.contains("private") || value.contains("no-cache") {
                    return Cacheability::NotCacheable;
                }
                if value.contains("public") || value.contains("no-store") {
                    return Cacheability::Cacheable { expires };
                }
            }
            "pragma" => {
                if value.trim() == "no-cache" {
                    return Cacheability::NotCacheable;
                }
            }
            "expires" => {
                if let Some(date) = parse_http_date(raw_value) {
                    extend(&mut expires, date);
                }
            }
            _ => {}
        }
    }

    Cacheability::Cacheable { expires }
}

/// Extract the numeric token of a `max-age=N` directive.
///
/// `s-maxage` and other directives are ignored; a malformed number yields
/// `None`, as if the directive were absent.
pub fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let rest = directive.trim().strip_prefix("max-age")?;
        let number = rest.trim_start().strip_prefix('=')?;
        number.trim().trim_matches('"').parse::<i64>().ok()
    })
}

/// Parse an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
///
/// Also accepts RFC 3339 timestamps. Anything else, including the common
/// `Expires: 0` / `-1`, yields `None`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `now + seconds`, saturating at the latest representable instant.
fn max_age_expiry(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    Duration::try_seconds(seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn extend(expires: &mut Option<DateTime<Utc>>, candidate: DateTime<Utc>) {
    if expires.is_none_or(|current| current < candidate) {
        *expires = Some(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_headers_cacheable_without_expiry() {
        assert_eq!(
            evaluate(&[], now()),
            Cacheability::Cacheable { expires: None }
        );
    }

    #[test]
    fn test_private_not_cacheable() {
        let h = headers(&[("Cache-Control", "private")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_no_cache_not_cacheable() {
        let h = headers(&[("Cache-Control", "no-cache")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_private_wins_over_public_in_same_value() {
        let h = headers(&[("Cache-Control", "public, private")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_public_short_circuits() {
        let h = headers(&[("Cache-Control", "public"), ("Pragma", "no-cache")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable { expires: None }
        );
    }

    #[test]
    fn test_no_store_cacheable() {
        let h = headers(&[("cache-control", "no-store")]);
        assert!(evaluate(&h, now()).is_cacheable());
    }

    #[test]
    fn test_max_age_sets_expiry() {
        let h = headers(&[("Cache-Control", "public, max-age=60")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(now() + Duration::seconds(60))
            }
        );
    }

    #[test]
    fn test_max_age_zero_not_cacheable() {
        let h = headers(&[("Cache-Control", "public, max-age=0")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_negative_max_age_not_cacheable() {
        let h = headers(&[("Cache-Control", "max-age=-30")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_huge_max_age_saturates() {
        let h = headers(&[("Cache-Control", "max-age=9223372036854775807")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(DateTime::<Utc>::MAX_UTC)
            }
        );
    }

    #[test]
    fn test_max_age_past_calendar_range_saturates() {
        // Representable as a duration, but not when added to `now`.
        let h = headers(&[("Cache-Control", "public, max-age=9000000000000")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(DateTime::<Utc>::MAX_UTC)
            }
        );
    }

    #[test]
    fn test_pragma_no_cache() {
        let h = headers(&[("Pragma", "no-cache")]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_pragma_other_value_ignored() {
        let h = headers(&[("Pragma", "x-custom")]);
        assert!(evaluate(&h, now()).is_cacheable());
    }

    #[test]
    fn test_expires_sets_expiry() {
        let h = headers(&[("Expires", "Mon, 01 Jan 2024 13:00:00 GMT")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap())
            }
        );
    }

    #[test]
    fn test_later_expiry_wins() {
        let h = headers(&[
            ("Expires", "Mon, 01 Jan 2024 15:00:00 GMT"),
            ("Cache-Control", "max-age=60"),
        ]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap())
            }
        );

        let h = headers(&[
            ("Cache-Control", "max-age=7200"),
            ("Expires", "Mon, 01 Jan 2024 13:00:00 GMT"),
        ]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable {
                expires: Some(now() + Duration::seconds(7200))
            }
        );
    }

    #[test]
    fn test_invalid_expires_ignored() {
        let h = headers(&[("Expires", "0")]);
        assert_eq!(
            evaluate(&h, now()),
            Cacheability::Cacheable { expires: None }
        );
    }

    #[test]
    fn test_no_cache_after_expiry_still_disqualifies() {
        let h = headers(&[
            ("Expires", "Mon, 01 Jan 2024 13:00:00 GMT"),
            ("Pragma", "no-cache"),
        ]);
        assert_eq!(evaluate(&h, now()), Cacheability::NotCacheable);
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("public, max-age = 120"), Some(120));
        assert_eq!(parse_max_age("max-age=\"30\""), Some(30));
        assert_eq!(parse_max_age("s-maxage=60"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
        assert_eq!(parse_max_age("no-cache"), None);
    }

    #[test]
    fn test_parse_http_date() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap())
        );
        assert_eq!(parse_http_date("-1"), None);
    }
}
