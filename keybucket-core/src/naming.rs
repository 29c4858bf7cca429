//! Object naming.
//!
//! A published key lives at `{bucket}/{expiration}.{fingerprint}`:
//!
//! - `bucket` — the expiration rounded to the nearest hour, in Unix seconds.
//!   Store lifecycle rules can expire a whole prefix at once.
//! - `expiration` — the exact expiry in Unix seconds.
//! - `fingerprint` — the URL-safe SHA-256 fingerprint of the public key.
//!
//! ```text
//! 1704124800/1704125700.SHA256.nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8
//! ```
//!
//! The name depends only on the expiration and the public key, so publishing
//! the same key pair twice overwrites the same object.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::keypair::KeyPair;

const SECS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    pub bucket: i64,
    pub expiration: i64,
    pub fingerprint: String,
}

impl ObjectName {
    pub fn for_key(key: &KeyPair) -> Self {
        Self {
            bucket: key.expiration_bucket().timestamp(),
            expiration: key.expiration().timestamp(),
            fingerprint: key.url_safe_fingerprint(),
        }
    }

    /// Parse a stored object name.
    ///
    /// Returns `None` for anything that is not in the
    /// `{bucket}/{expiration}.{fingerprint}` layout, including buckets that
    /// are not on an hour boundary.
    pub fn parse(name: &str) -> Option<Self> {
        let (bucket, rest) = name.split_once('/')?;
        let (expiration, fingerprint) = rest.split_once('.')?;

        if fingerprint.is_empty() || fingerprint.contains('/') {
            return None;
        }
        let bucket: i64 = bucket.parse().ok()?;
        let expiration: i64 = expiration.parse().ok()?;
        if bucket.rem_euclid(SECS_PER_HOUR) != 0 {
            return None;
        }

        Some(Self {
            bucket,
            expiration,
            fingerprint: fingerprint.to_string(),
        })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expiration, 0)
    }

    /// True once `now` is at or past the encoded expiration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now.timestamp()
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.bucket, self.expiration, self.fingerprint)
    }
}

/// The storage object name for `key`.
pub fn object_name(key: &KeyPair) -> String {
    ObjectName::for_key(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::test_key_pair;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn name_layout() {
        // Generated at 10:15 with six hours of validity.
        let key = test_key_pair(at("2024-01-01T16:15:00Z"));
        let name = object_name(&key);
        let expected = format!("1704124800/1704125700.{}", key.url_safe_fingerprint());
        assert_eq!(name, expected);
    }

    #[test]
    fn name_is_deterministic() {
        let expiration = at("2024-03-10T08:40:00Z");
        let a = test_key_pair(expiration);
        let b = test_key_pair(expiration);
        assert_eq!(object_name(&a), object_name(&b));
        assert_eq!(object_name(&a), object_name(&a));
    }

    #[test]
    fn different_keys_get_different_names() {
        let expiration = at("2024-03-10T08:40:00Z");
        let shared = test_key_pair(expiration);
        let fresh = KeyPair::generate_at(at("2024-03-10T02:40:00Z"), chrono::TimeDelta::hours(6))
            .unwrap();
        assert_eq!(shared.expiration(), fresh.expiration());
        assert_ne!(object_name(&shared), object_name(&fresh));
    }

    #[test]
    fn name_uses_rounded_bucket() {
        let key = test_key_pair(at("2024-01-01T16:45:00Z"));
        let name = ObjectName::for_key(&key);
        assert_eq!(name.bucket, at("2024-01-01T17:00:00Z").timestamp());
        assert_eq!(name.expiration, at("2024-01-01T16:45:00Z").timestamp());
    }

    #[test]
    fn parse_round_trips() {
        let key = test_key_pair(at("2024-01-01T16:15:00Z"));
        let name = ObjectName::for_key(&key);
        let parsed = ObjectName::parse(&name.to_string()).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.expires_at(), Some(key.expiration()));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(ObjectName::parse("README.md").is_none());
        assert!(ObjectName::parse("logs/2024-01-01.txt").is_none());
        assert!(ObjectName::parse("1704124800/1704125700.").is_none());
        assert!(ObjectName::parse("1704124800/1704125700").is_none());
        assert!(ObjectName::parse("1704124801/1704125700.SHA256.x").is_none());
        assert!(ObjectName::parse("1704124800/1704125700.SHA256.x/y").is_none());
        assert!(ObjectName::parse("abc/1704125700.SHA256.x").is_none());
    }

    #[test]
    fn expiry_check() {
        let name = ObjectName::parse("1704124800/1704125700.SHA256.x").unwrap();
        assert!(!name.is_expired(at("2024-01-01T16:14:59Z")));
        assert!(name.is_expired(at("2024-01-01T16:15:00Z")));
        assert!(name.is_expired(at("2024-01-02T00:00:00Z")));
    }
}
