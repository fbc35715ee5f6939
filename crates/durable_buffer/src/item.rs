use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use getset::CopyGetters;
use uuid::Uuid;

/// Metadata tracked for every pending message.
///
/// The payload bytes live in the payload store under `ident`; this record is
/// what the manifest persists. Expiry is kept at microsecond precision so it
/// survives the manifest encoding unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, CopyGetters)]
pub struct ItemMetadata {
    #[getset(get_copy = "pub")]
    ident: Uuid,
    #[getset(get_copy = "pub")]
    expire_at: DateTime<Utc>,
}

impl ItemMetadata {
    /// Create metadata for a new item with a fresh identifier that expires `ttl` from now
    pub fn new(ttl: TimeDelta) -> Self {
        let expire_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::with_expiry(Uuid::new_v4(), expire_at)
    }

    pub fn with_expiry(ident: Uuid, expire_at: DateTime<Utc>) -> Self {
        Self {
            ident,
            expire_at: expire_at.trunc_subsecs(6),
        }
    }

    /// An item is stale once its expiry is at or before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }

    /// File name used by the payload store
    pub fn file_name(&self) -> String {
        self.ident.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_expires_after_ttl() {
        let before = Utc::now();
        let item = ItemMetadata::new(TimeDelta::minutes(5));
        let after = Utc::now();

        assert!(item.expire_at() >= (before + TimeDelta::minutes(5)).trunc_subsecs(6));
        assert!(item.expire_at() <= after + TimeDelta::minutes(5));
        assert!(!item.is_expired_at(after));
        assert!(item.is_expired_at(after + TimeDelta::minutes(6)));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let at = Utc::now().trunc_subsecs(6);
        let item = ItemMetadata::with_expiry(Uuid::new_v4(), at);
        assert!(item.is_expired_at(at));
        assert!(!item.is_expired_at(at - TimeDelta::microseconds(1)));
    }

    #[test]
    fn test_identifiers_are_unique() {
        let a = ItemMetadata::new(TimeDelta::zero());
        let b = ItemMetadata::new(TimeDelta::zero());
        assert_ne!(a.ident(), b.ident());
        assert_eq!(a.file_name(), a.ident().to_string());
    }

    #[test]
    fn test_expiry_truncated_to_micros() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let item = ItemMetadata::with_expiry(Uuid::nil(), at);
        assert_eq!(item.expire_at().timestamp_subsec_nanos(), 123_456_000);
    }
}
