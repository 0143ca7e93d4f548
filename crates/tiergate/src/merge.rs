//! Merge policies: how a decoded on-chain result lands on a local row.

use crate::abi::DecodedSubscription;
use crate::store::EntitlementRecord;
use crate::tier::Tier;

/// Decides the new `(tier, expires_at)` for a row, or `None` to leave it alone.
///
/// Returning `None` whenever the decoded pair equals the row is what keeps an unchanged
/// chain from producing writes.
pub trait MergePolicy: Send + Sync {
    fn merge(&self, local: &EntitlementRecord, decoded: &DecodedSubscription)
        -> Option<(Tier, u64)>;
}

fn unchanged(local: &EntitlementRecord, decoded: &DecodedSubscription) -> bool {
    local.tier == decoded.tier && local.expires_at == decoded.expires_at
}

/// Promote-only: a decoded `Free` never touches a row. A paid result is taken when it ranks
/// above the local tier or carries a later expiry; at equal rank the later expiry wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromoteOnly;

impl MergePolicy for PromoteOnly {
    fn merge(
        &self,
        local: &EntitlementRecord,
        decoded: &DecodedSubscription,
    ) -> Option<(Tier, u64)> {
        if unchanged(local, decoded) || !decoded.tier.is_paid() {
            return None;
        }
        if decoded.tier > local.tier || decoded.expires_at > local.expires_at {
            Some((decoded.tier, decoded.expires_at))
        } else {
            None
        }
    }
}

/// Authoritative: the chain always wins, including downgrades to `Free`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Authoritative;

impl MergePolicy for Authoritative {
    fn merge(
        &self,
        local: &EntitlementRecord,
        decoded: &DecodedSubscription,
    ) -> Option<(Tier, u64)> {
        if unchanged(local, decoded) {
            None
        } else {
            Some((decoded.tier, decoded.expires_at))
        }
    }
}
