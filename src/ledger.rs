//! Per-item review ledger.
//!
//! A new review replaces the first existing entry by the same owner that was
//! submitted strictly earlier, then is appended. When the existing same-owner
//! entry is newer (or equally old) nothing is removed, so both stay in the
//! ledger. Report consumers see exactly this behavior; it is not a strict
//! latest-per-owner map.
use crate::model::Review;

pub fn add_review(mut ledger: Vec<Review>, review: Review) -> Vec<Review> {
    if let Some(idx) = ledger
        .iter()
        .position(|r| r.owner == review.owner && r.submitted_at < review.submitted_at)
    {
        ledger.remove(idx);
    }
    ledger.push(review);
    ledger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_timestamp;
    use crate::model::SourceKind;

    fn review(owner: &str, at: &str, result: &str) -> Review {
        Review {
            source_kind: SourceKind::Github,
            reviewer: format!("{}-{}", owner, at),
            url: format!("https://example.test/{}", at),
            owner: owner.into(),
            result: result.into(),
            submitted_at: parse_timestamp(at).unwrap(),
        }
    }

    #[test]
    fn newer_review_replaces_older_from_same_owner() {
        let r1 = review("alice", "2024-01-01T10:00:00Z", "COMMENTED");
        let r2 = review("alice", "2024-01-02T10:00:00Z", "APPROVED");
        let ledger = add_review(add_review(Vec::new(), r1.clone()), r2.clone());
        assert_eq!(ledger, vec![r2]);
        assert!(!ledger.contains(&r1));
    }

    #[test]
    fn older_review_added_after_newer_keeps_both() {
        let r1 = review("alice", "2024-01-01T10:00:00Z", "COMMENTED");
        let r2 = review("alice", "2024-01-02T10:00:00Z", "APPROVED");
        let ledger = add_review(add_review(Vec::new(), r2.clone()), r1.clone());
        assert_eq!(ledger, vec![r2, r1]);
    }

    #[test]
    fn same_timestamp_keeps_both() {
        let a = review("bob", "2024-01-01T10:00:00Z", "APPROVED");
        let mut b = a.clone();
        b.result = "CHANGES_REQUESTED".into();
        let ledger = add_review(add_review(Vec::new(), a), b);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn removal_preserves_survivor_order() {
        let a = review("alice", "2024-01-01T10:00:00Z", "COMMENTED");
        let b = review("bob", "2024-01-01T11:00:00Z", "APPROVED");
        let c = review("carol", "2024-01-01T12:00:00Z", "APPROVED");
        let a2 = review("alice", "2024-01-03T10:00:00Z", "APPROVED");
        let mut ledger = Vec::new();
        for r in [a, b.clone(), c.clone(), a2.clone()] {
            ledger = add_review(ledger, r);
        }
        let owners: Vec<&str> = ledger.iter().map(|r| r.owner.as_str()).collect();
        assert_eq!(owners, vec!["bob", "carol", "alice"]);
        assert_eq!(ledger, vec![b, c, a2]);
    }
}
