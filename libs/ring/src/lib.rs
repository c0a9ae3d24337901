//! Consistent-hashing ring for tenant placement.
//!
//! Tenants are placed on devices by hashing the tenant id onto a ring of
//! virtual points, `replicas` points per device. Removing or adding one
//! device only moves the tenants whose nearest point belonged to (or now
//! belongs to) that device; every other tenant keeps its placement.
//!
//! # Invariants
//!
//! - Construction sorts and de-duplicates member names first, so the same
//!   member set always yields the same ring, whatever order it arrives in.
//! - Hashing is SHA-256 based and therefore stable across processes and
//!   platforms; nothing depends on `std`'s randomized hasher.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

/// Default number of virtual points per member.
pub const DEFAULT_REPLICAS: u32 = 160;

/// A consistent-hashing ring over a set of member names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    /// Ring position -> index into `members`.
    points: BTreeMap<u64, usize>,

    /// Sorted, de-duplicated member names.
    members: Vec<String>,

    replicas: u32,
}

impl HashRing {
    /// Build a ring with [`DEFAULT_REPLICAS`] points per member.
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_replicas(members, DEFAULT_REPLICAS)
    }

    /// Build a ring with a specific number of points per member.
    ///
    /// A `replicas` value of zero is treated as one.
    pub fn with_replicas<I, S>(members: I, replicas: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let replicas = replicas.max(1);
        let members: Vec<String> = members
            .into_iter()
            .map(|m| m.as_ref().to_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut points = BTreeMap::new();
        for (index, member) in members.iter().enumerate() {
            for replica in 0..replicas {
                let point = position(format!("{member}#{replica}").as_bytes());
                // On a collision the earlier (smaller) member keeps the point.
                points.entry(point).or_insert(index);
            }
        }

        Self {
            points,
            members,
            replicas,
        }
    }

    /// Find the member owning `key`.
    ///
    /// Returns `None` only when the ring is empty.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        let hash = position(key.as_bytes());
        let (_, index) = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())?;
        Some(self.members[*index].as_str())
    }

    /// Sorted member names.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Virtual points per member.
    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    /// Short fingerprint of the member set and replica count.
    ///
    /// Two processes with equal fingerprints place every key identically.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.replicas.to_be_bytes());
        for member in &self.members {
            hasher.update(member.as_bytes());
            hasher.update([0u8]);
        }
        let result = hasher.finalize();
        hex::encode(&result[..8])
    }
}

/// Ring position of a byte string: the first 8 bytes of its SHA-256, big endian.
fn position(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn devices(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("ax-{i}")).collect()
    }

    fn tenants(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tenant-{i:04}")).collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new(Vec::<String>::new());
        assert!(ring.is_empty());
        assert_eq!(ring.lookup("tenant-a"), None);
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = HashRing::new(["only"]);
        for tenant in tenants(50) {
            assert_eq!(ring.lookup(&tenant), Some("only"));
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = HashRing::new(devices(4));
        let again = HashRing::new(devices(4));
        for tenant in tenants(200) {
            assert_eq!(ring.lookup(&tenant), again.lookup(&tenant));
        }
        assert_eq!(ring.fingerprint(), again.fingerprint());
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let ring = HashRing::new(["b", "a", "b", "a"]);
        assert_eq!(ring.members(), ["a", "b"]);
        assert_eq!(ring, HashRing::new(["a", "b"]));
    }

    #[test]
    fn test_zero_replicas_treated_as_one() {
        let ring = HashRing::with_replicas(["a", "b"], 0);
        assert_eq!(ring.replicas(), 1);
        assert!(ring.lookup("x").is_some());
    }

    #[test]
    fn test_every_member_receives_tenants() {
        let ring = HashRing::new(devices(5));
        let mut counts = BTreeMap::new();
        for tenant in tenants(2000) {
            *counts.entry(ring.lookup(&tenant).unwrap().to_owned()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 5);
        for (_, count) in counts {
            // 400 expected per member.
            assert!(count > 250 && count < 550, "unbalanced share: {count}");
        }
    }

    #[test]
    fn test_fingerprint_changes_with_members() {
        let a = HashRing::new(devices(3));
        let b = HashRing::new(devices(4));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_member_order_is_irrelevant(
            mut names in proptest::collection::vec("[a-z]{1,8}", 1..8),
            key in "[a-z0-9-]{1,32}",
        ) {
            let forward = HashRing::new(&names);
            names.reverse();
            let reversed = HashRing::new(&names);
            prop_assert_eq!(forward.lookup(&key), reversed.lookup(&key));
        }

        #[test]
        fn prop_lookup_returns_a_member(
            names in proptest::collection::vec("[a-z]{1,8}", 1..8),
            key in ".*",
        ) {
            let ring = HashRing::with_replicas(&names, 16);
            let owner = ring.lookup(&key).unwrap();
            prop_assert!(names.iter().any(|n| n == owner));
        }
    }

    /// A removed member's share is itself a sample around 1/N, so the moved
    /// fraction is held to 1/N scaled by this factor.
    const MOVE_TOLERANCE: f64 = 1.3;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_removing_a_member_only_moves_its_tenants(
            (n, index) in (2usize..=10).prop_flat_map(|n| (Just(n), 0..n)),
        ) {
            let members = devices(n);
            let removed = members[index].clone();
            let before = HashRing::new(&members);
            let after = HashRing::new(members.iter().filter(|d| **d != removed));

            let sample = tenants(2000);
            let mut moved = 0usize;
            for tenant in &sample {
                let old = before.lookup(tenant).unwrap();
                let new = after.lookup(tenant).unwrap();
                if old != new {
                    prop_assert_eq!(old, removed.as_str(), "{} moved off a surviving member", tenant);
                    moved += 1;
                } else {
                    prop_assert_ne!(old, removed.as_str());
                }
            }

            let fraction = moved as f64 / sample.len() as f64;
            let bound = MOVE_TOLERANCE / n as f64;
            prop_assert!(fraction <= bound, "removing {} moved {} > {}", removed, fraction, bound);
        }
    }
}
