//! Per-inbound device and speed limiting.
//!
//! Each inbound tag owns an [`InboundLimiter`]: a published table of user
//! limits, the set of live source addresses per user, and a hub of per-user
//! token buckets. The registry maps tags to `Arc<InboundLimiter>` so an
//! admission check clones the `Arc`, drops the map guard, and finishes
//! against that snapshot even if the tag is deleted meanwhile.
//!
//! Device check-and-insert runs under the `DashMap` entry guard of the
//! user, so two concurrent flows cannot both take the last free slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::InboundPolicy;
use crate::error::ServiceError;
use crate::rate_limit::{RateBuckets, TokenBucket, determine_rate};
use crate::types::{OnlineDevice, UserLimit};

/// Outcome of an admission check.
pub enum Admission {
    /// Admitted without speed limit.
    Admit(DeviceLease),
    /// Admitted; downlink must be metered against the buckets.
    Throttle(DeviceLease, RateBuckets),
    /// Device limit reached for a new source address.
    Reject,
}

impl Admission {
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject)
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admit(_) => f.write_str("Admit"),
            Self::Throttle(_, buckets) => write!(f, "Throttle({} buckets)", buckets.len()),
            Self::Reject => f.write_str("Reject"),
        }
    }
}

/// Keeps a device record alive. Dropping the last lease for a
/// (user, address) pair removes the record.
#[must_use = "dropping the lease releases the device slot"]
pub struct DeviceLease {
    inner: Option<LeaseInner>,
}

struct LeaseInner {
    limiter: Arc<InboundLimiter>,
    email: String,
    source: IpAddr,
}

impl DeviceLease {
    /// A lease that tracks nothing (the tag had no limiter).
    pub fn detached() -> Self {
        Self { inner: None }
    }

    pub fn is_detached(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(lease) = self.inner.take() {
            lease.limiter.release(&lease.email, lease.source);
        }
    }
}

/// Limiter state of one inbound tag.
pub struct InboundLimiter {
    tag: String,
    node_speed_limit: u64,
    policy: InboundPolicy,
    users: ArcSwap<HashMap<String, UserLimit>>,
    /// user -> live source addresses with their lease count
    devices: DashMap<String, HashMap<IpAddr, usize>>,
    buckets: DashMap<String, Arc<TokenBucket>>,
    inbound_bucket: Option<Arc<TokenBucket>>,
}

impl InboundLimiter {
    fn new(tag: &str, node_speed_limit: u64, users: &[UserLimit], policy: &InboundPolicy) -> Self {
        let table: HashMap<String, UserLimit> = users
            .iter()
            .map(|u| (u.email.clone(), u.clone()))
            .collect();
        let inbound_bucket = (policy.inbound_speed_limit > 0)
            .then(|| Arc::new(TokenBucket::new(policy.inbound_speed_limit)));
        Self {
            tag: tag.to_owned(),
            node_speed_limit,
            policy: policy.clone(),
            users: ArcSwap::from_pointee(table),
            devices: DashMap::new(),
            buckets: DashMap::new(),
            inbound_bucket,
        }
    }

    fn admit(self: &Arc<Self>, email: &str, source: IpAddr) -> Admission {
        let device_limit = self
            .users
            .load()
            .get(email)
            .map_or(0, |u| u.device_limit as usize);

        {
            let mut entry = self.devices.entry(email.to_owned()).or_default();
            let addrs = entry.value_mut();
            if let Some(count) = addrs.get_mut(&source) {
                *count += 1;
            } else if self.policy.enforce_device_limit
                && device_limit > 0
                && addrs.len() >= device_limit
            {
                return Admission::Reject;
            } else {
                addrs.insert(source, 1);
            }
        }

        let lease = DeviceLease {
            inner: Some(LeaseInner {
                limiter: Arc::clone(self),
                email: email.to_owned(),
                source,
            }),
        };

        let mut buckets = RateBuckets::default();
        if let Some(bucket) = self.user_bucket(email) {
            buckets.push(bucket);
        }
        if let Some(shared) = &self.inbound_bucket {
            buckets.push(Arc::clone(shared));
        }

        if buckets.is_empty() {
            Admission::Admit(lease)
        } else {
            Admission::Throttle(lease, buckets)
        }
    }

    /// The user's bucket, created on first use.
    ///
    /// The rate is read under the bucket's shard lock. `update_users`
    /// publishes the table before it touches buckets, so a bucket created
    /// here never outlives a rate change with the old rate.
    fn user_bucket(&self, email: &str) -> Option<Arc<TokenBucket>> {
        match self.buckets.entry(email.to_owned()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let user_speed = self.users.load().get(email).map_or(0, |u| u.speed_limit);
                let rate = determine_rate(self.node_speed_limit, user_speed);
                if rate == 0 {
                    return None;
                }
                let bucket = slot.insert(Arc::new(TokenBucket::new(rate)));
                Some(Arc::clone(bucket.value()))
            }
        }
    }

    fn release(&self, email: &str, source: IpAddr) {
        self.devices.remove_if_mut(email, |_, addrs| {
            if let Some(count) = addrs.get_mut(&source) {
                *count -= 1;
                if *count == 0 {
                    addrs.remove(&source);
                }
            }
            addrs.is_empty()
        });
    }

    fn update_users(&self, updated: &[UserLimit]) {
        self.users.rcu(|current| {
            let mut next = HashMap::clone(current);
            for user in updated {
                next.insert(user.email.clone(), user.clone());
            }
            next
        });

        for user in updated {
            let rate = determine_rate(self.node_speed_limit, user.speed_limit);
            if rate > 0 {
                if let Some(bucket) = self.buckets.get(&user.email) {
                    bucket.set_rate(rate);
                }
            } else {
                self.buckets.remove(&user.email);
            }
        }
    }

    /// Drops buckets of users without a live device. Returns count removed.
    fn prune_idle_buckets(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|email, _| self.devices.contains_key(email));
        before.saturating_sub(self.buckets.len())
    }

    fn online_devices(&self) -> Vec<OnlineDevice> {
        let users = self.users.load();
        let mut online = Vec::new();
        for entry in &self.devices {
            let uid = users.get(entry.key()).map_or(0, |u| u.uid);
            online.extend(entry.value().keys().map(|addr| OnlineDevice {
                user: entry.key().clone(),
                uid,
                address: *addr,
            }));
        }
        online
    }
}

/// Registry of inbound limiters, keyed by inbound tag.
pub struct LimiterRegistry {
    inbounds: DashMap<String, Arc<InboundLimiter>>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self {
            inbounds: DashMap::new(),
        }
    }

    fn get(&self, tag: &str) -> Result<Arc<InboundLimiter>, ServiceError> {
        self.inbounds
            .get(tag)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ServiceError::NotFound(format!("no limiter for inbound '{tag}'")))
    }

    /// Checks whether a new flow of `email` from `source` on `tag` may
    /// proceed, and registers its device record if so.
    pub fn admit(&self, tag: &str, email: &str, source: IpAddr) -> Admission {
        let Some(inbound) = self.inbounds.get(tag).map(|e| Arc::clone(e.value())) else {
            tracing::debug!(tag = %tag, "no limiter for inbound, admitting");
            return Admission::Admit(DeviceLease::detached());
        };
        inbound.admit(email, source)
    }

    /// Creates limiter state for a new inbound tag.
    pub fn add_inbound_limiter(
        &self,
        tag: &str,
        node_speed_limit: u64,
        users: &[UserLimit],
        policy: &InboundPolicy,
    ) -> Result<(), ServiceError> {
        match self.inbounds.entry(tag.to_owned()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "limiter for inbound '{tag}' already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(InboundLimiter::new(
                    tag,
                    node_speed_limit,
                    users,
                    policy,
                )));
                tracing::info!(
                    tag = %tag,
                    users = users.len(),
                    node_speed_limit,
                    "inbound limiter added"
                );
                Ok(())
            }
        }
    }

    /// Upserts user limits for a tag. The new table is built aside and
    /// published in one swap; device records are untouched.
    pub fn update_inbound_limiter(
        &self,
        tag: &str,
        updated: &[UserLimit],
    ) -> Result<(), ServiceError> {
        let inbound = self.get(tag)?;
        inbound.update_users(updated);
        tracing::debug!(tag = %tag, users = updated.len(), "inbound limiter updated");
        Ok(())
    }

    /// Removes all limiter state of a tag. Leases handed out earlier stay
    /// valid and release into the detached state.
    pub fn delete_inbound_limiter(&self, tag: &str) -> Result<(), ServiceError> {
        self.inbounds
            .remove(tag)
            .ok_or_else(|| ServiceError::NotFound(format!("no limiter for inbound '{tag}'")))?;
        tracing::info!(tag = %tag, "inbound limiter deleted");
        Ok(())
    }

    /// Snapshot of live devices on a tag. Also drops buckets of users that
    /// have gone offline.
    pub fn get_online_device(&self, tag: &str) -> Result<Vec<OnlineDevice>, ServiceError> {
        let inbound = self.get(tag)?;
        inbound.prune_idle_buckets();
        Ok(inbound.online_devices())
    }

    /// Current limits of one user, if the tag and user are known.
    pub fn user_limit(&self, tag: &str, email: &str) -> Option<UserLimit> {
        let inbound = self.get(tag).ok()?;
        inbound.users.load().get(email).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inbounds.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        self.inbounds.iter().map(|e| e.key().clone()).collect()
    }

    /// Drops idle buckets on every tag (background maintenance). Returns
    /// the number of buckets removed.
    pub fn cleanup(&self) -> usize {
        let inbounds: Vec<Arc<InboundLimiter>> =
            self.inbounds.iter().map(|e| Arc::clone(e.value())).collect();
        inbounds
            .iter()
            .map(|inbound| {
                let removed = inbound.prune_idle_buckets();
                if removed > 0 {
                    tracing::debug!(tag = %inbound.tag, removed, "pruned idle buckets");
                }
                removed
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn registry_with(users: &[UserLimit]) -> LimiterRegistry {
        let registry = LimiterRegistry::new();
        registry
            .add_inbound_limiter("t1", 0, users, &InboundPolicy::default())
            .unwrap();
        registry
    }

    #[test]
    fn unknown_tag_is_admitted_detached() {
        let registry = LimiterRegistry::new();
        match registry.admit("nope", "alice", ip("1.1.1.1")) {
            Admission::Admit(lease) => assert!(lease.is_detached()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_tag_conflicts() {
        let registry = registry_with(&[]);
        let err = registry
            .add_inbound_limiter("t1", 0, &[], &InboundPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn unknown_tag_operations_are_not_found() {
        let registry = LimiterRegistry::new();
        assert!(matches!(
            registry.update_inbound_limiter("t9", &[]),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete_inbound_limiter("t9"),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            registry.get_online_device("t9"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn device_limit_rejects_the_extra_address() {
        let registry = registry_with(&[UserLimit::new("alice").with_device_limit(2)]);

        let a = registry.admit("t1", "alice", ip("1.1.1.1"));
        let b = registry.admit("t1", "alice", ip("1.1.1.2"));
        let c = registry.admit("t1", "alice", ip("1.1.1.3"));
        assert!(!a.is_reject());
        assert!(!b.is_reject());
        assert!(c.is_reject());

        // Same address again is not a new device.
        let again = registry.admit("t1", "alice", ip("1.1.1.1"));
        assert!(!again.is_reject());
    }

    #[test]
    fn released_lease_frees_the_slot() {
        let registry = registry_with(&[UserLimit::new("alice").with_device_limit(1)]);

        let first = registry.admit("t1", "alice", ip("1.1.1.1"));
        assert!(registry.admit("t1", "alice", ip("1.1.1.2")).is_reject());
        drop(first);
        assert!(!registry.admit("t1", "alice", ip("1.1.1.2")).is_reject());
    }

    #[test]
    fn address_stays_online_until_last_lease_drops() {
        let registry = registry_with(&[UserLimit::new("alice").with_uid(7)]);

        let first = registry.admit("t1", "alice", ip("1.1.1.1"));
        let second = registry.admit("t1", "alice", ip("1.1.1.1"));
        drop(first);
        let online = registry.get_online_device("t1").unwrap();
        assert_eq!(
            online,
            vec![OnlineDevice {
                user: "alice".into(),
                uid: 7,
                address: ip("1.1.1.1"),
            }]
        );
        drop(second);
        assert!(registry.get_online_device("t1").unwrap().is_empty());
    }

    #[test]
    fn policy_can_disable_device_enforcement() {
        let registry = LimiterRegistry::new();
        let policy = InboundPolicy {
            enforce_device_limit: false,
            ..InboundPolicy::default()
        };
        registry
            .add_inbound_limiter("t1", 0, &[UserLimit::new("alice").with_device_limit(1)], &policy)
            .unwrap();

        let first = registry.admit("t1", "alice", ip("1.1.1.1"));
        let second = registry.admit("t1", "alice", ip("1.1.1.2"));
        assert!(!first.is_reject());
        assert!(!second.is_reject());
        assert_eq!(registry.get_online_device("t1").unwrap().len(), 2);
    }

    #[test]
    fn concurrent_admissions_respect_device_limit() {
        for _ in 0..50 {
            let registry = Arc::new(registry_with(&[
                UserLimit::new("alice").with_device_limit(2)
            ]));
            let barrier = Arc::new(Barrier::new(3));
            let handles: Vec<_> = ["1.1.1.1", "1.1.1.2", "1.1.1.3"]
                .into_iter()
                .map(|addr| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry.admit("t1", "alice", ip(addr))
                    })
                })
                .collect();
            let outcomes: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let rejected = outcomes.iter().filter(|a| a.is_reject()).count();
            assert_eq!(rejected, 1);
        }
    }

    #[test]
    fn speed_limit_yields_throttle() {
        let registry = LimiterRegistry::new();
        registry
            .add_inbound_limiter(
                "t1",
                1000,
                &[UserLimit::new("alice"), UserLimit::new("bob").with_speed_limit(500)],
                &InboundPolicy::default(),
            )
            .unwrap();

        match registry.admit("t1", "alice", ip("1.1.1.1")) {
            Admission::Throttle(_, buckets) => assert_eq!(buckets.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            registry.admit("t1", "bob", ip("1.1.1.2")),
            Admission::Throttle(..)
        ));
        let bucket = registry.get("t1").unwrap().buckets.get("bob").map(|b| b.rate());
        assert_eq!(bucket, Some(500));
    }

    #[test]
    fn no_limits_yield_plain_admit() {
        let registry = registry_with(&[UserLimit::new("alice")]);
        assert!(matches!(
            registry.admit("t1", "alice", ip("1.1.1.1")),
            Admission::Admit(_)
        ));
    }

    #[test]
    fn inbound_bucket_is_shared_by_all_users() {
        let registry = LimiterRegistry::new();
        let policy = InboundPolicy {
            inbound_speed_limit: 2000,
            ..InboundPolicy::default()
        };
        registry
            .add_inbound_limiter("t1", 0, &[UserLimit::new("alice").with_speed_limit(100)], &policy)
            .unwrap();

        let Admission::Throttle(_a, alice) = registry.admit("t1", "alice", ip("1.1.1.1")) else {
            panic!("alice should be throttled");
        };
        let Admission::Throttle(_b, bob) = registry.admit("t1", "bob", ip("1.1.1.2")) else {
            panic!("bob should be throttled by the inbound bucket");
        };
        assert_eq!(alice.len(), 2);
        assert_eq!(bob.len(), 1);
    }

    #[test]
    fn update_adjusts_existing_bucket_and_table() {
        let registry = LimiterRegistry::new();
        registry
            .add_inbound_limiter(
                "t1",
                0,
                &[UserLimit::new("alice").with_speed_limit(1000)],
                &InboundPolicy::default(),
            )
            .unwrap();
        let _lease = registry.admit("t1", "alice", ip("1.1.1.1"));

        registry
            .update_inbound_limiter("t1", &[UserLimit::new("alice").with_speed_limit(250)])
            .unwrap();
        let inbound = registry.get("t1").unwrap();
        assert_eq!(inbound.buckets.get("alice").map(|b| b.rate()), Some(250));

        registry
            .update_inbound_limiter("t1", &[UserLimit::new("alice")])
            .unwrap();
        assert!(inbound.buckets.get("alice").is_none());
        assert_eq!(registry.user_limit("t1", "alice"), Some(UserLimit::new("alice")));
    }

    #[test]
    fn update_racing_admission_leaves_no_stale_bucket() {
        for _ in 0..2000 {
            let registry = Arc::new(registry_with(&[
                UserLimit::new("alice").with_speed_limit(1000)
            ]));
            let barrier = Arc::new(Barrier::new(2));

            let admitting = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    drop(registry.admit("t1", "alice", ip("1.1.1.1")));
                })
            };
            let updating = {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let updated = [UserLimit::new("alice").with_speed_limit(250)];
                    registry.update_inbound_limiter("t1", &updated).unwrap();
                })
            };
            admitting.join().unwrap();
            updating.join().unwrap();

            let inbound = registry.get("t1").unwrap();
            let rate = inbound.buckets.get("alice").map(|b| b.rate());
            assert_eq!(rate, Some(250));
        }
    }

    #[test]
    fn update_keeps_users_not_in_the_batch() {
        let registry = registry_with(&[
            UserLimit::new("alice").with_device_limit(1),
            UserLimit::new("bob").with_device_limit(3),
        ]);
        registry
            .update_inbound_limiter("t1", &[UserLimit::new("alice").with_device_limit(5)])
            .unwrap();
        assert_eq!(registry.user_limit("t1", "alice").unwrap().device_limit, 5);
        assert_eq!(registry.user_limit("t1", "bob").unwrap().device_limit, 3);
    }

    #[test]
    fn update_does_not_disturb_live_devices() {
        let registry = registry_with(&[UserLimit::new("alice").with_device_limit(1)]);
        let _lease = registry.admit("t1", "alice", ip("1.1.1.1"));
        registry
            .update_inbound_limiter("t1", &[UserLimit::new("alice").with_device_limit(1)])
            .unwrap();
        assert!(registry.admit("t1", "alice", ip("1.1.1.2")).is_reject());
        assert_eq!(registry.get_online_device("t1").unwrap().len(), 1);
    }

    #[test]
    fn delete_lets_in_flight_leases_release_safely() {
        let registry = registry_with(&[UserLimit::new("alice").with_device_limit(1)]);
        let lease = registry.admit("t1", "alice", ip("1.1.1.1"));
        registry.delete_inbound_limiter("t1").unwrap();
        assert!(!registry.contains("t1"));
        drop(lease);

        // New checks no longer see the old state.
        let fresh = registry.admit("t1", "alice", ip("1.1.1.2"));
        assert!(matches!(fresh, Admission::Admit(ref l) if l.is_detached()));
    }

    #[test]
    fn online_query_prunes_idle_buckets() {
        let registry = LimiterRegistry::new();
        registry
            .add_inbound_limiter("t1", 100, &[], &InboundPolicy::default())
            .unwrap();
        let lease = registry.admit("t1", "alice", ip("1.1.1.1"));
        drop(lease);
        let inbound = registry.get("t1").unwrap();
        assert_eq!(inbound.buckets.len(), 1);
        registry.get_online_device("t1").unwrap();
        assert_eq!(inbound.buckets.len(), 0);
    }

    #[test]
    fn cleanup_sums_across_tags() {
        let registry = LimiterRegistry::new();
        for tag in ["t1", "t2"] {
            registry
                .add_inbound_limiter(tag, 100, &[], &InboundPolicy::default())
                .unwrap();
            drop(registry.admit(tag, "alice", ip("1.1.1.1")));
        }
        assert_eq!(registry.cleanup(), 2);
        assert_eq!(registry.cleanup(), 0);
        let mut tags = registry.tags();
        tags.sort();
        assert_eq!(tags, vec!["t1".to_owned(), "t2".to_owned()]);
    }
}
