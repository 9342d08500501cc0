//! Registry of pools and known readers
//!
//! All pool state lives behind one mutex because a reader may belong to
//! several pools and must still never be held twice. The condition variable
//! next to it is the wake signal of blocked allocations.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::{AllocationStrategy, Released, ResourcePool, ResourceStatus};
use crate::profile::Profile;
use crate::reader::{ReaderDescriptor, ReaderKey};
use crate::resource::LeaseId;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Profile name
    pub profile: String,
    /// Allocation strategy
    pub strategy: AllocationStrategy,
    /// Resources in pool order
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone)]
struct Lease {
    pool: usize,
    reader: ReaderKey,
    acquired: Instant,
}

/// Successful allocation, before selection
#[derive(Debug, Clone)]
pub(crate) struct Grant {
    pub(crate) lease: LeaseId,
    pub(crate) profile: Arc<Profile>,
    pub(crate) reader: ReaderKey,
    pub(crate) power_on_data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct RegistryState {
    pools: Vec<ResourcePool>,
    pool_names: HashMap<String, usize>,
    /// Every reader reported by a monitored plugin
    readers: HashMap<ReaderKey, ReaderDescriptor>,
    /// Reader to the pools holding a resource for it
    membership: HashMap<ReaderKey, BTreeSet<usize>>,
    leases: HashMap<LeaseId, Lease>,
    /// Reader to the lease currently holding it
    holders: HashMap<ReaderKey, LeaseId>,
    /// Readers lent by pool plugins, outside of every pool
    borrowed: HashMap<LeaseId, ReaderKey>,
    next_lease: LeaseId,
    usage_timeout: Option<Duration>,
    closed: bool,
}

/// Pools, readers and leases of one service instance
#[derive(Debug)]
pub(crate) struct Registry {
    id: u64,
    state: Mutex<RegistryState>,
    changed: Condvar,
}

impl Registry {
    pub(crate) fn new(profiles: Vec<Profile>, usage_timeout: Option<Duration>) -> Self {
        let pool_names = profiles
            .iter()
            .enumerate()
            .map(|(index, profile)| (profile.name().to_string(), index))
            .collect();
        let pools = profiles
            .into_iter()
            .map(|profile| ResourcePool::new(Arc::new(profile)))
            .collect();

        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(RegistryState {
                pools,
                pool_names,
                readers: HashMap::new(),
                membership: HashMap::new(),
                leases: HashMap::new(),
                holders: HashMap::new(),
                borrowed: HashMap::new(),
                next_lease: 1,
                usage_timeout,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Block until woken or `deadline`, releasing the lock meanwhile
    pub(crate) fn wait_until(&self, state: &mut MutexGuard<'_, RegistryState>, deadline: Instant) {
        let _ = self.changed.wait_until(state, deadline);
    }

    fn wake_all(&self) {
        self.changed.notify_all();
    }

    /// Whether the lease still holds its reader
    pub(crate) fn is_held(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    /// Block until woken or `until`, failing once the registry is closed
    pub(crate) fn pause(&self, until: Instant) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Stopped);
        }
        self.wait_until(&mut state, until);
        Ok(())
    }

    /// Record a reader lent by a pool plugin under a new lease
    pub(crate) fn lend(&self, reader: ReaderKey) -> Result<LeaseId> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Stopped);
        }
        let lease = state.next_lease;
        state.next_lease += 1;
        state.borrowed.insert(lease, reader);
        Ok(lease)
    }

    /// End a pool plugin loan, returning the reader to give back
    pub(crate) fn end_loan(&self, lease: LeaseId) -> Option<ReaderKey> {
        self.lock().borrowed.remove(&lease)
    }

    /// Release a lease, waking waiters when capacity came back
    pub(crate) fn release(&self, lease: LeaseId) -> Result<()> {
        self.lock().release(lease)?;
        self.wake_all();
        Ok(())
    }

    /// Release a lease and drop its resource from the pool it came from
    pub(crate) fn reject(&self, lease: LeaseId) -> Result<()> {
        self.lock().reject(lease)?;
        self.wake_all();
        Ok(())
    }

    /// Release a lease and drop its reader from every pool, leaving the
    /// reader known
    pub(crate) fn remove(&self, lease: LeaseId) -> Result<()> {
        {
            let mut state = self.lock();
            let reader = state.leases.get(&lease).map(|held| held.reader.clone());
            state.release(lease)?;
            if let Some(reader) = reader {
                state.evict(&reader);
            }
        }
        self.wake_all();
        Ok(())
    }

    /// Whether any pool may ever take the reader, whatever its card
    pub(crate) fn is_wanted(&self, reader: &ReaderDescriptor) -> bool {
        self.lock()
            .pools
            .iter()
            .any(|pool| pool.profile().accepts_reader(reader))
    }

    /// Offer a newly connected reader to every pool
    pub(crate) fn reader_added(&self, reader: ReaderDescriptor) {
        let mut state = self.lock();
        let key = reader.key();
        if state.readers.insert(key.clone(), reader).is_some() {
            debug!("Reader {} reported again, revalidating", key);
        }
        if state.revalidate(&key) {
            drop(state);
            self.wake_all();
        }
    }

    /// Forget a disconnected reader
    pub(crate) fn reader_removed(&self, reader: &ReaderKey) {
        {
            let mut state = self.lock();
            state.readers.remove(reader);
            state.evict(reader);
        }
        self.wake_all();
    }

    /// Record a card insertion and revalidate membership
    pub(crate) fn card_inserted(&self, reader: &ReaderKey, atr: Vec<u8>) {
        self.update_card(reader, |descriptor| descriptor.with_card(atr));
    }

    /// Record a card removal and revalidate membership
    pub(crate) fn card_removed(&self, reader: &ReaderKey) {
        self.update_card(reader, ReaderDescriptor::without_card);
    }

    fn update_card(
        &self,
        reader: &ReaderKey,
        update: impl FnOnce(&ReaderDescriptor) -> ReaderDescriptor,
    ) {
        let mut state = self.lock();
        let Some(descriptor) = state.readers.get(reader) else {
            debug!("Card event for unknown reader {}", reader);
            return;
        };
        let descriptor = update(descriptor);
        state.readers.insert(reader.clone(), descriptor);
        if state.revalidate(reader) {
            drop(state);
            self.wake_all();
        }
    }

    /// Refuse all further allocations and wake every waiter. Returns the
    /// readers still lent by pool plugins.
    pub(crate) fn close(&self) -> Vec<ReaderKey> {
        let borrowed = {
            let mut state = self.lock();
            state.closed = true;
            state.borrowed.drain().map(|(_, reader)| reader).collect()
        };
        self.wake_all();
        borrowed
    }

    pub(crate) fn status(&self) -> Vec<PoolStatus> {
        let state = self.lock();
        state
            .pools
            .iter()
            .map(|pool| PoolStatus {
                profile: pool.profile().name().to_string(),
                strategy: pool.profile().strategy(),
                resources: pool.snapshot(),
            })
            .collect()
    }
}

impl RegistryState {
    pub(crate) fn pool_index(&self, profile: &str) -> Option<usize> {
        self.pool_names.get(profile).copied()
    }

    pub(crate) fn profile(&self, pool: usize) -> &Arc<Profile> {
        self.pools[pool].profile()
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Allocate from a pool without waiting
    pub(crate) fn try_allocate(&mut self, pool: usize) -> Option<Grant> {
        self.reclaim_expired(Instant::now());

        let lease = self.next_lease;
        let holders = &self.holders;
        let allocated = self.pools[pool].try_allocate(lease, |reader| !holders.contains_key(reader))?;

        self.next_lease += 1;
        self.holders.insert(allocated.key.clone(), lease);
        self.leases.insert(
            lease,
            Lease {
                pool,
                reader: allocated.key.clone(),
                acquired: Instant::now(),
            },
        );

        Some(Grant {
            lease,
            profile: Arc::clone(self.pools[pool].profile()),
            reader: allocated.key,
            power_on_data: allocated.power_on_data,
        })
    }

    /// Earliest instant at which a lease may be reclaimed
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        let timeout = self.usage_timeout?;
        self.leases
            .values()
            .map(|lease| lease.acquired + timeout)
            .min()
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let Some(timeout) = self.usage_timeout else {
            return;
        };

        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| now.duration_since(lease.acquired) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            if let Some(reader) = self.leases.get(&lease).map(|l| l.reader.clone()) {
                warn!(
                    "Reader {} automatically released, usage timeout of {:?} exceeded",
                    reader, timeout
                );
            }
            let _ = self.release(lease);
        }
    }

    fn release(&mut self, lease: LeaseId) -> Result<()> {
        let Some(held) = self.leases.remove(&lease) else {
            return Err(if lease < self.next_lease {
                Error::AlreadyReleased
            } else {
                Error::UnknownToken
            });
        };

        if self.holders.get(&held.reader) == Some(&lease) {
            self.holders.remove(&held.reader);
        }

        match self.pools[held.pool].release(lease) {
            Some(Released::Purged) => {
                debug!("Purged removed resource {}", held.reader);
                self.refresh_membership(&held.reader);
            }
            Some(Released::Freed) => debug!("Resource {} is free again", held.reader),
            None => warn!("Lease {} not found in its pool", lease),
        }
        Ok(())
    }

    fn reject(&mut self, lease: LeaseId) -> Result<()> {
        if let Some(held) = self.leases.get(&lease).cloned() {
            let pool = &mut self.pools[held.pool];
            pool.remove_reader(&held.reader);
            info!("Removed {} from profile {}", held.reader, pool.profile().name());
        }
        self.release(lease)
    }

    fn evict(&mut self, reader: &ReaderKey) -> bool {
        let Some(pools) = self.membership.get(reader).cloned() else {
            return false;
        };

        let mut changed = false;
        for index in pools {
            if self.pools[index].remove_reader(reader) {
                info!(
                    "Removed {} from profile {}",
                    reader,
                    self.pools[index].profile().name()
                );
                changed = true;
            }
        }
        self.refresh_membership(reader);
        changed
    }

    /// Bring every pool in line with the reader's current descriptor.
    /// Returns whether a resource was added, which may unblock waiters.
    fn revalidate(&mut self, reader: &ReaderKey) -> bool {
        let Some(descriptor) = self.readers.get(reader) else {
            return false;
        };

        let mut added = false;
        for pool in &mut self.pools {
            if pool.add_if_matches(descriptor) {
                info!("Added {} to profile {}", reader, pool.profile().name());
                added = true;
            } else if pool.is_member(reader)
                && crate::profile::matches(descriptor, pool.profile()).is_none()
                && pool.remove_reader(reader)
            {
                info!("Removed {} from profile {}", reader, pool.profile().name());
            }
        }
        self.refresh_membership(reader);
        added
    }

    fn refresh_membership(&mut self, reader: &ReaderKey) {
        let pools: BTreeSet<usize> = self
            .pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| pool.references(reader))
            .map(|(index, _)| index)
            .collect();

        if pools.is_empty() {
            self.membership.remove(reader);
        } else {
            self.membership.insert(reader.clone(), pools);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use crate::profile::{CardPresence, FilterSpec};

    fn registry(configs: &[ProfileConfig], usage_timeout: Option<Duration>) -> Registry {
        let profiles = configs
            .iter()
            .map(|config| Profile::compile(config).unwrap())
            .collect();
        Registry::new(profiles, usage_timeout)
    }

    fn reader_only(name: &str) -> ProfileConfig {
        ProfileConfig::new(name).with_card_presence(CardPresence::None)
    }

    fn key(name: &str) -> ReaderKey {
        ReaderKey::new("pcsc", name)
    }

    #[test]
    fn test_reader_joins_several_pools_but_is_held_once() {
        let registry = registry(&[reader_only("A"), reader_only("B")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let mut state = registry.lock();
        let a = state.pool_index("A").unwrap();
        let b = state.pool_index("B").unwrap();
        assert_eq!(state.membership[&key("R1")].len(), 2);

        let grant = state.try_allocate(a).unwrap();
        assert_eq!(grant.reader, key("R1"));
        assert!(state.try_allocate(b).is_none());

        state.release(grant.lease).unwrap();
        assert!(state.try_allocate(b).is_some());
    }

    #[test]
    fn test_release_errors() {
        let registry = registry(&[reader_only("A")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let lease = registry.lock().try_allocate(0).unwrap().lease;
        registry.release(lease).unwrap();
        assert!(matches!(registry.release(lease), Err(Error::AlreadyReleased)));
        assert!(matches!(registry.release(999), Err(Error::UnknownToken)));
    }

    #[test]
    fn test_reader_removed_while_allocated() {
        let registry = registry(&[reader_only("A")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));
        let lease = registry.lock().try_allocate(0).unwrap().lease;

        registry.reader_removed(&key("R1"));
        assert!(registry.lock().membership.contains_key(&key("R1")));

        registry.release(lease).unwrap();
        let state = registry.lock();
        assert!(!state.membership.contains_key(&key("R1")));
        assert!(state.readers.is_empty());
    }

    #[test]
    fn test_same_reader_name_on_two_plugins() {
        let registry = registry(&[reader_only("A")], None);
        registry.reader_added(ReaderDescriptor::new("P1", "Reader", None));
        registry.reader_added(ReaderDescriptor::new("P2", "Reader", None));
        assert_eq!(registry.status()[0].resources.len(), 2);

        let first = registry.lock().try_allocate(0).unwrap();
        let second = registry.lock().try_allocate(0).unwrap();
        assert_eq!(first.reader, ReaderKey::new("P1", "Reader"));
        assert_eq!(second.reader, ReaderKey::new("P2", "Reader"));

        // Losing the reader of one plugin leaves the other one alone
        registry.release(second.lease).unwrap();
        registry.reader_removed(&ReaderKey::new("P1", "Reader"));
        registry.card_inserted(&ReaderKey::new("P1", "Reader"), vec![0x3B]);
        let state = registry.lock();
        assert!(state.pools[0].is_member(&ReaderKey::new("P2", "Reader")));
        assert!(state.membership.contains_key(&ReaderKey::new("P2", "Reader")));
        assert!(!state.readers.contains_key(&ReaderKey::new("P1", "Reader")));
    }

    #[test]
    fn test_card_events_revalidate() {
        let registry = registry(
            &[ProfileConfig::new("sam").with_atr(FilterSpec::Regex("3B.*".into()))],
            None,
        );
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));
        assert!(registry.lock().try_allocate(0).is_none());

        registry.card_inserted(&key("R1"), vec![0x3B, 0x02, 0x14, 0x50]);
        let lease = registry.lock().try_allocate(0).unwrap().lease;

        registry.card_removed(&key("R1"));
        assert_eq!(
            registry.status()[0].resources[0].state,
            crate::resource::ResourceState::Removed
        );
        registry.release(lease).unwrap();
        assert!(registry.status()[0].resources.is_empty());

        // Card events for readers never reported are ignored
        registry.card_inserted(&key("R9"), vec![0x3B]);
        assert!(registry.lock().readers.get(&key("R9")).is_none());
    }

    #[test]
    fn test_usage_timeout_reclaims_lease() {
        let registry = registry(&[reader_only("A")], Some(Duration::from_millis(20)));
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let first = registry.lock().try_allocate(0).unwrap().lease;
        assert!(registry.lock().try_allocate(0).is_none());
        assert!(registry.lock().next_expiry().is_some());
        assert!(registry.is_held(first));

        std::thread::sleep(Duration::from_millis(40));
        let second = registry.lock().try_allocate(0).unwrap().lease;
        assert_ne!(first, second);
        assert!(!registry.is_held(first));
        assert!(matches!(registry.release(first), Err(Error::AlreadyReleased)));
        registry.release(second).unwrap();
    }

    #[test]
    fn test_remove_keeps_reader_known() {
        let registry = registry(&[reader_only("A"), reader_only("B")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let lease = registry.lock().try_allocate(0).unwrap().lease;
        registry.remove(lease).unwrap();
        assert!(registry.lock().try_allocate(0).is_none());
        assert!(registry.lock().try_allocate(1).is_none());
        assert!(registry.lock().readers.contains_key(&key("R1")));
        assert!(matches!(registry.remove(lease), Err(Error::AlreadyReleased)));

        // Any later card event revalidates the reader
        registry.card_removed(&key("R1"));
        assert!(registry.lock().try_allocate(0).is_some());
    }

    #[test]
    fn test_reject_leaves_other_pools() {
        let registry = registry(&[reader_only("A"), reader_only("B")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let lease = registry.lock().try_allocate(0).unwrap().lease;
        registry.reject(lease).unwrap();

        let status = registry.status();
        assert!(status[0].resources.is_empty());
        assert_eq!(status[1].resources.len(), 1);
        assert!(registry.lock().try_allocate(1).is_some());
    }

    #[test]
    fn test_loans_share_lease_numbering() {
        let registry = registry(&[reader_only("A")], None);
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));

        let loan = registry.lend(ReaderKey::new("pool", "Lent 1")).unwrap();
        let lease = registry.lock().try_allocate(0).unwrap().lease;
        assert_ne!(loan, lease);

        assert_eq!(registry.end_loan(loan), Some(ReaderKey::new("pool", "Lent 1")));
        assert_eq!(registry.end_loan(loan), None);
        assert!(matches!(registry.release(loan), Err(Error::AlreadyReleased)));

        let open = registry.lend(ReaderKey::new("pool", "Lent 2")).unwrap();
        assert_eq!(registry.close(), [ReaderKey::new("pool", "Lent 2")]);
        assert_eq!(registry.end_loan(open), None);
        assert!(matches!(
            registry.lend(ReaderKey::new("pool", "Lent 3")),
            Err(Error::Stopped)
        ));
    }
}
