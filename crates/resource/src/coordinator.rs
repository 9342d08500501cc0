//! Allocation coordinator
//!
//! Blocking allocation on top of the registry. Waiters are not queued: every
//! wake-up is broadcast and each waiter retries on its own, so under
//! contention the pool's allocation strategy picks the winner, not arrival
//! order.
//!
//! Profiles that pool plugins may serve are retried at a fixed interval,
//! since loans do not go through the registry's wake signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::driver::CardDriver;
use crate::error::{Error, Result};
use crate::profile::{Profile, matches};
use crate::reader::{ReaderDescriptor, ReaderKey};
use crate::registry::{Grant, Registry};
use crate::resource::CardResource;

/// Interval between two rounds over the pool plugins
const POOL_RETRY: Duration = Duration::from_millis(100);

/// Serializes allocation requests against a [`Registry`]
pub(crate) struct Coordinator {
    registry: Arc<Registry>,
    driver: Arc<dyn CardDriver>,
    pool_plugins: Vec<String>,
    pool_first: bool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry.id())
            .field("pool_plugins", &self.pool_plugins)
            .field("pool_first", &self.pool_first)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub(crate) fn new(registry: Arc<Registry>, driver: Arc<dyn CardDriver>) -> Self {
        Self {
            registry,
            driver,
            pool_plugins: Vec::new(),
            pool_first: false,
        }
    }

    /// Also borrow readers from these pool plugins, before the pools when
    /// `pool_first` is set
    pub(crate) fn with_pool_plugins(mut self, plugins: Vec<String>, pool_first: bool) -> Self {
        self.pool_plugins = plugins;
        self.pool_first = pool_first;
        self
    }

    /// Allocate a resource for `profile`, waiting at most `max_wait`
    ///
    /// `Ok(None)` means the wait expired. A zero wait makes a single attempt.
    pub(crate) fn allocate(&self, profile: &str, max_wait: Duration) -> Result<Option<CardResource>> {
        let deadline = Instant::now().checked_add(max_wait);
        let (pool, profile) = {
            let state = self.registry.lock();
            let pool = state
                .pool_index(profile)
                .ok_or_else(|| Error::UnknownProfile(profile.to_string()))?;
            (pool, Arc::clone(state.profile(pool)))
        };
        let lenders: Vec<&str> = self
            .pool_plugins
            .iter()
            .map(String::as_str)
            .filter(|plugin| profile.accepts_plugin(plugin))
            .collect();

        if lenders.is_empty() {
            return self.allocate_from_pool(pool, &profile, deadline);
        }

        loop {
            if self.pool_first {
                if let Some(resource) = self.borrow(&profile, &lenders)? {
                    return Ok(Some(resource));
                }
            }
            if let Some(resource) = self.allocate_from_pool(pool, &profile, Some(Instant::now()))? {
                return Ok(Some(resource));
            }
            if !self.pool_first {
                if let Some(resource) = self.borrow(&profile, &lenders)? {
                    return Ok(Some(resource));
                }
            }

            let now = Instant::now();
            let retry_at = now + POOL_RETRY;
            match deadline {
                Some(deadline) if now >= deadline => {
                    debug!("No card resource available for profile {}", profile.name());
                    return Ok(None);
                }
                Some(deadline) => self.registry.pause(deadline.min(retry_at))?,
                None => self.registry.pause(retry_at)?,
            }
        }
    }

    /// Allocate from the profile's pool, running selection on each grant
    /// until one passes
    fn allocate_from_pool(
        &self,
        pool: usize,
        profile: &Profile,
        deadline: Option<Instant>,
    ) -> Result<Option<CardResource>> {
        loop {
            let Some(grant) = self.wait_for_grant(pool, deadline)? else {
                debug!("No card resource available for profile {}", profile.name());
                return Ok(None);
            };

            let responses = if grant.profile.selection().is_empty() {
                Vec::new()
            } else {
                match self.driver.execute_selection(
                    &grant.reader.plugin,
                    &grant.reader.name,
                    grant.profile.selection(),
                ) {
                    Ok(responses) => responses,
                    Err(e) => {
                        warn!(
                            "Selection failed on {} for profile {}: {}",
                            grant.reader,
                            grant.profile.name(),
                            e
                        );
                        match self.registry.reject(grant.lease) {
                            // Reclaimed by the usage timeout meanwhile
                            Ok(()) | Err(Error::AlreadyReleased) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
            };

            if !self.registry.is_held(grant.lease) {
                debug!(
                    "Lease on {} expired during selection, retrying",
                    grant.reader
                );
                continue;
            }
            return Ok(Some(self.resource(grant, responses)));
        }
    }

    /// Try the pool, sleeping on the registry's wake signal between attempts
    fn wait_for_grant(&self, pool: usize, deadline: Option<Instant>) -> Result<Option<Grant>> {
        let mut state = self.registry.lock();

        loop {
            if state.is_closed() {
                return Err(Error::Stopped);
            }
            if let Some(grant) = state.try_allocate(pool) {
                debug!("Allocated {} for profile {}", grant.reader, grant.profile.name());
                return Ok(Some(grant));
            }

            let now = Instant::now();
            let wake_at = match (deadline, state.next_expiry()) {
                (Some(deadline), _) if now >= deadline => return Ok(None),
                (Some(deadline), Some(expiry)) => deadline.min(expiry),
                (Some(deadline), None) => deadline,
                // Unrepresentable deadline: wait for a signal or an expiry
                (None, Some(expiry)) => expiry,
                (None, None) => now + Duration::from_secs(3600),
            };
            self.registry.wait_until(&mut state, wake_at);
        }
    }

    /// Ask each pool plugin in turn for a reader of the profile's group
    fn borrow(&self, profile: &Arc<Profile>, lenders: &[&str]) -> Result<Option<CardResource>> {
        for &plugin in lenders {
            let lent = match self.driver.allocate_pool_reader(plugin, profile.reader_group()) {
                Ok(Some(lent)) => lent,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Pool plugin {} has no reader for {}: {}", plugin, profile.name(), e);
                    continue;
                }
            };
            let key = ReaderKey::new(plugin, &lent.name);

            let found = match ReaderDescriptor::from_status(plugin, &lent.name, lent.card) {
                Ok(descriptor) => matches(&descriptor, profile),
                Err(e) => {
                    warn!("Unusable reader {} lent by pool plugin: {}", key, e);
                    None
                }
            };
            let Some(found) = found else {
                self.give_back(&key);
                continue;
            };

            let responses = if profile.selection().is_empty() {
                Vec::new()
            } else {
                match self
                    .driver
                    .execute_selection(plugin, &lent.name, profile.selection())
                {
                    Ok(responses) => responses,
                    Err(e) => {
                        warn!(
                            "Selection failed on {} for profile {}: {}",
                            key,
                            profile.name(),
                            e
                        );
                        self.give_back(&key);
                        continue;
                    }
                }
            };

            let lease = match self.registry.lend(key.clone()) {
                Ok(lease) => lease,
                Err(e) => {
                    self.give_back(&key);
                    return Err(e);
                }
            };
            debug!("Borrowed {} for profile {}", key, profile.name());
            return Ok(Some(CardResource::new(
                self.registry.id(),
                lease,
                profile.name().to_string(),
                key.plugin,
                key.name,
                found.power_on_data,
                responses,
            )));
        }
        Ok(None)
    }

    fn give_back(&self, reader: &ReaderKey) {
        if let Err(e) = self.driver.release_pool_reader(&reader.plugin, &reader.name) {
            warn!("Unable to give {} back to its pool plugin: {}", reader, e);
        }
    }

    fn resource(&self, grant: Grant, responses: Vec<Vec<u8>>) -> CardResource {
        CardResource::new(
            self.registry.id(),
            grant.lease,
            grant.profile.name().to_string(),
            grant.reader.plugin,
            grant.reader.name,
            grant.power_on_data,
            responses,
        )
    }

    /// Hand a resource back to its pool and wake waiters
    pub(crate) fn release(&self, resource: &CardResource) -> Result<()> {
        if resource.service != self.registry.id() {
            return Err(Error::UnknownToken);
        }
        if let Some(reader) = self.registry.end_loan(resource.lease) {
            self.driver
                .release_pool_reader(&reader.plugin, &reader.name)?;
        } else {
            self.registry.release(resource.lease)?;
        }
        debug!("Card resource released: {}", resource);
        Ok(())
    }

    /// Release a resource and drop its reader from every pool until the
    /// reader is reported again
    ///
    /// A reader borrowed from a pool plugin is simply given back.
    pub(crate) fn remove(&self, resource: &CardResource) -> Result<()> {
        if resource.service != self.registry.id() {
            return Err(Error::UnknownToken);
        }
        if let Some(reader) = self.registry.end_loan(resource.lease) {
            self.driver
                .release_pool_reader(&reader.plugin, &reader.name)?;
        } else {
            self.registry.remove(resource.lease)?;
        }
        debug!("Card resource removed: {}", resource);
        Ok(())
    }

    /// Fail pending and future allocations with [`Error::Stopped`] and give
    /// every borrowed reader back
    pub(crate) fn shutdown(&self) {
        for reader in self.registry.close() {
            self.give_back(&reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::ProfileConfig;
    use crate::driver::{CardEventReceiver, ReaderEventReceiver};
    use crate::error::DriverError;
    use crate::profile::{CardPresence, SelectionStep};

    /// Driver whose selection outlasts the usage timeout
    #[derive(Debug)]
    struct SlowSelection {
        delay: Duration,
        status: u16,
    }

    impl CardDriver for SlowSelection {
        fn list_plugins(&self) -> std::result::Result<Vec<String>, DriverError> {
            Ok(vec!["pcsc".to_string()])
        }

        fn observe_reader_events(
            &self,
            plugin: &str,
        ) -> std::result::Result<ReaderEventReceiver, DriverError> {
            Err(DriverError::PluginNotFound(plugin.to_string()))
        }

        fn observe_card_events(
            &self,
            _plugin: &str,
            reader: &str,
        ) -> std::result::Result<CardEventReceiver, DriverError> {
            Err(DriverError::ReaderNotFound(reader.to_string()))
        }

        fn execute_selection(
            &self,
            _plugin: &str,
            reader: &str,
            steps: &[SelectionStep],
        ) -> std::result::Result<Vec<Vec<u8>>, DriverError> {
            thread::sleep(self.delay);
            if steps.iter().all(|step| step.accepts(self.status)) {
                Ok(vec![self.status.to_be_bytes().to_vec(); steps.len()])
            } else {
                Err(DriverError::SelectionRejected {
                    reader: reader.to_string(),
                    status: self.status,
                })
            }
        }
    }

    fn coordinator(status: u16) -> (Arc<Registry>, Coordinator) {
        let config = ProfileConfig::new("A")
            .with_card_presence(CardPresence::None)
            .with_selection_step(SelectionStep::new(vec![0x00, 0xA4, 0x04, 0x00]));
        let registry = Arc::new(Registry::new(
            vec![Profile::compile(&config).unwrap()],
            Some(Duration::from_millis(200)),
        ));
        registry.reader_added(ReaderDescriptor::new("pcsc", "R1", None));
        let driver = SlowSelection {
            delay: Duration::from_millis(400),
            status,
        };
        let coordinator = Coordinator::new(Arc::clone(&registry), Arc::new(driver));
        (registry, coordinator)
    }

    /// Let another thread take the reader once the selecting lease expired
    fn steal_after_expiry(registry: &Arc<Registry>) -> thread::JoinHandle<Option<u64>> {
        let registry = Arc::clone(registry);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            registry.lock().try_allocate(0).map(|grant| grant.lease)
        })
    }

    #[test]
    fn test_expired_lease_not_returned_after_selection() {
        let (registry, coordinator) = coordinator(0x9000);
        let thief = steal_after_expiry(&registry);

        let allocated = coordinator.allocate("A", Duration::ZERO).unwrap();
        let stolen = thief.join().unwrap();

        assert!(stolen.is_some());
        assert!(allocated.is_none());
    }

    #[test]
    fn test_expired_lease_after_failed_selection_retries() {
        let (registry, coordinator) = coordinator(0x6A82);
        let thief = steal_after_expiry(&registry);

        assert!(matches!(coordinator.allocate("A", Duration::ZERO), Ok(None)));
        assert!(thief.join().unwrap().is_some());
    }
}
