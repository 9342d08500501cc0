//! Card resource service

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::coordinator::Coordinator;
use crate::driver::{CardDriver, ReaderConfigurator};
use crate::error::{Error, Result};
use crate::monitor::{Configurators, HardwareMonitor, MonitorState};
use crate::registry::{PoolStatus, Registry};
use crate::resource::CardResource;

/// Snapshot of a running service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Pools in profile declaration order
    pub pools: Vec<PoolStatus>,
    /// Monitoring state of each plugin start was requested for
    pub plugins: Vec<(String, MonitorState)>,
}

enum Lifecycle {
    Uninitialized,
    Started(Running),
    Stopped,
}

struct Running {
    coordinator: Arc<Coordinator>,
    registry: Arc<Registry>,
    monitor: HardwareMonitor,
    allocation_timeout: Duration,
}

/// Allocates smart-card readers to clients by profile
///
/// The service is started once with a [`ServiceConfig`], hands out
/// [`CardResource`]s until stopped, and cannot be restarted.
pub struct CardResourceService {
    driver: Arc<dyn CardDriver>,
    configurators: Configurators,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for CardResourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lifecycle.lock() {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Started(_) => "started",
            Lifecycle::Stopped => "stopped",
        };
        let mut configured: Vec<&String> = self.configurators.keys().collect();
        configured.sort();
        f.debug_struct("CardResourceService")
            .field("state", &state)
            .field("configured_plugins", &configured)
            .finish_non_exhaustive()
    }
}

impl CardResourceService {
    /// Create a service on top of a driver
    pub fn new<D: CardDriver + 'static>(driver: D) -> Self {
        Self::with_driver(Arc::new(driver))
    }

    /// Create a service on top of a shared driver
    pub fn with_driver(driver: Arc<dyn CardDriver>) -> Self {
        Self {
            driver,
            configurators: Configurators::new(),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    /// Set up every reader of `plugin` with `configurator` before the pools
    /// see it
    ///
    /// Only readers that pass the plugin and reader name filters of at least
    /// one profile are set up. A reader whose setup fails is skipped.
    pub fn with_reader_configurator<C>(mut self, plugin: impl Into<String>, configurator: C) -> Self
    where
        C: ReaderConfigurator + 'static,
    {
        self.configurators
            .insert(plugin.into(), Arc::new(configurator));
        self
    }

    /// Validate the configuration, build the pools and start monitoring
    ///
    /// Returns once the readers already connected to the monitored plugins
    /// are registered. A plugin whose monitoring fails to start is logged and
    /// skipped. Pool plugins are not monitored; they are asked for a reader
    /// at allocation time.
    pub fn start(&self, config: ServiceConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Started(_) => return Err(Error::AlreadyStarted),
            Lifecycle::Stopped => return Err(Error::Stopped),
        }

        let plugins = self.driver.list_plugins()?;
        let pool_plugins = self.driver.list_pool_plugins()?;
        let declared: Vec<String> = plugins.iter().chain(&pool_plugins).cloned().collect();
        let profiles = config.compile(&declared)?;

        let used = |plugin: &String| profiles.iter().any(|profile| profile.accepts_plugin(plugin));
        let monitored: Vec<String> = plugins.iter().filter(|p| used(*p)).cloned().collect();
        let lenders: Vec<String> = pool_plugins.iter().filter(|p| used(*p)).cloned().collect();
        debug!("Monitored plugins: {:?}, pool plugins: {:?}", monitored, lenders);

        let profile_count = profiles.len();
        let registry = Arc::new(Registry::new(profiles, config.usage_timeout()));
        let coordinator = Arc::new(
            Coordinator::new(Arc::clone(&registry), Arc::clone(&self.driver))
                .with_pool_plugins(lenders, config.pool_first),
        );
        let mut monitor = HardwareMonitor::new(
            Arc::clone(&self.driver),
            Arc::clone(&registry),
            self.configurators.clone(),
        );
        monitor.start(&monitored);

        *lifecycle = Lifecycle::Started(Running {
            coordinator,
            registry,
            monitor,
            allocation_timeout: config.allocation_timeout(),
        });
        info!(
            "Card resource service started with {} profiles on {} plugins",
            profile_count,
            monitored.len()
        );
        Ok(())
    }

    fn running(&self) -> Result<(Arc<Coordinator>, Duration)> {
        match &*self.lifecycle.lock() {
            Lifecycle::Uninitialized => Err(Error::NotStarted),
            Lifecycle::Started(running) => Ok((
                Arc::clone(&running.coordinator),
                running.allocation_timeout,
            )),
            Lifecycle::Stopped => Err(Error::Stopped),
        }
    }

    /// Allocate a resource for `profile`, waiting at most `max_wait`
    ///
    /// Returns `Ok(None)` when nothing became available in time. A zero wait
    /// makes a single attempt. Waiting ends with [`Error::Stopped`] if the
    /// service stops meanwhile.
    pub fn allocate(&self, profile: &str, max_wait: Duration) -> Result<Option<CardResource>> {
        let (coordinator, _) = self.running()?;
        coordinator.allocate(profile, max_wait)
    }

    /// Allocate with the configured allocation timeout
    pub fn allocate_default(&self, profile: &str) -> Result<Option<CardResource>> {
        let (coordinator, timeout) = self.running()?;
        coordinator.allocate(profile, timeout)
    }

    /// Hand a resource back
    ///
    /// Fails with [`Error::AlreadyReleased`] on a second release and with
    /// [`Error::UnknownToken`] for a resource this service never issued.
    pub fn release(&self, resource: &CardResource) -> Result<()> {
        let (coordinator, _) = self.running()?;
        coordinator.release(resource)
    }

    /// Hand a resource back and withdraw its reader from every pool
    ///
    /// The reader comes back with its next card or reader event.
    pub fn remove(&self, resource: &CardResource) -> Result<()> {
        let (coordinator, _) = self.running()?;
        coordinator.remove(resource)
    }

    /// Pools and monitoring state of a running service
    pub fn status(&self) -> Result<ServiceStatus> {
        match &*self.lifecycle.lock() {
            Lifecycle::Uninitialized => Err(Error::NotStarted),
            Lifecycle::Started(running) => Ok(ServiceStatus {
                pools: running.registry.status(),
                plugins: running.monitor.plugin_states(),
            }),
            Lifecycle::Stopped => Err(Error::Stopped),
        }
    }

    /// Monitoring state of a plugin
    pub fn plugin_state(&self, plugin: &str) -> MonitorState {
        match &*self.lifecycle.lock() {
            Lifecycle::Started(running) => running.monitor.plugin_state(plugin),
            _ => MonitorState::Stopped,
        }
    }

    /// Whether the service is started and not stopped
    pub fn is_started(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Started(_))
    }

    /// Stop monitoring and fail every pending and future call
    ///
    /// Blocked allocations return [`Error::Stopped`]. Stopping twice is a
    /// no-op.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Started(mut running) = previous {
            running.coordinator.shutdown();
            running.monitor.stop();
            self.driver.stop_monitoring();
            info!("Card resource service stopped");
        }
    }
}

impl Drop for CardResourceService {
    fn drop(&mut self) {
        self.stop();
    }
}
