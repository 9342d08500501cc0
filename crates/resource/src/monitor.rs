//! Hardware monitor
//!
//! One worker thread per plugin consumes the plugin's reader event stream and
//! the card event streams of its readers, and turns every event into a
//! registry update. A plugin may come with a [`ReaderConfigurator`] that
//! prepares each reader before the pools see it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvError, Select, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{
    CardDriver, CardEvent, CardEventReceiver, ReaderConfigurator, ReaderEvent, ReaderEventReceiver,
};
use crate::error::DriverError;
use crate::reader::{ReaderDescriptor, ReaderKey};
use crate::registry::Registry;

/// Monitoring state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Not monitored
    Stopped,
    /// Subscribing and replaying the connected readers
    Starting,
    /// Worker running
    Monitoring,
}

type States = Arc<Mutex<HashMap<String, MonitorState>>>;

/// Reader configurators by plugin name
pub(crate) type Configurators = HashMap<String, Arc<dyn ReaderConfigurator>>;

struct Worker {
    plugin: String,
    /// Dropping the sender stops the worker
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps the registry in line with the readers and cards of the monitored
/// plugins
pub(crate) struct HardwareMonitor {
    driver: Arc<dyn CardDriver>,
    registry: Arc<Registry>,
    configurators: Configurators,
    states: States,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for HardwareMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareMonitor")
            .field("states", &*self.states.lock())
            .finish_non_exhaustive()
    }
}

impl HardwareMonitor {
    pub(crate) fn new(
        driver: Arc<dyn CardDriver>,
        registry: Arc<Registry>,
        configurators: Configurators,
    ) -> Self {
        Self {
            driver,
            registry,
            configurators,
            states: Arc::new(Mutex::new(HashMap::new())),
            workers: Vec::new(),
        }
    }

    /// Start monitoring each plugin. A plugin that fails to start is logged
    /// and left stopped; the others are unaffected.
    pub(crate) fn start(&mut self, plugins: &[String]) {
        for plugin in plugins {
            if let Err(e) = self.start_plugin(plugin) {
                warn!("Plugin monitoring failed to start [plugin={}]: {}", plugin, e);
                self.states
                    .lock()
                    .insert(plugin.clone(), MonitorState::Stopped);
            }
        }
    }

    fn start_plugin(&mut self, plugin: &str) -> Result<(), DriverError> {
        info!("Plugin monitoring start requested [plugin={}]", plugin);
        self.states
            .lock()
            .insert(plugin.to_string(), MonitorState::Starting);

        let readers = self.driver.observe_reader_events(plugin)?;
        let mut watcher = PluginWatcher {
            plugin: plugin.to_string(),
            driver: Arc::clone(&self.driver),
            registry: Arc::clone(&self.registry),
            configurator: self.configurators.get(plugin).cloned(),
            readers,
            cards: Vec::new(),
            known: BTreeSet::new(),
        };

        // Readers already connected are in the registry before start returns
        watcher.drain();

        let (stop, stopped) = bounded::<()>(0);
        let states = Arc::clone(&self.states);
        self.states
            .lock()
            .insert(plugin.to_string(), MonitorState::Monitoring);

        let handle = thread::Builder::new()
            .name(format!("card-monitor-{plugin}"))
            .spawn(move || {
                watcher.run(&stopped);
                states.lock().insert(watcher.plugin, MonitorState::Stopped);
            })
            .map_err(|e| DriverError::Other(format!("Unable to spawn monitor: {e}")))?;

        self.workers.push(Worker {
            plugin: plugin.to_string(),
            stop,
            handle,
        });
        Ok(())
    }

    /// Stop every worker and wait for them to finish
    pub(crate) fn stop(&mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.stop);
            if worker.handle.join().is_err() {
                warn!("Monitor of plugin {} panicked", worker.plugin);
            }
            self.states
                .lock()
                .insert(worker.plugin.clone(), MonitorState::Stopped);
            info!("Plugin monitoring stopped [plugin={}]", worker.plugin);
        }
    }

    /// Monitoring state of a plugin
    pub(crate) fn plugin_state(&self, plugin: &str) -> MonitorState {
        self.states
            .lock()
            .get(plugin)
            .copied()
            .unwrap_or(MonitorState::Stopped)
    }

    /// Monitoring state of every plugin start was requested for
    pub(crate) fn plugin_states(&self) -> Vec<(String, MonitorState)> {
        let mut states: Vec<_> = self
            .states
            .lock()
            .iter()
            .map(|(plugin, state)| (plugin.clone(), *state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

impl Drop for HardwareMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Next {
    Stop,
    Reader(Result<ReaderEvent, RecvError>),
    Card(usize, Result<CardEvent, RecvError>),
}

/// Event loop of one plugin
struct PluginWatcher {
    plugin: String,
    driver: Arc<dyn CardDriver>,
    registry: Arc<Registry>,
    configurator: Option<Arc<dyn ReaderConfigurator>>,
    readers: ReaderEventReceiver,
    /// Card event streams by reader
    cards: Vec<(String, CardEventReceiver)>,
    /// Readers reported by this plugin and not removed since
    known: BTreeSet<String>,
}

impl PluginWatcher {
    /// Process every event already queued, without blocking
    fn drain(&mut self) {
        while let Ok(event) = self.readers.try_recv() {
            self.on_reader_event(event);
        }

        let mut index = 0;
        while index < self.cards.len() {
            let reader = self.cards[index].0.clone();
            let events: Vec<CardEvent> = self.cards[index].1.try_iter().collect();
            for event in events {
                self.on_card_event(&reader, event);
            }
            index += 1;
        }
    }

    fn run(&mut self, stopped: &Receiver<()>) {
        debug!("Monitoring plugin {}", self.plugin);

        loop {
            let next = {
                let mut select = Select::new();
                let stop_index = select.recv(stopped);
                let reader_index = select.recv(&self.readers);
                for (_, cards) in &self.cards {
                    select.recv(cards);
                }

                let operation = select.select();
                let index = operation.index();
                if index == stop_index {
                    let _ = operation.recv(stopped);
                    Next::Stop
                } else if index == reader_index {
                    Next::Reader(operation.recv(&self.readers))
                } else {
                    let card = index - reader_index - 1;
                    Next::Card(card, operation.recv(&self.cards[card].1))
                }
            };

            match next {
                Next::Stop => break,
                Next::Reader(Ok(event)) => self.on_reader_event(event),
                Next::Reader(Err(_)) => {
                    warn!(
                        "Reader event stream of plugin {} closed, dropping its readers",
                        self.plugin
                    );
                    self.forget_readers();
                    break;
                }
                Next::Card(index, Ok(event)) => {
                    let reader = self.cards[index].0.clone();
                    self.on_card_event(&reader, event);
                }
                Next::Card(index, Err(_)) => {
                    let (reader, _) = self.cards.remove(index);
                    debug!("Card event stream of {} closed", reader);
                }
            }
        }
    }

    fn on_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::Added { reader, card } => {
                let descriptor = match ReaderDescriptor::from_status(&self.plugin, &reader, card) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        warn!("Skipping reader {}: {}", reader, e);
                        return;
                    }
                };
                if let Err(e) = self.set_up(&descriptor) {
                    warn!(
                        "Reader setup failed, skipping [plugin={}, reader={}]: {}",
                        self.plugin, reader, e
                    );
                    return;
                }
                info!("Reader connected [plugin={}, reader={}]", self.plugin, reader);
                self.known.insert(reader.clone());
                self.registry.reader_added(descriptor);
                self.watch_cards(&reader);
            }
            ReaderEvent::Removed(reader) => {
                info!(
                    "Removing disconnected reader and all associated card resources [plugin={}, reader={}]",
                    self.plugin, reader
                );
                self.known.remove(&reader);
                self.cards.retain(|(name, _)| *name != reader);
                self.registry.reader_removed(&self.key(&reader));
            }
        }
    }

    /// Run the plugin's reader setup, for readers some profile may use
    fn set_up(&self, reader: &ReaderDescriptor) -> Result<(), DriverError> {
        match &self.configurator {
            Some(configurator) if self.registry.is_wanted(reader) => {
                debug!("Setting up reader {}", reader.name());
                configurator.setup_reader(reader)
            }
            _ => Ok(()),
        }
    }

    fn key(&self, reader: &str) -> ReaderKey {
        ReaderKey::new(&self.plugin, reader)
    }

    fn watch_cards(&mut self, reader: &str) {
        self.cards.retain(|(name, _)| name != reader);
        match self.driver.observe_card_events(&self.plugin, reader) {
            Ok(events) => self.cards.push((reader.to_string(), events)),
            Err(e) => warn!("Card monitoring unavailable for {}: {}", reader, e),
        }
    }

    fn on_card_event(&self, reader: &str, event: CardEvent) {
        if event.reader() != reader {
            debug!(
                "Card event of {} received on the stream of {}",
                event.reader(),
                reader
            );
        }
        let key = self.key(reader);
        match event {
            CardEvent::Inserted { atr, .. } => {
                debug!("Card inserted in {}, ATR {}", key, hex::encode_upper(&atr));
                self.registry.card_inserted(&key, atr);
            }
            CardEvent::Removed { .. } => {
                debug!("Card removed from {}", key);
                self.registry.card_removed(&key);
            }
        }
    }

    fn forget_readers(&mut self) {
        self.cards.clear();
        for reader in std::mem::take(&mut self.known) {
            self.registry.reader_removed(&self.key(&reader));
        }
    }
}
