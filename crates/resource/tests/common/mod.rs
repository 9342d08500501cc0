//! Common test utilities
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use nexum_card_resource::{
    CardDriver, CardEvent, CardEventReceiver, CardEventSender, CardResourceService, CardStatus,
    DriverError, PoolReader, ReaderEvent, ReaderEventReceiver, ReaderEventSender, SW_SUCCESS,
    SelectionStep, card_event_channel, reader_event_channel,
};

/// ATR of the cards the tests insert
pub const ATR: [u8; 12] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06,
];

/// ATR that profiles filtering on [`ATR`] do not accept
pub const OTHER_ATR: [u8; 4] = [0x3B, 0x02, 0x14, 0x50];

#[derive(Debug, Clone)]
struct MockReader {
    plugin: String,
    card: Option<Vec<u8>>,
    unreadable: bool,
}

impl MockReader {
    fn status(&self) -> CardStatus {
        if self.unreadable {
            return CardStatus::Unreadable("card mute".to_string());
        }
        match &self.card {
            Some(atr) => CardStatus::Present { atr: atr.clone() },
            None => CardStatus::Absent,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    plugin: String,
    group: String,
    name: String,
    card: Option<Vec<u8>>,
    lent: bool,
}

type Key = (String, String);

fn key(plugin: &str, reader: &str) -> Key {
    (plugin.to_string(), reader.to_string())
}

#[derive(Debug, Default)]
struct MockState {
    plugins: Vec<String>,
    failing: HashSet<String>,
    readers: BTreeMap<Key, MockReader>,
    reader_subscribers: HashMap<String, Vec<ReaderEventSender>>,
    card_subscribers: HashMap<Key, Vec<CardEventSender>>,
    selection_status: HashMap<Key, u16>,
    selections: Vec<String>,
    pool_plugins: Vec<String>,
    pool_readers: Vec<PoolEntry>,
    monitoring_stops: usize,
}

impl MockState {
    fn card(&self, plugin: &str, reader: &str) -> Result<Option<Vec<u8>>, DriverError> {
        if let Some(mock) = self.readers.get(&key(plugin, reader)) {
            return Ok(mock.card.clone());
        }
        self.pool_readers
            .iter()
            .find(|entry| entry.plugin == plugin && entry.name == reader && entry.lent)
            .map(|entry| entry.card.clone())
            .ok_or_else(|| DriverError::ReaderNotFound(reader.to_string()))
    }

    fn notify_card(&mut self, plugin: &str, reader: &str, event: CardEvent) {
        if let Some(subscribers) = self.card_subscribers.get_mut(&key(plugin, reader)) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// In-memory driver whose readers and cards are driven by the test
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Driver exposing the given plugins and no reader
    pub fn new(plugins: &[&str]) -> Self {
        let driver = Self::default();
        driver.state.lock().plugins = plugins.iter().map(|p| p.to_string()).collect();
        driver
    }

    /// Make subscribing to the plugin's reader events fail
    pub fn fail_plugin(&self, plugin: &str) {
        self.state.lock().failing.insert(plugin.to_string());
    }

    /// Connect a reader, with a card when `atr` is set
    pub fn connect_reader(&self, plugin: &str, reader: &str, atr: Option<&[u8]>) {
        self.connect(
            reader,
            MockReader {
                plugin: plugin.to_string(),
                card: atr.map(<[u8]>::to_vec),
                unreadable: false,
            },
        );
    }

    /// Connect a reader whose card cannot be read
    pub fn connect_unreadable_reader(&self, plugin: &str, reader: &str) {
        self.connect(
            reader,
            MockReader {
                plugin: plugin.to_string(),
                card: None,
                unreadable: true,
            },
        );
    }

    fn connect(&self, reader: &str, mock: MockReader) {
        let mut state = self.state.lock();
        let event = ReaderEvent::Added {
            reader: reader.to_string(),
            card: mock.status(),
        };
        if let Some(subscribers) = state.reader_subscribers.get_mut(&mock.plugin) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        state.readers.insert(key(&mock.plugin, reader), mock);
    }

    /// Disconnect a reader, closing its card event streams
    pub fn disconnect_reader(&self, plugin: &str, reader: &str) {
        let mut state = self.state.lock();
        if state.readers.remove(&key(plugin, reader)).is_none() {
            return;
        }
        state.card_subscribers.remove(&key(plugin, reader));
        if let Some(subscribers) = state.reader_subscribers.get_mut(plugin) {
            subscribers.retain(|tx| tx.send(ReaderEvent::Removed(reader.to_string())).is_ok());
        }
    }

    /// Insert a card into a connected reader
    pub fn insert_card(&self, plugin: &str, reader: &str, atr: &[u8]) {
        let mut state = self.state.lock();
        if let Some(mock) = state.readers.get_mut(&key(plugin, reader)) {
            mock.card = Some(atr.to_vec());
        }
        let event = CardEvent::Inserted {
            reader: reader.to_string(),
            atr: atr.to_vec(),
        };
        state.notify_card(plugin, reader, event);
    }

    /// Remove the card from a reader
    pub fn remove_card(&self, plugin: &str, reader: &str) {
        let mut state = self.state.lock();
        if let Some(mock) = state.readers.get_mut(&key(plugin, reader)) {
            mock.card = None;
        }
        let event = CardEvent::Removed {
            reader: reader.to_string(),
        };
        state.notify_card(plugin, reader, event);
    }

    /// End the reader event streams of a plugin
    pub fn close_plugin(&self, plugin: &str) {
        self.state.lock().reader_subscribers.remove(plugin);
    }

    /// Status word the card in `reader` answers every command with
    pub fn set_selection_status(&self, plugin: &str, reader: &str, status: u16) {
        self.state
            .lock()
            .selection_status
            .insert(key(plugin, reader), status);
    }

    /// Readers selection ran on, in order
    pub fn selections(&self) -> Vec<String> {
        self.state.lock().selections.clone()
    }

    /// Register a pool plugin lending readers by group
    pub fn add_pool_plugin(&self, plugin: &str) {
        self.state.lock().pool_plugins.push(plugin.to_string());
    }

    /// Make a reader of `group` available from a pool plugin
    pub fn add_pool_reader(&self, plugin: &str, group: &str, reader: &str, atr: Option<&[u8]>) {
        self.state.lock().pool_readers.push(PoolEntry {
            plugin: plugin.to_string(),
            group: group.to_string(),
            name: reader.to_string(),
            card: atr.map(<[u8]>::to_vec),
            lent: false,
        });
    }

    /// Pool plugin readers currently lent
    pub fn lent_readers(&self) -> Vec<String> {
        self.state
            .lock()
            .pool_readers
            .iter()
            .filter(|entry| entry.lent)
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of times the service asked the driver to stop monitoring
    pub fn monitoring_stops(&self) -> usize {
        self.state.lock().monitoring_stops
    }
}

impl CardDriver for MockDriver {
    fn list_plugins(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state.lock().plugins.clone())
    }

    fn observe_reader_events(&self, plugin: &str) -> Result<ReaderEventReceiver, DriverError> {
        let mut state = self.state.lock();
        if state.failing.contains(plugin) || !state.plugins.iter().any(|p| p == plugin) {
            return Err(DriverError::PluginNotFound(plugin.to_string()));
        }

        let (tx, rx) = reader_event_channel();
        for ((_, name), mock) in state.readers.iter().filter(|(_, m)| m.plugin == plugin) {
            let _ = tx.send(ReaderEvent::Added {
                reader: name.clone(),
                card: mock.status(),
            });
        }
        state
            .reader_subscribers
            .entry(plugin.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn observe_card_events(
        &self,
        plugin: &str,
        reader: &str,
    ) -> Result<CardEventReceiver, DriverError> {
        let mut state = self.state.lock();
        if !state.readers.contains_key(&key(plugin, reader)) {
            return Err(DriverError::ReaderNotFound(reader.to_string()));
        }

        let (tx, rx) = card_event_channel();
        state
            .card_subscribers
            .entry(key(plugin, reader))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn execute_selection(
        &self,
        plugin: &str,
        reader: &str,
        steps: &[SelectionStep],
    ) -> Result<Vec<Vec<u8>>, DriverError> {
        let mut state = self.state.lock();
        if state.card(plugin, reader)?.is_none() {
            return Err(DriverError::NoCard(reader.to_string()));
        }

        let status = state
            .selection_status
            .get(&key(plugin, reader))
            .copied()
            .unwrap_or(SW_SUCCESS);
        state.selections.push(reader.to_string());

        let mut responses = Vec::with_capacity(steps.len());
        for step in steps {
            if !step.accepts(status) {
                return Err(DriverError::SelectionRejected {
                    reader: reader.to_string(),
                    status,
                });
            }
            responses.push(status.to_be_bytes().to_vec());
        }
        Ok(responses)
    }

    fn stop_monitoring(&self) {
        let mut state = self.state.lock();
        state.monitoring_stops += 1;
        state.reader_subscribers.clear();
        state.card_subscribers.clear();
    }

    fn list_pool_plugins(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state.lock().pool_plugins.clone())
    }

    fn allocate_pool_reader(
        &self,
        plugin: &str,
        group: Option<&str>,
    ) -> Result<Option<PoolReader>, DriverError> {
        let mut state = self.state.lock();
        if !state.pool_plugins.iter().any(|p| p == plugin) {
            return Err(DriverError::PluginNotFound(plugin.to_string()));
        }
        let Some(entry) = state.pool_readers.iter_mut().find(|entry| {
            entry.plugin == plugin && !entry.lent && group.is_none_or(|g| g == entry.group)
        }) else {
            return Ok(None);
        };

        entry.lent = true;
        Ok(Some(PoolReader {
            name: entry.name.clone(),
            card: match &entry.card {
                Some(atr) => CardStatus::Present { atr: atr.clone() },
                None => CardStatus::Absent,
            },
        }))
    }

    fn release_pool_reader(&self, plugin: &str, reader: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let entry = state
            .pool_readers
            .iter_mut()
            .find(|entry| entry.plugin == plugin && entry.name == reader && entry.lent)
            .ok_or_else(|| DriverError::ReaderNotFound(reader.to_string()))?;
        entry.lent = false;
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Number of live resources in a profile's pool
pub fn pool_size(service: &CardResourceService, profile: &str) -> usize {
    service
        .status()
        .map(|status| {
            status
                .pools
                .iter()
                .find(|pool| pool.profile == profile)
                .map_or(0, |pool| pool.resources.len())
        })
        .unwrap_or(0)
}
