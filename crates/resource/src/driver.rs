//! Boundary with the reader driver layer
//!
//! The service never talks to hardware itself. A [`CardDriver`] lists the
//! plugins, hands out event streams for readers and cards, and runs selection
//! steps on demand. Event streams are `crossbeam-channel` receivers: the
//! monitor blocks on them, it never polls.

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::DriverError;
use crate::profile::SelectionStep;
use crate::reader::ReaderDescriptor;

/// Card state reported together with a new reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardStatus {
    /// No card in the reader
    Absent,
    /// A card is present
    Present {
        /// ATR of the card
        atr: Vec<u8>,
    },
    /// The driver could not read the reader state
    Unreadable(String),
}

/// Events related to reader connection/disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Reader was connected to the plugin
    Added {
        /// Reader name
        reader: String,
        /// Card state at the time the reader was seen
        card: CardStatus,
    },
    /// Reader was disconnected from the plugin
    Removed(String),
}

/// Events related to card insertion/removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// Card was inserted into a reader
    Inserted {
        /// Reader name
        reader: String,
        /// ATR of the inserted card
        atr: Vec<u8>,
    },
    /// Card was removed from a reader
    Removed {
        /// Reader name
        reader: String,
    },
}

impl CardEvent {
    /// Name of the reader the event belongs to
    pub fn reader(&self) -> &str {
        match self {
            Self::Inserted { reader, .. } | Self::Removed { reader } => reader,
        }
    }
}

/// Reader lent by a pool plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReader {
    /// Reader name
    pub name: String,
    /// Card state at the time the reader was lent
    pub card: CardStatus,
}

/// Sender for reader events
pub type ReaderEventSender = Sender<ReaderEvent>;
/// Receiver for reader events
pub type ReaderEventReceiver = Receiver<ReaderEvent>;

/// Sender for card events
pub type CardEventSender = Sender<CardEvent>;
/// Receiver for card events
pub type CardEventReceiver = Receiver<CardEvent>;

/// Create an unbounded channel for reader events
pub fn reader_event_channel() -> (ReaderEventSender, ReaderEventReceiver) {
    unbounded()
}

/// Create an unbounded channel for card events
pub fn card_event_channel() -> (CardEventSender, CardEventReceiver) {
    unbounded()
}

/// Driver layer consumed by the service
///
/// Reader event streams must start by replaying every reader already
/// connected as [`ReaderEvent::Added`]. A stream that is disconnected is
/// considered finished for good. Readers are addressed by plugin and name:
/// two plugins may expose readers with the same name.
///
/// Pool plugins do not report readers; they lend one on request from a
/// reader group and take it back on release. A driver without pool plugins
/// keeps the default implementations.
pub trait CardDriver: Send + Sync {
    /// Names of the registered plugins
    fn list_plugins(&self) -> Result<Vec<String>, DriverError>;

    /// Subscribe to reader connection events of a plugin
    fn observe_reader_events(&self, plugin: &str) -> Result<ReaderEventReceiver, DriverError>;

    /// Subscribe to card insertion events of a reader
    fn observe_card_events(
        &self,
        plugin: &str,
        reader: &str,
    ) -> Result<CardEventReceiver, DriverError>;

    /// Run selection steps against the card in a reader, returning one
    /// response per step
    fn execute_selection(
        &self,
        plugin: &str,
        reader: &str,
        steps: &[SelectionStep],
    ) -> Result<Vec<Vec<u8>>, DriverError>;

    /// End the background work behind every stream handed out so far
    fn stop_monitoring(&self) {}

    /// Names of the registered pool plugins
    fn list_pool_plugins(&self) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }

    /// Borrow a reader of `group` from a pool plugin, `Ok(None)` when the
    /// pool has none left
    fn allocate_pool_reader(
        &self,
        plugin: &str,
        _group: Option<&str>,
    ) -> Result<Option<PoolReader>, DriverError> {
        Err(DriverError::PluginNotFound(plugin.to_string()))
    }

    /// Give a borrowed reader back to its pool plugin
    fn release_pool_reader(&self, plugin: &str, _reader: &str) -> Result<(), DriverError> {
        Err(DriverError::PluginNotFound(plugin.to_string()))
    }
}

/// Prepares the readers of one plugin before they are offered to the pools
///
/// A reader whose setup fails is left out until it is reported again.
pub trait ReaderConfigurator: Send + Sync {
    /// Configure a newly reported reader
    fn setup_reader(&self, reader: &ReaderDescriptor) -> Result<(), DriverError>;
}

impl<F> ReaderConfigurator for F
where
    F: Fn(&ReaderDescriptor) -> Result<(), DriverError> + Send + Sync,
{
    fn setup_reader(&self, reader: &ReaderDescriptor) -> Result<(), DriverError> {
        self(reader)
    }
}
