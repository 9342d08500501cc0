//! Resources and the handles given to clients

use std::fmt;

/// Identifier of one allocation, unique within a service instance
pub(crate) type LeaseId = u64;

/// Binding state of a resource inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Available for allocation
    Free,
    /// Held by exactly one client
    Allocated,
    /// Hardware is gone but a client still holds it; purged on release
    Removed,
}

/// Allocated card resource
///
/// Proof of exclusive ownership of a reader for one profile until it is
/// handed back through `release`. Releasing it twice is reported, never
/// fatal.
#[derive(Debug, PartialEq, Eq)]
pub struct CardResource {
    pub(crate) service: u64,
    pub(crate) lease: LeaseId,
    profile: String,
    plugin: String,
    reader: String,
    power_on_data: Option<Vec<u8>>,
    selection_responses: Vec<Vec<u8>>,
}

impl CardResource {
    pub(crate) const fn new(
        service: u64,
        lease: LeaseId,
        profile: String,
        plugin: String,
        reader: String,
        power_on_data: Option<Vec<u8>>,
        selection_responses: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            service,
            lease,
            profile,
            plugin,
            reader,
            power_on_data,
            selection_responses,
        }
    }

    /// Name of the profile the resource was allocated for
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Name of the plugin exposing the reader
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Name of the reader
    pub fn reader(&self) -> &str {
        &self.reader
    }

    /// ATR of the card, when the profile looks at cards
    pub fn power_on_data(&self) -> Option<&[u8]> {
        self.power_on_data.as_deref()
    }

    /// Responses to the profile's selection steps, in order
    pub fn selection_responses(&self) -> &[Vec<u8>] {
        &self.selection_responses
    }
}

impl fmt::Display for CardResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (lease {})", self.reader, self.profile, self.lease)?;
        if let Some(atr) = &self.power_on_data {
            write!(f, " ATR {}", hex::encode_upper(atr))?;
        }
        Ok(())
    }
}
