//! Reader descriptors as seen by the profile matcher

use std::fmt;

use crate::driver::CardStatus;
use crate::error::DriverError;

/// Identity of a reader: reader names are only unique within a plugin
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ReaderKey {
    pub(crate) plugin: String,
    pub(crate) name: String,
}

impl ReaderKey {
    pub(crate) fn new(plugin: &str, name: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ReaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.name)
    }
}

/// Identity and card state of a reader exposed by a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderDescriptor {
    /// Name of the plugin exposing the reader
    plugin: String,

    /// Name of the reader
    name: String,

    /// Answer To Reset of the card (if present)
    atr: Option<Vec<u8>>,
}

impl ReaderDescriptor {
    /// Create a new descriptor
    pub fn new(plugin: impl Into<String>, name: impl Into<String>, atr: Option<Vec<u8>>) -> Self {
        Self {
            plugin: plugin.into(),
            name: name.into(),
            atr,
        }
    }

    /// Build a descriptor from the card state reported with a new reader
    pub fn from_status(plugin: &str, name: &str, card: CardStatus) -> Result<Self, DriverError> {
        if name.is_empty() {
            return Err(DriverError::Other(format!(
                "Reader without a name reported by plugin {plugin}"
            )));
        }

        let atr = match card {
            CardStatus::Absent => None,
            CardStatus::Present { atr } if atr.is_empty() => {
                return Err(DriverError::Other(format!("Empty ATR reported by {name}")));
            }
            CardStatus::Present { atr } => Some(atr),
            CardStatus::Unreadable(reason) => {
                return Err(DriverError::Other(format!(
                    "Unable to read state of {name}: {reason}"
                )));
            }
        };

        Ok(Self::new(plugin, name, atr))
    }

    /// Get the plugin name
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Get the reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> ReaderKey {
        ReaderKey::new(&self.plugin, &self.name)
    }

    /// Check if a card is present in the reader
    pub const fn has_card(&self) -> bool {
        self.atr.is_some()
    }

    /// Get the ATR of the card if present
    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    /// Same reader holding a card with the given ATR
    pub(crate) fn with_card(&self, atr: Vec<u8>) -> Self {
        Self {
            atr: Some(atr),
            ..self.clone()
        }
    }

    /// Same reader without a card
    pub(crate) fn without_card(&self) -> Self {
        Self {
            atr: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_from_status_present() {
        let atr = hex!("3B8F8001804F0CA000000306030001000000006A").to_vec();
        let reader = ReaderDescriptor::from_status(
            "pcsc",
            "ACS ACR122U",
            CardStatus::Present { atr: atr.clone() },
        )
        .unwrap();

        assert_eq!(reader.plugin(), "pcsc");
        assert_eq!(reader.name(), "ACS ACR122U");
        assert!(reader.has_card());
        assert_eq!(reader.atr(), Some(atr.as_slice()));
    }

    #[test]
    fn test_from_status_rejects_malformed() {
        assert!(ReaderDescriptor::from_status("pcsc", "", CardStatus::Absent).is_err());
        assert!(
            ReaderDescriptor::from_status("pcsc", "R1", CardStatus::Present { atr: Vec::new() })
                .is_err()
        );
        assert!(
            ReaderDescriptor::from_status("pcsc", "R1", CardStatus::Unreadable("busy".into()))
                .is_err()
        );
    }

    #[test]
    fn test_card_transitions() {
        let reader = ReaderDescriptor::new("pcsc", "R1", None);
        assert!(!reader.has_card());

        let inserted = reader.with_card(vec![0x3B, 0x00]);
        assert_eq!(inserted.atr(), Some(&[0x3B, 0x00][..]));
        assert_eq!(inserted.without_card(), reader);
    }

    #[test]
    fn test_key_includes_plugin() {
        let first = ReaderDescriptor::new("P1", "Reader", None);
        let second = ReaderDescriptor::new("P2", "Reader", None);
        assert_ne!(first.key(), second.key());
        assert_eq!(first.key(), ReaderKey::new("P1", "Reader"));
        assert_eq!(first.key().to_string(), "P1/Reader");
    }
}
