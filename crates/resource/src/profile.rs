//! Selection profiles and the profile matcher
//!
//! A profile describes which readers may serve a request: plugin and reader
//! name filters, whether a card must be present, which ATR it must have, and
//! the selection steps to run before the reader is handed out.
//! [`matches`] decides from a [`ReaderDescriptor`] alone and never touches
//! hardware.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;
use crate::error::ConfigError;
use crate::pool::AllocationStrategy;
use crate::reader::ReaderDescriptor;

/// Status word of a successful command
pub const SW_SUCCESS: u16 = 0x9000;

/// Longest application identifier ISO 7816-4 allows
pub const MAX_AID_LEN: usize = 16;

/// Declared form of a [`Filter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    /// Match the whole value literally
    Exact(String),
    /// Match the whole value against a regular expression
    Regex(String),
}

impl FilterSpec {
    /// Pattern text as declared
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(pattern) | Self::Regex(pattern) => pattern,
        }
    }

    /// Compile into a [`Filter`]
    pub fn compile(&self) -> Result<Filter, regex::Error> {
        match self {
            Self::Exact(value) => Ok(Filter::Exact(value.clone())),
            Self::Regex(pattern) => Filter::regex(pattern),
        }
    }
}

/// Compiled filter applied to reader names, plugin names and ATRs
///
/// Regular expressions must match the whole value. ATRs are matched in
/// uppercase hexadecimal form.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Literal comparison
    Exact(String),
    /// Anchored regular expression
    Regex {
        /// Pattern as declared
        pattern: String,
        /// Compiled, anchored expression
        regex: Regex,
    },
}

impl Filter {
    /// Literal filter
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    /// Regular expression filter, anchored at both ends
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self::Regex {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Check a value against the filter
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::Regex { regex, .. } => regex.is_match(value),
        }
    }

    /// Pattern text as declared
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(pattern) | Self::Regex { pattern, .. } => pattern,
        }
    }
}

/// Whether a profile needs a card in the reader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardPresence {
    /// The card is ignored, only the reader matters
    None,
    /// A card may be present; if it is, its ATR must match
    Optional,
    /// A card with a matching ATR must be present
    #[default]
    Required,
}

/// Command sent to the card before the reader is handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionStep {
    /// Command APDU
    #[serde(with = "hex::serde")]
    pub command: Vec<u8>,

    /// Status words accepted as success
    #[serde(default = "default_accepted_status")]
    pub accepted_status: Vec<u16>,
}

fn default_accepted_status() -> Vec<u16> {
    vec![SW_SUCCESS]
}

impl SelectionStep {
    /// Step sending a raw command, accepting only `9000`
    pub fn new(command: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            accepted_status: default_accepted_status(),
        }
    }

    /// SELECT by application identifier (first or only occurrence)
    ///
    /// The AID may be partial but must hold 1 to [`MAX_AID_LEN`] bytes.
    pub fn select_aid(aid: &[u8]) -> Result<Self, ConfigError> {
        let length = match u8::try_from(aid.len()) {
            Ok(length) if (1..=MAX_AID_LEN).contains(&aid.len()) => length,
            _ => return Err(ConfigError::InvalidAid(aid.len())),
        };

        let mut command = Vec::with_capacity(aid.len() + 6);
        command.extend_from_slice(&[0x00, 0xA4, 0x04, 0x00]);
        command.push(length);
        command.extend_from_slice(aid);
        command.push(0x00);
        Ok(Self::new(command))
    }

    /// Accept an additional status word
    pub fn with_accepted_status(mut self, status: u16) -> Self {
        if !self.accepted_status.contains(&status) {
            self.accepted_status.push(status);
        }
        self
    }

    /// Whether a status word counts as success for this step
    pub fn accepts(&self, status: u16) -> bool {
        self.accepted_status.contains(&status)
    }
}

/// Compiled selection profile, immutable once the service is started
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    plugin: Option<Filter>,
    reader: Option<Filter>,
    atr: Option<Filter>,
    card_presence: CardPresence,
    selection: Vec<SelectionStep>,
    strategy: AllocationStrategy,
    reader_group: Option<String>,
}

impl Profile {
    /// Compile a declared profile
    pub fn compile(config: &ProfileConfig) -> Result<Self, ConfigError> {
        let compile = |spec: &Option<FilterSpec>| -> Result<Option<Filter>, ConfigError> {
            spec.as_ref()
                .map(|spec| {
                    spec.compile().map_err(|e| ConfigError::InvalidPattern {
                        profile: config.name.clone(),
                        pattern: spec.pattern().to_string(),
                        reason: e.to_string(),
                    })
                })
                .transpose()
        };

        Ok(Self {
            name: config.name.clone(),
            plugin: compile(&config.plugin)?,
            reader: compile(&config.reader)?,
            atr: compile(&config.atr)?,
            card_presence: config.card_presence,
            selection: config.selection.clone(),
            strategy: config.strategy,
            reader_group: config.reader_group.clone(),
        })
    }

    /// Get the profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the plugin filter
    pub const fn plugin_filter(&self) -> Option<&Filter> {
        self.plugin.as_ref()
    }

    /// Get the card presence requirement
    pub const fn card_presence(&self) -> CardPresence {
        self.card_presence
    }

    /// Get the selection steps
    pub fn selection(&self) -> &[SelectionStep] {
        &self.selection
    }

    /// Get the allocation strategy
    pub const fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Reader group requested from pool plugins
    pub fn reader_group(&self) -> Option<&str> {
        self.reader_group.as_deref()
    }

    /// Whether readers of this plugin may serve the profile
    pub fn accepts_plugin(&self, plugin: &str) -> bool {
        self.plugin.as_ref().is_none_or(|filter| filter.is_match(plugin))
    }

    /// Whether the reader passes the plugin and reader name filters, card
    /// aside
    pub fn accepts_reader(&self, reader: &ReaderDescriptor) -> bool {
        self.accepts_plugin(reader.plugin())
            && self
                .reader
                .as_ref()
                .is_none_or(|filter| filter.is_match(reader.name()))
    }
}

/// Data extracted from a reader that matched a profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileMatch {
    /// ATR of the card, unless the profile ignores cards
    pub power_on_data: Option<Vec<u8>>,
}

/// Decide whether a reader satisfies a profile
pub fn matches(reader: &ReaderDescriptor, profile: &Profile) -> Option<ProfileMatch> {
    if !profile.accepts_reader(reader) {
        return None;
    }

    let atr_matches = |atr: &[u8]| {
        profile
            .atr
            .as_ref()
            .is_none_or(|filter| filter.is_match(&hex::encode_upper(atr)))
    };

    match (profile.card_presence, reader.atr()) {
        (CardPresence::None, _) | (CardPresence::Optional, None) => Some(ProfileMatch::default()),
        (CardPresence::Required, None) => None,
        (_, Some(atr)) => atr_matches(atr).then(|| ProfileMatch {
            power_on_data: Some(atr.to_vec()),
        }),
    }
}
