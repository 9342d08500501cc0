//! Configuration options for the card resource service

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::AllocationStrategy;
use crate::profile::{CardPresence, FilterSpec, Profile, SelectionStep};

/// Declaration of one card resource profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Unique profile name clients allocate by
    pub name: String,

    /// Plugins whose readers may serve the profile (all when unset)
    #[serde(default)]
    pub plugin: Option<FilterSpec>,

    /// Reader name filter
    #[serde(default)]
    pub reader: Option<FilterSpec>,

    /// ATR filter, applied to the uppercase hex form of the ATR
    #[serde(default)]
    pub atr: Option<FilterSpec>,

    /// Card presence requirement
    #[serde(default)]
    pub card_presence: CardPresence,

    /// Steps run on the card before it is handed out
    #[serde(default)]
    pub selection: Vec<SelectionStep>,

    /// Allocation strategy of the pool
    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Reader group requested from pool plugins
    #[serde(default)]
    pub reader_group: Option<String>,
}

impl ProfileConfig {
    /// Create a profile accepting any reader with a card
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: None,
            reader: None,
            atr: None,
            card_presence: CardPresence::default(),
            selection: Vec::new(),
            strategy: AllocationStrategy::default(),
            reader_group: None,
        }
    }

    /// Set the plugin filter
    pub fn with_plugin(mut self, filter: FilterSpec) -> Self {
        self.plugin = Some(filter);
        self
    }

    /// Set the reader name filter
    pub fn with_reader(mut self, filter: FilterSpec) -> Self {
        self.reader = Some(filter);
        self
    }

    /// Set the ATR filter
    pub fn with_atr(mut self, filter: FilterSpec) -> Self {
        self.atr = Some(filter);
        self
    }

    /// Set the card presence requirement
    pub const fn with_card_presence(mut self, presence: CardPresence) -> Self {
        self.card_presence = presence;
        self
    }

    /// Append a selection step
    pub fn with_selection_step(mut self, step: SelectionStep) -> Self {
        self.selection.push(step);
        self
    }

    /// Set the allocation strategy
    pub const fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the reader group requested from pool plugins
    pub fn with_reader_group(mut self, group: impl Into<String>) -> Self {
        self.reader_group = Some(group.into());
        self
    }
}

/// Configuration of the card resource service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Profiles, in declaration order
    #[serde(default, rename = "profile")]
    pub profiles: Vec<ProfileConfig>,

    /// Wait used by `allocate_default`, in milliseconds
    #[serde(default)]
    pub allocation_timeout_ms: u64,

    /// Lease duration after which an allocation may be reclaimed, in
    /// milliseconds
    #[serde(default)]
    pub usage_timeout_ms: Option<u64>,

    /// Ask pool plugins before the monitored readers
    #[serde(default)]
    pub pool_first: bool,
}

impl ServiceConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a profile
    pub fn with_profile(mut self, profile: ProfileConfig) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Set the wait used by `allocate_default`
    pub fn with_allocation_timeout(mut self, timeout: Duration) -> Self {
        self.allocation_timeout_ms = millis(timeout);
        self
    }

    /// Reclaim allocations held longer than `timeout`
    pub fn with_usage_timeout(mut self, timeout: Duration) -> Self {
        self.usage_timeout_ms = Some(millis(timeout));
        self
    }

    /// Ask pool plugins before the monitored readers
    pub const fn with_pool_first(mut self, pool_first: bool) -> Self {
        self.pool_first = pool_first;
        self
    }

    /// Wait used by `allocate_default`
    pub const fn allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation_timeout_ms)
    }

    /// Lease duration, if leases expire
    pub fn usage_timeout(&self) -> Option<Duration> {
        self.usage_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the profiles against the registered plugins, pool plugins
    /// included, and compile them
    pub fn compile(&self, plugins: &[String]) -> Result<Vec<Profile>, ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfile);
        }

        let mut names = HashSet::with_capacity(self.profiles.len());
        let mut profiles = Vec::with_capacity(self.profiles.len());

        for config in &self.profiles {
            if config.name.is_empty() {
                return Err(ConfigError::EmptyProfileName);
            }
            if !names.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateProfile(config.name.clone()));
            }

            let profile = Profile::compile(config)?;
            if !plugins.iter().any(|plugin| profile.accepts_plugin(plugin)) {
                return Err(ConfigError::UnknownPlugin {
                    profile: config.name.clone(),
                    plugin: config
                        .plugin
                        .as_ref()
                        .map_or_else(|| "*".to_string(), |spec| spec.pattern().to_string()),
                });
            }
            profiles.push(profile);
        }

        Ok(profiles)
    }
}

/// Whole milliseconds of a duration, saturating
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
