//! Error types for the card resource service

/// Result type for card resource operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for card resource operations
///
/// An allocation that runs out of time is not an error: `allocate` reports it
/// as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration was rejected at start
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// No profile with this name is configured
    #[error("Unknown card resource profile: {0}")]
    UnknownProfile(String),

    /// The service has not been started yet
    #[error("Card resource service not started")]
    NotStarted,

    /// The service was started already
    #[error("Card resource service already started")]
    AlreadyStarted,

    /// The service was stopped and cannot be used anymore
    #[error("Card resource service stopped")]
    Stopped,

    /// The resource was not issued by this service
    #[error("Unknown card resource token")]
    UnknownToken,

    /// The resource was released already
    #[error("Card resource already released")]
    AlreadyReleased,

    /// Driver-layer failure surfaced to the caller
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Configuration errors detected by `start`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No profile was declared
    #[error("No card resource profile configured")]
    NoProfile,

    /// A profile name is empty
    #[error("Card resource profile name must not be empty")]
    EmptyProfileName,

    /// Two profiles share the same name
    #[error("Duplicate card resource profile name: {0}")]
    DuplicateProfile(String),

    /// A profile targets plugins that are not registered
    #[error("Profile {profile} references an unregistered plugin: {plugin}")]
    UnknownPlugin {
        /// Profile name
        profile: String,
        /// Plugin filter as declared
        plugin: String,
    },

    /// An application identifier is empty or longer than 16 bytes
    #[error("Invalid AID length: {0} bytes")]
    InvalidAid(usize),

    /// A filter pattern is not a valid regular expression
    #[error("Invalid pattern {pattern:?} in profile {profile}: {reason}")]
    InvalidPattern {
        /// Profile name
        profile: String,
        /// Offending pattern
        pattern: String,
        /// Compiler message
        reason: String,
    },
}

/// Errors reported by the driver layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Plugin not known to the driver
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Reader not known to the driver
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// A selection step was answered with an unexpected status word
    #[error("Selection rejected by card in {reader}: status {status:04X}")]
    SelectionRejected {
        /// Reader name
        reader: String,
        /// Status word returned by the card
        status: u16,
    },

    /// The event stream has ended and cannot be restarted
    #[error("Event stream closed: {0}")]
    StreamClosed(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}
