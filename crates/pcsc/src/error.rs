//! Error types for the PC/SC driver

use nexum_card_resource::DriverError;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// The driver only exposes one plugin
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Card answered with a status word the selection step does not accept
    #[error("Selection rejected by card in {reader}: status {status:04X}")]
    Rejected {
        /// Reader name
        reader: String,
        /// Status word
        status: u16,
    },

    /// Response shorter than a status word
    #[error("Truncated response from {0}")]
    TruncatedResponse(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<PcscError> for DriverError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::PluginNotFound(plugin) => Self::PluginNotFound(plugin),
            PcscError::ReaderNotFound(reader) => Self::ReaderNotFound(reader),
            PcscError::NoCard(reader) => Self::NoCard(reader),
            PcscError::Rejected { reader, status } => Self::SelectionRejected { reader, status },
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        assert_eq!(
            DriverError::from(PcscError::NoCard("R1".into())),
            DriverError::NoCard("R1".into())
        );
        assert_eq!(
            DriverError::from(PcscError::Rejected {
                reader: "R1".into(),
                status: 0x6A82
            }),
            DriverError::SelectionRejected {
                reader: "R1".into(),
                status: 0x6A82
            }
        );
        assert_eq!(
            DriverError::from(PcscError::Pcsc(pcsc::Error::NoService)),
            DriverError::Other(PcscError::Pcsc(pcsc::Error::NoService).to_string())
        );
    }
}
