//! [`CardDriver`] implementation on top of PC/SC

use std::ffi::CString;
use std::thread;

use nexum_card_resource::{
    CardDriver, CardEventReceiver, DriverError, ReaderEventReceiver, SelectionStep,
    card_event_channel, reader_event_channel,
};
use pcsc::{Context, Disposition, MAX_BUFFER_SIZE_EXTENDED, Protocols, Scope};
use tracing::{debug, trace};

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::monitor::{
    StopSignal, added_event, list_readers, reader_state, watch_card, watch_readers,
};

/// Name of the single plugin the driver exposes
pub const PLUGIN_NAME: &str = "pcsc";

/// PC/SC card driver
///
/// Exposes the readers of the local PC/SC service as one plugin named
/// [`PLUGIN_NAME`]. The watcher threads behind the event streams run until
/// [`CardDriver::stop_monitoring`] is called or the driver is dropped.
pub struct PcscDriver {
    /// PC/SC context
    context: Context,
    config: PcscConfig,
    stop: StopSignal,
}

impl std::fmt::Debug for PcscDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscDriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscDriver {
    /// Create a driver with the default configuration
    pub fn new() -> Result<Self, PcscError> {
        Self::with_config(PcscConfig::default())
    }

    /// Create a driver with a custom configuration
    pub fn with_config(config: PcscConfig) -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self {
            context,
            config,
            stop: StopSignal::new(),
        })
    }

    /// Driver configuration
    pub const fn config(&self) -> &PcscConfig {
        &self.config
    }

    fn select(&self, reader: &str, steps: &[SelectionStep]) -> Result<Vec<Vec<u8>>, PcscError> {
        let name = CString::new(reader).map_err(|_| PcscError::ReaderNotFound(reader.to_string()))?;
        let card = match self
            .context
            .connect(&name, self.config.share_mode.into(), Protocols::ANY)
        {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard) => {
                return Err(PcscError::NoCard(reader.to_string()));
            }
            Err(pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable) => {
                return Err(PcscError::ReaderNotFound(reader.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut responses = Vec::with_capacity(steps.len());
        let mut buffer = vec![0u8; MAX_BUFFER_SIZE_EXTENDED];
        for step in steps {
            trace!("{} <= {}", reader, hex::encode_upper(&step.command));
            let response = card.transmit(&step.command, &mut buffer)?;
            trace!("{} => {}", reader, hex::encode_upper(response));

            let status = status_word(response)
                .ok_or_else(|| PcscError::TruncatedResponse(reader.to_string()))?;
            if !step.accepts(status) {
                return Err(PcscError::Rejected {
                    reader: reader.to_string(),
                    status,
                });
            }
            responses.push(response.to_vec());
        }

        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            debug!("Disconnecting from {} failed: {}", reader, e);
        }
        Ok(responses)
    }
}

impl CardDriver for PcscDriver {
    fn list_plugins(&self) -> Result<Vec<String>, DriverError> {
        Ok(vec![PLUGIN_NAME.to_string()])
    }

    fn observe_reader_events(&self, plugin: &str) -> Result<ReaderEventReceiver, DriverError> {
        if plugin != PLUGIN_NAME {
            return Err(PcscError::PluginNotFound(plugin.to_string()).into());
        }

        let (sender, receiver) = reader_event_channel();
        let known = list_readers(&self.context)?;
        for reader in &known {
            if let Some(event) = added_event(&self.context, reader) {
                let _ = sender.send(event);
            }
        }

        let context = self.context.clone();
        let interval = self.config.reader_poll();
        let stop = self.stop.subscribe();
        thread::Builder::new()
            .name("pcsc-readers".to_string())
            .spawn(move || watch_readers(context, known, sender, interval, stop))
            .map_err(|e| DriverError::Other(format!("Unable to spawn reader watch: {e}")))?;
        Ok(receiver)
    }

    fn observe_card_events(
        &self,
        plugin: &str,
        reader: &str,
    ) -> Result<CardEventReceiver, DriverError> {
        if plugin != PLUGIN_NAME {
            return Err(PcscError::PluginNotFound(plugin.to_string()).into());
        }
        // Fail early for unknown readers; the card state itself is reported
        // by the watch
        reader_state(&self.context, reader)?;
        let (sender, receiver) = card_event_channel();
        let name = reader.to_string();

        let context = self.context.clone();
        let wait = self.config.card_wait();
        let stop = self.stop.subscribe();
        thread::Builder::new()
            .name(format!("pcsc-card-{reader}"))
            .spawn(move || watch_card(context, name, sender, wait, stop))
            .map_err(|e| DriverError::Other(format!("Unable to spawn card watch: {e}")))?;
        Ok(receiver)
    }

    fn execute_selection(
        &self,
        plugin: &str,
        reader: &str,
        steps: &[SelectionStep],
    ) -> Result<Vec<Vec<u8>>, DriverError> {
        if plugin != PLUGIN_NAME {
            return Err(PcscError::PluginNotFound(plugin.to_string()).into());
        }
        Ok(self.select(reader, steps)?)
    }

    fn stop_monitoring(&self) {
        debug!("Stopping PC/SC watchers");
        self.stop.trigger();
    }
}

/// Status word closing an APDU response
pub(crate) fn status_word(response: &[u8]) -> Option<u16> {
    match response {
        [.., sw1, sw2] => Some(u16::from_be_bytes([*sw1, *sw2])),
        _ => None,
    }
}
