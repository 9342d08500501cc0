//! Background workers feeding the event streams
//!
//! Every worker checks the driver's [`StopSignal`] on each iteration and also
//! ends when its stream's receiver is gone and it has something to report.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use nexum_card_resource::{CardEventSender, CardStatus, ReaderEvent, ReaderEventSender};
use parking_lot::Mutex;
use pcsc::{Context, ReaderState, State};
use tracing::{debug, trace, warn};

use crate::error::PcscError;
use crate::reader::{CardWatch, card_status, diff_readers, is_gone};

/// Stop signal shared by the workers of one driver
///
/// Workers hold a receiver of the current channel. Triggering replaces the
/// channel, which disconnects every receiver handed out so far; workers
/// spawned afterwards use the new one. Dropping the signal stops them all.
#[derive(Debug)]
pub(crate) struct StopSignal {
    channel: Mutex<(Sender<()>, Receiver<()>)>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            channel: Mutex::new(bounded(0)),
        }
    }

    /// Receiver for a new worker
    pub(crate) fn subscribe(&self) -> Receiver<()> {
        self.channel.lock().1.clone()
    }

    /// Stop every worker subscribed so far
    pub(crate) fn trigger(&self) {
        *self.channel.lock() = bounded(0);
    }
}

fn is_stopped(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Names of the readers currently known to PC/SC
pub(crate) fn list_readers(context: &Context) -> Result<BTreeSet<String>, PcscError> {
    match context.list_readers_owned() {
        Ok(readers) => Ok(readers
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect()),
        Err(pcsc::Error::NoReadersAvailable) => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

/// Current state of a single reader
pub(crate) fn reader_state(context: &Context, reader: &str) -> Result<ReaderState, PcscError> {
    let name = CString::new(reader).map_err(|_| PcscError::ReaderNotFound(reader.to_string()))?;
    let mut states = [ReaderState::new(name, State::UNAWARE)];
    match context.get_status_change(Duration::ZERO, &mut states) {
        Ok(()) | Err(pcsc::Error::Timeout) => {}
        Err(pcsc::Error::UnknownReader) => {
            return Err(PcscError::ReaderNotFound(reader.to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    let [state] = states;
    if is_gone(&state) {
        return Err(PcscError::ReaderNotFound(reader.to_string()));
    }
    Ok(state)
}

/// Event announcing a reader, with its card state
pub(crate) fn added_event(context: &Context, reader: &str) -> Option<ReaderEvent> {
    match reader_state(context, reader) {
        Ok(state) => Some(ReaderEvent::Added {
            reader: reader.to_string(),
            card: card_status(&state),
        }),
        Err(e) => {
            debug!("Reader {} vanished before its state was read: {}", reader, e);
            None
        }
    }
}

/// Poll the reader list and report differences until stopped
pub(crate) fn watch_readers(
    context: Context,
    known: BTreeSet<String>,
    sender: ReaderEventSender,
    interval: Duration,
    stop: Receiver<()>,
) {
    poll_readers(
        known,
        &sender,
        interval,
        &stop,
        || list_readers(&context),
        |reader| added_event(&context, reader),
    );
}

fn poll_readers(
    mut known: BTreeSet<String>,
    sender: &ReaderEventSender,
    interval: Duration,
    stop: &Receiver<()>,
    mut list: impl FnMut() -> Result<BTreeSet<String>, PcscError>,
    added: impl Fn(&str) -> Option<ReaderEvent>,
) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => {
                debug!("Reader watch stopped");
                return;
            }
        }

        let current = match list() {
            Ok(current) => current,
            Err(e) => {
                warn!("Unable to list readers: {}", e);
                continue;
            }
        };

        let (appeared, removed) = diff_readers(&known, &current);
        for reader in removed {
            trace!("Reader {} disappeared", reader);
            if sender.send(ReaderEvent::Removed(reader)).is_err() {
                return;
            }
        }
        for reader in appeared {
            if let Some(event) = added(&reader) {
                if sender.send(event).is_err() {
                    return;
                }
            }
        }
        known = current;
    }
}

/// Wait for card changes in one reader until it disappears or the watch is
/// stopped
///
/// The first state observed is always sent, so the stream starts with the
/// card present at subscription time, or its absence.
pub(crate) fn watch_card(
    context: Context,
    reader: String,
    sender: CardEventSender,
    wait: Duration,
    stop: Receiver<()>,
) {
    let Ok(name) = CString::new(reader.as_str()) else {
        return;
    };
    let mut states = [ReaderState::new(name, State::UNAWARE)];
    let mut watch = CardWatch::default();
    let mut timeout = Duration::ZERO;

    loop {
        if is_stopped(&stop) {
            debug!("Card watch on {} stopped", reader);
            return;
        }

        match context.get_status_change(timeout, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => {
                timeout = wait;
                continue;
            }
            Err(e) => {
                debug!("Card watch on {} ended: {}", reader, e);
                return;
            }
        }
        timeout = wait;

        let state = &mut states[0];
        if is_gone(state) {
            debug!("Reader {} gone, card watch ended", reader);
            return;
        }

        if let Some(event) = watch.observe(&reader, present_atr(state)) {
            if sender.send(event).is_err() {
                return;
            }
        }
        state.sync_current_state();
    }
}

/// ATR of the card in the reader, if one can be talked to
fn present_atr(state: &ReaderState) -> Option<Vec<u8>> {
    match card_status(state) {
        CardStatus::Present { atr } => Some(atr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use nexum_card_resource::reader_event_channel;

    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn finished(handle: &thread::JoinHandle<()>, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if handle.is_finished() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.is_finished()
    }

    #[test]
    fn test_idle_reader_watch_ends_on_stop() {
        let signal = StopSignal::new();
        let stop = signal.subscribe();
        let (sender, receiver) = reader_event_channel();

        let handle = thread::spawn(move || {
            poll_readers(
                set(&["A"]),
                &sender,
                Duration::from_millis(10),
                &stop,
                || Ok(set(&["A", "B"])),
                |reader| {
                    Some(ReaderEvent::Added {
                        reader: reader.to_string(),
                        card: CardStatus::Absent,
                    })
                },
            );
        });

        let event = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, ReaderEvent::Added { reader, .. } if reader == "B"));

        // Nothing changes anymore and the receiver is still alive
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        signal.trigger();
        assert!(finished(&handle, Duration::from_secs(2)));
        handle.join().unwrap();
        drop(receiver);
    }

    #[test]
    fn test_stop_signal_generations() {
        let signal = StopSignal::new();
        let old = signal.subscribe();
        assert!(!is_stopped(&old));

        signal.trigger();
        let new = signal.subscribe();
        assert!(is_stopped(&old));
        assert!(!is_stopped(&new));

        drop(signal);
        assert!(is_stopped(&new));
    }
}
