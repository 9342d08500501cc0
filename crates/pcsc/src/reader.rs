//! Reader state helpers

use std::collections::BTreeSet;

use nexum_card_resource::{CardEvent, CardStatus};
use pcsc::{ReaderState, State};

/// Card state of a reader as reported by `SCardGetStatusChange`
pub(crate) fn card_status(reader_state: &ReaderState) -> CardStatus {
    let state = reader_state.event_state();
    if state.contains(State::MUTE) {
        CardStatus::Unreadable("card is mute".to_string())
    } else if state.contains(State::PRESENT) && !state.contains(State::EMPTY) {
        CardStatus::Present {
            atr: reader_state.atr().to_vec(),
        }
    } else {
        CardStatus::Absent
    }
}

/// Whether the reader behind the state is gone
pub(crate) fn is_gone(reader_state: &ReaderState) -> bool {
    let state = reader_state.event_state();
    state.intersects(State::UNKNOWN | State::UNAVAILABLE)
}

/// Readers that appeared and disappeared between two snapshots
pub(crate) fn diff_readers(
    previous: &BTreeSet<String>,
    current: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = current.difference(previous).cloned().collect();
    let removed = previous.difference(current).cloned().collect();
    (added, removed)
}

/// Card state of one reader as last reported on its stream
#[derive(Debug, Default)]
pub(crate) struct CardWatch {
    /// `None` until the first observation
    reported: Option<Option<Vec<u8>>>,
}

impl CardWatch {
    /// Event to report for the card now in the reader
    ///
    /// The first observation is always reported, so a card inserted between
    /// the reader snapshot and the subscription is not missed. A different
    /// card swapped in between two waits is reported as an insertion.
    pub(crate) fn observe(&mut self, reader: &str, atr: Option<Vec<u8>>) -> Option<CardEvent> {
        if self.reported.as_ref() == Some(&atr) {
            return None;
        }
        let event = match &atr {
            Some(atr) => CardEvent::Inserted {
                reader: reader.to_string(),
                atr: atr.clone(),
            },
            None => CardEvent::Removed {
                reader: reader.to_string(),
            },
        };
        self.reported = Some(atr);
        Some(event)
    }
}
