mod event_sink;
mod snapshot;

pub use event_sink::{EventRecord, EventSink, HttpEventSink};
pub use snapshot::{save_snapshot, SnapshotError};

#[cfg(test)]
pub(crate) use event_sink::testing;
