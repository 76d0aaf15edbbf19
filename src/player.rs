//! player.rs
//!
//! Maps a merged schedule onto the sink's timed-queue API: tempo first,
//! then the queue start, then every event in schedule order, then a drain
//! and a sync so nothing is left buffered when we return.

use log::info;

use crate::schedule::ScheduleEntry;
use crate::sink::{EventSink, OutputEvent, QueueId, SinkError};
use crate::smf::TimeBase;

/// Play one merged schedule on `queue`. The entries must already be in
/// `(tick, track)` order; this function never reorders, batches or drops
/// them. Returns once the sink has confirmed delivery of everything,
/// including the trailing stop entry.
pub fn play<S: EventSink>(
    sink: &mut S,
    queue: QueueId,
    timebase: &TimeBase,
    entries: &[ScheduleEntry],
) -> Result<(), SinkError> {
    info!(
        "playing {} events at {} µs/qn, {} ppq",
        entries.len(),
        timebase.tempo,
        timebase.ppq
    );
    sink.set_queue_tempo(queue, timebase.tempo, timebase.ppq)?;
    sink.start_queue(queue)?;

    for entry in entries {
        sink.output_event(OutputEvent {
            queue,
            tick: entry.event.tick,
            dest: entry.event.dest,
            kind: entry.event.kind.clone(),
        })?;
    }

    sink.drain_output()?;
    sink.sync_output_queue()?;
    Ok(())
}
