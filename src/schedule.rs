//! schedule.rs
//!
//! Merges the per-track event lists of a decoded file into one globally
//! time-ordered schedule. Ordering is by absolute tick, and at equal ticks
//! by source track index, so simultaneous events keep the file's track
//! order. The schedule ends with a synthetic stop entry at the tick of the
//! last event, which the dispatcher turns into a queue stop.

use crate::event::{Destination, EventKind, TrackEvent};
use crate::smf::Track;

/// One scheduled event together with the index of the track it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub track: usize,
    pub event: TrackEvent,
}

/// Flatten `tracks` into a single schedule ordered by `(tick, track)` and
/// terminated by a stop entry.
///
/// The sort key is an explicit lexicographic pair; combined with a stable
/// sort it preserves each track's own decode order at equal ticks.
pub fn merge(tracks: Vec<Track>) -> Vec<ScheduleEntry> {
    let mut entries =
        Vec::with_capacity(tracks.iter().map(|t| t.events.len()).sum::<usize>() + 1);
    let num_tracks = tracks.len();
    let mut max_end_tick = 0;
    for (track, t) in tracks.into_iter().enumerate() {
        max_end_tick = max_end_tick.max(t.end_tick);
        for event in t.events {
            entries.push(ScheduleEntry { track, event });
        }
    }
    entries.sort_by_key(|e| (e.event.tick, e.track));

    // Stop when the last event has played. A file whose tracks hold only
    // end-of-track metas still gets a stop, at the latest end tick.
    let max_tick = entries.last().map_or(max_end_tick, |e| e.event.tick);
    entries.push(ScheduleEntry {
        track: num_tracks,
        event: TrackEvent {
            tick: max_tick,
            dest: Destination::Timer,
            kind: EventKind::Stop,
        },
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(tick: u64, note: u8) -> TrackEvent {
        TrackEvent {
            tick,
            dest: Destination::Port(0),
            kind: EventKind::NoteOn {
                channel: 0,
                note,
                velocity: 100,
            },
        }
    }

    fn track(events: Vec<TrackEvent>, end_tick: u64) -> Track {
        Track { events, end_tick }
    }

    #[test]
    fn orders_by_tick_then_track() {
        let merged = merge(vec![
            track(vec![note_on(10, 1), note_on(30, 2)], 30),
            track(vec![note_on(10, 3), note_on(20, 4)], 20),
        ]);

        let order: Vec<(u64, usize)> = merged.iter().map(|e| (e.event.tick, e.track)).collect();
        assert_eq!(order, vec![(10, 0), (10, 1), (20, 1), (30, 0), (30, 2)]);
    }

    #[test]
    fn ticks_are_non_decreasing() {
        let merged = merge(vec![
            track(vec![note_on(0, 1), note_on(5, 2), note_on(5, 3)], 5),
            track(vec![note_on(2, 4), note_on(9, 5)], 9),
        ]);
        for pair in merged.windows(2) {
            assert!(pair[0].event.tick <= pair[1].event.tick);
        }
    }

    #[test]
    fn equal_ticks_keep_decode_order_within_a_track() {
        let merged = merge(vec![track(vec![note_on(7, 1), note_on(7, 2)], 7)]);
        assert_eq!(
            merged[0].event.kind,
            EventKind::NoteOn {
                channel: 0,
                note: 1,
                velocity: 100
            }
        );
        assert_eq!(
            merged[1].event.kind,
            EventKind::NoteOn {
                channel: 0,
                note: 2,
                velocity: 100
            }
        );
    }

    #[test]
    fn appends_exactly_one_stop_at_the_last_tick() {
        let merged = merge(vec![
            track(vec![note_on(0, 1), note_on(96, 2)], 96),
            track(vec![note_on(48, 3)], 48),
        ]);

        let stops: Vec<_> = merged
            .iter()
            .filter(|e| e.event.kind == EventKind::Stop)
            .collect();
        assert_eq!(stops.len(), 1);

        let last = merged.last().unwrap();
        assert_eq!(last.event.kind, EventKind::Stop);
        assert_eq!(last.event.tick, 96);
        assert_eq!(last.event.dest, Destination::Timer);
    }

    #[test]
    fn empty_tracks_stop_at_the_latest_end_tick() {
        let merged = merge(vec![track(vec![], 120), track(vec![], 64)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].event.tick, 120);
        assert_eq!(merged[0].event.kind, EventKind::Stop);
    }
}
