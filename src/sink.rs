//! sink.rs
//!
//! The queue-based event sink the player dispatches into, and its real
//! implementation over `midir` output connections.
//!
//! `EventSink` models a sequencer-style timed queue: the caller sets a
//! tempo, starts the queue, hands over tick-stamped events, and the sink is
//! responsible for delivering each one at the right wall-clock moment.
//! `MidirSink` realizes that with a pacing worker thread that owns the MIDI
//! connections: commands arrive over a channel, the worker converts ticks
//! to microseconds under the queue's current tempo, sleeps each event to
//! its due time, and writes the raw bytes to the destination port.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use midir::MidiOutputConnection;

use crate::event::{Destination, EventKind};

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("no such queue: {0:?}")]
    NoSuchQueue(QueueId),
    #[error("the queue worker is gone")]
    Disconnected,
}

/// Handle for a queue created on a sink. The numbering scheme belongs to
/// the sink that minted the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

/// A scheduled event as handed to the sink: the decoded event plus the
/// queue that owns its timing.
#[derive(Clone, Debug)]
pub struct OutputEvent {
    pub queue: QueueId,
    pub tick: u64,
    pub dest: Destination,
    pub kind: EventKind,
}

/// The timed delivery surface of an external sequencing device.
pub trait EventSink {
    fn create_queue(&mut self, name: &str) -> Result<QueueId, SinkError>;
    /// Set the queue's tempo (µs per quarter note) and resolution (ticks
    /// per quarter note).
    fn set_queue_tempo(&mut self, queue: QueueId, tempo: u32, ppq: u32) -> Result<(), SinkError>;
    /// Start (or restart) the queue; its clock begins at tick 0.
    fn start_queue(&mut self, queue: QueueId) -> Result<(), SinkError>;
    fn stop_queue(&mut self, queue: QueueId) -> Result<(), SinkError>;
    fn delete_queue(&mut self, queue: QueueId) -> Result<(), SinkError>;
    /// Enqueue one event for timed delivery. May block on backpressure.
    fn output_event(&mut self, event: OutputEvent) -> Result<(), SinkError>;
    /// Block until the local buffer has been handed to the device.
    fn drain_output(&mut self) -> Result<(), SinkError>;
    /// Block until the device has processed everything queued so far.
    fn sync_output_queue(&mut self) -> Result<(), SinkError>;
}

/// Microseconds covered by `delta` ticks at `tempo` µs per quarter note.
fn ticks_to_micros(delta: u64, tempo: u32, ppq: u32) -> u64 {
    (u128::from(delta) * u128::from(tempo) / u128::from(ppq.max(1))) as u64
}

/// Per-queue pacing state kept by the worker.
struct QueueState {
    tempo: u32,
    ppq: u32,
    running: bool,
    started_at: Instant,
    elapsed_us: u64,
    last_tick: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            tempo: 500_000,
            ppq: 96,
            running: false,
            started_at: Instant::now(),
            elapsed_us: 0,
            last_tick: 0,
        }
    }

    fn restart(&mut self) {
        self.running = true;
        self.started_at = Instant::now();
        self.elapsed_us = 0;
        self.last_tick = 0;
    }

    /// Advance the queue clock to `tick`, returning the offset from queue
    /// start at which the event is due. Segments between tempo changes are
    /// accumulated exactly, so a mid-song tempo only affects later ticks.
    fn advance_to(&mut self, tick: u64) -> Duration {
        let delta = tick.saturating_sub(self.last_tick);
        self.elapsed_us += ticks_to_micros(delta, self.tempo, self.ppq);
        self.last_tick = self.last_tick.max(tick);
        Duration::from_micros(self.elapsed_us)
    }
}

enum Cmd {
    Create(QueueId),
    SetTempo {
        queue: QueueId,
        tempo: u32,
        ppq: u32,
    },
    Start(QueueId),
    Stop(QueueId),
    Delete(QueueId),
    Event(OutputEvent),
    /// Reply once every command before this one has been fully processed.
    Flush(Sender<()>),
}

/// An `EventSink` over a set of connected `midir` output ports.
///
/// The port list is positional: `Destination::Port(i)` addresses
/// `connections[i]`, matching the order the caller resolved them in.
pub struct MidirSink {
    tx: Option<Sender<Cmd>>,
    worker: Option<JoinHandle<()>>,
    next_queue: u32,
    queues: Vec<QueueId>,
}

impl MidirSink {
    pub fn new(connections: Vec<MidiOutputConnection>) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || run_worker(rx, connections));
        Self {
            tx: Some(tx),
            worker: Some(worker),
            next_queue: 0,
            queues: Vec::new(),
        }
    }

    fn send(&self, cmd: Cmd) -> Result<(), SinkError> {
        self.tx
            .as_ref()
            .ok_or(SinkError::Disconnected)?
            .send(cmd)
            .map_err(|_| SinkError::Disconnected)
    }

    fn check(&self, queue: QueueId) -> Result<(), SinkError> {
        if self.queues.contains(&queue) {
            Ok(())
        } else {
            Err(SinkError::NoSuchQueue(queue))
        }
    }

    fn flush(&self) -> Result<(), SinkError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Cmd::Flush(reply_tx))?;
        reply_rx.recv().map_err(|_| SinkError::Disconnected)
    }
}

impl EventSink for MidirSink {
    fn create_queue(&mut self, name: &str) -> Result<QueueId, SinkError> {
        let queue = QueueId(self.next_queue);
        self.next_queue += 1;
        debug!("creating queue {queue:?} ({name})");
        self.send(Cmd::Create(queue))?;
        self.queues.push(queue);
        Ok(queue)
    }

    fn set_queue_tempo(&mut self, queue: QueueId, tempo: u32, ppq: u32) -> Result<(), SinkError> {
        self.check(queue)?;
        self.send(Cmd::SetTempo { queue, tempo, ppq })
    }

    fn start_queue(&mut self, queue: QueueId) -> Result<(), SinkError> {
        self.check(queue)?;
        self.send(Cmd::Start(queue))
    }

    fn stop_queue(&mut self, queue: QueueId) -> Result<(), SinkError> {
        self.check(queue)?;
        self.send(Cmd::Stop(queue))
    }

    fn delete_queue(&mut self, queue: QueueId) -> Result<(), SinkError> {
        self.check(queue)?;
        self.queues.retain(|q| *q != queue);
        self.send(Cmd::Delete(queue))
    }

    fn output_event(&mut self, event: OutputEvent) -> Result<(), SinkError> {
        self.check(event.queue)?;
        self.send(Cmd::Event(event))
    }

    fn drain_output(&mut self) -> Result<(), SinkError> {
        self.flush()
    }

    fn sync_output_queue(&mut self) -> Result<(), SinkError> {
        // Delivery happens in command order at due time, so a round-trip
        // through the worker implies everything queued before it has
        // already reached the device.
        self.flush()
    }
}

impl Drop for MidirSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: Receiver<Cmd>, mut connections: Vec<MidiOutputConnection>) {
    let mut queues: HashMap<QueueId, QueueState> = HashMap::new();

    while let Ok(cmd) = rx.recv() {
        match cmd {
            Cmd::Create(queue) => {
                queues.insert(queue, QueueState::new());
            }
            Cmd::SetTempo { queue, tempo, ppq } => {
                if let Some(state) = queues.get_mut(&queue) {
                    debug!("queue {queue:?}: tempo {tempo} µs/qn at {ppq} ppq");
                    state.tempo = tempo;
                    state.ppq = ppq;
                }
            }
            Cmd::Start(queue) => {
                if let Some(state) = queues.get_mut(&queue) {
                    info!("queue {queue:?} started");
                    state.restart();
                }
            }
            Cmd::Stop(queue) => {
                if let Some(state) = queues.get_mut(&queue) {
                    state.running = false;
                }
            }
            Cmd::Delete(queue) => {
                queues.remove(&queue);
            }
            Cmd::Event(event) => {
                let Some(state) = queues.get_mut(&event.queue) else {
                    continue;
                };
                if state.running {
                    let due = state.started_at + state.advance_to(event.tick);
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                }
                match event.kind {
                    EventKind::Tempo { micros_per_quarter } => {
                        debug!("tempo change to {micros_per_quarter} µs/qn");
                        state.tempo = micros_per_quarter;
                    }
                    EventKind::Stop => {
                        info!("queue {:?} stopped at tick {}", event.queue, event.tick);
                        state.running = false;
                    }
                    ref kind => {
                        if let (Destination::Port(p), Some(bytes)) =
                            (event.dest, kind.wire_bytes())
                        {
                            match connections.get_mut(p) {
                                Some(conn) => {
                                    if let Err(e) = conn.send(&bytes) {
                                        warn!("output to port {p} failed: {e}");
                                    }
                                }
                                None => warn!("event addressed to unknown port {p}"),
                            }
                        }
                    }
                }
            }
            Cmd::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    // Channel closed: connections drop here and close their ports.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_follows_tempo_and_ppq() {
        // One quarter note of ticks is exactly one tempo period.
        assert_eq!(ticks_to_micros(96, 500_000, 96), 500_000);
        assert_eq!(ticks_to_micros(96, 250_000, 96), 250_000);
        assert_eq!(ticks_to_micros(48, 500_000, 96), 250_000);
        assert_eq!(ticks_to_micros(0, 500_000, 96), 0);
    }

    #[test]
    fn tick_conversion_survives_zero_ppq() {
        assert_eq!(ticks_to_micros(10, 500_000, 0), 5_000_000);
    }

    #[test]
    fn queue_clock_accumulates_across_tempo_changes() {
        let mut state = QueueState::new();
        state.restart();
        state.tempo = 500_000;
        state.ppq = 96;

        assert_eq!(state.advance_to(96), Duration::from_micros(500_000));

        // Tempo change at tick 96 only affects the ticks after it.
        state.tempo = 250_000;
        assert_eq!(state.advance_to(192), Duration::from_micros(750_000));
    }

    #[test]
    fn queue_clock_ignores_backward_ticks() {
        let mut state = QueueState::new();
        state.restart();
        let at_100 = state.advance_to(100);
        // A tick below the clock position adds nothing, and does not make
        // the clock re-count ticks it has already covered.
        assert_eq!(state.advance_to(50), at_100);
        assert_eq!(state.advance_to(100), at_100);
    }

    #[test]
    fn restart_resets_the_clock() {
        let mut state = QueueState::new();
        state.restart();
        state.advance_to(500);
        state.restart();
        assert_eq!(state.advance_to(0), Duration::ZERO);
        assert_eq!(state.last_tick, 0);
    }
}
