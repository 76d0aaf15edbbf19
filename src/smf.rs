//! smf.rs
//!
//! Standard MIDI File decoding. An SMF is a chunked container: one `MThd`
//! header chunk (format type, track count, time division) followed by one
//! `MTrk` chunk per track. Track data is a stream of variable-length delta
//! times interleaved with channel messages, sysex payloads and `0xFF` meta
//! events, with the running-status shorthand allowing a repeated status
//! byte to be omitted.
//!
//! This module decodes the whole file into per-track lists of
//! `TrackEvent`s with absolute ticks, plus the initial `TimeBase`. Ticks
//! are never converted here; they stay in the file's own resolution so the
//! sequencing queue can apply tempo changes downstream.

use std::io::Read;

use log::debug;

use crate::event::{Destination, EventKind, TrackEvent};
use crate::reader::{ByteReader, ReadError};

#[derive(thiserror::Error, Debug)]
pub enum SmfError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("not a Standard MIDI File (leading bytes {found:02x?})")]
    UnrecognizedFile { found: [u8; 4] },
    #[error("RIFF MIDI files are not supported")]
    RiffNotSupported,
    #[error("invalid MThd header length {0}")]
    InvalidHeader(u32),
    #[error("unsupported SMF format type {0}")]
    UnsupportedFormat(u16),
    #[error("invalid number of tracks: {0}")]
    InvalidTrackCount(u16),
    #[error("invalid number of SMPTE frames per second: {0}")]
    InvalidSmpteRate(u8),
    #[error("invalid chunk length {len} at offset {offset}")]
    InvalidChunkLength { len: u32, offset: u64 },
    #[error("data byte without a running status at offset {0}")]
    NoRunningStatus(u64),
    #[error("unsupported status byte {status:#04x} at offset {offset}")]
    UnsupportedStatus { status: u8, offset: u64 },
    #[error("truncated meta event at offset {0}")]
    TruncatedMeta(u64),
    #[error("track chunk ended without an end-of-track event at offset {0}")]
    MissingEndOfTrack(u64),
}

/// Initial tempo and resolution derived from the header's time division.
///
/// Bit 15 clear: the division is ticks per quarter note and the tempo
/// defaults to 500000 µs per quarter (120 BPM) until a tempo meta says
/// otherwise. Bit 15 set: SMPTE timing, where the high byte is the negated
/// frame rate and the low byte the ticks per frame; each supported rate
/// maps to a fixed (tempo, ppq) pair so that one tick keeps its real
/// duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    /// Microseconds per quarter note.
    pub tempo: u32,
    /// Ticks per quarter note.
    pub ppq: u32,
    /// Whether the file uses SMPTE timing (tempo metas are ignored then).
    pub smpte: bool,
}

impl TimeBase {
    pub fn from_division(division: u16) -> Result<Self, SmfError> {
        if division & 0x8000 == 0 {
            return Ok(Self {
                tempo: 500_000,
                ppq: u32::from(division),
                smpte: false,
            });
        }
        let fps = (0x80 - ((division >> 8) & 0x7f)) as u8;
        let subframes = u32::from(division & 0xff);
        let (tempo, ticks_per_frame) = match fps {
            24 => (500_000, 12),
            25 => (400_000, 10),
            // 29 means 30 drop-frame; 100 s at that tempo spans exactly
            // 2997 frames
            29 => (100_000_000, 2997),
            30 => (500_000, 15),
            other => return Err(SmfError::InvalidSmpteRate(other)),
        };
        Ok(Self {
            tempo,
            ppq: ticks_per_frame * subframes,
            smpte: true,
        })
    }
}

/// One decoded track: events with absolute ticks, in file order, plus the
/// tick of the end-of-track meta.
#[derive(Debug)]
pub struct Track {
    pub events: Vec<TrackEvent>,
    pub end_tick: u64,
}

/// A fully decoded file, ready for scheduling.
#[derive(Debug)]
pub struct Song {
    pub format: u16,
    pub timebase: TimeBase,
    pub tracks: Vec<Track>,
}

/// Decode a MIDI file (or the stub-rejected RIFF container) from any byte
/// source. `num_ports` is the size of the destination list the caller will
/// route events to; port-select metas are resolved against it.
pub fn load<R: Read>(source: R, num_ports: usize) -> Result<Song, SmfError> {
    let mut r = ByteReader::new(source);
    let id = r.read_id()?;
    match &id {
        b"MThd" => read_smf(&mut r, num_ports),
        b"RIFF" => {
            // Recognize the container (id + little-endian size) before
            // rejecting it, so the error names the real format.
            let _riff_len = r.read_u32_le()?;
            Err(SmfError::RiffNotSupported)
        }
        _ => Err(SmfError::UnrecognizedFile { found: id }),
    }
}

/// Read the body of an SMF after its `MThd` id has been consumed.
fn read_smf<R: Read>(r: &mut ByteReader<R>, num_ports: usize) -> Result<Song, SmfError> {
    let header_len = r.read_u32_be()?;
    if header_len < 6 {
        return Err(SmfError::InvalidHeader(header_len));
    }
    let format = r.read_u16_be()?;
    if format > 1 {
        return Err(SmfError::UnsupportedFormat(format));
    }
    let num_tracks = r.read_u16_be()?;
    if !(1..=1000).contains(&num_tracks) {
        return Err(SmfError::InvalidTrackCount(num_tracks));
    }
    let division = r.read_u16_be()?;
    let timebase = TimeBase::from_division(division)?;
    // Headers longer than the 6 bytes we understand: skip the excess so
    // chunk scanning starts on a chunk boundary.
    r.skip(u64::from(header_len) - 6)?;

    let mut tracks = Vec::with_capacity(usize::from(num_tracks));
    while tracks.len() < usize::from(num_tracks) {
        // Scan for the next MTrk chunk, skipping foreign chunk types.
        let chunk_len = loop {
            let id = r.read_id()?;
            let len = r.read_u32_be()?;
            if len >= 0x1000_0000 {
                return Err(SmfError::InvalidChunkLength {
                    len,
                    offset: r.pos(),
                });
            }
            if &id == b"MTrk" {
                break len;
            }
            debug!(
                "skipping chunk {:?} ({} bytes)",
                String::from_utf8_lossy(&id),
                len
            );
            r.skip(u64::from(len))?;
        };
        let track = TrackDecoder::new(num_ports, timebase.smpte).run(r, chunk_len)?;
        debug!(
            "track {}: {} events, end tick {}",
            tracks.len(),
            track.events.len(),
            track.end_tick
        );
        tracks.push(track);
    }

    Ok(Song {
        format,
        timebase,
        tracks,
    })
}

/// Scans one `MTrk` chunk. The running-status and port registers live here
/// so every track decodes independently.
struct TrackDecoder {
    tick: u64,
    last_status: Option<u8>,
    port: usize,
    num_ports: usize,
    smpte: bool,
}

impl TrackDecoder {
    fn new(num_ports: usize, smpte: bool) -> Self {
        Self {
            tick: 0,
            last_status: None,
            port: 0,
            // Keep the port-select modulo total even with no ports wired.
            num_ports: num_ports.max(1),
            smpte,
        }
    }

    fn run<R: Read>(mut self, r: &mut ByteReader<R>, chunk_len: u32) -> Result<Track, SmfError> {
        let track_end = r.pos() + u64::from(chunk_len);
        let mut events = Vec::new();

        while r.pos() < track_end {
            self.tick += u64::from(r.read_var()?);

            let c = r.read_byte()?;
            let status = if c & 0x80 != 0 {
                // System and meta prefixes (0xF0..) never become the
                // running status.
                if c < 0xf0 {
                    self.last_status = Some(c);
                }
                c
            } else {
                // Data byte: this event reuses the previous status and `c`
                // is its first data byte, so put it back.
                r.unread(c);
                self.last_status
                    .ok_or(SmfError::NoRunningStatus(r.pos()))?
            };

            let channel = status & 0x0f;
            match status >> 4 {
                0x8 => events.push(self.at(EventKind::NoteOff {
                    channel,
                    note: r.read_byte()? & 0x7f,
                    velocity: r.read_byte()? & 0x7f,
                })),
                0x9 => events.push(self.at(EventKind::NoteOn {
                    channel,
                    note: r.read_byte()? & 0x7f,
                    velocity: r.read_byte()? & 0x7f,
                })),
                0xa => events.push(self.at(EventKind::KeyPressure {
                    channel,
                    note: r.read_byte()? & 0x7f,
                    pressure: r.read_byte()? & 0x7f,
                })),
                0xb => events.push(self.at(EventKind::Controller {
                    channel,
                    param: r.read_byte()? & 0x7f,
                    value: r.read_byte()? & 0x7f,
                })),
                0xc => events.push(self.at(EventKind::ProgramChange {
                    channel,
                    program: r.read_byte()? & 0x7f,
                })),
                0xd => events.push(self.at(EventKind::ChannelPressure {
                    channel,
                    value: r.read_byte()? & 0x7f,
                })),
                0xe => events.push(self.at(EventKind::PitchBend {
                    channel,
                    lsb: r.read_byte()? & 0x7f,
                    msb: r.read_byte()? & 0x7f,
                })),
                0xf => match status {
                    0xf0 | 0xf7 => events.push(self.at(self.read_sysex(r, status)?)),
                    0xff => {
                        if let Some(end_tick) = self.read_meta(r, track_end, &mut events)? {
                            return Ok(Track { events, end_tick });
                        }
                    }
                    other => {
                        return Err(SmfError::UnsupportedStatus {
                            status: other,
                            offset: r.pos(),
                        });
                    }
                },
                _ => {
                    return Err(SmfError::UnsupportedStatus {
                        status,
                        offset: r.pos(),
                    });
                }
            }
        }

        Err(SmfError::MissingEndOfTrack(r.pos()))
    }

    /// Sysex payload. An 0xF0 status is itself the first payload byte; an
    /// 0xF7 continuation carries its bytes verbatim.
    fn read_sysex<R: Read>(
        &self,
        r: &mut ByteReader<R>,
        status: u8,
    ) -> Result<EventKind, SmfError> {
        let len = r.read_var()? as usize;
        let mut data = Vec::with_capacity((len + 1).min(4096));
        if status == 0xf0 {
            data.push(0xf0);
        }
        for _ in 0..len {
            data.push(r.read_byte()?);
        }
        Ok(EventKind::SysEx { data })
    }

    /// Meta event. Returns `Some(end_tick)` when the end-of-track meta
    /// terminates the scan.
    fn read_meta<R: Read>(
        &mut self,
        r: &mut ByteReader<R>,
        track_end: u64,
        events: &mut Vec<TrackEvent>,
    ) -> Result<Option<u64>, SmfError> {
        let meta_type = r.read_byte()?;
        let len = u64::from(r.read_var()?);
        match meta_type {
            // Port select: one data byte, resolved against the destination
            // list.
            0x21 => {
                if len < 1 {
                    return Err(SmfError::TruncatedMeta(r.pos()));
                }
                self.port = usize::from(r.read_byte()?) % self.num_ports;
                r.skip(len - 1)?;
            }
            // End of track: the rest of the chunk carries nothing.
            0x2f => {
                r.skip(track_end.saturating_sub(r.pos()))?;
                return Ok(Some(self.tick));
            }
            // Tempo: 24-bit µs per quarter note. Meaningless under SMPTE
            // ticks, where it is skipped rather than converted.
            0x51 => {
                if len < 3 {
                    return Err(SmfError::TruncatedMeta(r.pos()));
                }
                if self.smpte {
                    r.skip(len)?;
                } else {
                    let micros_per_quarter = r.read_u24_be()?;
                    events.push(TrackEvent {
                        tick: self.tick,
                        dest: Destination::Timer,
                        kind: EventKind::Tempo { micros_per_quarter },
                    });
                    r.skip(len - 3)?;
                }
            }
            _ => r.skip(len)?,
        }
        Ok(None)
    }

    fn at(&self, kind: EventKind) -> TrackEvent {
        TrackEvent {
            tick: self.tick,
            dest: Destination::Port(self.port),
            kind,
        }
    }
}
