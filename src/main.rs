use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::info;
use midir::{MidiOutput, MidiOutputConnection};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

mod event;
mod player;
mod reader;
mod schedule;
mod sink;
mod smf;

use sink::{EventSink, MidirSink, QueueId};

/// Play Standard MIDI Files to MIDI output ports.
#[derive(Parser, Debug)]
#[command(version)]
struct Opt {
    /// Output port(s): an index from --list or a name substring, comma separated
    #[arg(short, long, value_delimiter = ',')]
    port: Vec<String>,
    /// Seconds to wait after the end of each file
    #[arg(short, long, default_value_t = 2)]
    delay: u64,
    /// List the available output ports
    #[arg(short, long)]
    list: bool,
    /// MIDI files to play; '-' reads from standard input
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
}

/// Fallback port list when --port is not given.
const PORTS_ENV: &str = "SMFPLAY_PORTS";

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    if opt.list {
        list_ports()?;
        return Ok(());
    }

    let specs = port_specs(&opt.port, std::env::var(PORTS_ENV).ok());
    if specs.is_empty() {
        bail!("no output ports; pass --port or set {PORTS_ENV}");
    }
    if opt.files.is_empty() {
        bail!("no files to play");
    }

    let connections = connect_ports(&specs)?;
    let num_ports = connections.len();
    let mut sink = MidirSink::new(connections);
    let queue = sink.create_queue("smfplay")?;

    for path in &opt.files {
        play_file(&mut sink, queue, path, num_ports, opt.delay)?;
    }

    sink.stop_queue(queue)?;
    sink.delete_queue(queue)?;
    Ok(())
}

/// Decode one file, merge its tracks and hand the schedule to the sink.
/// Returns after the sink confirms delivery plus the end-of-song delay.
fn play_file<S: EventSink>(
    sink: &mut S,
    queue: QueueId,
    path: &Path,
    num_ports: usize,
    delay: u64,
) -> Result<()> {
    let song = if path.as_os_str() == "-" {
        info!("reading standard input");
        smf::load(std::io::stdin().lock(), num_ports)
    } else {
        let file =
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        smf::load(BufReader::new(file), num_ports)
    }
    .with_context(|| format!("{} is not a playable MIDI file", path.display()))?;

    println!(
        "{}: format {}, {} track(s), {} ppq, {} µs per quarter note",
        path.display(),
        song.format,
        song.tracks.len(),
        song.timebase.ppq,
        song.timebase.tempo,
    );

    let timebase = song.timebase;
    let entries = schedule::merge(song.tracks);
    player::play(sink, queue, &timebase, &entries)
        .with_context(|| format!("playback of {} failed", path.display()))?;

    // Let release tails ring out before the ports close or the next file
    // starts.
    thread::sleep(Duration::from_secs(delay));
    Ok(())
}

/// CLI ports win; otherwise split the environment fallback.
fn port_specs(cli: &[String], env: Option<String>) -> Vec<String> {
    if !cli.is_empty() {
        return cli.to_vec();
    }
    env.map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Match a port spec against the enumerated port names: a bare number is an
/// index, anything else a case-insensitive substring.
fn match_port(spec: &str, names: &[String]) -> Option<usize> {
    if let Ok(idx) = spec.parse::<usize>() {
        return (idx < names.len()).then_some(idx);
    }
    let want = spec.to_ascii_lowercase();
    names
        .iter()
        .position(|n| n.to_ascii_lowercase().contains(&want))
}

/// Open one connection per spec. Each connection consumes its own
/// `MidiOutput` client, so one is created per port.
fn connect_ports(specs: &[String]) -> Result<Vec<MidiOutputConnection>> {
    let mut connections = Vec::with_capacity(specs.len());
    for spec in specs {
        let out = MidiOutput::new("smfplay").map_err(|e| anyhow!("opening MIDI output: {e}"))?;
        let ports = out.ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| out.port_name(p).unwrap_or_else(|_| "<unknown>".into()))
            .collect();
        let idx = match_port(spec, &names)
            .ok_or_else(|| anyhow!("no output port matches {spec:?}; try --list"))?;
        let conn = out
            .connect(&ports[idx], "smfplay-out")
            .map_err(|e| anyhow!("connecting to {}: {e}", names[idx]))?;
        info!("connected to output port {}: {}", idx, names[idx]);
        connections.push(conn);
    }
    Ok(connections)
}

fn list_ports() -> Result<()> {
    let out = MidiOutput::new("smfplay").map_err(|e| anyhow!("opening MIDI output: {e}"))?;
    let ports = out.ports();
    println!(" Port  Name");
    for (i, port) in ports.iter().enumerate() {
        let name = out.port_name(port).unwrap_or_else(|_| "<unknown>".into());
        println!("{i:>5}  {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_ports_take_precedence_over_the_environment() {
        let cli = vec!["1".to_string()];
        let specs = port_specs(&cli, Some("2,3".into()));
        assert_eq!(specs, vec!["1"]);
    }

    #[test]
    fn environment_fallback_splits_on_commas() {
        let specs = port_specs(&[], Some("FluidSynth, 2,".into()));
        assert_eq!(specs, vec!["FluidSynth", "2"]);
    }

    #[test]
    fn no_ports_anywhere_yields_nothing() {
        assert!(port_specs(&[], None).is_empty());
    }

    #[test]
    fn numeric_spec_is_an_index() {
        let names = names(&["Midi Through", "FluidSynth"]);
        assert_eq!(match_port("1", &names), Some(1));
        assert_eq!(match_port("5", &names), None);
    }

    #[test]
    fn name_spec_matches_case_insensitively() {
        let names = names(&["Midi Through Port-0", "FluidSynth virtual port"]);
        assert_eq!(match_port("fluid", &names), Some(1));
        assert_eq!(match_port("THROUGH", &names), Some(0));
        assert_eq!(match_port("timidity", &names), None);
    }
}
