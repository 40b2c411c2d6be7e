//! Cadence headless player
//!
//! Plays a Y4M file through the full decode/queue/render pipeline into an
//! in-memory surface and reports what happened.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use cadence_core::clock::SystemClock;
use cadence_core::convert::ChannelOrder;
use cadence_core::render::{DisplaySurface, MemorySurface};
use cadence_core::scaler::SoftwareScalerFactory;
use cadence_core::source::FileSource;
use cadence_core::y4m::Y4mDemuxer;
use cadence_core::{PlaybackConfig, PlaybackSession, SessionStats};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct HeadlessOptions {
    input: PathBuf,
    config: Option<PathBuf>,
    no_drops: bool,
    max_frames: Option<u64>,
    json: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_headless_args(&args)?;

    tracing::info!("Cadence v{}", cadence_core::VERSION);
    let stats = run_headless(&options)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_summary(&stats);
    }

    if stats.fatal {
        return Err(anyhow::anyhow!("Playback ended with {:?}", stats.end_reason));
    }
    Ok(())
}

fn run_headless(options: &HeadlessOptions) -> Result<SessionStats> {
    let mut config = match &options.config {
        Some(path) => PlaybackConfig::load(path)?,
        None => PlaybackConfig::default(),
    };
    if options.no_drops {
        config.frame_drops = false;
    }

    let source = FileSource::open(&options.input)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", options.input.display(), e))?;
    let demuxer = Y4mDemuxer::open(source)?;
    let decoder = demuxer.header().decoder();
    let surface = MemorySurface::new(ChannelOrder::Bgra);

    let session = PlaybackSession::open(
        config,
        Box::new(demuxer),
        Box::new(decoder),
        Box::new(SoftwareScalerFactory::default()),
        surface.channel_probe(),
        Arc::new(SystemClock::new()),
    )?;

    let started = Instant::now();
    let handle = session.spawn(surface)?;

    while !handle.is_done() {
        if let Some(limit) = options.max_frames {
            if handle.stats().counters.frames_presented >= limit {
                tracing::info!("Presented {} frames, stopping", limit);
                handle.stop();
                break;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let stats = handle.join()?;
    tracing::info!("Playback took {:.2}s", started.elapsed().as_secs_f64());
    Ok(stats)
}

fn parse_headless_args(args: &[String]) -> Result<HeadlessOptions> {
    let mut input: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut no_drops = false;
    let mut max_frames: Option<u64> = None;
    let mut json = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --input"))?;
                input = Some(PathBuf::from(value));
                i += 2;
            }
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                config = Some(PathBuf::from(value));
                i += 2;
            }
            "--max-frames" | "-n" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --max-frames"))?;
                let n = value
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", value, e))?;
                max_frames = Some(n);
                i += 2;
            }
            "--no-drops" => {
                no_drops = true;
                i += 1;
            }
            "--json" => {
                json = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input")
    })?;

    Ok(HeadlessOptions {
        input,
        config,
        no_drops,
        max_frames,
        json,
    })
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  cadence --input <file.y4m> [--config <cfg.json>] [--no-drops] [--max-frames <n>] [--json]\n"
    );
}

fn print_summary(stats: &SessionStats) {
    let c = &stats.counters;
    println!("Decoded:    {}", c.frames_decoded);
    println!("Queued:     {}", c.frames_queued);
    println!("Presented:  {}", c.frames_presented);
    println!("Dropped:    {}", c.frames_dropped);
    println!("OOM skips:  {}", c.oom_skips);
    println!("Discarded:  {} units", c.units_discarded);
    println!(
        "Buffers:    {} allocated, {} recycled",
        stats.pool.total_allocated, stats.pool.total_recycled
    );
    match &stats.end_reason {
        Some(reason) => println!("Ended:      {:?}", reason),
        None => println!("Ended:      (still running)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cadence")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_all_flags() {
        let options = parse_headless_args(&args(&[
            "--input",
            "clip.y4m",
            "--config",
            "cfg.json",
            "--no-drops",
            "--max-frames",
            "30",
            "--json",
        ]))
        .unwrap();

        assert_eq!(options.input, PathBuf::from("clip.y4m"));
        assert_eq!(options.config, Some(PathBuf::from("cfg.json")));
        assert!(options.no_drops);
        assert_eq!(options.max_frames, Some(30));
        assert!(options.json);
    }

    #[test]
    fn input_is_required() {
        assert!(parse_headless_args(&args(&["--json"])).is_err());
        assert!(parse_headless_args(&args(&["--input"])).is_err());
    }

    #[test]
    fn rejects_bad_frame_count() {
        assert!(parse_headless_args(&args(&["-i", "a.y4m", "-n", "many"])).is_err());
    }
}
