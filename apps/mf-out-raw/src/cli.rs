// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use manifold_core::limits::DEFAULT_REAL_TIME;
use manifold_core::runtime;

/// Raw packet output: reads a stream off the bus and writes its packets
/// to a file or stdout.
#[derive(Parser, Debug, Clone)]
#[command(name = "mf-out-raw", version, about)]
pub struct Cli {
    /// Debug level at which messages need to be printed (0-10)
    #[arg(long)]
    pub debug: Option<u8>,

    /// The name of the stream to read
    #[arg(short = 's', long = "stream")]
    pub stream: String,

    /// Name of the output file, or - for stdout
    #[arg(default_value = "-")]
    pub output: String,

    /// Do not start the input if it is not already running
    #[arg(short = 'N', long)]
    pub noinput: bool,

    /// Seek to this position (ms) instead of the default starting point
    #[arg(long)]
    pub seek: Option<u64>,

    /// Playback pacing: ms of media per real second; 0 is unthrottled
    #[arg(long, default_value_t = DEFAULT_REAL_TIME)]
    pub realtime: u64,

    /// Require this many ms of published future on every selected track
    /// before emitting a packet
    #[arg(long, default_value_t = 0)]
    pub lookahead: u64,

    /// Video track specification (ids, codecs, languages, all, none)
    #[arg(long)]
    pub video: Option<String>,

    /// Audio track specification
    #[arg(long)]
    pub audio: Option<String>,

    /// Subtitle track specification
    #[arg(long)]
    pub subtitle: Option<String>,

    /// User agent reported for codec exception matching
    #[arg(long, default_value = "")]
    pub user_agent: String,
}

/// Resolves the effective debug level: `--debug` wins over the `DEBUG`
/// environment variable, which wins over the compiled default.
pub fn effective_debug_level(cli_level: Option<u8>) -> u8 {
    cli_level
        .or_else(|| std::env::var("DEBUG").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(runtime::DEFAULT_DEBUG_LEVEL)
}

pub const fn level_filter(level: u8) -> &'static str {
    match level {
        0..=1 => "error",
        2..=3 => "warn",
        4 => "info",
        5..=6 => "debug",
        _ => "trace",
    }
}

pub fn init_logging(level: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_filter(level)));
    // Logs go to stderr: stdout may carry the media itself.
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["mf-out-raw", "-s", "live1"]);
        assert_eq!(cli.stream, "live1");
        assert_eq!(cli.output, "-");
        assert_eq!(cli.realtime, DEFAULT_REAL_TIME);
        assert_eq!(cli.lookahead, 0);
        assert!(!cli.noinput);
    }

    #[test]
    fn test_cli_track_specs() {
        let cli = Cli::parse_from([
            "mf-out-raw",
            "-s",
            "vod1",
            "out.bin",
            "--audio",
            "nl,aac",
            "--video",
            "none",
            "--realtime",
            "0",
        ]);
        assert_eq!(cli.output, "out.bin");
        assert_eq!(cli.audio.as_deref(), Some("nl,aac"));
        assert_eq!(cli.video.as_deref(), Some("none"));
        assert_eq!(cli.realtime, 0);
    }
}
