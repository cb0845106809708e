// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use manifold_core::runtime;

/// File input: serves a flat packet file as a stream, on demand or as
/// simulated live.
#[derive(Parser, Debug, Clone)]
#[command(name = "mf-in-file", version, about)]
pub struct Cli {
    /// Debug level at which messages need to be printed (0-10)
    #[arg(long)]
    pub debug: Option<u8>,

    /// The name of the stream this input provides
    #[arg(short = 's', long = "stream", default_value = "")]
    pub stream: String,

    /// Name of the input file, or - for stdin
    #[arg(default_value = "-")]
    pub input: String,

    /// Name of the output file, or - for stdout
    #[arg(default_value = "-")]
    pub output: String,

    /// Feed the file in real time as a simulated live stream
    #[arg(short = 'r', long)]
    pub realtime: bool,

    /// Unix timestamp (ms) the simulated stream is assumed to have started
    /// at, or 0 for automatic
    #[arg(short = 'S', long, default_value_t = 0)]
    pub simulated_starttime: u64,

    /// Print this input's capability descriptor as JSON, then exit
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Resolves the effective debug level: `--debug` wins over the `DEBUG`
/// environment variable, which wins over the compiled default.
pub fn effective_debug_level(cli_level: Option<u8>) -> u8 {
    cli_level
        .or_else(|| std::env::var("DEBUG").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(runtime::DEFAULT_DEBUG_LEVEL)
}

/// Maps the numeric debug level onto a tracing default filter.
pub const fn level_filter(level: u8) -> &'static str {
    match level {
        0..=1 => "error",
        2..=3 => "warn",
        4 => "info",
        5..=6 => "debug",
        _ => "trace",
    }
}

/// Initializes logging from the resolved debug level. `RUST_LOG` still
/// wins when set explicitly.
pub fn init_logging(level: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_filter(level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
