// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use manifold_core::{runtime, ManifoldError};
use manifold_stream::angel;
use std::io::Write;

mod cli;
mod output;
mod sink;

fn open_output(target: &str) -> std::io::Result<(Box<dyn Write + Send>, bool)> {
    if target == "-" {
        Ok((Box::new(std::io::stdout()), false))
    } else {
        Ok((Box::new(std::fs::File::create(target)?), true))
    }
}

const fn exit_code(err: &ManifoldError) -> i32 {
    match err {
        ManifoldError::Fatal(_) => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    let level = cli::effective_debug_level(args.debug);
    runtime::set_debug_level(level);
    cli::init_logging(level);
    angel::spawn_signal_watcher();

    let (out, to_file) = match open_output(&args.output) {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(target = %args.output, error = %e, "cannot open output");
            std::process::exit(1);
        },
    };
    let mut sink = sink::RawSink::new(out);

    let opts = output::OutputOptions {
        stream: args.stream.clone(),
        noinput: args.noinput,
        seek: args.seek,
        real_time: args.realtime,
        look_ahead: args.lookahead,
        video: args.video.clone(),
        audio: args.audio.clone(),
        subtitle: args.subtitle.clone(),
        user_agent: args.user_agent.clone(),
        to_file,
    };

    match output::run(&opts, &mut sink).await {
        Ok(()) => {},
        Err(e) => {
            tracing::error!(error = %e, "output failed");
            std::process::exit(exit_code(&e));
        },
    }
}
