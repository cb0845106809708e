// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use manifold_core::capa::{InputDescriptor, ParamDescriptor};
use manifold_core::{runtime, StreamState};
use manifold_shm::{names, NamedSemaphore};
use manifold_stream::{angel, capa::stream_config, checked_name, StatePage};

mod cli;
mod file_format;
mod live;
mod serve;

/// The capability descriptor this input registers under.
fn capability() -> InputDescriptor {
    let mut input = InputDescriptor {
        name: "file".to_string(),
        source_match: vec!["/*".to_string(), "file://*".to_string()],
        priority: 9,
        ..Default::default()
    };
    input.optional.insert(
        "realtime".to_string(),
        ParamDescriptor {
            option: "--realtime".to_string(),
            help: "Make this input run as a simulated live stream".to_string(),
            ..Default::default()
        },
    );
    input.optional.insert(
        "simulated-starttime".to_string(),
        ParamDescriptor {
            option: "--simulated-starttime".to_string(),
            kind: Some("uint".to_string()),
            help: "Unix timestamp the simulated stream playback is based on".to_string(),
            ..Default::default()
        },
    );
    input.optional.insert(
        "debug".to_string(),
        ParamDescriptor {
            option: "--debug".to_string(),
            kind: Some("debug".to_string()),
            help: "The debug level at which messages need to be printed".to_string(),
            ..Default::default()
        },
    );
    input
}

async fn run_worker(args: &cli::Cli, stream: &str) -> i32 {
    angel::spawn_signal_watcher();
    let mut state = match StatePage::claim(stream) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "cannot claim state page");
            return 1;
        },
    };
    state.set(StreamState::Boot);

    let source = match file_format::FileSource::open(&args.input) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(input = %args.input, error = %e, "setup failed - exiting");
            return 1;
        },
    };
    let always_on =
        stream_config(stream).ok().flatten().map(|c| c.always_on()).unwrap_or(false);

    let outcome = if args.realtime {
        live::run(stream, &source, &mut state, args.simulated_starttime).await
    } else {
        match serve::VodServer::new(stream, source) {
            Ok(mut server) => server.run(&mut state, always_on).await,
            Err(e) => Err(e),
        }
    };
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "input failed");
            1
        },
    }
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    let level = cli::effective_debug_level(args.debug);
    runtime::set_debug_level(level);
    cli::init_logging(level);

    if args.json {
        match serde_json::to_string(&capability()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("cannot serialize capability: {e}"),
        }
        return;
    }

    let stream = match checked_name(&args.stream) {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => {
            tracing::error!("a stream name is required (-s)");
            std::process::exit(1);
        },
        Err(e) => {
            tracing::error!(error = %e, "stream opening denied");
            std::process::exit(1);
        },
    };
    runtime::set_stream_name(&stream);

    // The worker copy serves; the angel below supervises it.
    if angel::is_worker() {
        std::process::exit(run_worker(&args, &stream).await);
    }

    // This input is the sole responsible process for its stream, so it
    // takes the stream's exclusivity lock before anything else.
    let mut lock = match NamedSemaphore::open(&names::sem_input(&stream)) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "cannot open stream lock");
            std::process::exit(1);
        },
    };
    if !lock.try_wait() {
        tracing::info!(%stream, "an input for this stream is already running");
        std::process::exit(1);
    }
    let mut state = match StatePage::claim(&stream) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "cannot claim state page");
            std::process::exit(1);
        },
    };
    state.set(StreamState::Init);

    let rc = if angel::no_fork() {
        tracing::info!("not using angel process due to NOFORK environment variable");
        run_worker(&args, &stream).await
    } else {
        match angel::supervise(&stream, || tracing::debug!(%stream, "running crash cleanup")).await
        {
            Ok(rc) => rc,
            Err(e) => {
                tracing::error!(error = %e, "supervision failed");
                lock.unlink();
                StatePage::destroy(&stream);
                std::process::exit(42);
            },
        }
    };

    lock.unlink();
    StatePage::destroy(&stream);
    tracing::debug!(%stream, "angel process exiting");
    std::process::exit(rc);
}
