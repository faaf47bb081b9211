// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::error;

use chatty::config::Config;
use chatty::context::ServerContext;
use chatty::{listener, signals, worker};

#[derive(Parser)]
struct Cli {
    /// Path to the server's configuration file.
    #[arg(short = 'f', long = "config")]
    config: std::path::PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Cli::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    let threads_in_pool = config.threads_in_pool;

    let ctx = match ServerContext::new(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("failed to initialise server state: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Block every signal chatty handles before spawning anything else, so
    // the listener and worker threads inherit the same mask and never
    // field one themselves.
    let sigset = match signals::block_signals() {
        Ok(set) => set,
        Err(e) => {
            error!("failed to configure signal handling: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener_handle = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || listener::run(ctx))
    };

    let worker_handles: Vec<_> = (0..threads_in_pool)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || worker::run(ctx))
        })
        .collect();

    let code = signals::run(ctx, sigset, listener_handle, worker_handles);
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
