// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The dedicated signal-handling thread. Every other thread has every
//! signal chatty cares about blocked from the moment [`block_signals`]
//! runs (before any are spawned), so only this thread ever observes one,
//! via `sigwait`. SIGUSR2 doubles as an internal "something fatal
//! happened" channel: the listener's `select` loop raises it on itself
//! after an unrecoverable I/O error, which this thread then treats
//! exactly like an operator-sent shutdown signal.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};
use nix::sys::signal::{sigprocmask, sigwait, SigHandler, SigSet, SigmaskHow, Signal};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::ready_queue::POISON;
use crate::self_pipe::ControlOp;

fn shutdown_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGUSR2);
    set
}

/// Blocks every signal chatty handles on the calling thread -- call this
/// before spawning the listener or any worker so the mask is inherited by
/// every thread in the process -- and ignores SIGPIPE outright, since a
/// dead peer is detected from a write's `ErrorKind`, not a signal.
pub fn block_signals() -> Result<SigSet, ServerError> {
    let mut set = shutdown_set();
    set.add(Signal::SIGUSR1);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    unsafe {
        nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(set)
}

/// Waits for one signal at a time from the blocked set: SIGUSR1 dumps
/// stats and loops, any of SIGINT/SIGTERM/SIGQUIT/SIGUSR2 runs the single
/// teardown routine and returns the process's exit code. Blocks the
/// caller (the CLI entry point) for as long as the server runs.
pub fn run(ctx: Arc<ServerContext>, set: SigSet, listener: JoinHandle<Result<(), ServerError>>, workers: Vec<JoinHandle<()>>) -> i32 {
    loop {
        let sig = match sigwait(&set) {
            Ok(sig) => sig,
            Err(e) => {
                error!("sigwait failed: {e}");
                continue;
            }
        };
        match sig {
            Signal::SIGUSR1 => dump_stats(&ctx),
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGUSR2 => {
                info!("received {sig:?}, shutting down");
                return teardown(ctx, listener, workers);
            }
            other => error!("sigwait returned an unrequested signal {other:?}"),
        }
    }
}

fn dump_stats(ctx: &ServerContext) {
    let Some(path) = ctx.config.stat_file_name.as_deref() else {
        return;
    };
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if let Err(e) = ctx.stats.dump(path, epoch) {
        error!("failed to dump stats: {e}");
    }
}

/// The single teardown routine: stop the listener, stop every worker,
/// purge the file store, then let `ctx`'s drop glue free the registries
/// when the last `Arc` goes away.
fn teardown(ctx: Arc<ServerContext>, listener: JoinHandle<Result<(), ServerError>>, workers: Vec<JoinHandle<()>>) -> i32 {
    let mut code = 0;

    if let Err(e) = ctx.self_pipe.send(-1, ControlOp::Terminate) {
        error!("failed to signal listener shutdown: {e}");
        code = 1;
    }
    match listener.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("listener exited with an error: {e}");
            code = 1;
        }
        Err(_) => {
            error!("listener thread panicked");
            code = 1;
        }
    }

    let worker_count = workers.len();
    for _ in 0..worker_count {
        ctx.ready_queue.push(POISON);
    }
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
            code = 1;
        }
    }

    if let Err(e) = ctx.files.purge() {
        error!("failed to purge the file store: {e}");
        code = 1;
    }

    info!("shutdown complete");
    code
}
