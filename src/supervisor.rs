//! Process-level orchestration: install signal handlers, spawn one
//! worker per configured thread, and drive an orderly shutdown.
//!
//! Grounded on `original_source/src/tcp-proxy.c`'s `main()` /
//! `sig_handler()` / `run_event_loop()`. The "still alive after 2s"
//! liveness poll is a direct port of that file's
//! `pthread_kill(tid, 0) != ESRCH` loop, reworked around a per-worker
//! `Arc<AtomicBool>` flag since `JoinHandle` has no non-blocking
//! liveness check.

use crate::config::Config;
use crate::runtime::event_loop::Worker;
use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Set by `handle_termination` on SIGINT/SIGTERM. A signal handler may
/// not safely log or allocate, so it does nothing but flip this flag;
/// the supervisor's poll loop is what actually logs the transition.
static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination(_signum: libc::c_int) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers and ignore SIGPIPE outright, so a
/// write to a peer that reset the connection surfaces as `EPIPE` on the
/// failing splice call instead of killing the process.
fn install_signal_handlers() -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    Ok(())
}

/// Block every signal on the calling thread. Worker threads do this so
/// that SIGINT/SIGTERM/SIGPIPE are always handled on the main thread,
/// matching the original's `pthread_sigmask(SIG_BLOCK, ...)` inside
/// `run_event_loop` (mio's `Poll` already never touches the process
/// sigmask itself, satisfying the rest of `EVFLAG_NOSIGMASK`'s intent).
fn block_all_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

struct WorkerHandle {
    join: JoinHandle<()>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

/// Spawn `config.nproc` worker threads, block until a termination
/// signal arrives, then wake every worker and give them up to two
/// seconds (polled in 100ms increments) to exit before giving up on
/// them and returning anyway.
pub fn run(config: Arc<Config>) -> std::io::Result<()> {
    install_signal_handlers()?;

    info!(workers = config.nproc, "starting event loops");

    let mut handles = Vec::with_capacity(config.nproc);
    for _ in 0..config.nproc {
        let mut worker = Worker::init(Arc::clone(&config))?;
        let waker = worker.waker();
        let running = Arc::new(AtomicBool::new(true));
        let running_in_thread = Arc::clone(&running);

        let join = thread::spawn(move || {
            block_all_signals();
            if let Err(e) = worker.run() {
                error!(error = %e, "worker reactor exited with error");
            }
            worker.close_all_connections();
            worker.free();
            running_in_thread.store(false, Ordering::SeqCst);
        });

        handles.push(WorkerHandle {
            join,
            waker,
            running,
        });
    }

    while !SHOULD_EXIT.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("caught termination signal");

    info!("signaling all event loops to exit");
    for handle in &handles {
        let _ = handle.waker.wake();
    }

    // Give threads up to 2s to gracefully terminate; start with a small
    // sleep since they can't possibly be done yet.
    let mut still_alive = true;
    for _ in 0..20 {
        if !still_alive {
            break;
        }
        thread::sleep(Duration::from_millis(100));
        still_alive = handles.iter().any(|h| h.running.load(Ordering::SeqCst));
    }

    if still_alive {
        warn!("some workers still alive after 2s, abandoning them to process exit");
        return Ok(());
    }

    for handle in handles {
        let _ = handle.join.join();
    }

    info!("exiting");
    Ok(())
}
