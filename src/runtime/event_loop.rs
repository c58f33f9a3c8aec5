//! The per-worker reactor: accept, non-blocking connect, and the
//! bidirectional splice relay.
//!
//! Grounded on the teacher's `runtime/mio/event_loop.rs` worker-thread
//! shape (one `mio::Poll` + `Events` per thread, a `SO_REUSEPORT`
//! listener shared by address across threads, an accept loop that
//! drains until `WouldBlock`). The connection state machine itself
//! comes from `original_source/src/server_ctx.c`'s `accept_cb` /
//! `connect_cb` / `upstream_cb` / `downstream_cb`, reshaped around the
//! explicit [`crate::runtime::slot::State`] tag instead of the
//! original's implicit "which callback is bound" encoding.
//!
//! Two `mio::Token`s per connection (`down_token`/`up_token`) replace
//! the original's two `ev_io` watchers; both resolve back to a slot
//! index in the worker's [`Pool`], never to a pointer, so there is no
//! cyclic watcher/slot reference to unwind on teardown.

use crate::config::Config;
use crate::net::{self, ConnectOutcome};
use crate::runtime::pipe::{self, SpliceOutcome, MAX_SPLICE_AT_ONCE};
use crate::runtime::pool::Pool;
use crate::runtime::slot::{ConnectionSlot, State};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Fixed token for the shared listening socket.
const LISTENER_TOKEN: Token = Token(usize::MAX);
/// Fixed token for the cross-thread [`Waker`].
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

fn down_token(idx: usize) -> Token {
    Token(idx * 2)
}

fn up_token(idx: usize) -> Token {
    Token(idx * 2 + 1)
}

/// Recover `(slot index, is_upstream)` from a connection token. Returns
/// `None` for the listener/waker sentinels.
fn decode_token(token: Token) -> Option<(usize, bool)> {
    let v = token.0;
    if v >= usize::MAX - 1 {
        return None;
    }
    Some((v / 2, v % 2 == 1))
}

fn mask_to_interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (false, false) => None,
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
    }
}

fn interest_to_mask(interest: Option<Interest>) -> (bool, bool) {
    match interest {
        None => (false, false),
        Some(i) => (i.is_readable(), i.is_writable()),
    }
}

/// One worker's reactor: its listener, pool, and poll instance. Runs on
/// a single dedicated thread; the only thing meant to be touched from
/// another thread is a clone of its [`Waker`] (see [`Worker::waker`]),
/// used to signal shutdown.
pub struct Worker {
    poll: Poll,
    listener: Option<mio::net::TcpListener>,
    waker: Arc<Waker>,
    pool: Pool<ConnectionSlot>,
    config: Arc<Config>,
}

impl Worker {
    /// Build the listener, reactor, and connection pool for one worker
    /// thread. Each worker binds its own copy of the listen socket with
    /// `SO_REUSEPORT`, so the kernel load-balances accepted connections
    /// across workers without any shared accept-mutex.
    pub fn init(config: Arc<Config>) -> io::Result<Self> {
        let std_listener = net::create_listener(&config.listen)?;
        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let pool = Pool::new(config.minconn, config.maxconn);

        Ok(Worker {
            poll,
            listener: Some(listener),
            waker,
            pool,
            config,
        })
    }

    /// A clone of this worker's waker, for the supervisor to hold onto
    /// and call `wake()` on from its own thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Run the reactor loop until woken for shutdown. Blocks the
    /// calling thread.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let token = event.token();

                if token == LISTENER_TOKEN {
                    if let Err(e) = self.handle_accept() {
                        error!(error = %e, "accept loop error");
                    }
                    continue;
                }

                if token == WAKER_TOKEN {
                    debug!("worker woken for shutdown");
                    return Ok(());
                }

                let readable = event.is_readable();
                let writable = event.is_writable();
                if let Err(e) = self.handle_connection_event(token, readable, writable) {
                    debug!(error = %e, "connection event error, tearing down");
                    if let Some((idx, _)) = decode_token(token) {
                        let _ = self.teardown_slot(idx);
                    }
                }
            }
        }
    }

    /// Close the listening socket and stop accepting, without
    /// disturbing connections already relaying.
    fn stop_accept(&mut self) -> io::Result<()> {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            // `listener` drops here, closing the fd.
        }
        Ok(())
    }

    /// Drain the accept queue: acquire a slot *before* calling
    /// `accept()` so that a full pool leaves the pending connection
    /// queued rather than accepted-then-dropped.
    fn handle_accept(&mut self) -> io::Result<()> {
        loop {
            let listener = match &mut self.listener {
                Some(l) => l,
                None => return Ok(()),
            };

            let idx = match self.pool.acquire() {
                Some(idx) => idx,
                None => {
                    warn!("connection pool at capacity, deferring accept");
                    return Ok(());
                }
            };

            match listener.accept() {
                Ok((stream, peer_addr)) => match self.init_client_ctx(idx, stream, peer_addr) {
                    Ok(()) => {
                        self.pool.mark_used(idx);
                        info!(peer = %peer_addr, "accepted connection");
                    }
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "failed to initialize connection");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => match e.raw_os_error() {
                    Some(libc::ENFILE)
                    | Some(libc::EMFILE)
                    | Some(libc::ENOBUFS)
                    | Some(libc::ENOMEM)
                    | Some(libc::EPROTO) => {
                        warn!(error = %e, "transient accept failure");
                        return Ok(());
                    }
                    _ => {
                        error!(error = %e, "fatal accept error, no longer accepting");
                        self.stop_accept()?;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Zero the slot's halves, open the upstream socket and both pipes,
    /// begin the non-blocking connect, and arm the upstream watcher for
    /// WRITE-readiness. The downstream watcher is not armed yet —
    /// nothing is relayed until the upstream connects.
    fn init_client_ctx(
        &mut self,
        idx: usize,
        down_stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        {
            let slot = self.pool.get_mut(idx);
            slot.reset();
        }

        let up_socket = net::create_client_socket(&self.config.upstream)?;
        // Outcome is intentionally not branched on: whether the connect
        // completes synchronously or not, the upstream watcher is armed
        // for WRITE and completion is always confirmed via SO_ERROR in
        // handle_connect_complete. Mirrors the original implementation,
        // which does not special-case a synchronous connect() either.
        let _: ConnectOutcome = net::begin_connect(&up_socket, &self.config.upstream)?;

        let (up_r, up_w) = pipe::create_pipe(self.config.pipe_size)?;
        let (down_r, down_w) = match pipe::create_pipe(self.config.pipe_size) {
            Ok(p) => p,
            Err(e) => {
                let mut r = up_r;
                let mut w = up_w;
                pipe::close_if_live(&mut r);
                pipe::close_if_live(&mut w);
                return Err(e);
            }
        };

        let up_std: std::net::TcpStream = up_socket.into();
        let mut up_stream = TcpStream::from_std(up_std);

        {
            let slot = self.pool.get_mut(idx);
            slot.index = idx;
            slot.state = State::Connecting;
            slot.down.peer = peer_addr.to_string();
            slot.down.pipe_r = down_r;
            slot.down.pipe_w = down_w;
            slot.up.pipe_r = up_r;
            slot.up.pipe_w = up_w;
        }

        if let Err(e) =
            self.poll
                .registry()
                .register(&mut up_stream, up_token(idx), Interest::WRITABLE)
        {
            // `up_stream`/`down_stream` close on drop when this
            // function returns, but the pipe fds already stored into
            // the slot above do not; `reset()` closes them now instead
            // of leaving them pinned on a slot that may sit unused for
            // a while, mirroring the original's `init_client_ctx_error`
            // cleanup.
            let slot = self.pool.get_mut(idx);
            slot.reset();
            return Err(e);
        }

        // Re-borrow after the registry call above.
        let slot = self.pool.get_mut(idx);
        slot.up.stream = Some(up_stream);
        slot.up.armed = Some(Interest::WRITABLE);
        slot.down.stream = Some(down_stream);
        slot.down.armed = None;

        Ok(())
    }

    /// Dispatch one readiness event to the connect-completion or relay
    /// handler depending on the slot's current state. Stale events
    /// against a `Free` slot (a late readiness notification racing a
    /// teardown) are silently dropped.
    fn handle_connection_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let (idx, is_up) = match decode_token(token) {
            Some(v) => v,
            None => return Ok(()),
        };
        if idx >= self.pool.capacity() {
            return Ok(());
        }

        match self.pool.get(idx).state {
            State::Free => Ok(()),
            State::Connecting => {
                if is_up && writable {
                    self.handle_connect_complete(idx)
                } else {
                    Ok(())
                }
            }
            State::Relaying => self.handle_relay_event(idx, is_up, readable, writable),
        }
    }

    /// The upstream socket became writable while a connect was in
    /// flight: check `SO_ERROR`. On success, transition to `Relaying`
    /// and arm both watchers for READ|WRITE; on failure, tear the
    /// connection down.
    fn handle_connect_complete(&mut self, idx: usize) -> io::Result<()> {
        let outcome = {
            let slot = self.pool.get_mut(idx);
            let stream = slot
                .up
                .stream
                .as_ref()
                .expect("Connecting slot must have a live upstream stream");
            net::take_socket_error(&socket2::SockRef::from(stream))
        };

        match outcome {
            Ok(()) => {
                {
                    let slot = self.pool.get_mut(idx);
                    slot.state = State::Relaying;
                }
                let both = mask_to_interest(true, true);
                self.apply_interest(idx, true, both)?;
                self.apply_interest(idx, false, both)?;
                debug!(idx, "upstream connected, relaying");
                Ok(())
            }
            Err(e) => {
                debug!(idx, error = %e, "upstream connect failed");
                self.teardown_slot(idx)
            }
        }
    }

    /// The splice relay. `fired_is_up` identifies which half's socket
    /// just became ready; `other` is the opposite half. WRITE-readiness
    /// drains the *other* half's pipe into this socket; READ-readiness
    /// fills *this* half's pipe from this socket. This is the
    /// EAGAIN-on-`splice()` disambiguation the original implementation
    /// resolves by tracking, per direction, whether the blocking side
    /// was the socket or the pipe.
    ///
    /// Both directions loop their `splice()` calls until `WouldBlock`/
    /// `Eof`/error: `mio`'s reactor is edge-triggered (epoll
    /// `EPOLLET`), unlike the original's level-triggered `libev`, so a
    /// readiness edge that is only partially drained (one `splice()`
    /// moves a full pipe's worth while the socket still holds more)
    /// would otherwise never re-fire — the socket's remaining bytes
    /// would stall until some unrelated event happened to touch this
    /// half again. Draining to `WouldBlock` ensures the mask we compute
    /// below always reflects "genuinely nothing left to move right
    /// now", so the next edge (or the other half's resume flag) is the
    /// only thing that re-arms it.
    fn handle_relay_event(
        &mut self,
        idx: usize,
        fired_is_up: bool,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let mut fatal: Option<io::Error> = None;
        let (mut h_read, mut h_write, other_resume_read, other_resume_write);

        {
            let slot = self.pool.get_mut(idx);
            let (h, other) = if fired_is_up {
                (&mut slot.up, &mut slot.down)
            } else {
                (&mut slot.down, &mut slot.up)
            };

            let (r, w) = interest_to_mask(h.armed);
            h_read = r;
            h_write = w;
            let mut resume_read = false;
            let mut resume_write = false;

            if writable {
                let h_fd = h.stream.as_ref().unwrap().as_raw_fd();
                while other.size > 0 {
                    match pipe::splice(other.pipe_r, h_fd, other.size) {
                        SpliceOutcome::Moved(n) => {
                            other.size -= n;
                            resume_read = true;
                        }
                        SpliceOutcome::WouldBlock => {
                            h_write = false;
                            break;
                        }
                        SpliceOutcome::Eof => {
                            h_write = false;
                            break;
                        }
                        SpliceOutcome::Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
                if other.size == 0 {
                    h_write = false;
                }
            }

            if fatal.is_none() && readable {
                let h_fd = h.stream.as_ref().unwrap().as_raw_fd();
                loop {
                    match pipe::splice(h_fd, h.pipe_w, MAX_SPLICE_AT_ONCE) {
                        SpliceOutcome::Moved(n) => {
                            h.size += n;
                            resume_write = true;
                        }
                        SpliceOutcome::WouldBlock => {
                            h_read = false;
                            break;
                        }
                        SpliceOutcome::Eof => {
                            fatal =
                                Some(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                            break;
                        }
                        SpliceOutcome::Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }

            other_resume_read = resume_read;
            other_resume_write = resume_write;
        }

        if let Some(e) = fatal {
            debug!(idx, error = %e, "relay error, tearing down");
            return self.teardown_slot(idx);
        }

        let new_h_interest = mask_to_interest(h_read, h_write);
        let (other_armed_read, other_armed_write) = {
            let slot = self.pool.get_mut(idx);
            let other = if fired_is_up { &slot.down } else { &slot.up };
            interest_to_mask(other.armed)
        };
        let new_other_interest = mask_to_interest(
            other_armed_read || other_resume_read,
            other_armed_write || other_resume_write,
        );

        self.apply_interest(idx, fired_is_up, new_h_interest)?;
        self.apply_interest(idx, !fired_is_up, new_other_interest)?;
        Ok(())
    }

    /// `_reset_events_mask` equivalent: (de)register a half's socket
    /// with the reactor so its armed interest matches `new`. A `None`
    /// target stops the watcher entirely; `mio::Interest` cannot itself
    /// represent "no interest".
    fn apply_interest(&mut self, idx: usize, is_up: bool, new: Option<Interest>) -> io::Result<()> {
        let token = if is_up { up_token(idx) } else { down_token(idx) };
        let registry = self.poll.registry();
        let slot = self.pool.get_mut(idx);
        let half = if is_up { &mut slot.up } else { &mut slot.down };
        let stream = match half.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        match (half.armed, new) {
            (None, None) => {}
            (Some(_), None) => {
                registry.deregister(stream)?;
                half.armed = None;
            }
            (None, Some(interest)) => {
                registry.register(stream, token, interest)?;
                half.armed = Some(interest);
            }
            (Some(old), Some(interest)) if old == interest => {}
            (Some(_), Some(interest)) => {
                registry.deregister(stream)?;
                registry.register(stream, token, interest)?;
                half.armed = Some(interest);
            }
        }

        Ok(())
    }

    /// Idempotent teardown: deregister both sockets, close both pipes,
    /// drop both streams (closing their fds), and return the slot to
    /// the free stack if it was in use.
    fn teardown_slot(&mut self, idx: usize) -> io::Result<()> {
        let (mut down_stream, mut up_stream, was_used) = {
            let slot = self.pool.get_mut(idx);
            let was_used = slot.state != State::Free;
            let down = slot.down.stream.take();
            let up = slot.up.stream.take();
            slot.reset();
            (down, up, was_used)
        };

        if let Some(s) = down_stream.as_mut() {
            let _ = self.poll.registry().deregister(s);
        }
        if let Some(s) = up_stream.as_mut() {
            let _ = self.poll.registry().deregister(s);
        }
        // down_stream/up_stream drop here, closing their fds.

        if was_used {
            self.pool.release(idx);
        }

        Ok(())
    }

    /// Tear down every in-flight connection. Called by the worker
    /// thread itself just before returning from `run()`, so the pool's
    /// fds don't leak past shutdown waiting for process exit.
    pub fn close_all_connections(&mut self) {
        let indices: Vec<usize> = self.pool.iter_used().collect();
        for idx in indices {
            let _ = self.teardown_slot(idx);
        }
    }

    /// Consume the worker. Dropping `self` closes the listener (if
    /// still open), destroys the reactor, and frees the pool — this
    /// exists to name the operation, not because anything beyond
    /// ordinary `Drop` is required. Assumes `run()` has already
    /// returned.
    pub fn free(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip_down_and_up() {
        assert_eq!(decode_token(down_token(5)), Some((5, false)));
        assert_eq!(decode_token(up_token(5)), Some((5, true)));
        assert_eq!(decode_token(down_token(0)), Some((0, false)));
    }

    #[test]
    fn sentinel_tokens_decode_to_none() {
        assert_eq!(decode_token(LISTENER_TOKEN), None);
        assert_eq!(decode_token(WAKER_TOKEN), None);
    }

    #[test]
    fn mask_interest_conversion_round_trips() {
        assert!(mask_to_interest(false, false).is_none());
        let both = mask_to_interest(true, true).unwrap();
        assert_eq!(interest_to_mask(Some(both)), (true, true));
        let read_only = mask_to_interest(true, false).unwrap();
        assert_eq!(interest_to_mask(Some(read_only)), (true, false));
    }
}
