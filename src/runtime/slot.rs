//! Per-connection state: the slot, its two half-duplex directions, and
//! the explicit state tag.
//!
//! Grounded on `original_source/src/server_ctx.h`'s `client_ctx_t`
//! (`struct upstream`/`struct downstream`, each an `ev_io` + pipe fds +
//! buffered-byte count), reshaped per spec.md's Design Notes §9 "tagged
//! state" redesign flag: state is an explicit `State` enum instead of
//! being implicit in which callback is bound and which `ev_io` events
//! are armed. Watchers don't back-reference their slot (spec.md Design
//! Notes §9's "cyclic references" note); the event loop looks slots up
//! in the worker's [`super::pool::Pool`] by index, recovered from the
//! `mio::Token` on each readiness event.

use crate::runtime::pipe::close_if_live;
use mio::net::TcpStream;
use mio::Interest;
use std::os::fd::RawFd;

/// Explicit connection state, replacing the original's "which callback
/// is bound + which events are armed" implicit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Slot is on the free stack; both halves are unused (`fd == -1`).
    Free,
    /// Upstream `connect()` is in progress; only `up`'s WRITE-ready
    /// watcher is armed, bound to the connect-completion callback.
    Connecting,
    /// Both directions are relaying; watchers are armed per
    /// `Half::armed` and bound to the splice relay callback.
    Relaying,
}

impl Default for State {
    fn default() -> Self {
        State::Free
    }
}

/// One half-duplex direction: a socket, the pipe it splices through,
/// and the readiness mask currently registered with the reactor.
pub struct Half {
    /// `None` when this half's socket is unused (`fd == -1` in spec terms).
    pub stream: Option<TcpStream>,
    /// Pipe read end, or -1 when unused.
    pub pipe_r: RawFd,
    /// Pipe write end, or -1 when unused.
    pub pipe_w: RawFd,
    /// Bytes spliced into `pipe_w` and not yet spliced out of `pipe_r`.
    pub size: usize,
    /// Interest currently registered with the reactor for `stream`.
    /// `None` means the watcher is stopped (not registered at all).
    pub armed: Option<Interest>,
    /// Printable peer address (downstream half only; empty otherwise).
    pub peer: String,
}

impl Default for Half {
    fn default() -> Self {
        Half {
            stream: None,
            pipe_r: -1,
            pipe_w: -1,
            size: 0,
            armed: None,
            peer: String::new(),
        }
    }
}

impl Half {
    /// `true` if this half has no live socket — the "fd == -1" state.
    pub fn is_unused(&self) -> bool {
        self.stream.is_none()
    }

    /// Close the pipe ends, idempotently, and mark them unused.
    fn close_pipe(&mut self) {
        close_if_live(&mut self.pipe_r);
        close_if_live(&mut self.pipe_w);
        self.size = 0;
    }
}

/// One connection's full state: stable pool index, both halves, and the
/// explicit state tag.
pub struct ConnectionSlot {
    /// Stable position in the pool; used to return this slot to the
    /// free stack and to compute its `mio::Token`s.
    pub index: usize,
    pub state: State,
    /// downstream -> pipe -> upstream
    pub down: Half,
    /// upstream -> pipe -> downstream
    pub up: Half,
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        ConnectionSlot {
            index: 0,
            state: State::Free,
            down: Half::default(),
            up: Half::default(),
        }
    }
}

impl ConnectionSlot {
    /// Idempotent teardown: for each fd, if it is live, stop any
    /// attached watcher (implicit in dropping the `TcpStream`, which
    /// deregisters nothing by itself — callers must `deregister` before
    /// dropping if a `Poll` is live) and close it. In-flight bytes in
    /// the pipes are dropped; there is no attempt to drain them first.
    pub fn reset(&mut self) {
        self.down.stream = None;
        self.up.stream = None;
        self.down.armed = None;
        self.up.armed = None;
        self.down.close_pipe();
        self.up.close_pipe();
        self.down.peer.clear();
        self.state = State::Free;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slot_has_all_fds_unused() {
        let slot = ConnectionSlot::default();
        assert_eq!(slot.state, State::Free);
        assert!(slot.down.is_unused());
        assert!(slot.up.is_unused());
        assert_eq!(slot.down.pipe_r, -1);
        assert_eq!(slot.up.pipe_w, -1);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut slot = ConnectionSlot::default();
        slot.state = State::Relaying;
        slot.down.size = 42;
        slot.reset();
        slot.reset();
        assert_eq!(slot.state, State::Free);
        assert_eq!(slot.down.size, 0);
    }
}
