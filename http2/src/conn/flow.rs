//! Credit-based flow control.
//!
//! One [`FlowControl`] instance tracks both directions for a single
//! scope (the connection, or one stream). The send window is credit the
//! peer has extended to us; the receive window is credit we have
//! extended to the peer. Both start at the scope's initial window size.

use std::fmt;

/// Largest legal window value (2^31 - 1).
pub const MAX_WINDOW: i64 = 0x7FFF_FFFF;

/// Flow-control accounting errors. All of them are protocol errors that
/// terminate the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// WINDOW_UPDATE would push the send window past 2^31 - 1.
    WindowOverflow,
    /// Peer sent more data than the receive window allowed.
    WindowUnderflow,
    /// WINDOW_UPDATE increment outside [1, 2^31 - 1].
    BadIncrement(u32),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::WindowOverflow => write!(f, "window update overflows 2^31-1"),
            FlowError::WindowUnderflow => write!(f, "received data exceeds flow window"),
            FlowError::BadIncrement(inc) => write!(f, "invalid window increment {}", inc),
        }
    }
}

impl std::error::Error for FlowError {}

/// Flow-control state for one scope.
#[derive(Debug)]
pub struct FlowControl {
    /// Credit for outgoing DATA. May go negative after a SETTINGS
    /// INITIAL_WINDOW_SIZE reduction.
    send: i64,
    /// Credit extended to the peer for incoming DATA.
    recv: i64,
    /// Replenish target for the receive window.
    initial_recv: i64,
}

impl FlowControl {
    pub fn new(initial_send: u32, initial_recv: u32) -> Self {
        Self {
            send: initial_send as i64,
            recv: initial_recv as i64,
            initial_recv: initial_recv as i64,
        }
    }

    /// Bytes of DATA that may be sent right now.
    pub fn send_available(&self) -> usize {
        self.send.max(0) as usize
    }

    /// Account for sent payload bytes. Callers must have checked
    /// [`send_available`](Self::send_available) first.
    pub fn consume_send(&mut self, n: usize) {
        debug_assert!(n <= self.send_available());
        self.send -= n as i64;
    }

    /// Apply a WINDOW_UPDATE from the peer.
    pub fn window_update(&mut self, increment: u32) -> Result<(), FlowError> {
        if increment == 0 || increment as i64 > MAX_WINDOW {
            return Err(FlowError::BadIncrement(increment));
        }
        let updated = self.send + increment as i64;
        if updated > MAX_WINDOW {
            return Err(FlowError::WindowOverflow);
        }
        self.send = updated;
        Ok(())
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta to the send window.
    pub fn adjust_send(&mut self, delta: i64) {
        self.send += delta;
    }

    /// Account for received payload bytes.
    ///
    /// Returns the WINDOW_UPDATE increment to emit when the window has
    /// dropped below half of its initial size; the window is restored to
    /// the initial size at that point.
    pub fn consume_recv(&mut self, n: usize) -> Result<Option<u32>, FlowError> {
        let n = n as i64;
        if n > self.recv {
            return Err(FlowError::WindowUnderflow);
        }
        self.recv -= n;

        // Below half, without the truncation of `initial_recv / 2`: for
        // an odd initial window the boundary value must already fire.
        if self.recv * 2 < self.initial_recv {
            let increment = (self.initial_recv - self.recv) as u32;
            self.recv = self.initial_recv;
            if increment > 0 {
                return Ok(Some(increment));
            }
        }
        Ok(None)
    }

    #[cfg(test)]
    pub(crate) fn send_window(&self) -> i64 {
        self.send
    }

    #[cfg(test)]
    pub(crate) fn recv_window(&self) -> i64 {
        self.recv
    }
}
