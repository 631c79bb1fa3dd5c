//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level,
//! and each level has two independent windows: the send window the peer
//! grants us and the receive window we grant the peer.

use super::error::{Error, ErrorCode, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Received bytes are returned to the peer once this many accumulate, or
/// once they exceed what the peer may still send
pub const WINDOW_UPDATE_THRESHOLD: u32 = 4 << 10;

/// Send window
///
/// Tracks how many bytes we may still send. A SETTINGS change can push the
/// window negative; sends then block until WINDOW_UPDATE brings it back
/// above zero.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Current window size (can be negative after a SETTINGS shrink)
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Bytes that may be sent now (never negative)
    pub fn available(&self) -> u64 {
        self.current_size.max(0) as u64
    }


    /// Consume window capacity for sending data
    ///
    /// Returns the amount actually granted, which never exceeds the
    /// available capacity.
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = (amount as u64).min(self.available()) as usize;
        self.current_size -= granted as i64;
        granted
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::connection(
                ErrorCode::FlowControlError,
                format!("window size {} exceeds maximum (2^31-1)", new_size),
            ));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Apply a signed change from SETTINGS_INITIAL_WINDOW_SIZE
    pub fn apply_delta(&mut self, delta: i64) -> Result<()> {
        let new_size = self.current_size + delta;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::connection(
                ErrorCode::FlowControlError,
                format!("window size {} exceeds maximum (2^31-1)", new_size),
            ));
        }
        self.current_size = new_size;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive window
///
/// `avail` is what the peer may still send; `unsent` is what the
/// application has consumed but we have not yet announced.
#[derive(Debug, Clone)]
pub struct InboundWindow {
    avail: u32,
    unsent: u32,
}

impl InboundWindow {
    /// Create a receive window granting `size` bytes
    pub fn new(size: u32) -> Self {
        InboundWindow { avail: size, unsent: 0 }
    }

    /// Bytes the peer may still send
    pub fn available(&self) -> u32 {
        self.avail
    }

    /// Account for received bytes; false if the peer overran the window
    pub fn take(&mut self, amount: u32) -> bool {
        if amount > self.avail {
            return false;
        }
        self.avail -= amount;
        true
    }

    /// Return consumed bytes to the peer
    ///
    /// Returns the WINDOW_UPDATE increment to send, if the accumulated
    /// amount is worth announcing.
    pub fn release(&mut self, amount: u32) -> Option<u32> {
        let unsent = self.unsent as u64 + amount as u64;
        let ceiling = (MAX_WINDOW_SIZE - self.avail) as u64;
        let unsent = unsent.min(ceiling) as u32;
        if unsent < WINDOW_UPDATE_THRESHOLD && unsent < self.avail {
            self.unsent = unsent;
            return None;
        }
        self.unsent = 0;
        if unsent == 0 {
            return None;
        }
        self.avail += unsent;
        Some(unsent)
    }

    /// Grow the window immediately (e.g. the initial connection update)
    pub fn grow(&mut self, increment: u32) {
        self.avail = self.avail.saturating_add(increment).min(MAX_WINDOW_SIZE);
    }
}

/// Connection-level flow control
#[derive(Debug)]
pub struct ConnectionFlowControl {
    /// Send window (outbound data)
    send_window: FlowControlWindow,
    /// Receive window (inbound data)
    recv_window: InboundWindow,
}

impl ConnectionFlowControl {
    /// Create new connection-level flow control with protocol defaults
    pub fn new() -> Self {
        Self::with_initial_sizes(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create with specified initial window sizes
    pub fn with_initial_sizes(send_size: u32, recv_size: u32) -> Self {
        ConnectionFlowControl {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: InboundWindow::new(recv_size),
        }
    }

    /// Get send window
    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    /// Get receive window
    pub fn recv_window(&self) -> &InboundWindow {
        &self.recv_window
    }

    /// Get mutable receive window
    pub fn recv_window_mut(&mut self) -> &mut InboundWindow {
        &mut self.recv_window
    }

    /// Consume send window for outbound data
    pub fn consume_send_window(&mut self, amount: usize) -> usize {
        self.send_window.consume(amount)
    }

    /// Increase send window from WINDOW_UPDATE
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send_window.increase(increment)
    }
}

impl Default for ConnectionFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes a DATA frame of up to `max` may carry under both send windows
pub fn sendable(conn: &FlowControlWindow, stream: &FlowControlWindow, max: usize) -> usize {
    (max as u64).min(conn.available()).min(stream.available()) as usize
}
