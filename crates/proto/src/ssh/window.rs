//! Per-channel flow-control window (RFC 4254 Section 5.2).
//!
//! Each channel carries two windows: the *local* window is the credit we
//! granted the peer (debited as inbound data arrives, topped up with
//! WINDOW_ADJUST), and the *remote* window is the credit the peer granted
//! us (outbound writers block on it).
//!
//! - [`consume`](Window::consume) waits until credit is available and is
//!   used on the remote window by outbound writers.
//! - [`consume_and_check`](Window::consume_and_check) debits the local
//!   window without waiting (inbound data beyond the advertised credit is
//!   a protocol violation) and reports when an adjustment should be sent
//!   back: once the outstanding credit falls below half the initial size,
//!   the window is restored to its initial value.
//! - [`expand`](Window::expand) adds credit and wakes waiters, saturating
//!   at 2^32 - 1.
//!
//! Closing the channel fails all waiters with a channel error.

use keel_platform::{KeelError, KeelResult};
use std::sync::Mutex;
use tokio::sync::Notify;

struct State {
    size: u32,
    initial_size: u32,
    max_packet: u32,
    closing: bool,
}

/// A non-negative 32-bit credit counter with waiter notification.
pub struct Window {
    state: Mutex<State>,
    notify: Notify,
}

impl Window {
    /// Creates a window with the given initial credit and packet bound.
    pub fn init(size: u32, max_packet: u32) -> Self {
        Self {
            state: Mutex::new(State {
                size,
                initial_size: size,
                max_packet,
                closing: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Current credit.
    pub fn size(&self) -> u32 {
        self.state.lock().expect("window poisoned").size
    }

    /// Initial credit (the value adjustments restore to).
    pub fn initial_size(&self) -> u32 {
        self.state.lock().expect("window poisoned").initial_size
    }

    /// Maximum packet size bound to this window.
    pub fn max_packet(&self) -> u32 {
        self.state.lock().expect("window poisoned").max_packet
    }

    /// Adds credit, waking any waiters. Saturates at `u32::MAX`.
    pub fn expand(&self, n: u32) {
        {
            let mut state = self.state.lock().expect("window poisoned");
            state.size = state.size.saturating_add(n);
        }
        self.notify.notify_waiters();
    }

    /// Waits until `n` bytes of credit are available and consumes them.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Channel`] once the channel is closing; waiters
    /// are woken and fail rather than hang.
    pub async fn consume(&self, n: u32) -> KeelResult<()> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("window poisoned");
                if state.closing {
                    return Err(KeelError::Channel(
                        "Window closed while waiting for credit".to_string(),
                    ));
                }
                if state.size >= n {
                    state.size -= n;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Waits until any credit is available and consumes up to `n` bytes,
    /// returning how many were granted. Lets writers make progress when
    /// a full chunk exceeds the peer's remaining (or even initial)
    /// window.
    pub async fn consume_up_to(&self, n: u32) -> KeelResult<u32> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("window poisoned");
                if state.closing {
                    return Err(KeelError::Channel(
                        "Window closed while waiting for credit".to_string(),
                    ));
                }
                if state.size > 0 {
                    let granted = state.size.min(n);
                    state.size -= granted;
                    return Ok(granted);
                }
            }
            notified.await;
        }
    }

    /// Consumes credit if immediately available.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut state = self.state.lock().expect("window poisoned");
        if state.closing || state.size < n {
            return false;
        }
        state.size -= n;
        true
    }

    /// Debits `n` bytes of inbound data from the local window and returns
    /// the adjustment to advertise back, if one is due.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] when the peer sent more data than
    /// it had credit for (a flow violation, fatal for the session).
    pub fn consume_and_check(&self, n: u32) -> KeelResult<Option<u32>> {
        let mut state = self.state.lock().expect("window poisoned");
        if n > state.size {
            return Err(KeelError::Protocol(format!(
                "Flow violation: {} bytes received with only {} bytes of window credit",
                n, state.size
            )));
        }
        state.size -= n;
        if state.size < state.initial_size / 2 {
            let adjustment = state.initial_size - state.size;
            state.size = state.initial_size;
            Ok(Some(adjustment))
        } else {
            Ok(None)
        }
    }

    /// Marks the window closing and wakes all waiters exceptionally.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("window poisoned");
            state.closing = true;
        }
        self.notify.notify_waiters();
    }

    /// Whether the window has been closed.
    pub fn is_closing(&self) -> bool {
        self.state.lock().expect("window poisoned").closing
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("window poisoned");
        f.debug_struct("Window")
            .field("size", &state.size)
            .field("initial_size", &state.initial_size)
            .field("max_packet", &state.max_packet)
            .field("closing", &state.closing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_consume_available_credit() {
        let window = Window::init(1000, 256);
        window.consume(400).await.unwrap();
        assert_eq!(window.size(), 600);
    }

    #[tokio::test]
    async fn test_consume_blocks_until_expand() {
        let window = Arc::new(Window::init(100, 256));
        let waiter = Arc::clone(&window);

        let handle = tokio::spawn(async move { waiter.consume(300).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        window.expand(250);
        handle.await.unwrap().unwrap();
        assert_eq!(window.size(), 50);
    }

    #[tokio::test]
    async fn test_consume_fails_on_close() {
        let window = Arc::new(Window::init(0, 256));
        let waiter = Arc::clone(&window);

        let handle = tokio::spawn(async move { waiter.consume(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        window.close();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, KeelError::Channel(_)));
    }

    #[test]
    fn test_expand_saturates() {
        let window = Window::init(u32::MAX - 10, 256);
        window.expand(100);
        assert_eq!(window.size(), u32::MAX);
    }

    #[test]
    fn test_consume_and_check_no_adjustment_above_half() {
        let window = Window::init(1000, 256);
        // 1000 -> 600: still >= 500, no adjustment yet
        assert_eq!(window.consume_and_check(400).unwrap(), None);
        assert_eq!(window.size(), 600);
    }

    #[test]
    fn test_consume_and_check_adjusts_below_half() {
        let window = Window::init(1000, 256);
        assert_eq!(window.consume_and_check(400).unwrap(), None);
        // 600 -> 300: below half, restore to initial
        let adjustment = window.consume_and_check(300).unwrap();
        assert_eq!(adjustment, Some(700));
        assert_eq!(window.size(), 1000);
    }

    #[test]
    fn test_consume_and_check_flow_violation() {
        let window = Window::init(100, 256);
        let err = window.consume_and_check(200).unwrap_err();
        assert!(matches!(err, KeelError::Protocol(_)));
    }

    #[test]
    fn test_try_consume() {
        let window = Window::init(100, 256);
        assert!(window.try_consume(100));
        assert!(!window.try_consume(1));
        window.expand(10);
        assert!(window.try_consume(10));
    }
}
