//! Per-channel send-window flow control (RFC 4254 Section 5.2).
//!
//! The window counts bytes the peer is currently willing to accept.
//! Writers reserve capacity before emitting data packets; the peer's
//! WINDOW_ADJUST messages put capacity back. RFC 4254 allows the window to
//! grow to 2^32 - 1 but never to wrap.

use skiff_platform::{SkiffError, SkiffResult};
use tokio::sync::{Mutex, Notify};

struct WindowState {
    win: u32,
    closed: bool,
}

/// A flow-control window: a `u32` counter paired with a wakeup for blocked
/// reservers.
pub struct SendWindow {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl SendWindow {
    /// Creates a window holding `initial` bytes of capacity.
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                win: initial,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Adds peer-granted capacity. A zero delta is a no-op success. Returns
    /// `false` without changing the window when the addition would wrap,
    /// which the caller must treat as fatal to the connection.
    pub async fn add(&self, delta: u32) -> bool {
        if delta == 0 {
            return true;
        }
        let mut state = self.state.lock().await;
        let Some(next) = state.win.checked_add(delta) else {
            return false;
        };
        state.win = next;
        drop(state);
        // Multiple tasks rarely wait on one window, but nothing forbids it.
        self.notify.notify_waiters();
        true
    }

    /// Reserves up to `want` bytes, waiting while the window is empty. The
    /// grant may be smaller than requested; callers needing the full amount
    /// must loop.
    pub async fn reserve(&self, want: u32) -> SkiffResult<u32> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.win > 0 {
                    let granted = want.min(state.win);
                    state.win -= granted;
                    return Ok(granted);
                }
                if state.closed {
                    return Err(SkiffError::ChannelClosed);
                }
            }
            notified.await;
        }
    }

    /// Marks the window closed and wakes every blocked reserver.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Current capacity.
    pub async fn current(&self) -> u32 {
        self.state.lock().await.win
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_then_reserve() {
        let window = SendWindow::new(0);
        assert!(window.add(100).await);

        assert_eq!(window.reserve(40).await.unwrap(), 40);
        assert_eq!(window.current().await, 60);

        // A reserve beyond capacity grants what is available.
        assert_eq!(window.reserve(500).await.unwrap(), 60);
        assert_eq!(window.current().await, 0);
    }

    #[tokio::test]
    async fn test_add_zero_is_noop() {
        let window = SendWindow::new(7);
        assert!(window.add(0).await);
        assert_eq!(window.current().await, 7);
    }

    #[tokio::test]
    async fn test_add_overflow_fails_and_preserves_window() {
        let window = SendWindow::new(u32::MAX - 5);
        assert!(!window.add(10).await);
        assert_eq!(window.current().await, u32::MAX - 5);

        // Max delta onto a non-zero window also wraps.
        let window = SendWindow::new(1);
        assert!(!window.add(u32::MAX).await);
        assert_eq!(window.current().await, 1);

        // But max delta onto an empty window is fine.
        let window = SendWindow::new(0);
        assert!(window.add(u32::MAX).await);
    }

    #[tokio::test]
    async fn test_reserve_blocks_until_add() {
        use std::sync::Arc;

        let window = Arc::new(SendWindow::new(0));
        let waiter = Arc::clone(&window);
        let task = tokio::spawn(async move { waiter.reserve(10).await });

        // Give the reserver time to block, then grant capacity.
        tokio::task::yield_now().await;
        assert!(window.add(4).await);

        assert_eq!(task.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reserver() {
        use std::sync::Arc;

        let window = Arc::new(SendWindow::new(0));
        let waiter = Arc::clone(&window);
        let task = tokio::spawn(async move { waiter.reserve(1).await });

        tokio::task::yield_now().await;
        window.close().await;

        assert!(matches!(
            task.await.unwrap(),
            Err(SkiffError::ChannelClosed)
        ));
    }
}
