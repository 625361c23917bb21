//! Display dispatch thread
//!
//! The only reader of the compositor connection. Blocks in the backend until
//! events arrive, hands them to the display, and exits when shutdown is
//! flagged (the wait is cancelled) or the connection fails.

use super::DisplayInner;
use crate::protocol::DispatchStatus;
use log::{info, trace};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(super) fn run(inner: Arc<DisplayInner>) {
    info!("🧵 Display dispatch thread started");
    let mut events = Vec::new();

    while !inner.shutdown.load(Ordering::Acquire) {
        match inner.backend.dispatch_blocking(&mut events) {
            Ok(DispatchStatus::Dispatched) => {
                for event in events.drain(..) {
                    trace!("📨 {:?}", event);
                    inner.handle_event(&event);
                }
            }
            Ok(DispatchStatus::Cancelled) => {
                trace!("Dispatch wait cancelled");
            }
            Err(err) => {
                if !inner.shutdown.load(Ordering::Acquire) {
                    inner.fail(err);
                }
                break;
            }
        }
    }

    info!("🧵 Display dispatch thread stopped");
}
