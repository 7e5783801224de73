// Copyright 2018-2026 the Vela authors. MIT license.

use parking_lot::Mutex;

pub type TimelineCallback = Box<dyn Fn() + Send + Sync>;

/// A start/stop pair the VM's timeline subsystem invokes when external
/// tracing clients attach and detach.
pub struct TimelineCallbacks {
  start_tracing_callback: TimelineCallback,
  stop_tracing_callback: TimelineCallback,
}

impl TimelineCallbacks {
  pub fn new(start: TimelineCallback, stop: TimelineCallback) -> Self {
    Self {
      start_tracing_callback: start,
      stop_tracing_callback: stop,
    }
  }
}

/// Slot holding the optional embedder tracing pair. Set during
/// single-threaded startup, read-only once the VM is live; the guard for
/// late setting lives on `VmHost`, which owns the moment the VM goes live.
#[derive(Default)]
pub(crate) struct TimelineBridge {
  callbacks: Mutex<Option<TimelineCallbacks>>,
}

impl TimelineBridge {
  pub fn set(&self, callbacks: TimelineCallbacks) {
    *self.callbacks.lock() = Some(callbacks);
  }

  pub fn notify_start(&self) {
    if let Some(callbacks) = &*self.callbacks.lock() {
      (callbacks.start_tracing_callback)();
    }
  }

  pub fn notify_stop(&self) {
    if let Some(callbacks) = &*self.callbacks.lock() {
      (callbacks.stop_tracing_callback)();
    }
  }
}
