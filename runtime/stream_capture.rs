// Copyright 2018-2026 the Vela authors. MIT license.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use vela_core::VmEngine;

pub const STDOUT_STREAM_ID: &str = "Stdout";
pub const STDERR_STREAM_ID: &str = "Stderr";

/// Turns redirection of the process's stdout/stderr into the VM's
/// diagnostic streams on and off, as diagnostic clients subscribe. Unknown
/// stream ids belong to other subsystems and are left alone.
pub struct StreamCaptureController {
  engine: Arc<dyn VmEngine>,
  stdout: AtomicBool,
  stderr: AtomicBool,
}

impl StreamCaptureController {
  pub fn new(engine: Arc<dyn VmEngine>) -> Self {
    Self {
      engine,
      stdout: AtomicBool::new(false),
      stderr: AtomicBool::new(false),
    }
  }

  /// True iff `stream_id` names a known stream, which is now captured.
  pub fn enable(&self, stream_id: &str) -> bool {
    match stream_id {
      STDOUT_STREAM_ID => {
        self.stdout.store(true, Ordering::SeqCst);
        self.engine.set_capture_stdout(true);
        true
      }
      STDERR_STREAM_ID => {
        self.stderr.store(true, Ordering::SeqCst);
        self.engine.set_capture_stderr(true);
        true
      }
      _ => false,
    }
  }

  pub fn disable(&self, stream_id: &str) {
    match stream_id {
      STDOUT_STREAM_ID => {
        self.stdout.store(false, Ordering::SeqCst);
        self.engine.set_capture_stdout(false);
      }
      STDERR_STREAM_ID => {
        self.stderr.store(false, Ordering::SeqCst);
        self.engine.set_capture_stderr(false);
      }
      _ => {}
    }
  }

  pub fn is_capturing_stdout(&self) -> bool {
    self.stdout.load(Ordering::SeqCst)
  }

  pub fn is_capturing_stderr(&self) -> bool {
    self.stderr.load(Ordering::SeqCst)
  }
}
