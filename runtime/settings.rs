// Copyright 2018-2026 the Vela authors. MIT license.

use std::path::PathBuf;

pub const DEFAULT_SERVICE_PORT: u16 = 8181;

/// Read-only snapshot of the host options this core consumes. Captured once
/// by the embedder before `bootstrap_vm` and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct Settings {
  /// Serve the diagnostics protocol from the service isolate.
  pub enable_service: bool,
  /// Port for the diagnostics transport; the address is always loopback.
  pub service_port: u16,
  /// Host preference for checked mode. Overridden to off in precompiled
  /// mode and to on by the `strict` build feature.
  pub checked_mode: bool,
  /// Pause every isolate at startup until a debugger resumes it.
  pub start_paused: bool,
  /// Record timeline streams from the first instruction.
  pub trace_startup: bool,
  /// Directory holding the precompiled snapshot assets. Required whenever
  /// the asset resolver strategy is active.
  pub aot_snapshot_path: Option<PathBuf>,
  /// Handed to the VM's io layer before flags are composed.
  pub temp_directory_path: Option<PathBuf>,
  /// A single space-separated string of extra VM flags, appended after the
  /// embedder defaults so the VM's last-wins resolution favors them.
  pub extra_flags: Option<String>,
  /// Timestamp (epoch microseconds) of engine entry, emitted as a timeline
  /// event once the VM is up so traces cover the whole startup.
  pub engine_start_timestamp: Option<i64>,
  /// Asset archive backing the diagnostics UI, when the build embeds one.
  pub service_assets_archive: Option<&'static [u8]>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      enable_service: false,
      service_port: DEFAULT_SERVICE_PORT,
      checked_mode: false,
      start_paused: false,
      trace_startup: false,
      aot_snapshot_path: None,
      temp_directory_path: None,
      extra_flags: None,
      engine_start_timestamp: None,
      service_assets_archive: None,
    }
  }
}
