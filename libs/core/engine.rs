// Copyright 2018-2026 the Vela authors. MIT license.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::embedder::LibraryLoader;
use crate::error::AnyError;
use crate::error::CoreError;
use crate::snapshot::RawSymbol;
use crate::snapshot::SnapshotBuffer;

/// Name the VM reserves for its diagnostics isolate. A creation request for
/// this URI must never take the generic isolate path.
pub const SERVICE_ISOLATE_NAME: &str = "vela:vm-service";

/// Opaque token for an isolate owned by the VM. The embedder never frees
/// one; it only attaches state to it and reacts to the VM's shutdown
/// notification.
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct IsolateHandle(u64);

impl IsolateHandle {
  pub fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub fn as_raw(self) -> u64 {
    self.0
  }
}

impl fmt::Display for IsolateHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "isolate-{}", self.0)
  }
}

/// Key of the embedder-side state record attached to an isolate at creation.
/// Handed to the VM as opaque callback data and passed back exactly once at
/// shutdown.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IsolateStateToken(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimelineEventKind {
  Begin,
  End,
  Instant,
  Duration,
}

/// Everything handed to the VM in the single initialization call.
pub struct InitParams {
  /// Snapshot backing the VM-global heap, if one was resolved.
  pub vm_snapshot: Option<SnapshotBuffer>,
  /// Precompiled instructions symbol; non-null only in precompiled mode.
  pub instructions_snapshot: Option<RawSymbol>,
  /// Precompiled read-only data symbol; non-null only in precompiled mode.
  pub data_snapshot: Option<RawSymbol>,
  /// The embedder half of the callback contract. The VM holds this for the
  /// rest of the process lifetime and invokes it from its own threads.
  pub callbacks: Arc<dyn EmbedderCallbacks>,
}

/// What a VM binding provides to the engine. One implementation wraps the
/// real VM; `vela_core_testing::FakeVm` drives the same contract in tests.
///
/// All methods take `&self`: the VM serializes what must be serialized
/// internally, and callbacks arrive on arbitrary native threads.
pub trait VmEngine: Send + Sync {
  /// Bootstraps the VM's embedded io subsystem. Must precede any other
  /// call.
  fn bootstrap_io(&self);

  /// Hands the host's temp directory to the VM's io layer.
  fn set_system_temp_directory(&self, path: &str);

  /// Applies the composed startup flag vector. The VM resolves duplicate
  /// flags last-wins, which is what lets user-supplied flags override the
  /// embedder defaults.
  fn set_flags(&self, flags: &[String]) -> Result<(), CoreError>;

  /// Starts the VM. Called at most once per process; a second call is a
  /// contract violation the binding must reject.
  fn initialize(&self, params: InitParams) -> Result<(), CoreError>;

  /// Creates an isolate primed with `snapshot`. `token` is returned
  /// verbatim in the shutdown notification for this isolate.
  fn create_isolate(
    &self,
    script_uri: &str,
    entry_point: &str,
    snapshot: Option<&SnapshotBuffer>,
    token: IsolateStateToken,
  ) -> Result<IsolateHandle, CoreError>;

  /// Whether the VM considers `isolate` its reserved service isolate.
  fn is_service_isolate(&self, isolate: IsolateHandle) -> bool;

  /// Registers the URI-tag resolution callback consumed by the VM's
  /// library loading machinery.
  fn set_library_tag_handler(
    &self,
    isolate: IsolateHandle,
    loader: Arc<dyn LibraryLoader>,
  ) -> Result<(), CoreError>;

  /// Enters `isolate` on the current thread. Prefer [`ActivationScope`],
  /// which guarantees the matching exit on every path.
  fn enter_isolate(&self, isolate: IsolateHandle);

  /// Leaves `isolate` on the current thread. Activations nest strictly.
  fn exit_isolate(&self, isolate: IsolateHandle);

  /// Loads a script snapshot into the isolate. Only valid while the
  /// calling thread holds an activation for `isolate`.
  fn load_snapshot(
    &self,
    isolate: IsolateHandle,
    data: &[u8],
  ) -> Result<(), CoreError>;

  /// Marks the isolate ready to run. Only valid once the creating thread
  /// has exited the isolate.
  fn make_runnable(&self, isolate: IsolateHandle) -> Result<(), CoreError>;

  fn set_capture_stdout(&self, capture: bool);

  fn set_capture_stderr(&self, capture: bool);

  /// Emits one event into the VM's timeline.
  fn timeline_event(
    &self,
    label: &str,
    timestamp0: i64,
    timestamp1_or_id: i64,
    kind: TimelineEventKind,
  );
}

/// What the VM requires of the embedder. Implemented once per process and
/// handed over in [`InitParams`]; the VM invokes it from its own threads at
/// arbitrary points of its execution.
pub trait EmbedderCallbacks: Send + Sync {
  /// Produces an isolate for the requested URI, or `None` when the request
  /// names the service isolate and the build has diagnostics compiled out.
  ///
  /// `parent` is the state token of the immediately enclosing isolate for
  /// child-isolate requests and `None` for the service isolate. An `Err`
  /// reports creation failure back to the VM; this embedder treats every
  /// failure on this path as fatal before it gets that far.
  fn create_isolate(
    &self,
    script_uri: &str,
    entry_point: &str,
    parent: Option<IsolateStateToken>,
  ) -> Result<Option<IsolateHandle>, AnyError>;

  /// Exactly one notification per isolate; the embedder releases the state
  /// record behind `token` here.
  fn shutdown_isolate(&self, token: IsolateStateToken);

  /// A diagnostics client subscribed to `stream_id`. True iff the stream
  /// is recognized and capture was enabled.
  fn stream_listen(&self, stream_id: &str) -> bool;

  /// A diagnostics client unsubscribed; unknown ids are a silent no-op.
  fn stream_cancel(&self, stream_id: &str);

  /// The VM's timeline started recording.
  fn timeline_start(&self);

  /// The VM's timeline stopped recording.
  fn timeline_stop(&self);

  /// Whether `source_url` changed after `since_ms` (epoch milliseconds).
  /// Must report "modified" when it cannot tell.
  fn is_file_modified(&self, source_url: &str, since_ms: i64) -> bool;

  /// One of the VM's internal threads is exiting.
  fn thread_exit(&self) {}

  /// Asset archive backing the diagnostics UI, when the build carries one.
  fn service_assets_archive(&self) -> Option<&'static [u8]> {
    None
  }
}

/// RAII activation of an isolate on the current thread. Exit happens on
/// every path out of the scope, including unwinds on the fatal paths.
pub struct ActivationScope<'a> {
  engine: &'a dyn VmEngine,
  isolate: IsolateHandle,
}

impl<'a> ActivationScope<'a> {
  pub fn enter(engine: &'a dyn VmEngine, isolate: IsolateHandle) -> Self {
    engine.enter_isolate(isolate);
    Self { engine, isolate }
  }

  pub fn isolate(&self) -> IsolateHandle {
    self.isolate
  }

  pub fn engine(&self) -> &dyn VmEngine {
    self.engine
  }
}

impl Drop for ActivationScope<'_> {
  fn drop(&mut self) {
    self.engine.exit_isolate(self.isolate);
  }
}
