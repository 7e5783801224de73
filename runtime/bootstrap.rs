// Copyright 2018-2026 the Vela authors. MIT license.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use vela_core::error::AnyError;
use vela_core::AssetBundleOpener;
use vela_core::BindingsInstaller;
use vela_core::EmbedderCallbacks;
use vela_core::InitParams;
use vela_core::IsolateClient;
use vela_core::IsolateHandle;
use vela_core::IsolateStateToken;
use vela_core::LibraryLoader;
use vela_core::ServiceTransport;
use vela_core::SnapshotBuffer;
use vela_core::SymbolResolver;
use vela_core::TimelineEventKind;
use vela_core::VmEngine;
use vela_core::DATA_SNAPSHOT_SYMBOL;
use vela_core::INSTRUCTIONS_SNAPSHOT_SYMBOL;
use vela_core::ISOLATE_SNAPSHOT_SYMBOL;
use vela_core::SERVICE_ISOLATE_NAME;
use vela_core::ExecutionMode;
use vela_core::VM_SNAPSHOT_SYMBOL;

use crate::flags;
use crate::fs_util;
use crate::isolate;
use crate::isolate::IsolateRegistry;
use crate::service_isolate;
use crate::service_isolate::ExtensionRegistrationHook;
use crate::service_isolate::ServiceIsolateHook;
use crate::service_isolate::ServiceIsolateState;
use crate::settings::Settings;
use crate::snapshot;
use crate::stream_capture::StreamCaptureController;
use crate::timeline::TimelineBridge;
use crate::timeline::TimelineCallbacks;

/// Everything a host supplies to stand up the VM. The engine and resolver
/// are mandatory; the remaining seams have obvious null implementations for
/// hosts that do not use them.
pub struct VmHostOptions {
  pub engine: Arc<dyn VmEngine>,
  pub resolver: Arc<dyn SymbolResolver>,
  pub settings: Settings,
  pub asset_opener: Arc<dyn AssetBundleOpener>,
  pub library_loader: Arc<dyn LibraryLoader>,
  pub bindings: Vec<Arc<dyn BindingsInstaller>>,
  pub isolate_client: Arc<dyn IsolateClient>,
  /// Transport behind the service isolate's diagnostics protocol. Required
  /// only when `settings.enable_service` is set.
  pub service_transport: Option<Arc<dyn ServiceTransport>>,
  /// Runs after flag application and before the VM starts; compiled out of
  /// product builds along with the rest of the diagnostics surface.
  pub debugger_preinit: Option<Box<dyn FnOnce() + Send>>,
  /// Forwarded whenever one of the VM's internal threads exits.
  pub thread_exit_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

/// The single-instance context object behind every VM callback: the
/// engine's process state, the isolate-state arena, the diagnostics
/// configuration surface, and the timeline bridge. Owning all of it in one
/// explicit object (instead of ambient globals) is what makes the
/// "no registration after init" rules checkable preconditions.
///
/// The VM itself is process-global, so creating more than one `VmHost`
/// over a real engine binding is the embedder's error; the host enforces
/// single initialization of itself and the engine rejects a second
/// `initialize` regardless.
pub struct VmHost {
  pub(crate) engine: Arc<dyn VmEngine>,
  pub(crate) resolver: Arc<dyn SymbolResolver>,
  pub(crate) settings: Settings,
  pub(crate) asset_opener: Arc<dyn AssetBundleOpener>,
  pub(crate) library_loader: Arc<dyn LibraryLoader>,
  pub(crate) bindings: Vec<Arc<dyn BindingsInstaller>>,
  pub(crate) isolate_client: Arc<dyn IsolateClient>,
  #[cfg_attr(not(feature = "vm_service"), allow(dead_code))]
  pub(crate) service_transport: Option<Arc<dyn ServiceTransport>>,
  #[cfg_attr(not(feature = "vm_service"), allow(dead_code))]
  debugger_preinit: Mutex<Option<Box<dyn FnOnce() + Send>>>,
  thread_exit_hook: Option<Box<dyn Fn() + Send + Sync>>,
  pub(crate) isolates: IsolateRegistry,
  pub(crate) service_state: ServiceIsolateState,
  timeline: TimelineBridge,
  stream_capture: StreamCaptureController,
  /// Resolved once, shared read-only across every isolate creation.
  isolate_snapshot: OnceCell<Option<SnapshotBuffer>>,
  vm_live: AtomicBool,
}

impl VmHost {
  pub fn new(options: VmHostOptions) -> Arc<Self> {
    let stream_capture =
      StreamCaptureController::new(options.engine.clone());
    Arc::new(Self {
      engine: options.engine,
      resolver: options.resolver,
      settings: options.settings,
      asset_opener: options.asset_opener,
      library_loader: options.library_loader,
      bindings: options.bindings,
      isolate_client: options.isolate_client,
      service_transport: options.service_transport,
      debugger_preinit: Mutex::new(options.debugger_preinit),
      thread_exit_hook: options.thread_exit_hook,
      isolates: IsolateRegistry::default(),
      service_state: ServiceIsolateState::default(),
      timeline: TimelineBridge::default(),
      stream_capture,
      isolate_snapshot: OnceCell::new(),
      vm_live: AtomicBool::new(false),
    })
  }

  /// Brings the VM up: io bootstrap, flag composition and application,
  /// debugger pre-init, global bindings, then the one initialization call
  /// that hands the VM its snapshots and this host as its callbacks.
  ///
  /// Called exactly once, from the host's main thread, before anything can
  /// spawn isolates. Every failure here is fatal: the process must not
  /// continue on a partially initialized VM.
  pub fn bootstrap_vm(self: &Arc<Self>) {
    assert!(
      !self.vm_live.swap(true, Ordering::SeqCst),
      "bootstrap_vm may only be called once"
    );

    self.engine.bootstrap_io();
    if let Some(temp_directory) = &self.settings.temp_directory_path {
      self
        .engine
        .set_system_temp_directory(&temp_directory.to_string_lossy());
    }

    let precompiled = self.is_running_precompiled_code();
    let args = flags::compose_flags(precompiled, &self.settings);
    debug!("starting VM with flags {args:?}");
    if let Err(error) = self.engine.set_flags(&args) {
      panic!("{error}");
    }

    #[cfg(feature = "vm_service")]
    if let Some(preinit) = self.debugger_preinit.lock().take() {
      // Must run before the VM starts; the debugger attaches to isolates
      // from their first instruction.
      preinit();
    }

    for bindings in &self.bindings {
      if let Err(error) = bindings.init_global() {
        panic!("failed to install global bindings: {error:#}");
      }
    }

    // The callbacks object carries the timeline bridge and the
    // file-modification check; handing it over before any isolate can
    // exist keeps those hooks race-free.
    let params = InitParams {
      vm_snapshot: self
        .resolver
        .lookup(VM_SNAPSHOT_SYMBOL)
        .map(SnapshotBuffer::from),
      instructions_snapshot: self
        .resolver
        .lookup(INSTRUCTIONS_SNAPSHOT_SYMBOL),
      data_snapshot: self.resolver.lookup(DATA_SNAPSHOT_SYMBOL),
      callbacks: self.clone(),
    };
    if let Err(error) = self.engine.initialize(params) {
      panic!("error while initializing the VM: {error}");
    }

    // The earliest timestamp of the application lifecycle; the span from
    // here to first frame is the startup cost external tracing wants.
    if let Some(timestamp) = self.settings.engine_start_timestamp {
      self.engine.timeline_event(
        "VelaEngineMainEnter",
        timestamp,
        timestamp,
        TimelineEventKind::Duration,
      );
    }
  }

  pub fn is_running_precompiled_code(&self) -> bool {
    snapshot::is_running_precompiled_code(&*self.resolver)
  }

  pub fn execution_mode(&self) -> ExecutionMode {
    snapshot::execution_mode(&*self.resolver)
  }

  /// Registers the tracing pair the VM's timeline subsystem drives. The
  /// pair is read-only once the VM is live, so late registration is fatal.
  pub fn set_timeline_callbacks(&self, callbacks: TimelineCallbacks) {
    assert!(
      !self.vm_live.load(Ordering::SeqCst),
      "timeline callbacks must be registered before the VM starts"
    );
    self.timeline.set(callbacks);
  }

  /// See [`ServiceIsolateHook`]. Fatal once the service isolate exists.
  pub fn set_service_isolate_hook(&self, hook: ServiceIsolateHook) {
    self.service_state.set_service_hook(hook);
  }

  /// See [`ExtensionRegistrationHook`]. Fatal once the service isolate
  /// exists.
  pub fn set_extension_registration_hook(
    &self,
    hook: ExtensionRegistrationHook,
  ) {
    self.service_state.set_extension_hook(hook);
  }

  pub fn service_isolate_initialized(&self) -> bool {
    self.service_state.is_initialized()
  }

  /// Allocates the root of the isolate-state tree. The engine layer calls
  /// this when it creates the main isolate and threads the token through
  /// the VM as that isolate's callback data.
  pub fn register_root_isolate(
    &self,
    script_uri: &str,
  ) -> IsolateStateToken {
    self.isolates.allocate_root(script_uri)
  }

  pub fn stream_capture(&self) -> &StreamCaptureController {
    &self.stream_capture
  }

  pub(crate) fn isolate_snapshot_buffer(&self) -> Option<&SnapshotBuffer> {
    self
      .isolate_snapshot
      .get_or_init(|| {
        self
          .resolver
          .lookup(ISOLATE_SNAPSHOT_SYMBOL)
          .map(SnapshotBuffer::from)
      })
      .as_ref()
  }
}

fn is_service_isolate_url(script_uri: &str) -> bool {
  script_uri == SERVICE_ISOLATE_NAME
}

impl EmbedderCallbacks for VmHost {
  fn create_isolate(
    &self,
    script_uri: &str,
    entry_point: &str,
    parent: Option<IsolateStateToken>,
  ) -> Result<Option<IsolateHandle>, AnyError> {
    if is_service_isolate_url(script_uri) {
      let handle = service_isolate::create(self, script_uri)
        .unwrap_or_else(|error| {
          panic!("failed to create the service isolate: {error:#}")
        });
      return Ok(handle);
    }

    let handle =
      isolate::create_isolate(self, script_uri, entry_point, parent)
        .unwrap_or_else(|error| {
          panic!("failed to create isolate {script_uri}: {error:#}")
        });
    Ok(Some(handle))
  }

  fn shutdown_isolate(&self, token: IsolateStateToken) {
    self.isolates.release(token);
  }

  fn stream_listen(&self, stream_id: &str) -> bool {
    self.stream_capture.enable(stream_id)
  }

  fn stream_cancel(&self, stream_id: &str) {
    self.stream_capture.disable(stream_id)
  }

  fn timeline_start(&self) {
    self.timeline.notify_start();
  }

  fn timeline_stop(&self) {
    self.timeline.notify_stop();
  }

  fn is_file_modified(&self, source_url: &str, since_ms: i64) -> bool {
    fs_util::is_file_modified(source_url, since_ms)
  }

  fn thread_exit(&self) {
    if let Some(hook) = &self.thread_exit_hook {
      hook();
    }
  }

  fn service_assets_archive(&self) -> Option<&'static [u8]> {
    if cfg!(feature = "vm_service") {
      self.settings.service_assets_archive
    } else {
      None
    }
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::Arc;

  use vela_core::SymbolResolver;
  use vela_core_testing::FakeTransport;
  use vela_core_testing::FakeVm;
  use vela_core_testing::MemoryAssetOpener;
  use vela_core_testing::NullLibraryLoader;
  use vela_core_testing::RecordingBindings;
  use vela_core_testing::RecordingClient;

  use super::*;

  pub(crate) struct TestHost {
    pub vm: Arc<FakeVm>,
    pub bindings: Arc<RecordingBindings>,
    pub client: Arc<RecordingClient>,
    pub opener: Arc<MemoryAssetOpener>,
    pub transport: Arc<FakeTransport>,
    pub host: Arc<VmHost>,
  }

  pub(crate) fn host_with_bindings(
    settings: Settings,
    resolver: Arc<dyn SymbolResolver>,
    bindings: Arc<RecordingBindings>,
  ) -> TestHost {
    let vm = FakeVm::new();
    let client = Arc::new(RecordingClient::new());
    let opener = Arc::new(MemoryAssetOpener::new());
    let transport = Arc::new(FakeTransport::new());
    let host = VmHost::new(VmHostOptions {
      engine: vm.clone(),
      resolver,
      settings,
      asset_opener: opener.clone(),
      library_loader: Arc::new(NullLibraryLoader),
      bindings: vec![bindings.clone()],
      isolate_client: client.clone(),
      service_transport: Some(transport.clone()),
      debugger_preinit: None,
      thread_exit_hook: None,
    });
    TestHost {
      vm,
      bindings,
      client,
      opener,
      transport,
      host,
    }
  }

  pub(crate) fn host(
    settings: Settings,
    resolver: Arc<dyn SymbolResolver>,
  ) -> TestHost {
    host_with_bindings(
      settings,
      resolver,
      Arc::new(RecordingBindings::new()),
    )
  }

  pub(crate) fn bootstrapped_host(
    settings: Settings,
    resolver: Arc<dyn SymbolResolver>,
  ) -> TestHost {
    let th = host(settings, resolver);
    th.host.bootstrap_vm();
    th
  }

  pub(crate) fn host_without_transport(
    settings: Settings,
    resolver: Arc<dyn SymbolResolver>,
  ) -> TestHost {
    let mut th = host(settings, resolver);
    let vm = FakeVm::new();
    let host = VmHost::new(VmHostOptions {
      engine: vm.clone(),
      resolver: th.host.resolver.clone(),
      settings: th.host.settings.clone(),
      asset_opener: th.opener.clone(),
      library_loader: Arc::new(NullLibraryLoader),
      bindings: vec![th.bindings.clone()],
      isolate_client: th.client.clone(),
      service_transport: None,
      debugger_preinit: None,
      thread_exit_hook: None,
    });
    th.vm = vm;
    th.host = host;
    th
  }
}
