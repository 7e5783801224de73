// Copyright 2018-2026 the Vela authors. MIT license.

//! Scriptable stand-ins for the VM and for the runtime's external
//! collaborators. `FakeVm` honors the whole `VmEngine` contract, checks the
//! embedder's side of it (strict activation nesting, no runnable-while-
//! entered), and lets tests inject the failure modes the bootstrap layer
//! treats as fatal.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::ThreadId;

use anyhow::anyhow;
use parking_lot::Mutex;
use vela_core::error::AnyError;
use vela_core::error::CoreError;
use vela_core::ActivationScope;
use vela_core::AssetBundle;
use vela_core::AssetBundleOpener;
use vela_core::BindingsInstaller;
use vela_core::ClassProvider;
use vela_core::EmbedderCallbacks;
use vela_core::InitParams;
use vela_core::IsolateClient;
use vela_core::IsolateHandle;
use vela_core::IsolateRole;
use vela_core::IsolateStateToken;
use vela_core::LibraryLoader;
use vela_core::LibraryTag;
use vela_core::RawSymbol;
use vela_core::ServiceTransport;
use vela_core::SnapshotBuffer;
use vela_core::SymbolResolver;
use vela_core::TimelineEventKind;
use vela_core::TransportConfig;
use vela_core::VmEngine;
use vela_core::SERVICE_ISOLATE_NAME;

/// Everything the fake VM remembers about one isolate it created.
#[derive(Clone, Debug, Default)]
pub struct FakeIsolate {
  pub script_uri: String,
  pub entry_point: String,
  pub token: Option<IsolateStateToken>,
  /// Address of the startup snapshot, if one was supplied.
  pub snapshot_ptr: Option<usize>,
  /// Lengths of script snapshots loaded while entered.
  pub loaded_snapshots: Vec<usize>,
  pub has_tag_handler: bool,
  pub runnable: bool,
}

#[derive(Default)]
struct FakeVmState {
  io_bootstrapped: bool,
  temp_directory: Option<String>,
  flags: Vec<String>,
  initialized: bool,
  vm_snapshot_ptr: Option<usize>,
  instructions_ptr: Option<usize>,
  data_ptr: Option<usize>,
  next_handle: u64,
  isolates: HashMap<u64, FakeIsolate>,
  /// Activations are per native thread, like the real VM's.
  activations: HashMap<ThreadId, Vec<u64>>,
  timeline_events: Vec<(String, i64, i64, TimelineEventKind)>,
}

impl FakeVmState {
  fn current_activations(&mut self) -> &mut Vec<u64> {
    self.activations.entry(std::thread::current().id()).or_default()
  }
}

/// A scriptable `VmEngine`.
pub struct FakeVm {
  service_uri: String,
  state: Mutex<FakeVmState>,
  callbacks: Mutex<Option<Arc<dyn EmbedderCallbacks>>>,
  capture_stdout: AtomicBool,
  capture_stderr: AtomicBool,
  reject_flags: AtomicBool,
  fail_initialize: AtomicBool,
  fail_next_create: AtomicBool,
  fail_next_load: AtomicBool,
  fail_next_runnable: AtomicBool,
}

impl Default for FakeVm {
  fn default() -> Self {
    Self {
      service_uri: SERVICE_ISOLATE_NAME.to_string(),
      state: Mutex::new(FakeVmState::default()),
      callbacks: Mutex::new(None),
      capture_stdout: AtomicBool::new(false),
      capture_stderr: AtomicBool::new(false),
      reject_flags: AtomicBool::new(false),
      fail_initialize: AtomicBool::new(false),
      fail_next_create: AtomicBool::new(false),
      fail_next_load: AtomicBool::new(false),
      fail_next_runnable: AtomicBool::new(false),
    }
  }
}

impl FakeVm {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  // Failure injection. Each arms exactly the condition the bootstrap layer
  // must treat as fatal.

  pub fn reject_flags(&self) {
    self.reject_flags.store(true, Ordering::SeqCst);
  }

  pub fn fail_initialize(&self) {
    self.fail_initialize.store(true, Ordering::SeqCst);
  }

  pub fn fail_next_create(&self) {
    self.fail_next_create.store(true, Ordering::SeqCst);
  }

  pub fn fail_next_load(&self) {
    self.fail_next_load.store(true, Ordering::SeqCst);
  }

  pub fn fail_next_runnable(&self) {
    self.fail_next_runnable.store(true, Ordering::SeqCst);
  }

  // Introspection.

  pub fn flags(&self) -> Vec<String> {
    self.state.lock().flags.clone()
  }

  pub fn is_initialized(&self) -> bool {
    self.state.lock().initialized
  }

  pub fn io_bootstrapped(&self) -> bool {
    self.state.lock().io_bootstrapped
  }

  pub fn temp_directory(&self) -> Option<String> {
    self.state.lock().temp_directory.clone()
  }

  pub fn vm_snapshot_ptr(&self) -> Option<usize> {
    self.state.lock().vm_snapshot_ptr
  }

  pub fn instructions_ptr(&self) -> Option<usize> {
    self.state.lock().instructions_ptr
  }

  pub fn isolate(&self, isolate: IsolateHandle) -> Option<FakeIsolate> {
    self.state.lock().isolates.get(&isolate.as_raw()).cloned()
  }

  pub fn isolate_count(&self) -> usize {
    self.state.lock().isolates.len()
  }

  /// Total live activations across every thread.
  pub fn activation_depth(&self) -> usize {
    self.state.lock().activations.values().map(|v| v.len()).sum()
  }

  pub fn timeline_events(
    &self,
  ) -> Vec<(String, i64, i64, TimelineEventKind)> {
    self.state.lock().timeline_events.clone()
  }

  pub fn captures_stdout(&self) -> bool {
    self.capture_stdout.load(Ordering::SeqCst)
  }

  pub fn captures_stderr(&self) -> bool {
    self.capture_stderr.load(Ordering::SeqCst)
  }

  /// The embedder callbacks handed over at initialization.
  pub fn callbacks(&self) -> Arc<dyn EmbedderCallbacks> {
    self
      .callbacks
      .lock()
      .clone()
      .expect("FakeVm was not initialized")
  }

  /// Simulates the VM asking the embedder for a new isolate, the way the
  /// real VM does from one of its own threads.
  pub fn request_isolate(
    &self,
    script_uri: &str,
    entry_point: &str,
    parent: Option<IsolateStateToken>,
  ) -> Result<Option<IsolateHandle>, AnyError> {
    self.callbacks().create_isolate(script_uri, entry_point, parent)
  }

  /// Simulates the VM's exactly-once shutdown notification.
  pub fn notify_shutdown(&self, token: IsolateStateToken) {
    self.callbacks().shutdown_isolate(token);
  }
}

impl VmEngine for FakeVm {
  fn bootstrap_io(&self) {
    self.state.lock().io_bootstrapped = true;
  }

  fn set_system_temp_directory(&self, path: &str) {
    self.state.lock().temp_directory = Some(path.to_string());
  }

  fn set_flags(&self, flags: &[String]) -> Result<(), CoreError> {
    if self.reject_flags.load(Ordering::SeqCst) {
      return Err(CoreError::FlagsRejected(flags.join(" ")));
    }
    self.state.lock().flags = flags.to_vec();
    Ok(())
  }

  fn initialize(&self, params: InitParams) -> Result<(), CoreError> {
    if self.fail_initialize.load(Ordering::SeqCst) {
      return Err(CoreError::InitializeFailed("injected failure".into()));
    }
    let mut state = self.state.lock();
    if state.initialized {
      return Err(CoreError::AlreadyInitialized);
    }
    state.initialized = true;
    state.vm_snapshot_ptr =
      params.vm_snapshot.as_ref().map(|s| s.as_ptr() as usize);
    state.instructions_ptr =
      params.instructions_snapshot.map(|s| s.as_ptr() as usize);
    state.data_ptr = params.data_snapshot.map(|s| s.as_ptr() as usize);
    *self.callbacks.lock() = Some(params.callbacks);
    Ok(())
  }

  fn create_isolate(
    &self,
    script_uri: &str,
    entry_point: &str,
    snapshot: Option<&SnapshotBuffer>,
    token: IsolateStateToken,
  ) -> Result<IsolateHandle, CoreError> {
    if self.fail_next_create.swap(false, Ordering::SeqCst) {
      return Err(CoreError::IsolateCreateFailed(
        "injected failure".into(),
      ));
    }
    let mut state = self.state.lock();
    state.next_handle += 1;
    let handle = state.next_handle;
    state.isolates.insert(
      handle,
      FakeIsolate {
        script_uri: script_uri.to_string(),
        entry_point: entry_point.to_string(),
        token: Some(token),
        snapshot_ptr: snapshot.map(|s| s.as_ptr() as usize),
        loaded_snapshots: Vec::new(),
        has_tag_handler: false,
        runnable: false,
      },
    );
    Ok(IsolateHandle::from_raw(handle))
  }

  fn is_service_isolate(&self, isolate: IsolateHandle) -> bool {
    self
      .state
      .lock()
      .isolates
      .get(&isolate.as_raw())
      .map(|i| i.script_uri == self.service_uri)
      .unwrap_or(false)
  }

  fn set_library_tag_handler(
    &self,
    isolate: IsolateHandle,
    _loader: Arc<dyn LibraryLoader>,
  ) -> Result<(), CoreError> {
    let mut state = self.state.lock();
    match state.isolates.get_mut(&isolate.as_raw()) {
      Some(record) => {
        record.has_tag_handler = true;
        Ok(())
      }
      None => Err(CoreError::TagHandlerFailed("unknown isolate".into())),
    }
  }

  fn enter_isolate(&self, isolate: IsolateHandle) {
    self
      .state
      .lock()
      .current_activations()
      .push(isolate.as_raw());
  }

  fn exit_isolate(&self, isolate: IsolateHandle) {
    let popped = self.state.lock().current_activations().pop();
    assert_eq!(
      popped,
      Some(isolate.as_raw()),
      "activation scopes must nest strictly"
    );
  }

  fn load_snapshot(
    &self,
    isolate: IsolateHandle,
    data: &[u8],
  ) -> Result<(), CoreError> {
    if self.fail_next_load.swap(false, Ordering::SeqCst) {
      return Err(CoreError::SnapshotLoadFailed("injected failure".into()));
    }
    let mut state = self.state.lock();
    assert_eq!(
      state.current_activations().last().copied(),
      Some(isolate.as_raw()),
      "load_snapshot requires an activation of the target isolate"
    );
    state
      .isolates
      .get_mut(&isolate.as_raw())
      .expect("unknown isolate")
      .loaded_snapshots
      .push(data.len());
    Ok(())
  }

  fn make_runnable(&self, isolate: IsolateHandle) -> Result<(), CoreError> {
    if self.fail_next_runnable.swap(false, Ordering::SeqCst) {
      return Err(CoreError::MakeRunnableFailed("injected failure".into()));
    }
    let mut state = self.state.lock();
    assert!(
      !state.current_activations().contains(&isolate.as_raw()),
      "make_runnable requires the creating thread to have exited"
    );
    state
      .isolates
      .get_mut(&isolate.as_raw())
      .expect("unknown isolate")
      .runnable = true;
    Ok(())
  }

  fn set_capture_stdout(&self, capture: bool) {
    self.capture_stdout.store(capture, Ordering::SeqCst);
  }

  fn set_capture_stderr(&self, capture: bool) {
    self.capture_stderr.store(capture, Ordering::SeqCst);
  }

  fn timeline_event(
    &self,
    label: &str,
    timestamp0: i64,
    timestamp1_or_id: i64,
    kind: TimelineEventKind,
  ) {
    self.state.lock().timeline_events.push((
      label.to_string(),
      timestamp0,
      timestamp1_or_id,
      kind,
    ));
  }
}

/// Asset bundles served from memory, keyed by bundle path.
#[derive(Default)]
pub struct MemoryAssetOpener {
  bundles: Mutex<HashMap<PathBuf, HashMap<String, Vec<u8>>>>,
}

impl MemoryAssetOpener {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_bundle(
    &self,
    path: impl Into<PathBuf>,
    assets: Vec<(&str, Vec<u8>)>,
  ) {
    let assets = assets
      .into_iter()
      .map(|(k, v)| (k.to_string(), v))
      .collect();
    self.bundles.lock().insert(path.into(), assets);
  }
}

struct MemoryAssetBundle {
  assets: HashMap<String, Vec<u8>>,
}

impl AssetBundle for MemoryAssetBundle {
  fn get_as_buffer(&self, key: &str) -> Result<Vec<u8>, AnyError> {
    self
      .assets
      .get(key)
      .cloned()
      .ok_or_else(|| anyhow!("no asset named {key} in bundle"))
  }
}

impl AssetBundleOpener for MemoryAssetOpener {
  fn open(&self, path: &Path) -> Result<Box<dyn AssetBundle>, AnyError> {
    let assets = self
      .bundles
      .lock()
      .get(path)
      .cloned()
      .ok_or_else(|| anyhow!("no bundle at {}", path.display()))?;
    Ok(Box::new(MemoryAssetBundle { assets }))
  }
}

/// Records per-isolate installation calls; contributes no providers.
#[derive(Default)]
pub struct RecordingBindings {
  providers: Vec<ClassProvider>,
  installed: Mutex<Vec<(String, IsolateRole)>>,
  global_installed: AtomicBool,
}

impl RecordingBindings {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_providers(providers: Vec<ClassProvider>) -> Self {
    Self {
      providers,
      ..Default::default()
    }
  }

  pub fn installed(&self) -> Vec<(String, IsolateRole)> {
    self.installed.lock().clone()
  }

  pub fn global_installed(&self) -> bool {
    self.global_installed.load(Ordering::SeqCst)
  }
}

impl BindingsInstaller for RecordingBindings {
  fn init_global(&self) -> Result<(), AnyError> {
    self.global_installed.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn init_for_isolate(
    &self,
    _scope: &ActivationScope<'_>,
    role: IsolateRole,
    script_uri: &str,
  ) -> Result<(), AnyError> {
    self.installed.lock().push((script_uri.to_string(), role));
    Ok(())
  }

  fn class_providers(&self) -> Vec<ClassProvider> {
    self.providers.clone()
  }
}

/// Records secondary-isolate notifications.
#[derive(Default)]
pub struct RecordingClient {
  notified: Mutex<Vec<IsolateHandle>>,
}

impl RecordingClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn notified(&self) -> Vec<IsolateHandle> {
    self.notified.lock().clone()
  }
}

impl IsolateClient for RecordingClient {
  fn did_create_secondary_isolate(&self, isolate: IsolateHandle) {
    self.notified.lock().push(isolate);
  }
}

/// A library loader that accepts every tag.
#[derive(Default)]
pub struct NullLibraryLoader;

impl LibraryLoader for NullLibraryLoader {
  fn handle_library_tag(
    &self,
    _tag: LibraryTag,
    _library_url: &str,
    _url: &str,
  ) -> Result<(), AnyError> {
    Ok(())
  }
}

/// Resolves only the symbols it was seeded with, from static data.
#[derive(Default)]
pub struct StaticSymbolResolver {
  symbols: HashMap<&'static str, RawSymbol>,
}

impl StaticSymbolResolver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_symbol(
    mut self,
    name: &'static str,
    data: &'static [u8],
  ) -> Self {
    self.symbols.insert(name, RawSymbol::from_static(data));
    self
  }
}

impl SymbolResolver for StaticSymbolResolver {
  fn lookup(&self, symbol_name: &str) -> Option<RawSymbol> {
    self.symbols.get(symbol_name).copied()
  }
}

/// Records transport startups; optionally fails them.
#[derive(Default)]
pub struct FakeTransport {
  started: Mutex<Vec<TransportConfig>>,
  fail_startup: AtomicBool,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_startup(&self) {
    self.fail_startup.store(true, Ordering::SeqCst);
  }

  pub fn startups(&self) -> Vec<TransportConfig> {
    self.started.lock().clone()
  }
}

impl ServiceTransport for FakeTransport {
  fn startup(&self, config: &TransportConfig) -> Result<(), AnyError> {
    if self.fail_startup.load(Ordering::SeqCst) {
      return Err(anyhow!("injected transport failure"));
    }
    self.started.lock().push(config.clone());
    Ok(())
  }
}
