// Copyright 2018-2026 the Vela authors. MIT license.

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use parking_lot::Mutex;
use slab::Slab;
use url::Url;
use vela_core::error::AnyError;
use vela_core::ActivationScope;
use vela_core::ClassProvider;
use vela_core::IsolateHandle;
use vela_core::IsolateRole;
use vela_core::IsolateStateToken;

use crate::bootstrap::VmHost;

/// Asset key of the script snapshot inside an application bundle.
pub const SNAPSHOT_ASSET_KEY: &str = "snapshot_blob.bin";

/// Embedder-side state attached to one isolate. Children reference their
/// parent record by arena key, never by live reference, so records form a
/// tree rooted at the main isolate with no lifetime coupling beyond the
/// creation-time copy.
#[derive(Clone, Debug)]
pub struct IsolateState {
  pub script_uri: String,
  pub parent: Option<usize>,
  pub handle: Option<IsolateHandle>,
  pub providers: Vec<ClassProvider>,
}

impl IsolateState {
  fn new(script_uri: &str, parent: Option<usize>) -> Self {
    Self {
      script_uri: script_uri.to_string(),
      parent,
      handle: None,
      providers: Vec::new(),
    }
  }
}

/// Arena of isolate-state records, indexed by the token the VM carries as
/// callback data. Records are allocated at creation and released exactly
/// once, on the VM's shutdown notification.
#[derive(Default)]
pub struct IsolateRegistry {
  states: Mutex<Slab<IsolateState>>,
}

impl IsolateRegistry {
  /// Allocates a state with no parent: the main isolate or the service
  /// isolate.
  pub fn allocate_root(&self, script_uri: &str) -> IsolateStateToken {
    let key = self.states.lock().insert(IsolateState::new(script_uri, None));
    IsolateStateToken(key)
  }

  /// Strict parent→child derivation: the parent must be a live record.
  pub fn derive_child(
    &self,
    parent: IsolateStateToken,
    script_uri: &str,
  ) -> IsolateStateToken {
    let mut states = self.states.lock();
    assert!(
      states.contains(parent.0),
      "child isolate derived from a released or unknown parent state"
    );
    let key = states.insert(IsolateState::new(script_uri, Some(parent.0)));
    IsolateStateToken(key)
  }

  pub fn attach_handle(
    &self,
    token: IsolateStateToken,
    handle: IsolateHandle,
  ) {
    self.states.lock()[token.0].handle = Some(handle);
  }

  pub fn add_provider(
    &self,
    token: IsolateStateToken,
    provider: ClassProvider,
  ) {
    self.states.lock()[token.0].providers.push(provider);
  }

  pub fn get(&self, token: IsolateStateToken) -> Option<IsolateState> {
    self.states.lock().get(token.0).cloned()
  }

  /// Releases the record behind `token`. The VM guarantees exactly one
  /// shutdown notification per isolate; a second release is a contract
  /// violation.
  pub fn release(&self, token: IsolateStateToken) -> IsolateState {
    self
      .states
      .lock()
      .try_remove(token.0)
      .expect("shutdown notification for an unknown isolate state")
  }

  pub fn len(&self) -> usize {
    self.states.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.lock().is_empty()
  }
}

/// The generic (non-service) isolate creation path. Invoked by the VM,
/// possibly concurrently from several native threads; everything here works
/// on this invocation's own state except the registry and the resolver
/// cache, which serialize internally.
pub(crate) fn create_isolate(
  host: &VmHost,
  script_uri: &str,
  entry_point: &str,
  parent: Option<IsolateStateToken>,
) -> Result<IsolateHandle, AnyError> {
  debug!("creating isolate {script_uri}");

  // Without precompiled code the isolate boots from the snapshot inside
  // the application bundle named by the URI.
  let snapshot_data = if host.is_running_precompiled_code() {
    None
  } else {
    Some(load_bundle_snapshot(host, script_uri)?)
  };

  let parent =
    parent.context("isolate creation request without a parent context")?;
  let token = host.isolates.derive_child(parent, script_uri);

  let handle = match host.engine.create_isolate(
    script_uri,
    entry_point,
    host.isolate_snapshot_buffer(),
    token,
  ) {
    Ok(handle) => handle,
    Err(error) => {
      host.isolates.release(token);
      return Err(error.into());
    }
  };
  host.isolates.attach_handle(token, handle);

  host
    .engine
    .set_library_tag_handler(handle, host.library_loader.clone())?;

  {
    let scope = ActivationScope::enter(&*host.engine, handle);
    for bindings in &host.bindings {
      bindings.init_for_isolate(&scope, IsolateRole::Secondary, script_uri)?;
    }

    host
      .isolates
      .add_provider(token, ClassProvider::new("ui", "vela:ui"));
    for bindings in &host.bindings {
      for provider in bindings.class_providers() {
        host.isolates.add_provider(token, provider);
      }
    }

    if let Some(data) = &snapshot_data {
      host
        .engine
        .load_snapshot(handle, data)
        .context("failed to load the script snapshot")?;
    }

    host.isolate_client.did_create_secondary_isolate(handle);
  }

  host.engine.make_runnable(handle)?;
  Ok(handle)
}

fn load_bundle_snapshot(
  host: &VmHost,
  script_uri: &str,
) -> Result<Vec<u8>, AnyError> {
  let url = Url::parse(script_uri)
    .with_context(|| format!("invalid isolate URI {script_uri}"))?;
  anyhow::ensure!(
    url.scheme() == "file",
    "isolate URI {script_uri} does not use the file scheme"
  );
  let bundle_path = url
    .to_file_path()
    .map_err(|()| anyhow!("isolate URI {script_uri} has no local path"))?;
  let bundle = host.asset_opener.open(&bundle_path)?;
  bundle.get_as_buffer(SNAPSHOT_ASSET_KEY).with_context(|| {
    format!(
      "asset bundle {} is missing {SNAPSHOT_ASSET_KEY}",
      bundle_path.display()
    )
  })
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;
  use std::sync::Arc;

  use vela_core::ExecutionMode;
  use vela_core::SymbolResolver;
  use vela_core::INSTRUCTIONS_SNAPSHOT_SYMBOL;
  use vela_core_testing::StaticSymbolResolver;

  use super::*;
  use crate::bootstrap::testing::bootstrapped_host;
  use crate::settings::Settings;
  use crate::snapshot::NullSymbolResolver;

  fn snapshot_resolver() -> Arc<dyn SymbolResolver> {
    Arc::new(NullSymbolResolver)
  }

  fn precompiled_resolver() -> Arc<dyn SymbolResolver> {
    Arc::new(
      StaticSymbolResolver::new()
        .with_symbol(INSTRUCTIONS_SNAPSHOT_SYMBOL, b"\xc3"),
    )
  }

  fn add_app_bundle(th: &crate::bootstrap::testing::TestHost) -> String {
    th.opener.add_bundle(
      PathBuf::from("/bundles/app"),
      vec![(SNAPSHOT_ASSET_KEY, b"snapshot bytes".to_vec())],
    );
    "file:///bundles/app".to_string()
  }

  #[test]
  fn snapshot_mode_boots_from_the_bundle() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");

    let handle = th
      .vm
      .request_isolate(&uri, "main", Some(root))
      .unwrap()
      .unwrap();

    let record = th.vm.isolate(handle).unwrap();
    assert_eq!(record.script_uri, uri);
    assert_eq!(record.entry_point, "main");
    assert!(record.has_tag_handler);
    assert!(record.runnable);
    assert_eq!(record.loaded_snapshots, vec![b"snapshot bytes".len()]);

    let token = record.token.unwrap();
    let state = th.host.isolates.get(token).unwrap();
    assert_eq!(state.parent, Some(root.0));
    assert_eq!(state.handle, Some(handle));
    assert!(state
      .providers
      .contains(&ClassProvider::new("ui", "vela:ui")));

    assert_eq!(th.client.notified(), vec![handle]);
    assert_eq!(
      th.bindings.installed(),
      vec![(uri, IsolateRole::Secondary)]
    );
  }

  #[test]
  fn precompiled_mode_never_touches_the_bundle() {
    let th = bootstrapped_host(Settings::default(), precompiled_resolver());
    assert_eq!(th.host.execution_mode(), ExecutionMode::Precompiled);
    let root = th.host.register_root_isolate("file:///bundles/main");

    // No bundle was registered with the opener: opening one would fail, so
    // success proves the precompiled path skipped the asset entirely.
    let handle = th
      .vm
      .request_isolate("file:///bundles/app", "main", Some(root))
      .unwrap()
      .unwrap();
    let record = th.vm.isolate(handle).unwrap();
    assert!(record.loaded_snapshots.is_empty());
    assert!(record.runnable);
  }

  #[test]
  fn installer_contributed_providers_are_recorded() {
    use vela_core_testing::RecordingBindings;

    let th = crate::bootstrap::testing::host_with_bindings(
      Settings::default(),
      snapshot_resolver(),
      Arc::new(RecordingBindings::with_providers(vec![
        ClassProvider::new("platform", "vela:platform"),
      ])),
    );
    th.host.bootstrap_vm();
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");

    let handle = th
      .vm
      .request_isolate(&uri, "main", Some(root))
      .unwrap()
      .unwrap();
    let token = th.vm.isolate(handle).unwrap().token.unwrap();
    let providers = th.host.isolates.get(token).unwrap().providers;
    assert_eq!(
      providers,
      vec![
        ClassProvider::new("ui", "vela:ui"),
        ClassProvider::new("platform", "vela:platform"),
      ]
    );
  }

  #[test]
  #[should_panic(expected = "does not use the file scheme")]
  fn non_file_uri_is_fatal_in_snapshot_mode() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let root = th.host.register_root_isolate("file:///bundles/main");
    let _ = th.vm.request_isolate("https://example.com/app", "main", Some(root));
  }

  #[test]
  #[should_panic(expected = "missing snapshot_blob.bin")]
  fn missing_snapshot_asset_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    th.opener
      .add_bundle(PathBuf::from("/bundles/app"), vec![("other", vec![1])]);
    let root = th.host.register_root_isolate("file:///bundles/main");
    let _ =
      th.vm.request_isolate("file:///bundles/app", "main", Some(root));
  }

  #[test]
  #[should_panic(expected = "without a parent context")]
  fn missing_parent_context_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let _ = th.vm.request_isolate(&uri, "main", None);
  }

  #[test]
  #[should_panic(expected = "isolate creation failed")]
  fn engine_refusing_creation_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");
    th.vm.fail_next_create();
    let _ = th.vm.request_isolate(&uri, "main", Some(root));
  }

  #[test]
  #[should_panic(expected = "failed to load the script snapshot")]
  fn snapshot_load_failure_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");
    th.vm.fail_next_load();
    let _ = th.vm.request_isolate(&uri, "main", Some(root));
  }

  #[test]
  #[should_panic(expected = "refused to mark the isolate runnable")]
  fn make_runnable_refusal_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");
    th.vm.fail_next_runnable();
    let _ = th.vm.request_isolate(&uri, "main", Some(root));
  }

  #[test]
  fn shutdown_releases_exactly_the_notified_state() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let uri = add_app_bundle(&th);
    let root = th.host.register_root_isolate("file:///bundles/main");

    let handle = th
      .vm
      .request_isolate(&uri, "main", Some(root))
      .unwrap()
      .unwrap();
    let token = th.vm.isolate(handle).unwrap().token.unwrap();
    assert_eq!(th.host.isolates.len(), 2);

    th.vm.notify_shutdown(token);
    assert_eq!(th.host.isolates.len(), 1);
    assert!(th.host.isolates.get(root).is_some());
  }

  #[test]
  fn concurrent_child_creation_is_independent() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    let root = th.host.register_root_isolate("file:///bundles/main");
    for i in 0..4 {
      th.opener.add_bundle(
        PathBuf::from(format!("/bundles/child{i}")),
        vec![(SNAPSHOT_ASSET_KEY, vec![i as u8; 8])],
      );
    }

    let threads: Vec<_> = (0..4)
      .map(|i| {
        let vm = th.vm.clone();
        std::thread::spawn(move || {
          vm.request_isolate(
            &format!("file:///bundles/child{i}"),
            "main",
            Some(root),
          )
          .unwrap()
          .unwrap()
        })
      })
      .collect();

    let mut handles: Vec<_> =
      threads.into_iter().map(|t| t.join().unwrap()).collect();
    handles.sort_by_key(|h| h.as_raw());
    handles.dedup();
    assert_eq!(handles.len(), 4);
    assert_eq!(th.host.isolates.len(), 5);
    assert_eq!(th.vm.activation_depth(), 0);
  }

  #[test]
  #[should_panic(expected = "released or unknown parent state")]
  fn derivation_from_released_parent_is_fatal() {
    let registry = IsolateRegistry::default();
    let root = registry.allocate_root("file:///bundles/main");
    registry.release(root);
    registry.derive_child(root, "file:///bundles/child");
  }
}
