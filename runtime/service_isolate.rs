// Copyright 2018-2026 the Vela authors. MIT license.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use vela_core::error::AnyError;
use vela_core::ExecutionMode;
use vela_core::IsolateHandle;

use crate::bootstrap::VmHost;

/// Invoked inside the service isolate's activation scope once it exists,
/// with the process's execution mode.
pub type ServiceIsolateHook = Box<dyn Fn(ExecutionMode) + Send + Sync>;

/// Invoked after the service isolate is up, for registering native service
/// protocol extensions.
pub type ExtensionRegistrationHook = Box<dyn Fn(ExecutionMode) + Send + Sync>;

/// One-shot configuration surface for the service isolate. Hooks are
/// startup-only: registration after the isolate exists is a programming
/// error and fatal, never silently ignored.
#[derive(Default)]
pub(crate) struct ServiceIsolateState {
  initialized: AtomicBool,
  service_hook: Mutex<Option<ServiceIsolateHook>>,
  extension_hook: Mutex<Option<ExtensionRegistrationHook>>,
}

impl ServiceIsolateState {
  pub fn set_service_hook(&self, hook: ServiceIsolateHook) {
    assert!(
      !self.is_initialized(),
      "service isolate hook registered after the service isolate was created"
    );
    *self.service_hook.lock() = Some(hook);
  }

  pub fn set_extension_hook(&self, hook: ExtensionRegistrationHook) {
    assert!(
      !self.is_initialized(),
      "extension registration hook registered after the service isolate \
       was created"
    );
    *self.extension_hook.lock() = Some(hook);
  }

  pub fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::SeqCst)
  }
}

/// Creates the single diagnostics isolate. With the `vm_service` feature
/// compiled out this is a no-op returning `None` and the whole diagnostics
/// surface is disabled.
#[cfg(not(feature = "vm_service"))]
pub(crate) fn create(
  _host: &VmHost,
  _script_uri: &str,
) -> Result<Option<IsolateHandle>, AnyError> {
  Ok(None)
}

#[cfg(feature = "vm_service")]
pub(crate) fn create(
  host: &VmHost,
  script_uri: &str,
) -> Result<Option<IsolateHandle>, AnyError> {
  use std::net::Ipv4Addr;
  use std::net::SocketAddr;

  use anyhow::Context;
  use vela_core::ActivationScope;
  use vela_core::IsolateRole;
  use vela_core::TransportConfig;

  let token = host.isolates.allocate_root(script_uri);
  let handle = match host.engine.create_isolate(
    script_uri,
    "main",
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
  anyhow::ensure!(
    host.engine.is_service_isolate(handle),
    "the VM did not recognize {script_uri} as its service isolate"
  );

  host
    .engine
    .set_library_tag_handler(handle, host.library_loader.clone())?;

  {
    let scope = ActivationScope::enter(&*host.engine, handle);
    for bindings in &host.bindings {
      bindings.init_for_isolate(&scope, IsolateRole::Secondary, "")?;
    }

    if host.settings.enable_service {
      let transport = host.service_transport.as_ref().context(
        "diagnostics are enabled but no service transport was configured",
      )?;
      let config = TransportConfig {
        addr: SocketAddr::from((
          Ipv4Addr::LOCALHOST,
          host.settings.service_port,
        )),
        disable_origin_check: false,
        mode: host.execution_mode(),
      };
      transport
        .startup(&config)
        .context("failed to start the service protocol transport")?;
    }

    if let Some(hook) = &*host.service_state.service_hook.lock() {
      hook(host.execution_mode());
    }
  }

  host.service_state.initialized.store(true, Ordering::SeqCst);
  if let Some(hook) = &*host.service_state.extension_hook.lock() {
    hook(host.execution_mode());
  }
  Ok(Some(handle))
}

#[cfg(all(test, feature = "vm_service"))]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::sync::Arc;

  use vela_core::SymbolResolver;
  use vela_core::VmEngine;
  use vela_core::INSTRUCTIONS_SNAPSHOT_SYMBOL;
  use vela_core::SERVICE_ISOLATE_NAME;
  use vela_core_testing::StaticSymbolResolver;

  use super::*;
  use crate::bootstrap::testing::bootstrapped_host;
  use crate::settings::Settings;
  use crate::snapshot::NullSymbolResolver;

  fn snapshot_resolver() -> Arc<dyn SymbolResolver> {
    Arc::new(NullSymbolResolver)
  }

  fn service_settings() -> Settings {
    Settings {
      enable_service: true,
      service_port: 8484,
      ..Default::default()
    }
  }

  #[test]
  fn service_uri_routes_to_the_service_bootstrap() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    // No asset bundle exists for the service URI; taking the generic
    // creation path would be fatal in snapshot mode.
    let handle = th
      .vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap()
      .unwrap();

    let record = th.vm.isolate(handle).unwrap();
    assert!(th.vm.is_service_isolate(handle));
    assert!(record.has_tag_handler);
    // The VM owns the service isolate's runnability.
    assert!(!record.runnable);
    assert!(record.loaded_snapshots.is_empty());
    assert!(th.host.service_isolate_initialized());
    // The service isolate is nobody's secondary isolate.
    assert!(th.client.notified().is_empty());
  }

  #[test]
  fn transport_starts_only_when_diagnostics_are_enabled() {
    let th = bootstrapped_host(service_settings(), snapshot_resolver());
    th.vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap();

    let startups = th.transport.startups();
    assert_eq!(startups.len(), 1);
    assert_eq!(startups[0].addr.to_string(), "127.0.0.1:8484");
    assert!(!startups[0].disable_origin_check);
    assert_eq!(startups[0].mode, ExecutionMode::Snapshot);

    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    th.vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap();
    assert!(th.transport.startups().is_empty());
  }

  #[test]
  #[should_panic(expected = "failed to start the service protocol transport")]
  fn transport_startup_failure_is_fatal() {
    let th = bootstrapped_host(service_settings(), snapshot_resolver());
    th.transport.fail_startup();
    let _ = th.vm.request_isolate(SERVICE_ISOLATE_NAME, "main", None);
  }

  #[test]
  fn hooks_run_in_order_with_the_execution_mode() {
    let resolver = Arc::new(
      StaticSymbolResolver::new()
        .with_symbol(INSTRUCTIONS_SNAPSHOT_SYMBOL, b"\xc3"),
    );
    let th = bootstrapped_host(Settings::default(), resolver);

    let calls = Arc::new(AtomicUsize::new(0));
    let (c1, c2) = (calls.clone(), calls.clone());
    th.host.set_service_isolate_hook(Box::new(move |mode| {
      assert_eq!(mode, ExecutionMode::Precompiled);
      assert_eq!(c1.fetch_add(1, Ordering::SeqCst), 0);
    }));
    th.host.set_extension_registration_hook(Box::new(move |mode| {
      assert_eq!(mode, ExecutionMode::Precompiled);
      assert_eq!(c2.fetch_add(1, Ordering::SeqCst), 1);
    }));

    th.vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  #[should_panic(expected = "service isolate hook registered after")]
  fn late_service_hook_registration_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    th.vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap();
    th.host.set_service_isolate_hook(Box::new(|_| {}));
  }

  #[test]
  #[should_panic(expected = "extension registration hook registered after")]
  fn late_extension_hook_registration_is_fatal() {
    let th = bootstrapped_host(Settings::default(), snapshot_resolver());
    th.vm
      .request_isolate(SERVICE_ISOLATE_NAME, "main", None)
      .unwrap();
    th.host.set_extension_registration_hook(Box::new(|_| {}));
  }

  #[test]
  #[should_panic(expected = "no service transport was configured")]
  fn enabled_diagnostics_without_transport_is_fatal() {
    let th = crate::bootstrap::testing::host_without_transport(
      service_settings(),
      snapshot_resolver(),
    );
    th.host.bootstrap_vm();
    let _ = th.vm.request_isolate(SERVICE_ISOLATE_NAME, "main", None);
  }
}
