// Copyright 2018-2026 the Vela authors. MIT license.

//! Bootstrap and isolate-lifecycle management for a host process embedding
//! the Vela VM: flag composition, snapshot/symbol resolution, the isolate
//! creation callbacks, the service isolate, and the process-wide diagnostic
//! channels between the VM and the embedder.

pub use vela_core;

pub mod asset_bundle;
pub mod flags;
pub mod fs_util;
pub mod isolate;
pub mod service_isolate;
#[cfg(feature = "vm_service")]
pub mod service_server;
pub mod snapshot;
pub mod stream_capture;
pub mod timeline;
#[cfg(feature = "vm_service")]
pub mod tokio_util;

mod bootstrap;
mod settings;

pub use bootstrap::VmHost;
pub use bootstrap::VmHostOptions;
pub use service_isolate::ExtensionRegistrationHook;
pub use service_isolate::ServiceIsolateHook;
pub use settings::Settings;
pub use settings::DEFAULT_SERVICE_PORT;
pub use timeline::TimelineCallbacks;
