// Copyright 2018-2026 the Vela authors. MIT license.

//! The narrow interface between the Vela engine and the managed-language VM
//! it embeds. `VmEngine` is what a VM binding provides to the engine;
//! `EmbedderCallbacks` is what the VM requires the engine to implement. The
//! split lets the runtime crate be driven by a fake VM in tests and by the
//! real binding in production without either side knowing the difference.

mod embedder;
mod engine;
pub mod error;
mod snapshot;

pub use embedder::AssetBundle;
pub use embedder::AssetBundleOpener;
pub use embedder::BindingsInstaller;
pub use embedder::ClassProvider;
pub use embedder::IsolateClient;
pub use embedder::IsolateRole;
pub use embedder::LibraryLoader;
pub use embedder::LibraryTag;
pub use embedder::ServiceTransport;
pub use embedder::SymbolResolver;
pub use embedder::TransportConfig;
pub use engine::ActivationScope;
pub use engine::EmbedderCallbacks;
pub use engine::InitParams;
pub use engine::IsolateHandle;
pub use engine::IsolateStateToken;
pub use engine::TimelineEventKind;
pub use engine::VmEngine;
pub use engine::SERVICE_ISOLATE_NAME;
pub use snapshot::ExecutionMode;
pub use snapshot::RawSymbol;
pub use snapshot::SnapshotBuffer;
pub use snapshot::DATA_SNAPSHOT_SYMBOL;
pub use snapshot::INSTRUCTIONS_SNAPSHOT_SYMBOL;
pub use snapshot::ISOLATE_SNAPSHOT_SYMBOL;
pub use snapshot::VM_SNAPSHOT_SYMBOL;
