// Copyright 2018-2026 the Vela authors. MIT license.

use std::net::SocketAddr;
use std::path::Path;

use crate::engine::ActivationScope;
use crate::engine::IsolateHandle;
use crate::error::AnyError;
use crate::snapshot::ExecutionMode;
use crate::snapshot::RawSymbol;

/// Resolution of precompiled-code symbols and snapshot buffers. Two
/// strategies exist (dynamic-library lookup and asset mapping), selected at
/// configuration time; a miss is always a soft `None`, never a failure.
pub trait SymbolResolver: Send + Sync {
  fn lookup(&self, symbol_name: &str) -> Option<RawSymbol>;
}

/// Tags under which the VM asks the embedder to resolve a library URI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LibraryTag {
  /// Produce the canonical form of a URI.
  CanonicalizeUrl,
  /// Load the library behind a URI.
  Import,
  /// Load the root script behind a URI.
  Script,
}

/// Per-isolate URI-tag resolution, consumed by the VM's library loading
/// machinery. The loading strategy itself lives outside this core.
pub trait LibraryLoader: Send + Sync {
  fn handle_library_tag(
    &self,
    tag: LibraryTag,
    library_url: &str,
    url: &str,
  ) -> Result<(), AnyError>;
}

/// An opened asset bundle. Archive formats are not this core's business;
/// only the "named asset as byte buffer" capability is consumed.
pub trait AssetBundle: Send + Sync {
  fn get_as_buffer(&self, key: &str) -> Result<Vec<u8>, AnyError>;
}

pub trait AssetBundleOpener: Send + Sync {
  fn open(&self, path: &Path) -> Result<Box<dyn AssetBundle>, AnyError>;
}

/// The role an isolate plays, determining which bindings an installer
/// wires up. The service isolate installs with the secondary role.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsolateRole {
  Main,
  Secondary,
}

/// A named class-library provider registered on an isolate's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassProvider {
  pub name: String,
  pub library: String,
}

impl ClassProvider {
  pub fn new(
    name: impl Into<String>,
    library: impl Into<String>,
  ) -> Self {
    Self {
      name: name.into(),
      library: library.into(),
    }
  }
}

/// Installs language bindings: once globally before the VM starts, and once
/// per isolate inside that isolate's activation scope.
pub trait BindingsInstaller: Send + Sync {
  fn init_global(&self) -> Result<(), AnyError> {
    Ok(())
  }

  fn init_for_isolate(
    &self,
    scope: &ActivationScope<'_>,
    role: IsolateRole,
    script_uri: &str,
  ) -> Result<(), AnyError>;

  /// Providers this installer contributes to each isolate's state.
  fn class_providers(&self) -> Vec<ClassProvider> {
    Vec::new()
  }
}

/// Owner-side notification hooks for isolate lifecycle events.
pub trait IsolateClient: Send + Sync {
  fn did_create_secondary_isolate(&self, isolate: IsolateHandle);
}

/// Parameters for bringing up the diagnostics transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
  /// Loopback address + host-configured port.
  pub addr: SocketAddr,
  /// Websocket origin checking is on unless explicitly disabled.
  pub disable_origin_check: bool,
  pub mode: ExecutionMode,
}

/// Start/stop surface of the diagnostics transport. The wire protocol the
/// transport speaks is external to this core.
pub trait ServiceTransport: Send + Sync {
  fn startup(&self, config: &TransportConfig) -> Result<(), AnyError>;

  fn shutdown(&self) {}
}
