// Copyright 2018-2026 the Vela authors. MIT license.

//! The two snapshot/symbol resolution strategies. Hosts pick one at
//! configuration time: dynamic-library lookup where the platform has a
//! native loader for precompiled code, asset mapping where snapshot parts
//! ship as plain files, or [`NullSymbolResolver`] where neither exists and
//! the VM always loads snapshots.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use libloading::Library;
use log::debug;
use memmap2::Mmap;
use memmap2::MmapOptions;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use vela_core::ExecutionMode;
use vela_core::RawSymbol;
use vela_core::SymbolResolver;
use vela_core::DATA_SNAPSHOT_SYMBOL;
use vela_core::INSTRUCTIONS_SNAPSHOT_SYMBOL;
use vela_core::ISOLATE_SNAPSHOT_SYMBOL;
use vela_core::VM_SNAPSHOT_SYMBOL;

use crate::settings::Settings;

#[cfg(any(target_os = "ios", target_os = "macos"))]
const APPLICATION_LIBRARY_PATH: &str = "app.dylib";
#[cfg(windows)]
const APPLICATION_LIBRARY_PATH: &str = "app.dll";
#[cfg(not(any(target_os = "ios", target_os = "macos", windows)))]
const APPLICATION_LIBRARY_PATH: &str = "libapp.so";

/// The process is running precompiled code iff the instructions symbol
/// resolves. The probe may perform the backing mapping; it is idempotent.
pub fn is_running_precompiled_code(resolver: &dyn SymbolResolver) -> bool {
  resolver.lookup(INSTRUCTIONS_SNAPSHOT_SYMBOL).is_some()
}

pub fn execution_mode(resolver: &dyn SymbolResolver) -> ExecutionMode {
  if is_running_precompiled_code(resolver) {
    ExecutionMode::Precompiled
  } else {
    ExecutionMode::Snapshot
  }
}

/// Never resolves anything: the configuration for platforms without any
/// form of dynamic snapshot resolution, which therefore always run from
/// loadable snapshots.
#[derive(Default)]
pub struct NullSymbolResolver;

impl SymbolResolver for NullSymbolResolver {
  fn lookup(&self, _symbol_name: &str) -> Option<RawSymbol> {
    None
  }
}

/// Resolves symbols against an application-bundled native library first,
/// falling back to the process's own symbol namespace. Either library may
/// be absent; once loaded, neither is ever unloaded.
pub struct DylibSymbolResolver {
  app_library_path: PathBuf,
  app_library: OnceCell<Option<Library>>,
  process_library: OnceCell<Option<Library>>,
}

impl Default for DylibSymbolResolver {
  fn default() -> Self {
    Self::new(PathBuf::from(APPLICATION_LIBRARY_PATH))
  }
}

impl DylibSymbolResolver {
  pub fn new(app_library_path: PathBuf) -> Self {
    Self {
      app_library_path,
      app_library: OnceCell::new(),
      process_library: OnceCell::new(),
    }
  }

  fn app_library(&self) -> Option<&Library> {
    self
      .app_library
      .get_or_init(|| {
        // SAFETY: the application library carries only snapshot data and
        // precompiled code for the VM; it has no initializers that could
        // run arbitrary code against our invariants.
        match unsafe { Library::new(&self.app_library_path) } {
          Ok(library) => Some(library),
          Err(error) => {
            debug!(
              "no application library at {}: {}",
              self.app_library_path.display(),
              error
            );
            None
          }
        }
      })
      .as_ref()
  }

  fn process_library(&self) -> Option<&Library> {
    self
      .process_library
      .get_or_init(|| Some(open_self()))
      .as_ref()
  }

  fn lookup_in(
    library: Option<&Library>,
    symbol_name: &str,
  ) -> Option<RawSymbol> {
    let library = library?;
    // SAFETY: snapshot symbols are plain data; only the address is taken,
    // and the library stays loaded for the rest of the process.
    let symbol = unsafe {
      library.get::<*const u8>(symbol_name.as_bytes()).ok()?
    };
    // SAFETY: the address points into a library segment that is never
    // unloaded.
    unsafe { RawSymbol::new(*symbol) }
  }
}

impl SymbolResolver for DylibSymbolResolver {
  fn lookup(&self, symbol_name: &str) -> Option<RawSymbol> {
    // The application library wins when a symbol exists in both.
    Self::lookup_in(self.app_library(), symbol_name)
      .or_else(|| Self::lookup_in(self.process_library(), symbol_name))
  }
}

#[cfg(unix)]
fn open_self() -> Library {
  libloading::os::unix::Library::this().into()
}

#[cfg(windows)]
fn open_self() -> Library {
  libloading::os::windows::Library::this()
    .expect("failed to open the process's own module")
    .into()
}

/// An asset file holding one part of the precompiled snapshot.
struct SymbolAsset {
  symbol_name: &'static str,
  file_name: &'static str,
  executable: bool,
}

static SYMBOL_ASSETS: &[SymbolAsset] = &[
  SymbolAsset {
    symbol_name: VM_SNAPSHOT_SYMBOL,
    file_name: "snapshot_aot_vmisolate",
    executable: false,
  },
  SymbolAsset {
    symbol_name: ISOLATE_SNAPSHOT_SYMBOL,
    file_name: "snapshot_aot_isolate",
    executable: false,
  },
  SymbolAsset {
    symbol_name: INSTRUCTIONS_SNAPSHOT_SYMBOL,
    file_name: "snapshot_aot_instr",
    executable: true,
  },
  SymbolAsset {
    symbol_name: DATA_SNAPSHOT_SYMBOL,
    file_name: "snapshot_aot_rodata",
    executable: false,
  },
];

/// Resolves the well-known symbols by mapping the corresponding asset file
/// under the host-configured snapshot directory. Mappings are created on
/// first lookup, cached for the process lifetime, and never unmapped, so a
/// cache hit always returns the pointer the first lookup produced. A failed
/// mapping is cached too: lookups never retry I/O.
pub struct AssetSnapshotResolver {
  snapshot_dir: Option<PathBuf>,
  cache: Mutex<HashMap<&'static str, Option<Mmap>>>,
}

impl AssetSnapshotResolver {
  pub fn new(settings: &Settings) -> Self {
    Self {
      snapshot_dir: settings.aot_snapshot_path.clone(),
      cache: Mutex::new(HashMap::new()),
    }
  }

  fn map_asset(&self, asset: &SymbolAsset) -> Option<Mmap> {
    let snapshot_dir = self.snapshot_dir.as_deref().unwrap_or_else(|| {
      panic!(
        "aot_snapshot_path must be configured when snapshot assets are \
         resolved from files"
      )
    });
    let path = snapshot_dir.join(asset.file_name);
    let file = match File::open(&path) {
      Ok(file) => file,
      Err(error) => {
        debug!("no snapshot asset at {}: {}", path.display(), error);
        return None;
      }
    };
    // SAFETY: the mapping is private and read-only; snapshot assets are
    // immutable installation artifacts, so the file cannot change under
    // the mapping.
    let mapped = unsafe {
      if asset.executable {
        MmapOptions::new().map_exec(&file)
      } else {
        MmapOptions::new().map(&file)
      }
    };
    match mapped {
      Ok(mapping) => Some(mapping),
      Err(error) => {
        debug!("failed to map {}: {}", path.display(), error);
        None
      }
    }
  }
}

impl SymbolResolver for AssetSnapshotResolver {
  fn lookup(&self, symbol_name: &str) -> Option<RawSymbol> {
    let asset = SYMBOL_ASSETS
      .iter()
      .find(|asset| asset.symbol_name == symbol_name)?;

    // Population happens under the cache lock, so racing lookups agree on
    // one mapping and the pointer for a name never changes.
    let mut cache = self.cache.lock();
    let entry = cache
      .entry(asset.symbol_name)
      .or_insert_with(|| self.map_asset(asset));
    entry.as_ref().and_then(|mapping| {
      // SAFETY: the mapping lives in the process-lifetime cache and is
      // never removed from it.
      unsafe { RawSymbol::new(mapping.as_ptr()) }
    })
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;
  use std::path::Path;

  use super::*;

  fn resolver_with_dir(dir: &Path) -> AssetSnapshotResolver {
    let settings = Settings {
      aot_snapshot_path: Some(dir.to_path_buf()),
      ..Default::default()
    };
    AssetSnapshotResolver::new(&settings)
  }

  #[test]
  fn unregistered_symbol_misses_without_io() {
    // A directory that does not exist: a lookup that attempted I/O could
    // not distinguish this from a missing file, but an unregistered name
    // must short-circuit before any path is built.
    let settings = Settings {
      aot_snapshot_path: Some(PathBuf::from("/nonexistent")),
      ..Default::default()
    };
    let resolver = AssetSnapshotResolver::new(&settings);
    assert!(resolver.lookup("no_such_symbol").is_none());
    assert!(resolver.cache.lock().is_empty());
  }

  #[test]
  fn lookup_is_pointer_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut file =
      File::create(dir.path().join("snapshot_aot_rodata")).unwrap();
    file.write_all(b"read-only data").unwrap();
    drop(file);

    let resolver = resolver_with_dir(dir.path());
    let first = resolver.lookup(DATA_SNAPSHOT_SYMBOL).unwrap();
    let second = resolver.lookup(DATA_SNAPSHOT_SYMBOL).unwrap();
    assert_eq!(first.as_ptr(), second.as_ptr());
  }

  #[test]
  fn missing_asset_is_a_cached_miss() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver_with_dir(dir.path());
    assert!(resolver.lookup(ISOLATE_SNAPSHOT_SYMBOL).is_none());
    // The miss is cached; a later lookup must not see a file created
    // afterwards.
    std::fs::write(dir.path().join("snapshot_aot_isolate"), b"late")
      .unwrap();
    assert!(resolver.lookup(ISOLATE_SNAPSHOT_SYMBOL).is_none());
  }

  #[test]
  #[should_panic(expected = "aot_snapshot_path must be configured")]
  fn unconfigured_snapshot_dir_is_fatal() {
    let resolver = AssetSnapshotResolver::new(&Settings::default());
    let _ = resolver.lookup(ISOLATE_SNAPSHOT_SYMBOL);
  }

  #[cfg(unix)]
  #[test]
  fn instructions_asset_maps_executable() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("snapshot_aot_instr"), b"\xc3").unwrap();
    let resolver = resolver_with_dir(dir.path());
    assert!(is_running_precompiled_code(&resolver));
    assert_eq!(execution_mode(&resolver), ExecutionMode::Precompiled);
  }

  #[test]
  fn mode_is_snapshot_without_instructions() {
    let resolver = NullSymbolResolver;
    assert!(!is_running_precompiled_code(&resolver));
    assert_eq!(execution_mode(&resolver), ExecutionMode::Snapshot);
  }

  #[test]
  fn dylib_resolver_misses_are_soft() {
    let resolver =
      DylibSymbolResolver::new(PathBuf::from("/nonexistent/libapp.so"));
    assert!(resolver.lookup("vela_no_such_symbol").is_none());
  }

  #[cfg(all(unix, not(target_env = "musl")))]
  #[test]
  fn dylib_resolver_falls_back_to_process_namespace() {
    let resolver =
      DylibSymbolResolver::new(PathBuf::from("/nonexistent/libapp.so"));
    // The application library is absent, so resolution falls through to
    // the default namespace, where libc symbols are visible.
    assert!(resolver.lookup("malloc").is_some());
  }
}
