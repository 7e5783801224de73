// Copyright 2018-2026 the Vela authors. MIT license.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use vela_core::error::AnyError;
use vela_core::AssetBundle;
use vela_core::AssetBundleOpener;

/// Opens asset bundles that are plain directories: each asset key is a file
/// name under the bundle path. Archive-backed bundles come from the host.
#[derive(Default)]
pub struct DirAssetBundleOpener;

struct DirAssetBundle {
  root: PathBuf,
}

impl AssetBundle for DirAssetBundle {
  fn get_as_buffer(&self, key: &str) -> Result<Vec<u8>, AnyError> {
    let path = self.root.join(key);
    std::fs::read(&path)
      .with_context(|| format!("failed to read asset {}", path.display()))
  }
}

impl AssetBundleOpener for DirAssetBundleOpener {
  fn open(&self, path: &Path) -> Result<Box<dyn AssetBundle>, AnyError> {
    anyhow::ensure!(
      path.is_dir(),
      "asset bundle {} is not a directory",
      path.display()
    );
    Ok(Box::new(DirAssetBundle {
      root: path.to_path_buf(),
    }))
  }
}
