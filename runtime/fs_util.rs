// Copyright 2018-2026 the Vela authors. MIT license.

use std::time::Duration;
use std::time::UNIX_EPOCH;

use url::Url;

/// Whether the file behind `source_url` changed after `since_ms` (epoch
/// milliseconds). The VM uses this to decide snapshot reuse, so every case
/// where the answer cannot be determined conservatively reports "modified":
/// URLs without a local-file scheme, unconvertible paths, and files that
/// cannot be stat'ed.
pub fn is_file_modified(source_url: &str, since_ms: i64) -> bool {
  let url = match Url::parse(source_url) {
    Ok(url) => url,
    Err(_) => return true,
  };
  if url.scheme() != "file" {
    return true;
  }
  let path = match url.to_file_path() {
    Ok(path) => path,
    Err(()) => return true,
  };
  let metadata = match std::fs::metadata(&path) {
    Ok(metadata) => metadata,
    Err(_) => return true,
  };
  let modified = match metadata.modified() {
    Ok(modified) => modified,
    Err(_) => return true,
  };
  let since = UNIX_EPOCH + Duration::from_millis(since_ms.max(0) as u64);
  modified > since
}

#[cfg(test)]
mod tests {
  use filetime::FileTime;

  use super::*;

  #[test]
  fn non_file_schemes_report_modified() {
    assert!(is_file_modified("https://example.com/main.vela", 0));
    assert!(is_file_modified("not a url at all", 0));
  }

  #[test]
  fn unstattable_files_report_modified() {
    assert!(is_file_modified("file:///nonexistent/main.vela", i64::MAX));
  }

  #[test]
  fn mtime_at_or_before_timestamp_is_unmodified() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.vela");
    std::fs::write(&path, b"main() {}").unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000, 0))
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    // Exactly at the modification time.
    assert!(!is_file_modified(url.as_str(), 1_000_000));
    // After it.
    assert!(!is_file_modified(url.as_str(), 2_000_000));
    // Before it.
    assert!(is_file_modified(url.as_str(), 999_000));
  }
}
