// Copyright 2018-2026 the Vela authors. MIT license.

pub fn create_basic_runtime() -> tokio::runtime::Runtime {
  tokio::runtime::Builder::new_current_thread()
    .enable_io()
    .enable_time()
    // The service protocol thread never needs a blocking pool of the
    // default size (512); a couple of threads cover it.
    .max_blocking_threads(8)
    .build()
    .unwrap()
}

pub fn run_local<F, R>(future: F) -> R
where
  F: std::future::Future<Output = R>,
{
  let rt = create_basic_runtime();
  let local = tokio::task::LocalSet::new();
  local.block_on(&rt, future)
}
