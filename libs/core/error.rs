// Copyright 2018-2026 the Vela authors. MIT license.

use thiserror::Error;

/// A generic wrapper that can encapsulate any concrete error type, used on
/// the embedder-facing seams where callers only propagate or report.
pub type AnyError = anyhow::Error;

/// Errors surfaced by a VM binding. Every variant is fatal by policy at the
/// bootstrap layer; the type exists so the boundary between "the VM said no"
/// and "the embedder gave up" stays visible in signatures.
#[derive(Debug, Error)]
pub enum CoreError {
  #[error("the VM rejected the composed flag set: {0}")]
  FlagsRejected(String),
  #[error("the VM is already initialized")]
  AlreadyInitialized,
  #[error("VM initialization failed: {0}")]
  InitializeFailed(String),
  #[error("isolate creation failed: {0}")]
  IsolateCreateFailed(String),
  #[error("library tag handler registration failed: {0}")]
  TagHandlerFailed(String),
  #[error("failed to load snapshot into isolate: {0}")]
  SnapshotLoadFailed(String),
  #[error("the VM refused to mark the isolate runnable: {0}")]
  MakeRunnableFailed(String),
}
