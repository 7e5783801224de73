// Copyright 2018-2026 the Vela authors. MIT license.

use serde::Deserialize;
use serde::Serialize;

// Well-known symbol names the VM binding exports. The resolver strategies
// key off these; everything else is unknown to this core.
pub const VM_SNAPSHOT_SYMBOL: &str = "vela_vm_snapshot_buffer";
pub const ISOLATE_SNAPSHOT_SYMBOL: &str = "vela_isolate_snapshot_buffer";
pub const INSTRUCTIONS_SNAPSHOT_SYMBOL: &str = "vela_snapshot_instructions";
pub const DATA_SNAPSHOT_SYMBOL: &str = "vela_snapshot_rodata";

/// How the VM executes managed code in this process. Derived per query from
/// the snapshot resolver, never stored centrally; the two modes are mutually
/// exclusive for the life of the process.
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ExecutionMode {
  /// Machine code was generated ahead of time and is resolved via symbol
  /// lookup.
  Precompiled,
  /// Code is loaded from a serialized snapshot at isolate creation.
  Snapshot,
}

impl ExecutionMode {
  pub fn is_precompiled(self) -> bool {
    matches!(self, ExecutionMode::Precompiled)
  }
}

/// Address of a resolved snapshot symbol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawSymbol(*const u8);

// SAFETY: a RawSymbol addresses process-lifetime, read-only data: either a
// segment of a library that is never unloaded or a private file mapping that
// is never unmapped. Sharing the address across threads can neither outlive
// nor mutate it. Constructors uphold this contract.
unsafe impl Send for RawSymbol {}
// SAFETY: see above.
unsafe impl Sync for RawSymbol {}

impl RawSymbol {
  /// Wraps a resolved symbol address, `None` for null.
  ///
  /// # Safety
  ///
  /// The pointer must address read-only data that stays valid for the rest
  /// of the process lifetime.
  pub unsafe fn new(ptr: *const u8) -> Option<Self> {
    if ptr.is_null() {
      None
    } else {
      Some(Self(ptr))
    }
  }

  pub fn from_static(data: &'static [u8]) -> Self {
    Self(data.as_ptr())
  }

  pub fn as_ptr(self) -> *const u8 {
    self.0
  }
}

/// A buffer holding serialized VM state, loaded at VM or isolate startup.
pub enum SnapshotBuffer {
  /// Embedded in the binary at build time.
  Static(&'static [u8]),
  /// Read from an asset bundle at runtime.
  Boxed(Box<[u8]>),
  /// Resolved through a `RawSymbol`; length is known only to the VM.
  Symbol(RawSymbol),
}

impl SnapshotBuffer {
  pub fn as_ptr(&self) -> *const u8 {
    match self {
      SnapshotBuffer::Static(data) => data.as_ptr(),
      SnapshotBuffer::Boxed(data) => data.as_ptr(),
      SnapshotBuffer::Symbol(symbol) => symbol.as_ptr(),
    }
  }

  /// Byte length where one is knowable; symbol-backed buffers carry their
  /// length inside the snapshot itself.
  pub fn len(&self) -> Option<usize> {
    match self {
      SnapshotBuffer::Static(data) => Some(data.len()),
      SnapshotBuffer::Boxed(data) => Some(data.len()),
      SnapshotBuffer::Symbol(_) => None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == Some(0)
  }
}

impl From<RawSymbol> for SnapshotBuffer {
  fn from(symbol: RawSymbol) -> Self {
    SnapshotBuffer::Symbol(symbol)
  }
}

impl From<&'static [u8]> for SnapshotBuffer {
  fn from(data: &'static [u8]) -> Self {
    SnapshotBuffer::Static(data)
  }
}

impl From<Vec<u8>> for SnapshotBuffer {
  fn from(data: Vec<u8>) -> Self {
    SnapshotBuffer::Boxed(data.into_boxed_slice())
  }
}
