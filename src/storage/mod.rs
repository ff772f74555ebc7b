//! Storage layer
//!
//! # Architecture
//!
//! One store manages anonymous byte payloads inside a single growable
//! backing buffer:
//!
//! ```text
//! BlockStore
//!   ├─→ BlockTable      (bitmap of used blocks, first-fit, defrag)
//!   ├─→ BufferMapper    (block coordinates → byte slices)
//!   │     └─→ BackingBuffer: heap | off-heap | mapped temp file
//!   ├─→ HandleRegistry  (weak refs to every LiveHandle)
//!   └─→ StreamRegistry  (open input streams)
//!
//! StoredBytes ──owns──▶ LiveHandle (start, size) ◀──rewritten on migrate
//! ```
//!
//! ## Allocation
//!
//! Payloads are rounded up to whole blocks. The table hands out the first
//! free run that fits and grows by whole multiples of the initial block count
//! when nothing fits.
//!
//! ## Relocation
//!
//! Growing, compaction and defragmentation move bytes. The table reports every
//! move through [`table::TableListener`]; the engine moves the bytes, then
//! every live handle translates its own coordinates.
//!
//! ## Readers
//!
//! Input streams read the shared buffer directly and take a private copy only
//! when a write or delete is about to change what they would read.

pub mod blocks;
pub mod buffer;
pub mod diag;
pub mod engine;
pub mod handle;
pub mod lock;
pub mod mapper;
pub mod range;
pub mod registry;
pub mod stored;
pub mod stream;
pub mod table;

pub use blocks::BlockConverter;
pub use buffer::{BackingBuffer, StorageKind};
pub use diag::{DiagEvent, DiagOp, DiagnosticRing};
pub use engine::{BlockStore, EngineStats};
pub use handle::LiveHandle;
pub use range::BlockRange;
pub use stored::StoredBytes;
pub use stream::{StoredInputStream, StoredOutputStream};
pub use table::{BlockTable, DefragKind, DefragPolicy, ExpansionPolicy, TableListener};

#[cfg(test)]
mod scenario_tests;
