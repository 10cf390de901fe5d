//! Sackdb - A block-level storage engine with undo-log recovery
//!
//! This crate provides the block layer of a persistent object store: a file
//! of fixed-size blocks, a pool of resident blocks, and a before-image undo
//! log that lets a transaction be rolled back after an abort or a crash.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Storage Layer** (`storage`): Handles disk I/O and block layout
//!   - `FileIo`: Raw positioned reads and writes of integers and byte runs
//!   - `DiskManager`: Reads and writes blocks at their home slot
//!   - `FreeList`: Reusable block slots
//!   - `Datablock`: Block header and payload with full and compact encodings
//!
//! - **Buffer Pool** (`buffer`): Resident blocks of a session
//!   - `BlockPool`: Block table with LRU eviction
//!   - `BlockAccessIndex`: Per-block cursor and pin count
//!
//! - **Undo Log** (`undo`): Pre-images of blocks changed by the in-flight
//!   transaction, replayed on rollback and at open after a crash
//!
//! - **Session** (`session`): `BlockDbIo`, the cursor-based block I/O used by
//!   higher layers, with block allocation, node placement and commit/rollback
//!
//! # Example
//!
//! ```rust,no_run
//! use sackdb::session::BlockDbIo;
//! use sackdb::SackConfig;
//!
//! let mut io = BlockDbIo::open("test.db", SackConfig::default()).unwrap();
//!
//! // Place a new object and write it
//! let ptr = io.compute_new_node_position().unwrap();
//! io.objseek(ptr).unwrap();
//! io.write_bytes(b"Hello, World!").unwrap();
//! io.record_new_node_position().unwrap();
//!
//! // Make it durable
//! io.dealloc_outstanding_commit().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod session;
pub mod storage;
pub mod undo;

// Re-export commonly used types at the crate root
pub use common::{BlockId, Mirror, ObjectPtr, Result, SackConfig, SackError};
