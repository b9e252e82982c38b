//! Content-addressed object store contract for the DatumFlow worker.
//!
//! Architecture role:
//! - defines the narrow [`ObjClient`] surface the worker core consumes
//!   (tags, objects, async tag writer, direct sidecar writes, block paths)
//! - provides [`MemObjClient`], the in-process client used by driver tests
//!   and integration scenarios
//!
//! Key modules:
//! - [`client`]
//! - [`mem`]

pub mod client;
pub mod mem;

pub use client::{ByteReader, ObjClient, ObjWriter, Object, ObjectInfo};
pub use mem::MemObjClient;
