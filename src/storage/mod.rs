//! File storage backends.
//!
//! The [`backend::FileStore`] trait abstracts over where bytes physically
//! live.  Implementations include the local filesystem and an in-memory map.

pub mod backend;
pub mod local;
pub mod memory;
