//! Flood routing, duplicate suppression and relay statistics for the mesh.
//!
//! This crate decides what happens to every packet a node sees: local
//! delivery, relaying to neighbors with one hop consumed, parking in
//! store-and-forward, or dropping. It holds no key material and never looks
//! inside encrypted payloads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod seen;

pub use router::*;
pub use seen::*;
