//! # EMBER Shared
//!
//! Types used by the world core and by every collaborator that talks to it.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER depend on `ember_core`. It only holds:
//! - Transform math (`glam` based)
//! - The serialization stream contract and its in-memory implementation

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod math;
pub mod stream;

pub use error::{StreamError, StreamResult};
pub use math::{Mat4, Quat, Transform, Vec3};
pub use stream::{BinaryReader, BinaryWriter, Reader, Writer};
