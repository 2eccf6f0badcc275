//! # Sharing a World Across Threads
//!
//! A world is mutated by one update thread and read by any number of
//! others (rendering, audio, tools). Readers take a read marker, the frame
//! update takes the write marker.
//!
//! Inside a frame, parallelism comes from the task scheduler, not from
//! these markers.

mod marker;

pub use marker::{ReadMarker, SharedWorld, WriteMarker};
