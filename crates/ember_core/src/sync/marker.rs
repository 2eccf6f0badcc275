//! # Read and Write Markers
//!
//! A [`SharedWorld`] puts a world behind a `parking_lot` reader-writer lock.
//! Any number of threads may hold a [`ReadMarker`] at once; a frame update
//! or any structural mutation needs the single [`WriteMarker`].
//!
//! ```text
//! render thread:   ──[ read ]──────────[ read ]──────────
//! audio thread:    ─────[ read ]──────────[ read ]───────
//! update thread:   ───────────[ write: update ]─────[ write ]
//!                             ▲
//!                             waits for every reader to let go
//! ```
//!
//! The outstanding reader count is published so an update loop can decide
//! to skip a frame instead of blocking.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ecs::{FrameStats, World};
use crate::error::{WorldError, WorldResult};

/// A world shared between threads.
pub struct SharedWorld {
    inner: RwLock<World>,
    readers: Arc<AtomicUsize>,
}

impl SharedWorld {
    /// Wraps a world.
    #[must_use]
    pub fn new(world: World) -> Self {
        let readers = world.read_marker_counter();
        Self {
            inner: RwLock::new(world),
            readers,
        }
    }

    /// Blocks until no writer holds the world, then grants shared read
    /// access.
    pub fn acquire_read_marker(&self) -> ReadMarker<'_> {
        ReadMarker::new(self.inner.read(), &self.readers)
    }

    /// Read access if no writer holds the world right now.
    pub fn try_acquire_read_marker(&self) -> Option<ReadMarker<'_>> {
        self.inner
            .try_read()
            .map(|guard| ReadMarker::new(guard, &self.readers))
    }

    /// Blocks until every marker is released, then grants exclusive access.
    pub fn acquire_write_marker(&self) -> WriteMarker<'_> {
        WriteMarker {
            guard: self.inner.write(),
        }
    }

    /// Readers currently holding a marker.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Runs one frame, waiting for readers to finish.
    pub fn update(&self, dt: Duration) -> FrameStats {
        self.acquire_write_marker().update(dt)
    }

    /// Runs one frame only if nobody holds a marker.
    ///
    /// # Errors
    ///
    /// [`WorldError::ReadersActive`] when the world is being read.
    pub fn try_update(&self, dt: Duration) -> WorldResult<FrameStats> {
        let Some(mut guard) = self.inner.try_write() else {
            let readers = self.reader_count();
            tracing::debug!(readers, "frame skipped: world is being read");
            return Err(WorldError::ReadersActive(readers));
        };
        Ok(guard.update(dt))
    }

    /// Runs one frame, waiting at most `timeout` for readers to finish.
    ///
    /// # Errors
    ///
    /// [`WorldError::Timeout`] if the write marker was not granted in time.
    pub fn update_timeout(&self, dt: Duration, timeout: Duration) -> WorldResult<FrameStats> {
        let mut guard = self.inner.try_write_for(timeout).ok_or(WorldError::Timeout)?;
        Ok(guard.update(dt))
    }

    /// Unwraps the world.
    #[must_use]
    pub fn into_inner(self) -> World {
        self.inner.into_inner()
    }
}

impl std::fmt::Debug for SharedWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWorld")
            .field("readers", &self.reader_count())
            .finish_non_exhaustive()
    }
}

/// Shared read access to a [`SharedWorld`].
pub struct ReadMarker<'a> {
    guard: RwLockReadGuard<'a, World>,
    readers: &'a AtomicUsize,
}

impl<'a> ReadMarker<'a> {
    fn new(guard: RwLockReadGuard<'a, World>, readers: &'a AtomicUsize) -> Self {
        readers.fetch_add(1, Ordering::AcqRel);
        Self { guard, readers }
    }
}

impl Deref for ReadMarker<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        &self.guard
    }
}

impl Drop for ReadMarker<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive access to a [`SharedWorld`].
pub struct WriteMarker<'a> {
    guard: RwLockWriteGuard<'a, World>,
}

impl Deref for WriteMarker<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        &self.guard
    }
}

impl DerefMut for WriteMarker<'_> {
    fn deref_mut(&mut self) -> &mut World {
        &mut self.guard
    }
}
