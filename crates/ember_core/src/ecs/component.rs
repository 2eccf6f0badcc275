//! # Component System
//!
//! Components are the behavior building blocks attached to game objects.
//! Unlike plain ECS data, each component type may hook into the lifecycle
//! (initialize/deinitialize), persist itself through the serialization
//! stream, and receive typed messages through handlers registered in the
//! [`TypeRegistry`](crate::TypeRegistry).
//!
//! Every hook has a no-op default, so a pure data component is just:
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct Health { hp: u32 }
//!
//! impl Component for Health {}
//! ```

use std::any::Any;

use downcast_rs::{impl_downcast, Downcast};
use ember_shared::{Reader, StreamResult, Writer};

use super::context::ComponentContext;
use super::handle::Handle;
use super::registry::ComponentTypeId;
use crate::error::ComponentError;

/// Capability set shared by every component type.
///
/// The trait is object safe; the world stores components behind
/// per-type storages and reaches them as `&mut dyn Component` when it
/// needs to dispatch lifecycle hooks generically.
pub trait Component: Downcast + Send + Sync + 'static {
    /// Called once before the first update after the component was added.
    ///
    /// Returning an error marks the component inert: it stays attached but
    /// never receives update calls.
    fn initialize(&mut self, _ctx: &mut ComponentContext<'_>) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Called once before the component is removed, only if it initialized.
    fn deinitialize(&mut self, _ctx: &mut ComponentContext<'_>) {}

    /// Writes the component's persistent state.
    fn serialize(&self, _writer: &mut dyn Writer) -> StreamResult<()> {
        Ok(())
    }

    /// Restores state written by [`Component::serialize`].
    ///
    /// `version` is the type version recorded in the stream, which may be
    /// older than the currently registered one.
    fn deserialize(&mut self, _reader: &mut dyn Reader, _version: u32) -> StreamResult<()> {
        Ok(())
    }

    /// Rust type name, for logs and errors on erased components.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
impl_downcast!(Component);

/// Marker for message payload types.
///
/// Any `'static` thread-safe value can be a message once registered.
pub trait Message: Any + Send + Sync {}

impl<T: Any + Send + Sync> Message for T {}

/// Type-erased component handle.
pub type ComponentHandle = Handle<dyn Component>;

impl<C: Component> Handle<C> {
    /// Erases the component type. The type id stays in the tag.
    #[inline]
    #[must_use]
    pub const fn erase(self) -> ComponentHandle {
        self.cast()
    }
}

impl ComponentHandle {
    /// Returns the component type id carried in the tag.
    #[inline]
    #[must_use]
    pub const fn component_type(self) -> ComponentTypeId {
        ComponentTypeId(self.tag())
    }

    /// Recovers a typed handle when `expected` is the id registered for `C`.
    #[inline]
    #[must_use]
    pub fn downcast<C: Component>(self, expected: ComponentTypeId) -> Option<Handle<C>> {
        (self.component_type() == expected && !self.is_null()).then(|| self.cast())
    }
}

/// Lifecycle state of one component entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentState {
    /// Added but `initialize` has not run yet.
    Uninitialized,
    /// `initialize` succeeded; the component receives updates.
    Initialized,
    /// `deinitialize` ran; the entry is on its way out.
    Deinitialized,
    /// `initialize` failed; the component never receives updates.
    Inert,
}

/// Memory policy of a component storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StoragePolicy {
    /// Dense array; removal moves the last entry into the hole.
    #[default]
    Compact,
    /// Fixed blocks; entries never move once created.
    Stable,
}
