//! # World Persistence
//!
//! Objects are written parents first, so every record can name its parent
//! by an index into the records already read.
//!
//! ## Layout (little endian)
//!
//! ```text
//! magic "EMWD" | version u32 | object count u32
//! per object:
//!   parent index u32 (u32::MAX = root) | name str | persistent id u64
//!   flags u8 (bit 0 active, bit 1 dynamic) | has key bool [| key str]
//!   local transform | component count u32
//!   per component: type name str | type version u32 | state blob
//! ```
//!
//! Each component's state is a length-prefixed blob, so a reader can skip
//! types it does not know.

use ember_shared::{BinaryReader, BinaryWriter, Reader, StreamError, Writer};

use super::command::WorldCommand;
use super::frame::FramePhase;
use super::object::{GameObjectDesc, GameObjectHandle};
use super::world::World;
use crate::diagnostics::Diagnostic;
use crate::error::{ComponentError, WorldResult};

/// Stream magic.
pub const WORLD_MAGIC: [u8; 4] = *b"EMWD";

/// Newest format version this build writes and reads.
pub const WORLD_FORMAT_VERSION: u32 = 1;

const NO_PARENT: u32 = u32::MAX;
const FLAG_ACTIVE: u8 = 1 << 0;
const FLAG_DYNAMIC: u8 = 1 << 1;

impl World {
    /// Writes every object and component.
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn serialize(&self, writer: &mut dyn Writer) -> WorldResult<()> {
        let order: Vec<GameObjectHandle> = self
            .objects
            .roots()
            .flat_map(|root| self.objects.subtree_pre_order(root))
            .collect();

        writer.write_bytes(&WORLD_MAGIC)?;
        writer.write_u32(WORLD_FORMAT_VERSION)?;
        writer.write_u32(count_u32(order.len())?)?;

        for (index, &handle) in order.iter().enumerate() {
            let Some(object) = self.objects.get(handle) else {
                continue;
            };
            let parent = match object.parent() {
                Some(parent) => order
                    .iter()
                    .take(index)
                    .position(|h| *h == parent)
                    .map_or(Ok(NO_PARENT), count_u32)?,
                None => NO_PARENT,
            };
            writer.write_u32(parent)?;
            writer.write_str(object.name())?;
            writer.write_u64(object.persistent_id())?;

            let mut flags = 0;
            if object.is_active_flag_set() {
                flags |= FLAG_ACTIVE;
            }
            if object.is_dynamic() {
                flags |= FLAG_DYNAMIC;
            }
            writer.write_u8(flags)?;
            writer.write_bool(object.global_key().is_some())?;
            if let Some(key) = object.global_key() {
                writer.write_str(key)?;
            }
            writer.write_transform(object.local_transform())?;

            let components: Vec<_> = object
                .components()
                .iter()
                .filter_map(|&handle| {
                    let info = self.registry.component(handle.component_type())?;
                    Some((info, self.component_dyn(handle)?))
                })
                .collect();
            writer.write_u32(count_u32(components.len())?)?;
            for (info, component) in components {
                let mut blob = BinaryWriter::new();
                component.serialize(&mut blob)?;
                writer.write_str(info.name)?;
                writer.write_u32(info.version)?;
                writer.write_blob(blob.as_slice())?;
            }
        }
        tracing::debug!(world = self.id, objects = order.len(), "world serialized");
        Ok(())
    }

    /// Serializes into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`Self::serialize`].
    pub fn to_bytes(&self) -> WorldResult<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        self.serialize(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Reads objects written by [`Self::serialize`] into this world, next
    /// to whatever it already holds. Returns the created objects in stream
    /// order.
    ///
    /// Components of unregistered types are skipped and reported on the
    /// diagnostics channel. Added components initialize at the next frame.
    ///
    /// # Errors
    ///
    /// Fails on a foreign or newer stream, malformed records, duplicate
    /// keys or persistent ids, and registered types without a default
    /// constructor. Objects created before the failure stay in the world.
    ///
    /// Called during the async phase, the rest of the stream is buffered and
    /// loaded at PostAsync; the returned list is empty.
    pub fn deserialize(&mut self, reader: &mut dyn Reader) -> WorldResult<Vec<GameObjectHandle>> {
        if self.phase == FramePhase::Async {
            let mut bytes = vec![0u8; reader.remaining()];
            reader.read_into(&mut bytes)?;
            self.defer_during_async("deserialize", || WorldCommand::Load(bytes));
            return Ok(Vec::new());
        }
        let mut magic = [0u8; 4];
        reader.read_into(&mut magic)?;
        if magic != WORLD_MAGIC {
            return Err(StreamError::BadMagic {
                expected: WORLD_MAGIC,
                found: magic,
            }
            .into());
        }
        let version = reader.read_u32()?;
        if version > WORLD_FORMAT_VERSION {
            return Err(StreamError::UnsupportedVersion {
                found: version,
                supported: WORLD_FORMAT_VERSION,
            }
            .into());
        }

        let count = reader.read_u32()? as usize;
        let mut created: Vec<GameObjectHandle> = Vec::with_capacity(count.min(reader.remaining()));
        for index in 0..count {
            let parent_index = reader.read_u32()?;
            let parent = match parent_index {
                NO_PARENT => None,
                i if (i as usize) < index => created.get(i as usize).copied(),
                i => {
                    return Err(StreamError::Malformed(format!(
                        "object {index} names parent {i}, which is not written before it"
                    ))
                    .into())
                }
            };
            let name = reader.read_string()?;
            let persistent_id = reader.read_u64()?;
            let flags = reader.read_u8()?;
            let global_key = if reader.read_bool()? {
                Some(reader.read_string()?)
            } else {
                None
            };
            let local = reader.read_transform()?;

            let desc = GameObjectDesc {
                name,
                parent,
                local,
                active: flags & FLAG_ACTIVE != 0,
                dynamic: flags & FLAG_DYNAMIC != 0,
                persistent_id,
                global_key,
            };
            let object = self.create_object_impl(desc)?;
            created.push(object);

            let components = reader.read_u32()?;
            for _ in 0..components {
                let type_name = reader.read_string()?;
                let version = reader.read_u32()?;
                let blob = reader.read_blob()?;
                let Some(type_id) = self.registry.component_type_by_name(&type_name) else {
                    tracing::warn!(component = %type_name, "unknown component type in stream, skipped");
                    self.report(Diagnostic::UnknownComponentType {
                        type_name,
                        owner: object,
                    });
                    continue;
                };
                let registered = self.registry.component_name(type_id).unwrap_or("<unregistered>");
                let mut component = self
                    .registry
                    .create_default(type_id)
                    .ok_or(ComponentError::NoDefault(registered))?;
                component.deserialize(&mut BinaryReader::new(&blob), version)?;
                self.add_boxed_impl(object, component)?;
            }
            self.apply_commands();
        }
        tracing::debug!(world = self.id, objects = created.len(), "world deserialized");
        Ok(created)
    }

    /// Deserializes from a byte slice.
    ///
    /// # Errors
    ///
    /// See [`Self::deserialize`].
    pub fn load_bytes(&mut self, bytes: &[u8]) -> WorldResult<Vec<GameObjectHandle>> {
        self.deserialize(&mut BinaryReader::new(bytes))
    }
}

fn count_u32(len: usize) -> WorldResult<u32> {
    u32::try_from(len).map_err(|_| StreamError::Malformed(format!("count {len} does not fit in u32")).into())
}
