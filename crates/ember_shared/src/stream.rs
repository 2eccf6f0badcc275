//! # Serialization Stream
//!
//! The world core never knows an on-disk format. Components and the world
//! itself write primitives into a [`Writer`] and read them back from a
//! [`Reader`]; whoever owns the stream decides where the bytes go.
//!
//! All multi-byte values are little-endian. Strings and byte blobs are
//! prefixed with their length as a `u32`.
//!
//! ```rust,ignore
//! let mut writer = BinaryWriter::new();
//! writer.write_u32(7)?;
//! writer.write_str("wind")?;
//!
//! let mut reader = BinaryReader::new(writer.as_slice());
//! assert_eq!(reader.read_u32()?, 7);
//! assert_eq!(reader.read_string()?, "wind");
//! ```

use glam::{Quat, Vec3};

use crate::error::{StreamError, StreamResult};
use crate::math::Transform;

/// Sink for serialized primitives.
pub trait Writer {
    /// Appends raw bytes to the stream.
    fn write_bytes(&mut self, bytes: &[u8]) -> StreamResult<()>;

    /// Number of bytes written so far.
    fn position(&self) -> usize;

    /// Writes a `u8`.
    fn write_u8(&mut self, value: u8) -> StreamResult<()> {
        self.write_bytes(&[value])
    }

    /// Writes a `u16`.
    fn write_u16(&mut self, value: u16) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `u32`.
    fn write_u32(&mut self, value: u32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `u64`.
    fn write_u64(&mut self, value: u64) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `i32`.
    fn write_i32(&mut self, value: i32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `i64`.
    fn write_i64(&mut self, value: i64) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `f32`.
    fn write_f32(&mut self, value: f32) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `f64`.
    fn write_f64(&mut self, value: f64) -> StreamResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `bool` as a single byte.
    fn write_bool(&mut self, value: bool) -> StreamResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Writes a length-prefixed UTF-8 string.
    fn write_str(&mut self, value: &str) -> StreamResult<()> {
        self.write_blob(value.as_bytes())
    }

    /// Writes a length-prefixed byte blob.
    fn write_blob(&mut self, value: &[u8]) -> StreamResult<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| StreamError::Malformed(format!("blob of {} bytes", value.len())))?;
        self.write_u32(len)?;
        self.write_bytes(value)
    }

    /// Writes a vector as three `f32`s.
    fn write_vec3(&mut self, value: Vec3) -> StreamResult<()> {
        self.write_f32(value.x)?;
        self.write_f32(value.y)?;
        self.write_f32(value.z)
    }

    /// Writes a quaternion as four `f32`s (x, y, z, w).
    fn write_quat(&mut self, value: Quat) -> StreamResult<()> {
        for component in value.to_array() {
            self.write_f32(component)?;
        }
        Ok(())
    }

    /// Writes a transform as position, rotation, scale.
    fn write_transform(&mut self, value: &Transform) -> StreamResult<()> {
        self.write_vec3(value.position)?;
        self.write_quat(value.rotation)?;
        self.write_vec3(value.scale)
    }
}

/// Source of serialized primitives.
pub trait Reader {
    /// Fills `buf` completely from the stream.
    fn read_into(&mut self, buf: &mut [u8]) -> StreamResult<()>;

    /// Number of unread bytes.
    fn remaining(&self) -> usize;

    /// Discards `len` bytes.
    fn skip(&mut self, len: usize) -> StreamResult<()>;

    /// Reads a `u8`.
    fn read_u8(&mut self) -> StreamResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a `u16`.
    fn read_u16(&mut self) -> StreamResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a `u32`.
    fn read_u32(&mut self) -> StreamResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a `u64`.
    fn read_u64(&mut self) -> StreamResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads an `i32`.
    fn read_i32(&mut self) -> StreamResult<i32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads an `i64`.
    fn read_i64(&mut self) -> StreamResult<i64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Reads an `f32`.
    fn read_f32(&mut self) -> StreamResult<f32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Reads an `f64`.
    fn read_f64(&mut self) -> StreamResult<f64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Reads a `bool` written by [`Writer::write_bool`].
    fn read_bool(&mut self) -> StreamResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StreamError::InvalidBool(other)),
        }
    }

    /// Reads a length-prefixed byte blob.
    fn read_blob(&mut self) -> StreamResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(StreamError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads a length-prefixed UTF-8 string.
    fn read_string(&mut self) -> StreamResult<String> {
        String::from_utf8(self.read_blob()?).map_err(|_| StreamError::InvalidUtf8)
    }

    /// Reads a vector written by [`Writer::write_vec3`].
    fn read_vec3(&mut self) -> StreamResult<Vec3> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Reads a quaternion written by [`Writer::write_quat`].
    fn read_quat(&mut self) -> StreamResult<Quat> {
        let mut xyzw = [0.0f32; 4];
        for component in &mut xyzw {
            *component = self.read_f32()?;
        }
        Ok(Quat::from_array(xyzw))
    }

    /// Reads a transform written by [`Writer::write_transform`].
    fn read_transform(&mut self) -> StreamResult<Transform> {
        Ok(Transform::new(
            self.read_vec3()?,
            self.read_quat()?,
            self.read_vec3()?,
        ))
    }
}

/// In-memory little-endian writer.
#[derive(Debug, Default, Clone)]
pub struct BinaryWriter {
    buffer: Vec<u8>,
}

impl BinaryWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with pre-reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the writer, returning its buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl Writer for BinaryWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> StreamResult<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn position(&self) -> usize {
        self.buffer.len()
    }
}

/// Cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> BinaryReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.cursor
    }
}

impl Reader for BinaryReader<'_> {
    fn read_into(&mut self, buf: &mut [u8]) -> StreamResult<()> {
        let end = self.cursor + buf.len();
        let Some(src) = self.data.get(self.cursor..end) else {
            return Err(StreamError::UnexpectedEof {
                needed: buf.len(),
                remaining: self.remaining(),
            });
        };
        buf.copy_from_slice(src);
        self.cursor = end;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn skip(&mut self, len: usize) -> StreamResult<()> {
        if len > self.remaining() {
            return Err(StreamError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        self.cursor += len;
        Ok(())
    }
}
