use std::mem;

use crate::errors::{Result, ShmemLibError};
use crate::message::MessageBuffer;
use crate::ptr::ShMemPtr;
use crate::registry::Handle;

/// Fixed-size value copied as native-endian bytes.
pub trait Primitive: Copy + Default + 'static {
    const SIZE: usize;

    fn write_ne(self, out: &mut [u8]);

    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($t:ty),*) => {
        $(
            impl Primitive for $t {
                const SIZE: usize = mem::size_of::<$t>();

                #[inline]
                fn write_ne(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_ne_bytes(raw)
                }
            }

            impl Serializable for $t {
                fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
                    marshal_primitive(buffer, *self)
                }

                fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
                    demarshal_primitive(buffer)
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Primitive for bool {
    const SIZE: usize = 1;

    fn write_ne(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Serializable for bool {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        marshal_primitive(buffer, *self)
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        demarshal_primitive(buffer)
    }
}

/// Symmetric write/read pair. `deserialize` reads exactly the fields
/// `serialize` wrote, in the same order; nothing on the wire says which type
/// comes next.
pub trait Serializable: Sized {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()>;

    fn deserialize(buffer: &MessageBuffer) -> Result<Self>;
}

pub fn marshal<T: Serializable>(buffer: &mut MessageBuffer, value: &T) -> Result<()> {
    value.serialize(buffer)
}

pub fn demarshal<T: Serializable>(buffer: &MessageBuffer) -> Result<T> {
    T::deserialize(buffer)
}

fn marshal_primitive<T: Primitive>(buffer: &mut MessageBuffer, value: T) -> Result<()> {
    value.write_ne(buffer.reserve_bytes(T::SIZE)?);
    Ok(())
}

fn demarshal_primitive<T: Primitive>(buffer: &MessageBuffer) -> Result<T> {
    Ok(T::read_ne(buffer.read_bytes(T::SIZE)?))
}

/// Elements back to back, no length.
pub fn marshal_array<T: Primitive>(buffer: &mut MessageBuffer, values: &[T]) -> Result<()> {
    let out = buffer.reserve_bytes(values.len() * T::SIZE)?;
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(T::SIZE)) {
        value.write_ne(chunk);
    }
    Ok(())
}

pub fn demarshal_array<T: Primitive>(buffer: &MessageBuffer, len: usize) -> Result<Vec<T>> {
    let bytes = buffer.read_bytes(len * T::SIZE)?;
    Ok(bytes.chunks_exact(T::SIZE).map(T::read_ne).collect())
}

fn read_len(buffer: &MessageBuffer) -> Result<usize> {
    let len = u32::deserialize(buffer)? as usize;
    let left = buffer.remaining();
    if len > left {
        return Err(ShmemLibError::BufferUnderrun {
            requested: len,
            available: left,
        });
    }
    Ok(len)
}

fn write_len(buffer: &mut MessageBuffer, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| ShmemLibError::Protocol(format!("length {} does not fit u32", len)))?;
    len.serialize(buffer)
}

impl Serializable for String {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        write_len(buffer, self.len())?;
        buffer.write_bytes(self.as_bytes())
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        let len = read_len(buffer)?;
        let bytes = buffer.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ShmemLibError::Protocol(format!("string is not utf-8: {}", e)))
    }
}

impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        write_len(buffer, self.len())?;
        for item in self {
            item.serialize(buffer)?;
        }
        Ok(())
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        // every element takes at least one byte
        let len = read_len(buffer)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::deserialize(buffer)?);
        }
        Ok(items)
    }
}

impl<T> Serializable for ShMemPtr<T> {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        self.handle().serialize(buffer)?;
        self.offset().serialize(buffer)
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        let handle = Handle::deserialize(buffer)?;
        let offset = i32::deserialize(buffer)?;
        Ok(ShMemPtr::at(handle, offset))
    }
}
