//! Formatters for primitive types and the resolver that bundles them.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use super::binary;
use super::dynamic::RuntimeType;
use super::resolver::{DynamicCache, Formatter, FormatterBinding, FormatterMap, FormatterResolver};
use crate::error::{CodecError, Result};

/// `()` as nil.
pub struct NilFormatter;

impl Formatter<()> for NilFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, _: &(), _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_nil(bytes, offset)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<((), usize)> {
        Ok(((), binary::read_nil(bytes, offset)?))
    }
}

pub struct BoolFormatter;

impl Formatter<bool> for BoolFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &bool, _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_bool(bytes, offset, *value)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(bool, usize)> {
        binary::read_bool(bytes, offset)
    }
}

/// Every fixed-width integer type, in its narrowest wire form.
pub struct IntegerFormatter;

macro_rules! integer_formatter {
    (signed: $($ty:ty),*) => {$(
        impl Formatter<$ty> for IntegerFormatter {
            fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &$ty, _: &dyn FormatterResolver) -> Result<usize> {
                binary::write_i64(bytes, offset, *value as i64)
            }

            fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<($ty, usize)> {
                let (v, size) = binary::read_i64(bytes, offset)?;
                let v = <$ty>::try_from(v).map_err(|_| {
                    CodecError::format(offset, format!("{v} out of range for {}", type_name::<$ty>()))
                })?;
                Ok((v, size))
            }
        }
    )*};
    (unsigned: $($ty:ty),*) => {$(
        impl Formatter<$ty> for IntegerFormatter {
            fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &$ty, _: &dyn FormatterResolver) -> Result<usize> {
                binary::write_u64(bytes, offset, *value as u64)
            }

            fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<($ty, usize)> {
                let (v, size) = binary::read_u64(bytes, offset)?;
                let v = <$ty>::try_from(v).map_err(|_| {
                    CodecError::format(offset, format!("{v} out of range for {}", type_name::<$ty>()))
                })?;
                Ok((v, size))
            }
        }
    )*};
}

integer_formatter!(signed: i8, i16, i32, i64);
integer_formatter!(unsigned: u8, u16, u32, u64);

pub struct FloatFormatter;

impl Formatter<f64> for FloatFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &f64, _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_f64(bytes, offset, *value)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(f64, usize)> {
        binary::read_f64(bytes, offset)
    }
}

impl Formatter<f32> for FloatFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &f32, _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_f32(bytes, offset, *value)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(f32, usize)> {
        binary::read_f32(bytes, offset)
    }
}

pub struct StringFormatter;

impl Formatter<String> for StringFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &String, _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_string(bytes, offset, value)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(String, usize)> {
        binary::read_string(bytes, offset)
    }
}

/// `Vec<u8>` as MessagePack binary.
pub struct BytesFormatter;

impl Formatter<Vec<u8>> for BytesFormatter {
    fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, value: &Vec<u8>, _: &dyn FormatterResolver) -> Result<usize> {
        binary::write_bin(bytes, offset, value)
    }

    fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(Vec<u8>, usize)> {
        let (data, size) = binary::read_bin(bytes, offset)?;
        Ok((data.to_vec(), size))
    }
}

/// `Option<T>`: nil for `None`, otherwise `T` through the resolver.
pub struct NullableFormatter<T>(PhantomData<fn() -> T>);

impl<T> NullableFormatter<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for NullableFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Formatter<Option<T>> for NullableFormatter<T> {
    fn serialize(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &Option<T>,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        match value {
            None => binary::write_nil(bytes, offset),
            Some(inner) => resolver
                .get_formatter_with_verify::<T>()?
                .serialize(bytes, offset, inner, resolver),
        }
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(Option<T>, usize)> {
        if binary::is_nil(bytes, offset)? {
            return Ok((None, 1));
        }
        let (value, size) = resolver
            .get_formatter_with_verify::<T>()?
            .deserialize(bytes, offset, resolver)?;
        Ok((Some(value), size))
    }
}

/// `Vec<T>` as an array, elements through the resolver.
pub struct ArrayFormatter<T>(PhantomData<fn() -> T>);

impl<T> ArrayFormatter<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ArrayFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Formatter<Vec<T>> for ArrayFormatter<T> {
    fn serialize(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &Vec<T>,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        let count = u32::try_from(value.len()).map_err(|_| CodecError::Capacity {
            requested: value.len(),
        })?;
        let element = resolver.get_formatter_with_verify::<T>()?;
        let mut cursor = offset;
        cursor += binary::write_array_header(bytes, cursor, count)?;
        for item in value {
            cursor += element.serialize(bytes, cursor, item, resolver)?;
        }
        Ok(cursor - offset)
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(Vec<T>, usize)> {
        let (count, mut cursor) = binary::read_array_header(bytes, offset)?;
        let element = resolver.get_formatter_with_verify::<T>()?;
        // every element occupies at least one byte
        let remaining = bytes.len().saturating_sub(offset + cursor);
        let mut items = Vec::with_capacity((count as usize).min(remaining));
        for _ in 0..count {
            let (item, size) = element.deserialize(bytes, offset + cursor, resolver)?;
            items.push(item);
            cursor += size;
        }
        Ok((items, cursor))
    }
}

macro_rules! register_primitives {
    ($map:expr, $formatter:expr => $($ty:ty),*) => {
        $map$(
            .with::<$ty, _>($formatter)
            .with::<Option<$ty>, _>(NullableFormatter::<$ty>::new())
        )*
    };
}

/// Formatters for `()`, `bool`, integers, floats, `String`, `Vec<u8>`,
/// their `Option`s, and `Vec`s of the common scalar types.
pub struct StandardResolver {
    map: FormatterMap,
}

impl StandardResolver {
    pub fn new() -> Self {
        let map = FormatterMap::new("StandardResolver").with::<(), _>(NilFormatter);
        let map = register_primitives!(map, BoolFormatter => bool);
        let map = register_primitives!(map, IntegerFormatter => i8, i16, i32, i64, u8, u16, u32, u64);
        let map = register_primitives!(map, FloatFormatter => f32, f64);
        let map = register_primitives!(map, StringFormatter => String);
        let map = register_primitives!(map, BytesFormatter => Vec<u8>);
        let map = map
            .with::<Vec<bool>, _>(ArrayFormatter::<bool>::new())
            .with::<Vec<i32>, _>(ArrayFormatter::<i32>::new())
            .with::<Vec<i64>, _>(ArrayFormatter::<i64>::new())
            .with::<Vec<u64>, _>(ArrayFormatter::<u64>::new())
            .with::<Vec<f64>, _>(ArrayFormatter::<f64>::new())
            .with::<Vec<String>, _>(ArrayFormatter::<String>::new());
        Self { map }
    }

    /// A process-wide instance.
    pub fn shared() -> Arc<StandardResolver> {
        static SHARED: OnceLock<Arc<StandardResolver>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(StandardResolver::new())).clone()
    }
}

impl Default for StandardResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatterResolver for StandardResolver {
    fn name(&self) -> &str {
        self.map.name()
    }

    fn binding(&self, ty: RuntimeType) -> Result<Option<FormatterBinding>> {
        self.map.binding(ty)
    }

    fn dynamic_cache(&self) -> Option<&DynamicCache> {
        self.map.dynamic_cache()
    }
}
