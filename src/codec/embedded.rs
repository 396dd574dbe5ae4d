//! Values that carry their own runtime type
//!
//! The embedded-type envelope is a two-element array: the value's type
//! identifier as a string, then the value encoded by the formatter for that
//! type. Decoding resolves the identifier through a [`TypeRegistry`], so only
//! types the application registered can be produced. Identifiers on the
//! [`TypeDenylist`] are refused in both directions.
//!
//! ```
//! use std::sync::Arc;
//! use msgpack_lz4::{
//!     BoxedValue, EmbeddedTypeFormatter, EmbeddedTypeResolver, FormatterResolver, TypeRegistry,
//! };
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<i64>().unwrap();
//! let resolver = EmbeddedTypeResolver::new(EmbeddedTypeFormatter::new(Arc::new(registry)), vec![]);
//! let resolver: &dyn FormatterResolver = &resolver;
//!
//! let formatter = resolver.get_formatter_with_verify::<Option<BoxedValue>>().unwrap();
//! let mut bytes = Vec::new();
//! let value: Option<BoxedValue> = Some(Box::new(7i64));
//! let written = formatter.serialize(&mut bytes, 0, &value, resolver).unwrap();
//!
//! let (decoded, _) = formatter.deserialize(&bytes[..written], 0, resolver).unwrap();
//! assert_eq!(decoded.unwrap().downcast_ref::<i64>(), Some(&7));
//! ```

use std::any::TypeId;
use std::borrow::Cow;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::binary;
use super::dynamic::{BoxedValue, DynValue, RuntimeType};
use super::formatters::StandardResolver;
use super::resolver::{
    CompositeResolver, DynamicCache, Formatter, FormatterBinding, FormatterMap, FormatterResolver,
};
use crate::error::{CodecError, Result};

/// Identifiers refused by every [`TypeDenylist`].
///
/// Types that take hold of OS resources when constructed.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "std::fs::File",
    "std::fs::ReadDir",
    "std::process::Command",
    "std::process::Child",
    "std::process::Stdio",
    "std::net::tcp::TcpStream",
    "std::net::tcp::TcpListener",
    "std::net::udp::UdpSocket",
];

/// Canonical form of a compiler type name.
///
/// Whitespace is dropped except where it separates two identifiers, and the
/// `core::` and `alloc::` roots are spelled `std::`, so the identifier does
/// not depend on which facade a type was reached through.
pub fn canonical_type_name(raw: &str) -> String {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut segment_start = true;
    let mut skipped_space = false;
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            skipped_space = true;
            segment_start = true;
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if skipped_space && is_ident(c) && out.chars().last().is_some_and(is_ident) {
            out.push(' ');
        }
        skipped_space = false;
        if segment_start {
            let tail = rest
                .strip_prefix("core::")
                .or_else(|| rest.strip_prefix("alloc::"));
            if let Some(tail) = tail {
                out.push_str("std::");
                rest = tail;
                segment_start = false;
                continue;
            }
        }
        out.push(c);
        segment_start = !(is_ident(c) || c == ':');
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// The canonical identifier of `T`.
pub fn type_identifier<T: ?Sized + 'static>() -> String {
    canonical_type_name(std::any::type_name::<T>())
}

/// The set of types an embedded-type envelope may name when decoding.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    by_identifier: FxHashMap<String, RuntimeType>,
    by_type: FxHashMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its canonical identifier.
    pub fn register<T: ?Sized + 'static>(&mut self) -> Result<()> {
        self.register_as::<T>(type_identifier::<T>())
    }

    /// Register `T` under an explicit identifier.
    ///
    /// Encoding uses the identifier registered last; every registered
    /// identifier still decodes.
    pub fn register_as<T: ?Sized + 'static>(&mut self, identifier: impl Into<String>) -> Result<()> {
        let identifier = identifier.into();
        let ty = RuntimeType::of::<T>();
        if let Some(existing) = self.by_identifier.get(&identifier) {
            if *existing != ty {
                return Err(CodecError::DuplicateTypeIdentifier { identifier });
            }
        }
        self.by_type.insert(ty.id(), identifier.clone());
        self.by_identifier.insert(identifier, ty);
        Ok(())
    }

    /// Identifier written for values of `ty`.
    pub fn identifier_of(&self, ty: RuntimeType) -> Cow<'_, str> {
        match self.by_type.get(&ty.id()) {
            Some(identifier) => Cow::Borrowed(identifier.as_str()),
            None => Cow::Owned(canonical_type_name(ty.name())),
        }
    }

    pub fn resolve(&self, identifier: &str) -> Option<RuntimeType> {
        self.by_identifier.get(identifier).copied()
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }
}

/// Identifiers refused by the embedded-type codec. Matching is exact.
///
/// Always contains [`DEFAULT_DENYLIST`]; entries can be added, never removed.
#[derive(Clone, Debug)]
pub struct TypeDenylist {
    entries: FxHashSet<String>,
}

impl TypeDenylist {
    pub fn new() -> Self {
        Self::with_entries(std::iter::empty::<String>())
    }

    /// The default entries plus `extra`.
    pub fn with_entries<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = DEFAULT_DENYLIST
            .iter()
            .map(|s| s.to_string())
            .chain(extra.into_iter().map(Into::into))
            .collect();
        Self { entries }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    fn check(&self, identifier: &str) -> Result<()> {
        if self.contains(identifier) {
            warn_event!("refused denylisted type {}", identifier);
            return Err(CodecError::Security {
                type_name: identifier.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for TypeDenylist {
    fn default() -> Self {
        Self::new()
    }
}

/// Formatter for `Option<BoxedValue>`: nil, or `[identifier, payload]`.
#[derive(Clone)]
pub struct EmbeddedTypeFormatter {
    registry: Arc<TypeRegistry>,
    denylist: TypeDenylist,
}

impl EmbeddedTypeFormatter {
    /// A formatter decoding the types in `registry`, with the default denylist.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_denylist(registry, TypeDenylist::new())
    }

    pub fn with_denylist(registry: Arc<TypeRegistry>, denylist: TypeDenylist) -> Self {
        Self { registry, denylist }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn denylist(&self) -> &TypeDenylist {
        &self.denylist
    }

    /// Refuse `ty` if either its identifier or its canonical name is denylisted.
    fn check_type(&self, identifier: &str, ty: RuntimeType) -> Result<()> {
        self.denylist.check(identifier)?;
        let canonical = canonical_type_name(ty.name());
        if canonical != identifier {
            self.denylist.check(&canonical)?;
        }
        Ok(())
    }
}

impl Formatter<Option<BoxedValue>> for EmbeddedTypeFormatter {
    fn serialize(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &Option<BoxedValue>,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        let Some(value) = value else {
            return binary::write_nil(bytes, offset);
        };
        let value: &dyn DynValue = &**value;
        let ty = value.value_type();
        let identifier = self.registry.identifier_of(ty);

        // Nothing is written until the type is known to be encodable.
        self.check_type(&identifier, ty)?;
        let formatter = resolver.get_formatter_dynamic(ty)?;

        let mut cursor = offset;
        cursor += binary::write_array_header(bytes, cursor, 2)?;
        cursor += binary::write_string(bytes, cursor, &identifier)?;
        cursor += formatter.serialize_dyn(bytes, cursor, value, resolver)?;
        Ok(cursor - offset)
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(Option<BoxedValue>, usize)> {
        if binary::is_nil(bytes, offset)? {
            return Ok((None, 1));
        }

        let (count, mut cursor) = binary::read_array_header(bytes, offset)?;
        if count != 2 {
            return Err(CodecError::format(
                offset,
                format!("embedded type envelope must have 2 elements, found {count}"),
            ));
        }

        let (identifier, size) = binary::read_str(bytes, offset + cursor)?;
        cursor += size;
        self.denylist.check(identifier)?;
        let ty = self
            .registry
            .resolve(identifier)
            .ok_or_else(|| CodecError::TypeNotFound {
                type_name: identifier.to_string(),
            })?;
        self.check_type(identifier, ty)?;

        let (value, size) = resolver.deserialize_dynamic(ty, bytes, offset + cursor)?;
        cursor += size;
        Ok((Some(value), cursor))
    }
}

/// Resolver chain with the embedded-type formatter first, then the
/// application's resolvers, then the [`StandardResolver`].
pub struct EmbeddedTypeResolver {
    chain: CompositeResolver,
}

impl EmbeddedTypeResolver {
    pub fn new(formatter: EmbeddedTypeFormatter, application: Vec<Arc<dyn FormatterResolver>>) -> Self {
        let embedded: Arc<dyn FormatterResolver> =
            Arc::new(FormatterMap::new("EmbeddedType").with::<Option<BoxedValue>, _>(formatter));
        let mut resolvers = Vec::with_capacity(application.len() + 2);
        resolvers.push(embedded);
        resolvers.extend(application);
        resolvers.push(StandardResolver::shared());
        Self {
            chain: CompositeResolver::new("EmbeddedTypeResolver", resolvers),
        }
    }
}

impl FormatterResolver for EmbeddedTypeResolver {
    fn name(&self) -> &str {
        self.chain.name()
    }

    fn binding(&self, ty: RuntimeType) -> Result<Option<FormatterBinding>> {
        self.chain.binding(ty)
    }

    fn dynamic_cache(&self) -> Option<&DynamicCache> {
        self.chain.dynamic_cache()
    }
}
