//! Type-erased values and formatters
//!
//! A [`Formatter<T>`] is statically typed. When only a runtime type handle is
//! available (an embedded-type payload, a field declared as "any value"),
//! the resolver hands out a [`DynFormatter`] instead: a non-generic wrapper
//! that downcasts the value and forwards to the typed formatter it was built
//! from, so the typed fast path is untouched.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use super::resolver::{Formatter, FormatterResolver};
use crate::error::{CodecError, Result};

/// Runtime handle for a concrete type.
#[derive(Clone, Copy)]
pub struct RuntimeType {
    id: TypeId,
    name: &'static str,
}

impl RuntimeType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Compiler-provided type name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for RuntimeType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RuntimeType {}

impl Hash for RuntimeType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A value whose concrete type is only known at run time.
///
/// Implemented for every `Send + Sync + 'static` type. Call the inherent
/// helpers on `dyn DynValue` (`value_type`, `downcast_ref`, ...) rather than
/// the trait methods on a `Box<dyn DynValue>`, which would describe the box.
pub trait DynValue: Any + Send + Sync {
    fn dyn_type(&self) -> RuntimeType;
    fn dyn_any(&self) -> &dyn Any;
    fn dyn_into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> DynValue for T {
    fn dyn_type(&self) -> RuntimeType {
        RuntimeType::of::<T>()
    }

    fn dyn_any(&self) -> &dyn Any {
        self
    }

    fn dyn_into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Owned value of a runtime-determined type.
pub type BoxedValue = Box<dyn DynValue>;

impl dyn DynValue {
    /// The concrete type behind the trait object.
    pub fn value_type(&self) -> RuntimeType {
        self.dyn_type()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.dyn_any().is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.dyn_any().downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(self: Box<Self>) -> Option<Box<T>> {
        self.dyn_into_any().downcast::<T>().ok()
    }
}

impl fmt::Debug for dyn DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynValue<{}>", self.value_type().name())
    }
}

/// Formatter contract with the value type erased.
pub trait DynFormatter: Send + Sync {
    /// The concrete type this formatter was built for.
    fn runtime_type(&self) -> RuntimeType;

    fn serialize_dyn(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &dyn DynValue,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize>;

    fn deserialize_dyn(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(BoxedValue, usize)>;
}

/// Forwards erased calls to a typed formatter.
pub(crate) struct ErasedFormatter<T> {
    inner: Arc<dyn Formatter<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ErasedFormatter<T> {
    pub(crate) fn new(inner: Arc<dyn Formatter<T>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> DynFormatter for ErasedFormatter<T> {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::of::<T>()
    }

    fn serialize_dyn(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &dyn DynValue,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| CodecError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
            })?;
        self.inner.serialize(bytes, offset, typed, resolver)
    }

    fn deserialize_dyn(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(BoxedValue, usize)> {
        let (value, size) = self.inner.deserialize(bytes, offset, resolver)?;
        Ok((Box::new(value), size))
    }
}
