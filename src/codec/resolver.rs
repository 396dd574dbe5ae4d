//! Formatter resolution
//!
//! A [`FormatterResolver`] maps a type to its [`Formatter`]. Resolvers are
//! composed into chains ([`CompositeResolver`]) where the first resolver
//! with a binding wins. Lookups by compile-time type go through
//! `get_formatter::<T>()`; lookups by runtime type go through
//! `get_formatter_dynamic(ty)`, which builds a type-erased binding once per
//! (resolver, type) and caches it.
//!
//! ```
//! use std::sync::Arc;
//! use msgpack_lz4::{CompositeResolver, FormatterResolver, StandardResolver};
//!
//! let chain = CompositeResolver::new("App", vec![Arc::new(StandardResolver::new())]);
//! let resolver: &dyn FormatterResolver = &chain;
//! assert!(resolver.get_formatter::<i64>().unwrap().is_some());
//! assert!(resolver.get_formatter::<std::time::Duration>().unwrap().is_none());
//! ```

use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

use super::dynamic::{BoxedValue, DynFormatter, DynValue, ErasedFormatter, RuntimeType};
use crate::error::{CodecError, Result};

/// Encode/decode pair for one type.
///
/// `serialize` writes at `offset`, growing `bytes` as needed, and returns the
/// number of bytes written. `deserialize` reads from `offset` and returns the
/// value with the number of bytes consumed.
pub trait Formatter<T>: Send + Sync {
    fn serialize(
        &self,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &T,
        resolver: &dyn FormatterResolver,
    ) -> Result<usize>;

    fn deserialize(
        &self,
        bytes: &[u8],
        offset: usize,
        resolver: &dyn FormatterResolver,
    ) -> Result<(T, usize)>;
}

type ErasedTyped = Arc<dyn Any + Send + Sync>;

/// A type's formatter, as stored by a resolver.
///
/// Holds the typed formatter behind `dyn Any` together with the monomorphized
/// function that wraps it into a [`DynFormatter`].
#[derive(Clone)]
pub struct FormatterBinding {
    ty: RuntimeType,
    typed: ErasedTyped,
    erase: fn(&ErasedTyped) -> Option<Arc<dyn DynFormatter>>,
}

impl FormatterBinding {
    pub fn new<T, F>(formatter: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Formatter<T> + 'static,
    {
        Self::from_arc::<T>(Arc::new(formatter))
    }

    pub fn from_arc<T: Send + Sync + 'static>(formatter: Arc<dyn Formatter<T>>) -> Self {
        Self {
            ty: RuntimeType::of::<T>(),
            typed: Arc::new(formatter),
            erase: erase_binding::<T>,
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.ty
    }

    /// The typed formatter, if this binding is for `T`.
    pub fn typed<T: 'static>(&self) -> Option<Arc<dyn Formatter<T>>> {
        self.typed.downcast_ref::<Arc<dyn Formatter<T>>>().cloned()
    }

    fn erased(&self) -> Option<Arc<dyn DynFormatter>> {
        (self.erase)(&self.typed)
    }
}

fn erase_binding<T: Send + Sync + 'static>(typed: &ErasedTyped) -> Option<Arc<dyn DynFormatter>> {
    let formatter = typed.downcast_ref::<Arc<dyn Formatter<T>>>()?.clone();
    Some(Arc::new(ErasedFormatter::new(formatter)))
}

/// Maps types to formatters.
///
/// `binding` returns `Ok(None)` for types the resolver does not know; an
/// `Err` means the binding exists but could not be built.
pub trait FormatterResolver: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn binding(&self, ty: RuntimeType) -> Result<Option<FormatterBinding>>;

    /// Cache for type-erased bindings; `None` rebuilds them on every lookup.
    fn dynamic_cache(&self) -> Option<&DynamicCache> {
        None
    }
}

impl<'a> dyn FormatterResolver + 'a {
    /// The formatter for `T`, or `None` if unknown to this resolver.
    pub fn get_formatter<T: 'static>(&self) -> Result<Option<Arc<dyn Formatter<T>>>> {
        let ty = RuntimeType::of::<T>();
        match self.binding(ty)? {
            Some(binding) => binding.typed::<T>().map(Some).ok_or_else(|| CodecError::TypeMismatch {
                expected: ty.name().to_string(),
            }),
            None => Ok(None),
        }
    }

    /// The formatter for `T`, failing with `NotRegistered` if unknown.
    ///
    /// Initialization failures are reported by their root cause.
    pub fn get_formatter_with_verify<T: 'static>(&self) -> Result<Arc<dyn Formatter<T>>> {
        match self.get_formatter::<T>() {
            Ok(Some(formatter)) => Ok(formatter),
            Ok(None) => Err(CodecError::NotRegistered {
                type_name: std::any::type_name::<T>().to_string(),
                resolver: self.name().to_string(),
            }),
            Err(err) => Err(err.root_cause()),
        }
    }

    /// The type-erased formatter for a runtime type, built once and cached.
    pub fn get_formatter_dynamic(&self, ty: RuntimeType) -> Result<Arc<dyn DynFormatter>> {
        let build = || match self.binding(ty) {
            Ok(Some(binding)) => binding.erased().ok_or_else(|| CodecError::TypeMismatch {
                expected: ty.name().to_string(),
            }),
            Ok(None) => Err(CodecError::NotRegistered {
                type_name: ty.name().to_string(),
                resolver: self.name().to_string(),
            }),
            Err(err) => Err(err.root_cause()),
        };
        match self.dynamic_cache() {
            Some(cache) => cache.get_or_create(ty, build),
            None => build(),
        }
    }

    /// Serialize a value through the formatter for its runtime type.
    pub fn serialize_dynamic(
        &self,
        ty: RuntimeType,
        bytes: &mut Vec<u8>,
        offset: usize,
        value: &dyn DynValue,
    ) -> Result<usize> {
        self.get_formatter_dynamic(ty)?
            .serialize_dyn(bytes, offset, value, self)
    }

    /// Deserialize a value of the given runtime type.
    pub fn deserialize_dynamic(
        &self,
        ty: RuntimeType,
        bytes: &[u8],
        offset: usize,
    ) -> Result<(BoxedValue, usize)> {
        self.get_formatter_dynamic(ty)?
            .deserialize_dyn(bytes, offset, self)
    }
}

/// Per-resolver cache of type-erased bindings.
///
/// Concurrent first lookups of one type may each build a binding, but only
/// the first one inserted is ever returned; the others are dropped.
#[derive(Default)]
pub struct DynamicCache {
    entries: RwLock<FxHashMap<TypeId, Arc<dyn DynFormatter>>>,
}

impl DynamicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<F>(&self, ty: RuntimeType, build: F) -> Result<Arc<dyn DynFormatter>>
    where
        F: FnOnce() -> Result<Arc<dyn DynFormatter>>,
    {
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ty.id())
        {
            return Ok(hit.clone());
        }

        let built = build()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let winner = entries.entry(ty.id()).or_insert_with(|| {
            debug_event!("created dynamic formatter binding for {}", ty.name());
            built
        });
        Ok(winner.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type BindingFactory = Box<dyn Fn() -> Result<FormatterBinding> + Send + Sync>;

enum Entry {
    Ready(FormatterBinding),
    Lazy {
        cell: OnceLock<Result<FormatterBinding>>,
        factory: BindingFactory,
    },
}

/// A fixed table of formatters, keyed by type.
///
/// Built by chaining `with`/`with_lazy`; immutable once built.
pub struct FormatterMap {
    name: String,
    entries: FxHashMap<TypeId, Entry>,
    cache: DynamicCache,
}

impl FormatterMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: FxHashMap::default(),
            cache: DynamicCache::new(),
        }
    }

    /// Bind `formatter` to `T`, replacing any earlier binding.
    pub fn with<T, F>(mut self, formatter: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Formatter<T> + 'static,
    {
        self.entries
            .insert(TypeId::of::<T>(), Entry::Ready(FormatterBinding::new(formatter)));
        self
    }

    /// Bind `T` to a formatter built on first lookup.
    ///
    /// A failed build is remembered and reported on every later lookup.
    pub fn with_lazy<T, F, I>(mut self, init: I) -> Self
    where
        T: Send + Sync + 'static,
        F: Formatter<T> + 'static,
        I: Fn() -> Result<F> + Send + Sync + 'static,
    {
        let factory: BindingFactory = Box::new(move || init().map(FormatterBinding::new::<T, F>));
        self.entries.insert(
            TypeId::of::<T>(),
            Entry::Lazy {
                cell: OnceLock::new(),
                factory,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FormatterResolver for FormatterMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self, ty: RuntimeType) -> Result<Option<FormatterBinding>> {
        match self.entries.get(&ty.id()) {
            None => Ok(None),
            Some(Entry::Ready(binding)) => Ok(Some(binding.clone())),
            Some(Entry::Lazy { cell, factory }) => match cell.get_or_init(|| factory()) {
                Ok(binding) => Ok(Some(binding.clone())),
                Err(err) => Err(CodecError::Initialization {
                    type_name: ty.name().to_string(),
                    source: Arc::new(err.clone()),
                }),
            },
        }
    }

    fn dynamic_cache(&self) -> Option<&DynamicCache> {
        Some(&self.cache)
    }
}

/// Ordered chain of resolvers; the first one with a binding wins.
pub struct CompositeResolver {
    name: String,
    resolvers: Vec<Arc<dyn FormatterResolver>>,
    cache: DynamicCache,
}

impl CompositeResolver {
    pub fn new(name: impl Into<String>, resolvers: Vec<Arc<dyn FormatterResolver>>) -> Self {
        Self {
            name: name.into(),
            resolvers,
            cache: DynamicCache::new(),
        }
    }

    pub fn resolvers(&self) -> &[Arc<dyn FormatterResolver>] {
        &self.resolvers
    }
}

impl FormatterResolver for CompositeResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self, ty: RuntimeType) -> Result<Option<FormatterBinding>> {
        for resolver in &self.resolvers {
            if let Some(binding) = resolver.binding(ty)? {
                return Ok(Some(binding));
            }
        }
        Ok(None)
    }

    fn dynamic_cache(&self) -> Option<&DynamicCache> {
        Some(&self.cache)
    }
}

fn default_slot() -> &'static ArcSwap<Arc<dyn FormatterResolver>> {
    static DEFAULT: OnceLock<ArcSwap<Arc<dyn FormatterResolver>>> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        let standard: Arc<dyn FormatterResolver> = super::formatters::StandardResolver::shared();
        ArcSwap::from_pointee(standard)
    })
}

/// The process-wide default resolver (initially the [`StandardResolver`]).
///
/// [`StandardResolver`]: super::formatters::StandardResolver
pub fn default_resolver() -> Arc<dyn FormatterResolver> {
    (*default_slot().load_full()).clone()
}

/// Replace the process-wide default resolver.
pub fn set_default_resolver(resolver: Arc<dyn FormatterResolver>) {
    default_slot().store(Arc::new(resolver));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary;
    use crate::codec::formatters::StandardResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    struct PointFormatter;

    impl Formatter<Point> for PointFormatter {
        fn serialize(
            &self,
            bytes: &mut Vec<u8>,
            offset: usize,
            value: &Point,
            _resolver: &dyn FormatterResolver,
        ) -> Result<usize> {
            let mut cursor = offset;
            cursor += binary::write_array_header(bytes, cursor, 2)?;
            cursor += binary::write_i64(bytes, cursor, value.x as i64)?;
            cursor += binary::write_i64(bytes, cursor, value.y as i64)?;
            Ok(cursor - offset)
        }

        fn deserialize(
            &self,
            bytes: &[u8],
            offset: usize,
            _resolver: &dyn FormatterResolver,
        ) -> Result<(Point, usize)> {
            let (len, mut cursor) = binary::read_array_header(bytes, offset)?;
            if len != 2 {
                return Err(CodecError::format(offset, "Point expects 2 fields"));
            }
            let (x, n) = binary::read_i32(bytes, offset + cursor)?;
            cursor += n;
            let (y, n) = binary::read_i32(bytes, offset + cursor)?;
            cursor += n;
            Ok((Point { x, y }, cursor))
        }
    }

    fn points() -> FormatterMap {
        FormatterMap::new("Points").with::<Point, _>(PointFormatter)
    }

    #[test]
    fn test_unknown_type_is_absent_not_error() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        assert!(resolver.get_formatter::<String>().unwrap().is_none());
    }

    #[test]
    fn test_verify_names_type_and_resolver() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        match resolver.get_formatter_with_verify::<String>() {
            Err(CodecError::NotRegistered { type_name, resolver }) => {
                assert_eq!(type_name, std::any::type_name::<String>());
                assert_eq!(resolver, "Points");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_chain_first_binding_wins() {
        struct Zero;
        impl Formatter<i64> for Zero {
            fn serialize(&self, bytes: &mut Vec<u8>, offset: usize, _: &i64, _: &dyn FormatterResolver) -> Result<usize> {
                binary::write_i64(bytes, offset, 0)
            }
            fn deserialize(&self, bytes: &[u8], offset: usize, _: &dyn FormatterResolver) -> Result<(i64, usize)> {
                binary::read_i64(bytes, offset)
            }
        }

        let chain = CompositeResolver::new(
            "Chain",
            vec![
                Arc::new(FormatterMap::new("Override").with::<i64, _>(Zero)),
                Arc::new(StandardResolver::new()),
            ],
        );
        let resolver: &dyn FormatterResolver = &chain;
        let formatter = resolver.get_formatter_with_verify::<i64>().unwrap();
        let mut bytes = Vec::new();
        let n = formatter.serialize(&mut bytes, 0, &99, resolver).unwrap();
        assert_eq!(&bytes[..n], &[0x00]);

        // falls through to the standard resolver
        assert!(resolver.get_formatter::<String>().unwrap().is_some());
    }

    #[test]
    fn test_dynamic_roundtrip() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let value = Point { x: 10, y: -20 };

        let mut bytes = Vec::new();
        let written = resolver
            .serialize_dynamic(RuntimeType::of::<Point>(), &mut bytes, 0, &value)
            .unwrap();
        let (decoded, read) = resolver
            .deserialize_dynamic(RuntimeType::of::<Point>(), &bytes[..written], 0)
            .unwrap();

        assert_eq!(read, written);
        assert_eq!(decoded.downcast_ref::<Point>(), Some(&value));
    }

    #[test]
    fn test_dynamic_type_mismatch() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let mut bytes = Vec::new();
        let err = resolver
            .serialize_dynamic(RuntimeType::of::<Point>(), &mut bytes, 0, &"not a point".to_string())
            .unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn test_dynamic_not_registered_names_concrete_type() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let Err(err) = resolver.get_formatter_dynamic(RuntimeType::of::<u128>()) else {
            panic!("u128 should not resolve");
        };
        match err {
            CodecError::NotRegistered { type_name, .. } => assert_eq!(type_name, "u128"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(map.cache.is_empty());
    }

    #[test]
    fn test_dynamic_binding_is_cached_per_resolver() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let a = resolver.get_formatter_dynamic(RuntimeType::of::<Point>()).unwrap();
        let b = resolver.get_formatter_dynamic(RuntimeType::of::<Point>()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.runtime_type(), RuntimeType::of::<Point>());

        let other = points();
        let other: &dyn FormatterResolver = &other;
        let c = other.get_formatter_dynamic(RuntimeType::of::<Point>()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_concurrent_dynamic_lookup_yields_single_binding() {
        const THREADS: usize = 16;
        let map = Arc::new(points());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let resolver: &dyn FormatterResolver = &*map;
                    let binding = resolver.get_formatter_dynamic(RuntimeType::of::<Point>()).unwrap();
                    Arc::as_ptr(&binding) as *const () as usize
                })
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(map.cache.len(), 1);
    }

    #[test]
    fn test_cache_discards_losing_construction() {
        let cache = DynamicCache::new();
        let builds = AtomicUsize::new(0);
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            resolver.get_formatter_dynamic(RuntimeType::of::<Point>())
        };

        let first = cache.get_or_create(RuntimeType::of::<Point>(), build).unwrap();
        let second = cache.get_or_create(RuntimeType::of::<Point>(), build).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_initialization_failure_surfaces_root_cause() {
        let map = FormatterMap::new("Lazy").with_lazy::<Point, PointFormatter, _>(|| {
            Err(CodecError::Initialization {
                type_name: "nested".to_string(),
                source: Arc::new(CodecError::TypeNotFound {
                    type_name: "geometry::Plane".to_string(),
                }),
            })
        });
        let resolver: &dyn FormatterResolver = &map;

        // plain lookup reports the wrapper
        assert!(matches!(
            resolver.get_formatter::<Point>(),
            Err(CodecError::Initialization { .. })
        ));

        // verified lookup reports the root cause, on every call
        for _ in 0..2 {
            match resolver.get_formatter_with_verify::<Point>() {
                Err(CodecError::TypeNotFound { type_name }) => assert_eq!(type_name, "geometry::Plane"),
                other => panic!("unexpected: {:?}", other.err()),
            }
        }
    }

    #[test]
    fn test_lazy_initialization_runs_once() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);
        let map = FormatterMap::new("Lazy").with_lazy::<Point, _, _>(|| {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Ok(PointFormatter)
        });
        let resolver: &dyn FormatterResolver = &map;
        resolver.get_formatter_with_verify::<Point>().unwrap();
        resolver.get_formatter_with_verify::<Point>().unwrap();
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_binding_is_stable() {
        let map = points();
        let resolver: &dyn FormatterResolver = &map;
        let a = resolver.get_formatter::<Point>().unwrap().unwrap();
        let b = resolver.get_formatter::<Point>().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
