//! Call-argument model
//!
//! A memoized call is described by an ordered list of named [`ArgValue`]s.
//! The tree is cheap to clone (every container is reference counted) so the
//! fingerprinter can walk it without borrowing gymnastics.
//!
//! [`ArgValue::Shared`] nodes are the only way to build a cycle: a shared
//! cell can be filled after it has been cloned into its own contents.
//!
//! ```
//! use memora_domain::{ArgValue, CallArgs, SharedArg};
//!
//! let args = CallArgs::new().arg("user_id", 42).arg("fields", vec!["name", "email"]);
//! assert_eq!(args.len(), 2);
//!
//! let cell = SharedArg::new(ArgValue::Unit);
//! cell.set(ArgValue::seq([ArgValue::Shared(cell.clone())]));
//! ```

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::SKIP_CACHE_ARG;

/// Custom cache-key function
///
/// Receives the call's arguments and returns the value to fingerprint in
/// their place. `None` means no usable key could be produced.
pub type KeyFn = Arc<dyn Fn(&CallArgs) -> Option<ArgValue> + Send + Sync>;

/// One argument value
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// No value
    Unit,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer too large for `Int`
    UInt(u64),
    /// Floating point; NaN payloads are not distinguished
    Float(f64),
    /// UTF-8 text
    Str(Arc<str>),
    /// Raw byte string
    Bytes(Arc<[u8]>),
    /// Ordered sequence; order is significant
    Seq(Arc<[ArgValue]>),
    /// Unordered collection; order is not significant
    Set(Arc<[ArgValue]>),
    /// Key/value pairs in insertion order
    Map(Arc<[(ArgValue, ArgValue)]>),
    /// Mutable cell that may be referenced from several places
    Shared(SharedArg),
    /// Value with no structural encoding, compared by identity
    Opaque(OpaqueArg),
}

impl ArgValue {
    /// Ordered sequence from `items`
    pub fn seq<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ArgValue>,
    {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Unordered collection from `items`
    pub fn set<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ArgValue>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    /// Map from pairs, keeping their order
    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<ArgValue>,
        V: Into<ArgValue>,
    {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Byte string copied from `data`
    pub fn bytes(data: impl AsRef<[u8]>) -> Self {
        Self::Bytes(Arc::from(data.as_ref()))
    }

    /// Wrap `value` in a fresh shared cell
    pub fn shared(value: impl Into<ArgValue>) -> Self {
        Self::Shared(SharedArg::new(value.into()))
    }

    /// Opaque handle owning `value`
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(OpaqueArg::new(value))
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Seq(_) => "seq",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Shared(_) => "shared",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Boolean payload, if this is a `Bool`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text payload, if this is a `Str`
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Shared mutable cell inside an argument tree
///
/// Clones point at the same cell. Identity (not contents) decides whether
/// two occurrences are "the same object" during fingerprinting.
#[derive(Clone)]
pub struct SharedArg(Arc<RwLock<ArgValue>>);

impl SharedArg {
    /// Cell holding `value`
    pub fn new(value: ArgValue) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Replace the cell's contents
    pub fn set(&self, value: ArgValue) {
        *self.0.write() = value;
    }

    /// Shallow copy of the current contents
    pub fn get(&self) -> ArgValue {
        self.0.read().clone()
    }

    /// Stable identity of the cell for as long as it is alive
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// `true` when both handles point at the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedArg {
    // Contents are not printed: the cell may contain itself.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedArg({:#x})", self.addr())
    }
}

/// Arbitrary value without a structural encoding
#[derive(Clone)]
pub struct OpaqueArg {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl OpaqueArg {
    /// Handle owning `value`
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an existing allocation, keeping its identity
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self { inner: value, type_name: std::any::type_name::<T>() }
    }

    /// Type name of the wrapped value, for error messages
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Address identifying the wrapped value
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Borrow the wrapped value if it is a `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueArg<{}>({:#x})", self.type_name, self.addr())
    }
}

// Conversions
// ---------------------------------------------------------------

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(v: $t) -> Self {
                Self::UInt(u64::from(v))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u16, u32, u64);

impl From<()> for ArgValue {
    fn from(_: ()) -> Self {
        Self::Unit
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<usize> for ArgValue {
    fn from(v: usize) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<Arc<str>> for ArgValue {
    fn from(v: Arc<str>) -> Self {
        Self::Str(v)
    }
}

impl From<SharedArg> for ArgValue {
    fn from(v: SharedArg) -> Self {
        Self::Shared(v)
    }
}

impl From<OpaqueArg> for ArgValue {
    fn from(v: OpaqueArg) -> Self {
        Self::Opaque(v)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Unit, Into::into)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        Self::seq(v)
    }
}

impl<T: Into<ArgValue>, const N: usize> From<[T; N]> for ArgValue {
    fn from(v: [T; N]) -> Self {
        Self::seq(v)
    }
}

impl<T: Into<ArgValue>, S> From<HashSet<T, S>> for ArgValue {
    fn from(v: HashSet<T, S>) -> Self {
        Self::set(v)
    }
}

impl<T: Into<ArgValue>> From<BTreeSet<T>> for ArgValue {
    fn from(v: BTreeSet<T>) -> Self {
        Self::set(v)
    }
}

/// Pairs are taken in the map's iteration order, which for `HashMap` is
/// unspecified. Prefer `BTreeMap` when keys must be stable across processes.
impl<K: Into<ArgValue>, V: Into<ArgValue>, S> From<HashMap<K, V, S>> for ArgValue {
    fn from(v: HashMap<K, V, S>) -> Self {
        Self::map(v)
    }
}

impl<K: Into<ArgValue>, V: Into<ArgValue>> From<BTreeMap<K, V>> for ArgValue {
    fn from(v: BTreeMap<K, V>) -> Self {
        Self::map(v)
    }
}

/// Named arguments of one call, in call order
///
/// A boolean argument named `skip_cache` is never stored: it sets the
/// skip-cache flag instead and so never contributes to the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    items: Vec<(Arc<str>, ArgValue)>,
    skip_cache: bool,
}

impl CallArgs {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named argument (builder form)
    pub fn arg(mut self, name: impl Into<Arc<str>>, value: impl Into<ArgValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Append a named argument
    pub fn push(&mut self, name: impl Into<Arc<str>>, value: impl Into<ArgValue>) {
        let name = name.into();
        let value = value.into();
        if &*name == SKIP_CACHE_ARG {
            if let ArgValue::Bool(skip) = value {
                self.skip_cache = skip;
                return;
            }
        }
        self.items.push((name, value));
    }

    /// Bypass the cache for this call (builder form)
    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    /// Whether the caller asked to bypass the lookup
    pub fn skips_cache(&self) -> bool {
        self.skip_cache
    }

    /// Argument named `name`
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.items.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    /// Arguments in call order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.items.iter().map(|(n, v)| (&**n, v))
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Arguments as a fingerprintable map, leaving out `ignored` names
    ///
    /// Pairs keep call order, so the same arguments supplied in a different
    /// order produce a different fingerprint.
    pub fn to_value(&self, ignored: &BTreeSet<String>) -> ArgValue {
        ArgValue::Map(
            self.items
                .iter()
                .filter(|(name, _)| !ignored.contains(&**name))
                .map(|(name, value)| (ArgValue::Str(Arc::clone(name)), value.clone()))
                .collect(),
        )
    }
}
