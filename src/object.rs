//! Opaque runtime values.
//!
//! Messages, labels, and registered-call arguments are carried as an
//! [`Object`]: a reference-counted value with a stable string type key.
//! Behavior (comparison, hashing, serialization, formatting, numeric
//! conversion) is looked up in a process-wide registry populated at
//! registration time and read on the hot path. String keys, rather than
//! platform type-info identity, keep types addressable across dynamically
//! loaded modules.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::util::SpinLockRW;
use crate::{Error, Result};

/// A type that can be stored in an [`Object`].
pub trait ObjectType: Any + Send + Sync {
    /// Stable registry key, unique per type.
    const KEY: &'static str;
}

type AnyArc = Arc<dyn Any + Send + Sync>;

/// Hooks registered per type key.
pub struct TypeHooks {
    pub compare: Option<fn(&dyn Any, &dyn Any) -> Option<Ordering>>,
    pub hash: Option<fn(&dyn Any) -> u64>,
    pub serialize: Option<fn(&dyn Any) -> Vec<u8>>,
    pub deserialize: Option<fn(&[u8]) -> Result<Object>>,
    pub display: fn(&dyn Any) -> String,
    /// Exact integer view, when the type is an integer.
    pub as_int: Option<fn(&dyn Any) -> i128>,
    /// Floating view, when the type is numeric at all.
    pub as_float: Option<fn(&dyn Any) -> f64>,
}

impl fmt::Debug for TypeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHooks")
            .field("compare", &self.compare.is_some())
            .field("hash", &self.hash.is_some())
            .field("serialize", &self.serialize.is_some())
            .finish()
    }
}

fn registry() -> &'static SpinLockRW<HashMap<&'static str, TypeHooks>> {
    static REGISTRY: OnceLock<SpinLockRW<HashMap<&'static str, TypeHooks>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        install_builtins(&mut map);
        SpinLockRW::new(map)
    })
}

/// Register hooks for a user type. Registering a key twice replaces the
/// previous hooks; loaders run this at module initialization.
pub fn register_type<T: ObjectType>(hooks: TypeHooks) {
    registry().write().insert(T::KEY, hooks);
}

/// An opaque, clonable, possibly-null value.
#[derive(Clone, Default)]
pub struct Object {
    inner: Option<ObjectInner>,
}

#[derive(Clone)]
struct ObjectInner {
    key: &'static str,
    value: AnyArc,
}

impl Object {
    /// The null object.
    pub fn null() -> Object {
        Object { inner: None }
    }

    pub fn new<T: ObjectType>(value: T) -> Object {
        Object {
            inner: Some(ObjectInner {
                key: T::KEY,
                value: Arc::new(value),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The registered type key, or `None` for the null object.
    pub fn type_key(&self) -> Option<&'static str> {
        self.inner.as_ref().map(|inner| inner.key)
    }

    /// Exact downcast; no conversion is attempted.
    pub fn get<T: ObjectType>(&self) -> Option<&T> {
        let inner = self.inner.as_ref()?;
        inner.value.downcast_ref::<T>()
    }

    /// Two objects holding the same underlying allocation.
    pub fn same(a: &Object, b: &Object) -> bool {
        match (&a.inner, &b.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.value, &b.value),
            (None, None) => true,
            _ => false,
        }
    }

    fn with_hooks<R>(&self, f: impl FnOnce(&ObjectInner, &TypeHooks) -> Result<R>) -> Result<R> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| Error::ObjectConvert("null object".into()))?;
        let reg = registry().read();
        let hooks = reg
            .get(inner.key)
            .ok_or_else(|| Error::ObjectConvert(format!("unregistered type \"{}\"", inner.key)))?;
        f(inner, hooks)
    }

    fn numeric(&self) -> Result<Numeric> {
        self.with_hooks(|inner, hooks| {
            if let Some(as_int) = hooks.as_int {
                return Ok(Numeric::Int(as_int(inner.value.as_ref())));
            }
            if let Some(as_float) = hooks.as_float {
                return Ok(Numeric::Float(as_float(inner.value.as_ref())));
            }
            Err(Error::ObjectConvert(format!(
                "type \"{}\" is not numeric",
                inner.key
            )))
        })
    }

    /// Convert to a signed integer via the registered numeric table.
    pub fn as_i64(&self) -> Result<i64> {
        match self.numeric()? {
            Numeric::Int(i) => {
                i64::try_from(i).map_err(|_| Error::ObjectConvert(format!("{} out of range", i)))
            }
            Numeric::Float(f) => float_to_int(f).and_then(|i| {
                i64::try_from(i).map_err(|_| Error::ObjectConvert(format!("{} out of range", f)))
            }),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self.numeric()? {
            Numeric::Int(i) => {
                u64::try_from(i).map_err(|_| Error::ObjectConvert(format!("{} out of range", i)))
            }
            Numeric::Float(f) => float_to_int(f).and_then(|i| {
                u64::try_from(i).map_err(|_| Error::ObjectConvert(format!("{} out of range", f)))
            }),
        }
    }

    pub fn as_usize(&self) -> Result<usize> {
        let v = self.as_u64()?;
        usize::try_from(v).map_err(|_| Error::ObjectConvert(format!("{} out of range", v)))
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self.numeric()? {
            Numeric::Int(i) => Ok(i as f64),
            Numeric::Float(f) => Ok(f),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        self.get::<String>()
            .map(|s| s.as_str())
            .ok_or_else(|| Error::ObjectConvert("not a string".into()))
    }

    /// Compare via the registered hooks. Values of different numeric types
    /// compare through the conversion table; anything else must share a
    /// type key and a compare hook.
    pub fn compare(&self, other: &Object) -> Result<Ordering> {
        if self.is_null() && other.is_null() {
            return Ok(Ordering::Equal);
        }
        if self.type_key() == other.type_key() {
            return self.with_hooks(|inner, hooks| {
                let compare = hooks.compare.ok_or_else(|| {
                    Error::ObjectCompare(format!("type \"{}\" is not comparable", inner.key))
                })?;
                let rhs = other.inner.as_ref().expect("same key implies non-null");
                compare(inner.value.as_ref(), rhs.value.as_ref())
                    .ok_or_else(|| Error::ObjectCompare("incomparable values".into()))
            });
        }
        match (self.numeric(), other.numeric()) {
            (Ok(a), Ok(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| Error::ObjectCompare("incomparable numerics".into())),
            _ => Err(Error::ObjectCompare(format!(
                "cannot compare \"{}\" with \"{}\"",
                self.type_key().unwrap_or("null"),
                other.type_key().unwrap_or("null"),
            ))),
        }
    }

    /// Hash via the registered hook.
    pub fn hash_value(&self) -> Result<u64> {
        if self.is_null() {
            return Ok(0);
        }
        self.with_hooks(|inner, hooks| {
            let hash = hooks.hash.ok_or_else(|| {
                Error::ObjectCompare(format!("type \"{}\" is not hashable", inner.key))
            })?;
            Ok(hash(inner.value.as_ref()))
        })
    }

    /// Serialize to a self-describing frame: key length, key bytes, payload
    /// length, payload.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| Error::ObjectConvert("cannot serialize the null object".into()))?;
        let payload = self.with_hooks(|inner, hooks| {
            let serialize = hooks.serialize.ok_or_else(|| {
                Error::ObjectConvert(format!("type \"{}\" is not serializable", inner.key))
            })?;
            Ok(serialize(inner.value.as_ref()))
        })?;
        let key = inner.key.as_bytes();
        let mut out = Vec::with_capacity(2 + key.len() + 4 + payload.len());
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Deserialize a frame produced by [`Object::serialize`]. Trailing
    /// bytes after the frame are rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Object> {
        let (object, used) = Object::deserialize_prefix(bytes)?;
        if used != bytes.len() {
            return Err(Error::DataFormat("trailing bytes after object".into()));
        }
        Ok(object)
    }

    /// Deserialize one frame from the front of `bytes`, returning the
    /// object and the number of bytes consumed.
    pub fn deserialize_prefix(bytes: &[u8]) -> Result<(Object, usize)> {
        if bytes.len() < 2 {
            return Err(Error::DataFormat("truncated object header".into()));
        }
        let key_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let key_end = 2 + key_len;
        if bytes.len() < key_end + 4 {
            return Err(Error::DataFormat("truncated object key".into()));
        }
        let key = std::str::from_utf8(&bytes[2..key_end])
            .map_err(|_| Error::DataFormat("object key is not utf-8".into()))?;
        let payload_len = u32::from_be_bytes([
            bytes[key_end],
            bytes[key_end + 1],
            bytes[key_end + 2],
            bytes[key_end + 3],
        ]) as usize;
        let payload_start = key_end + 4;
        let end = payload_start + payload_len;
        if bytes.len() < end {
            return Err(Error::DataFormat("truncated object payload".into()));
        }
        let payload = &bytes[payload_start..end];

        let deserialize = {
            let reg = registry().read();
            let hooks = reg
                .get(key)
                .ok_or_else(|| Error::DataFormat(format!("unknown type key \"{}\"", key)))?;
            hooks.deserialize.ok_or_else(|| {
                Error::DataFormat(format!("type \"{}\" is not deserializable", key))
            })?
        };
        Ok((deserialize(payload)?, end))
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("null"),
            Some(inner) => {
                let reg = registry().read();
                match reg.get(inner.key) {
                    Some(hooks) => f.write_str(&(hooks.display)(inner.value.as_ref())),
                    None => write!(f, "<{}>", inner.key),
                }
            }
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self)
    }
}

#[derive(Copy, Clone, Debug)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn partial_cmp(&self, other: &Numeric) -> Option<Ordering> {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

fn float_to_int(f: f64) -> Result<i128> {
    if !f.is_finite() {
        return Err(Error::ObjectConvert(format!("{} is not finite", f)));
    }
    Ok(f.trunc() as i128)
}

/***********************************************************************
 * builtin registrations
 **********************************************************************/

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

macro_rules! impl_int_builtin {
    ($ty:ty, $key:literal) => {
        impl ObjectType for $ty {
            const KEY: &'static str = $key;
        }

        impl From<$ty> for Object {
            fn from(value: $ty) -> Object {
                Object::new(value)
            }
        }
    };
}

impl_int_builtin!(i8, "int8");
impl_int_builtin!(i16, "int16");
impl_int_builtin!(i32, "int32");
impl_int_builtin!(i64, "int64");
impl_int_builtin!(u8, "uint8");
impl_int_builtin!(u16, "uint16");
impl_int_builtin!(u32, "uint32");
impl_int_builtin!(u64, "uint64");

impl ObjectType for f32 {
    const KEY: &'static str = "float32";
}

impl ObjectType for f64 {
    const KEY: &'static str = "float64";
}

impl ObjectType for bool {
    const KEY: &'static str = "bool";
}

impl ObjectType for String {
    const KEY: &'static str = "string";
}

impl ObjectType for Vec<u8> {
    const KEY: &'static str = "blob";
}

impl ObjectType for Vec<Object> {
    const KEY: &'static str = "object_vector";
}

impl From<f32> for Object {
    fn from(value: f32) -> Object {
        Object::new(value)
    }
}

impl From<f64> for Object {
    fn from(value: f64) -> Object {
        Object::new(value)
    }
}

impl From<bool> for Object {
    fn from(value: bool) -> Object {
        Object::new(value)
    }
}

impl From<String> for Object {
    fn from(value: String) -> Object {
        Object::new(value)
    }
}

impl From<&str> for Object {
    fn from(value: &str) -> Object {
        Object::new(value.to_owned())
    }
}

impl From<Vec<u8>> for Object {
    fn from(value: Vec<u8>) -> Object {
        Object::new(value)
    }
}

impl From<Vec<Object>> for Object {
    fn from(value: Vec<Object>) -> Object {
        Object::new(value)
    }
}

macro_rules! int_hooks {
    ($map:expr, $ty:ty) => {
        $map.insert(
            <$ty as ObjectType>::KEY,
            TypeHooks {
                compare: Some(|a, b| {
                    let a = a.downcast_ref::<$ty>()?;
                    let b = b.downcast_ref::<$ty>()?;
                    Some(a.cmp(b))
                }),
                hash: Some(|a| {
                    let v = a.downcast_ref::<$ty>().copied().unwrap_or_default();
                    hash_bytes(&(v as i128).to_le_bytes())
                }),
                serialize: Some(|a| {
                    let v = a.downcast_ref::<$ty>().copied().unwrap_or_default();
                    v.to_le_bytes().to_vec()
                }),
                deserialize: Some(|bytes| {
                    let arr: [u8; std::mem::size_of::<$ty>()] = bytes
                        .try_into()
                        .map_err(|_| Error::DataFormat("bad integer payload".into()))?;
                    Ok(Object::new(<$ty>::from_le_bytes(arr)))
                }),
                display: |a| a.downcast_ref::<$ty>().map(<$ty>::to_string).unwrap_or_default(),
                as_int: Some(|a| a.downcast_ref::<$ty>().copied().unwrap_or_default() as i128),
                as_float: Some(|a| a.downcast_ref::<$ty>().copied().unwrap_or_default() as f64),
            },
        );
    };
}

macro_rules! float_hooks {
    ($map:expr, $ty:ty) => {
        $map.insert(
            <$ty as ObjectType>::KEY,
            TypeHooks {
                compare: Some(|a, b| {
                    let a = a.downcast_ref::<$ty>()?;
                    let b = b.downcast_ref::<$ty>()?;
                    a.partial_cmp(b)
                }),
                hash: Some(|a| {
                    let v = a.downcast_ref::<$ty>().copied().unwrap_or_default();
                    hash_bytes(&v.to_le_bytes())
                }),
                serialize: Some(|a| {
                    let v = a.downcast_ref::<$ty>().copied().unwrap_or_default();
                    v.to_le_bytes().to_vec()
                }),
                deserialize: Some(|bytes| {
                    let arr: [u8; std::mem::size_of::<$ty>()] = bytes
                        .try_into()
                        .map_err(|_| Error::DataFormat("bad float payload".into()))?;
                    Ok(Object::new(<$ty>::from_le_bytes(arr)))
                }),
                display: |a| a.downcast_ref::<$ty>().map(<$ty>::to_string).unwrap_or_default(),
                as_int: None,
                as_float: Some(|a| a.downcast_ref::<$ty>().copied().unwrap_or_default() as f64),
            },
        );
    };
}

fn install_builtins(map: &mut HashMap<&'static str, TypeHooks>) {
    int_hooks!(map, i8);
    int_hooks!(map, i16);
    int_hooks!(map, i32);
    int_hooks!(map, i64);
    int_hooks!(map, u8);
    int_hooks!(map, u16);
    int_hooks!(map, u32);
    int_hooks!(map, u64);
    float_hooks!(map, f32);
    float_hooks!(map, f64);

    map.insert(
        bool::KEY,
        TypeHooks {
            compare: Some(|a, b| Some(a.downcast_ref::<bool>()?.cmp(b.downcast_ref::<bool>()?))),
            hash: Some(|a| hash_bytes(&[*a.downcast_ref::<bool>().unwrap_or(&false) as u8])),
            serialize: Some(|a| vec![*a.downcast_ref::<bool>().unwrap_or(&false) as u8]),
            deserialize: Some(|bytes| match bytes {
                [0] => Ok(Object::new(false)),
                [1] => Ok(Object::new(true)),
                _ => Err(Error::DataFormat("bad bool payload".into())),
            }),
            display: |a| a.downcast_ref::<bool>().map(bool::to_string).unwrap_or_default(),
            as_int: Some(|a| *a.downcast_ref::<bool>().unwrap_or(&false) as i128),
            as_float: Some(|a| *a.downcast_ref::<bool>().unwrap_or(&false) as u8 as f64),
        },
    );

    map.insert(
        String::KEY,
        TypeHooks {
            compare: Some(|a, b| Some(a.downcast_ref::<String>()?.cmp(b.downcast_ref::<String>()?))),
            hash: Some(|a| {
                hash_bytes(a.downcast_ref::<String>().map(String::as_bytes).unwrap_or_default())
            }),
            serialize: Some(|a| {
                a.downcast_ref::<String>()
                    .map(|s| s.as_bytes().to_vec())
                    .unwrap_or_default()
            }),
            deserialize: Some(|bytes| {
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::DataFormat("string payload is not utf-8".into()))?;
                Ok(Object::from(s))
            }),
            display: |a| a.downcast_ref::<String>().cloned().unwrap_or_default(),
            as_int: None,
            as_float: None,
        },
    );

    map.insert(
        <Vec<u8> as ObjectType>::KEY,
        TypeHooks {
            compare: Some(|a, b| Some(a.downcast_ref::<Vec<u8>>()?.cmp(b.downcast_ref::<Vec<u8>>()?))),
            hash: Some(|a| hash_bytes(a.downcast_ref::<Vec<u8>>().map(Vec::as_slice).unwrap_or_default())),
            serialize: Some(|a| a.downcast_ref::<Vec<u8>>().cloned().unwrap_or_default()),
            deserialize: Some(|bytes| Ok(Object::from(bytes.to_vec()))),
            display: |a| {
                format!("blob[{}]", a.downcast_ref::<Vec<u8>>().map(Vec::len).unwrap_or(0))
            },
            as_int: None,
            as_float: None,
        },
    );

    map.insert(
        <Vec<Object> as ObjectType>::KEY,
        TypeHooks {
            compare: Some(|a, b| {
                let a = a.downcast_ref::<Vec<Object>>()?;
                let b = b.downcast_ref::<Vec<Object>>()?;
                match a.len().cmp(&b.len()) {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y).ok()? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(Ordering::Equal)
            }),
            hash: Some(|a| {
                let mut hasher = DefaultHasher::new();
                if let Some(vec) = a.downcast_ref::<Vec<Object>>() {
                    for obj in vec {
                        obj.hash_value().unwrap_or(0).hash(&mut hasher);
                    }
                }
                hasher.finish()
            }),
            serialize: Some(|a| {
                let vec = match a.downcast_ref::<Vec<Object>>() {
                    Some(vec) => vec,
                    None => return Vec::new(),
                };
                let mut out = (vec.len() as u32).to_be_bytes().to_vec();
                for obj in vec {
                    match obj.serialize() {
                        Ok(frame) => out.extend_from_slice(&frame),
                        Err(_) => return Vec::new(),
                    }
                }
                out
            }),
            deserialize: Some(|bytes| {
                if bytes.len() < 4 {
                    return Err(Error::DataFormat("truncated object vector".into()));
                }
                let count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                let mut rest = &bytes[4..];
                let mut vec = Vec::with_capacity(count);
                for _ in 0..count {
                    let (obj, used) = Object::deserialize_prefix(rest)?;
                    vec.push(obj);
                    rest = &rest[used..];
                }
                if !rest.is_empty() {
                    return Err(Error::DataFormat("trailing bytes in object vector".into()));
                }
                Ok(Object::from(vec))
            }),
            display: |a| {
                format!(
                    "args[{}]",
                    a.downcast_ref::<Vec<Object>>().map(Vec::len).unwrap_or(0)
                )
            },
            as_int: None,
            as_float: None,
        },
    );
}
