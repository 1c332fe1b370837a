use super::codec::Raised;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::Arc,
};


/// Значение, которое пересекает границу изоляции только по значению
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Живой ресурс процесса. Кодек отказывается его сериализовать.
    /// Вариант обязан оставаться последним: индексы остальных не должны сдвигаться.
    #[serde(skip)]
    Resource(ResourceHandle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Resource(_) => "resource",
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Проверка без сериализации: можно ли передать значение через границу
    pub fn is_transportable(&self) -> bool {
        match self {
            Value::Resource(_) => false,
            Value::List(items) => items.iter().all(Value::is_transportable),
            Value::Map(entries) => entries.values().all(Value::is_transportable),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}


/// Дескриптор живого ресурса (файл, сокет, lock и т.п.)
#[derive(Clone)]
pub struct ResourceHandle {
    label: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ResourceHandle {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, resource: T) -> Self {
        Self {
            label: label.into(),
            inner: Arc::new(resource),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle").field("label", &self.label).finish_non_exhaustive()
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}


macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                #[inline]
                fn from(v: $t) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    f32 => Float,
    String => Str,
    &str => Str,
    Vec<u8> => Bytes,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

impl From<ResourceHandle> for Value {
    fn from(handle: ResourceHandle) -> Self {
        Value::Resource(handle)
    }
}


fn mismatch(expected: &str, got: &Value) -> Raised {
    Raised::type_error(format!("expected {}, got {}", expected, got.type_name()))
}

impl TryFrom<Value> for i64 {
    type Error = Raised;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(mismatch("int", &other)),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Raised;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Raised;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Raised;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Str(v) => Ok(v),
            other => Err(mismatch("str", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = Raised;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::List(v) => Ok(v),
            other => Err(mismatch("list", &other)),
        }
    }
}
