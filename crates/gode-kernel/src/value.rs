//! 标记值中间表示
//! Tagged value intermediate representation
//!
//! 脚本引擎与原生插件之间传递的所有数据都经过 [`Value`]。
//! Everything that crosses between the script engine and native plugins goes
//! through [`Value`]. It is `Send`, so workers can carry results back to the host
//! thread by value; it never references engine-internal storage directly.

use crate::error::NativeError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 字符串键映射
/// String-keyed mapping
pub type ValueMap = BTreeMap<String, Value>;

/// Native function body.
pub type NativeFnBody = dyn Fn(Vec<Value>) -> Result<Value, NativeError> + Send + Sync;

// ============================================================================
// 可调用对象
// Callables
// ============================================================================

/// 原生可调用对象
/// A callable implemented in native code
#[derive(Clone)]
pub struct NativeFn {
    name: Arc<str>,
    body: Arc<NativeFnBody>,
}

impl NativeFn {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 调用原生函数
    /// Invoke the native function
    pub fn call(&self, args: Vec<Value>) -> Result<Value, NativeError> {
        (self.body)(args)
    }

    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

/// 脚本函数句柄
/// Opaque handle to a function owned by the script engine
///
/// Only the host thread can invoke it (through [`crate::HostScope`]); other
/// threads may hold and move it around but never look inside.
#[derive(Clone)]
pub struct ScriptFunction {
    name: Arc<str>,
    handle: Arc<dyn Any + Send + Sync>,
}

impl ScriptFunction {
    pub fn new<T: Any + Send + Sync>(name: &str, handle: T) -> Self {
        Self {
            name: Arc::from(name),
            handle: Arc::new(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 向下转型为引擎特定的句柄
    /// Downcast to the engine-specific handle
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &ScriptFunction) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("name", &self.name)
            .finish()
    }
}

/// 可调用对象
/// Callable value
#[derive(Debug, Clone)]
pub enum Callable {
    /// 原生实现
    /// Native implementation
    Native(NativeFn),
    /// 脚本实现
    /// Script implementation
    Script(ScriptFunction),
}

impl Callable {
    pub fn name(&self) -> &str {
        match self {
            Callable::Native(f) => f.name(),
            Callable::Script(f) => f.name(),
        }
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callable::Native(a), Callable::Native(b)) => a.ptr_eq(b),
            (Callable::Script(a), Callable::Script(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Promise 标识
/// Promise identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PromiseId(pub u64);

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise#{}", self.0)
    }
}

// ============================================================================
// 值
// Value
// ============================================================================

/// 标记值
/// Tagged value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(ValueMap),
    Function(Callable),
    Promise(PromiseId),
}

impl Value {
    /// 类型名称（用于错误信息）
    /// Type name (for error messages)
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Promise(_) => "promise",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// 从键值对构造映射
    /// Build a map from key/value pairs
    pub fn map<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// 读取映射字段
    /// Read a map field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// JSON Value 转换为标记值
    /// Convert a JSON value into a tagged value
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// 标记值转换为 JSON Value
    /// Convert a tagged value into JSON
    ///
    /// Functions and promises have no JSON form and become descriptive strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::json!(i),
            Value::Float(f) => serde_json::json!(f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Function(f) => serde_json::Value::String(format!("[function {}]", f.name())),
            Value::Promise(id) => serde_json::Value::String(format!("[{}]", id)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl From<NativeFn> for Value {
    fn from(f: NativeFn) -> Self {
        Value::Function(Callable::Native(f))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// 参数类型与转换表
// Parameter kinds and the conversion table
// ============================================================================

/// 导出函数的参数类型
/// Parameter kind of an exported function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ParamKind {
    Any,
    Bool,
    Int,
    Float,
    /// Int or Float, passed through unchanged
    Number,
    String,
    Array,
    Map,
    Function,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Any => "any",
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Number => "number",
            ParamKind::String => "string",
            ParamKind::Array => "array",
            ParamKind::Map => "map",
            ParamKind::Function => "function",
        }
    }

    /// 按转换表强制转换
    /// Coerce a value according to the conversion table
    ///
    /// Int widens to Float and an integral Float narrows to Int; every other
    /// kind must match exactly. On mismatch the original value is handed back.
    pub fn coerce(self, value: Value) -> Result<Value, Value> {
        match (self, value) {
            (ParamKind::Any, v) => Ok(v),
            (ParamKind::Bool, v @ Value::Bool(_)) => Ok(v),
            (ParamKind::Int, v @ Value::Int(_)) => Ok(v),
            (ParamKind::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Ok(Value::Int(f as i64))
            }
            (ParamKind::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (ParamKind::Float, v @ Value::Float(_)) => Ok(v),
            (ParamKind::Number, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
            (ParamKind::String, v @ Value::String(_)) => Ok(v),
            (ParamKind::Array, v @ Value::Array(_)) => Ok(v),
            (ParamKind::Map, v @ Value::Map(_)) => Ok(v),
            (ParamKind::Function, v @ Value::Function(_)) => Ok(v),
            (_, v) => Err(v),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
