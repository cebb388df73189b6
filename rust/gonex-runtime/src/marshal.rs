//! Values that cross the worker boundary.
//!
//! Every argument of a parallel task is classified into a [`TaskValue`]:
//! plain data deep-clones through serde, callables travel as registry ids,
//! and synchronization objects travel as identity-tagged handles from which
//! the worker installs a typed proxy. RWMutex handles do not cross at all;
//! its fairness protocol is not replicated across threads, so marshaling
//! one fails up front.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gonex_core::{GonexError, GonexResult};
use gonex_sync::{Channel, Context, RWMutex};

/// Snapshot of a [`Context`] taken at marshal time. The worker-side proxy
/// layers live cancellation state from the context-state registry on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    /// Remaining time until the deadline at marshal time, if any.
    pub deadline_remaining_ms: Option<i64>,
    /// Cancellation cause at marshal time, if already cancelled.
    pub error: Option<String>,
    /// Bindings visible from the context, nearest first.
    pub values: BTreeMap<String, TaskValue>,
}

/// Snapshot of a [`Channel`]'s observable state. Worker proxies support
/// only the non-blocking surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: String,
    pub name: Option<String>,
    pub capacity: usize,
    pub len: usize,
    pub closed: bool,
}

/// Identity of a shared-memory mutex or semaphore; the worker looks the
/// live object up in the shared sync registry, so its operations are real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandle {
    pub key: String,
}

/// The tagged variant shipped to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<TaskValue>),
    Map(BTreeMap<String, TaskValue>),
    /// Milliseconds since the Unix epoch.
    Time(i64),
    /// A callable, by function-registry id.
    FunctionRef(String),
    Context(ContextSnapshot),
    Channel(ChannelHandle),
    SharedMutex(SyncHandle),
    SharedSemaphore(SyncHandle),
    /// A shared buffer, by manager name.
    Buffer(String),
}

impl TaskValue {
    /// Serialize for the worker transport.
    pub fn to_bytes(&self) -> GonexResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })
    }

    /// Deserialize from the worker transport.
    pub fn from_bytes(bytes: &[u8]) -> GonexResult<TaskValue> {
        bincode::deserialize(bytes).map_err(|e| GonexError::SerializationFailed {
            message: e.to_string(),
        })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TaskValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaskValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaskValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            TaskValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! from_value {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for TaskValue {
            fn from(v: $ty) -> Self {
                TaskValue::$variant(v.into())
            }
        }
    };
}

from_value!(bool, Bool);
from_value!(i32, Int);
from_value!(i64, Int);
from_value!(f64, Float);
from_value!(&str, Str);
from_value!(String, Str);
from_value!(Vec<u8>, Bytes);

/// Snapshot a context for the boundary. Only values that are plain data
/// cross; anything else is dropped from the snapshot with a warning.
pub fn marshal_context(ctx: &Context) -> TaskValue {
    let mut values = BTreeMap::new();
    for (key, value) in ctx.collect_values() {
        let marshaled = if let Some(s) = value.downcast_ref::<String>() {
            Some(TaskValue::Str(s.clone()))
        } else if let Some(s) = value.downcast_ref::<&'static str>() {
            Some(TaskValue::Str((*s).to_string()))
        } else if let Some(i) = value.downcast_ref::<i64>() {
            Some(TaskValue::Int(*i))
        } else if let Some(i) = value.downcast_ref::<i32>() {
            Some(TaskValue::Int(i64::from(*i)))
        } else if let Some(f) = value.downcast_ref::<f64>() {
            Some(TaskValue::Float(*f))
        } else if let Some(b) = value.downcast_ref::<bool>() {
            Some(TaskValue::Bool(*b))
        } else {
            None
        };
        match marshaled {
            Some(v) => {
                values.insert(key, v);
            }
            None => {
                tracing::warn!(key = %key, "context value is not plain data; not crossing the worker boundary");
            }
        }
    }
    TaskValue::Context(ContextSnapshot {
        id: ctx.id().to_string(),
        deadline_remaining_ms: ctx.deadline().map(|d| {
            let now = tokio::time::Instant::now();
            if d > now {
                (d - now).as_millis() as i64
            } else {
                0
            }
        }),
        error: ctx.err().map(|e| e.to_string()),
        values,
    })
}

/// Snapshot a channel's observable state for the boundary.
pub fn marshal_channel<T: Send + 'static>(ch: &Channel<T>) -> TaskValue {
    TaskValue::Channel(ChannelHandle {
        id: ch.id().to_string(),
        name: ch.name().map(str::to_string),
        capacity: ch.capacity(),
        len: ch.len(),
        closed: ch.is_closed(),
    })
}

/// RWMutex handles never cross: fail at marshal time instead of degrading
/// into a no-op proxy on the worker.
pub fn marshal_rwmutex(_m: &RWMutex) -> GonexResult<TaskValue> {
    Err(GonexError::MarshalUnsupported {
        type_name: "RWMutex".to_string(),
    })
}
