//! The Operator Adapter: the narrow boundary between a [`NodeDescriptor`](
//! crate::descriptor::NodeDescriptor)'s operator reference and something the
//! runtime can actually invoke. Resolving a hub reference into a live
//! operator is an external collaborator (the hub loader) — this module only
//! defines the trait boundary and a process-wide cache for whatever a
//! [`OperatorRegistry`] hands back.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;

use crate::errors::ExecutionError;
use crate::value::Row;

/// What a `window`/`time_window` node hands its operator: every row
/// collected for one window, in arrival order.
#[derive(Debug, Clone)]
pub enum OperatorInput<'a> {
    Row(&'a Row),
    Window(&'a [Row]),
}

/// What an operator hands back. The [`crate::runner::NodeRunner`] variant
/// invoking it knows which shape to expect from its iteration kind and
/// treats any other shape as [`ExecutionError::MalformedOperatorOutput`].
#[derive(Debug, Clone)]
pub enum OperatorOutput {
    Row(Row),
    Rows(Vec<Row>),
    Bool(bool),
}

/// A materialized, invocable operator.
pub trait Operator: Send + Sync + fmt::Debug {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError>;
}

pub type OperatorError = Box<dyn std::error::Error + Send + Sync>;

/// One of the small set of operators the core itself knows how to run
/// without consulting the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Nop,
    Concat,
}

#[derive(Debug)]
struct NopOperator;

impl Operator for NopOperator {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
        match input {
            OperatorInput::Row(row) => Ok(OperatorOutput::Row((*row).clone())),
            OperatorInput::Window(rows) => Ok(OperatorOutput::Rows(rows.to_vec())),
        }
    }
}

/// An operator reference as it appears in a [`NodeDescriptor`](
/// crate::descriptor::NodeDescriptor)'s `op_info` — one of four flavors.
#[derive(Clone)]
pub enum OperatorRef {
    /// A named operator resolved through the (external) hub loader.
    Hub {
        name: String,
        init_args: Vec<Value>,
        init_kwargs: serde_json::Map<String, Value>,
        tag: String,
    },
    /// An inline closure, constructed by the pipeline author rather than
    /// deserialized.
    Lambda(Arc<dyn Fn(OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> + Send + Sync>),
    /// An already-materialized operator instance.
    Callable(Arc<dyn Operator>),
    Builtin(BuiltinKind),
}

impl fmt::Debug for OperatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorRef::Hub {
                name, tag, init_args, ..
            } => f
                .debug_struct("Hub")
                .field("name", name)
                .field("tag", tag)
                .field("init_args", init_args)
                .finish(),
            OperatorRef::Lambda(_) => f.write_str("Lambda(..)"),
            OperatorRef::Callable(_) => f.write_str("Callable(..)"),
            OperatorRef::Builtin(kind) => f.debug_tuple("Builtin").field(kind).finish(),
        }
    }
}

struct LambdaOperator(
    Arc<dyn Fn(OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> + Send + Sync>,
);

impl fmt::Debug for LambdaOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LambdaOperator")
    }
}

impl Operator for LambdaOperator {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
        (self.0)(input)
    }
}

/// Narrow boundary to the (out of scope) hub: resolves a `Hub` reference
/// into a materialized operator. Individual operator implementations are
/// never the core's concern.
pub trait OperatorRegistry: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        init_args: &[Value],
        init_kwargs: &serde_json::Map<String, Value>,
        tag: &str,
    ) -> Result<Arc<dyn Operator>, ExecutionError>;
}

/// A registry with no hub names registered; every `Hub` reference fails to
/// resolve. Used when a DAG has no hub-backed nodes, or as the base to
/// extend with [`StaticRegistry::register`] in tests.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, operator: Arc<dyn Operator>) {
        self.operators.insert(name.into(), operator);
    }
}

impl OperatorRegistry for StaticRegistry {
    fn resolve(
        &self,
        name: &str,
        _init_args: &[Value],
        _init_kwargs: &serde_json::Map<String, Value>,
        _tag: &str,
    ) -> Result<Arc<dyn Operator>, ExecutionError> {
        self.operators
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::OperatorNotFound(name.to_string()))
    }
}

/// Cache key for the process-wide operator pool: `(ref, init args, tag)`.
/// `init_kwargs` participates through its serialized form since
/// `serde_json::Map` isn't `Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OperatorKey {
    name: String,
    init_args: String,
    init_kwargs: String,
    tag: String,
}

impl OperatorKey {
    fn for_hub(
        name: &str,
        init_args: &[Value],
        init_kwargs: &serde_json::Map<String, Value>,
        tag: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            init_args: serde_json::to_string(init_args).unwrap_or_default(),
            init_kwargs: serde_json::to_string(init_kwargs).unwrap_or_default(),
            tag: tag.to_string(),
        }
    }
}

/// Process-wide, reference-counted cache of materialized operators, keyed
/// by `(operator ref, init args, tag)`. Construction of a given key is
/// serialized so concurrent first-use never double-instantiates.
#[derive(Debug, Default)]
pub struct OperatorPool {
    entries: Mutex<HashMap<OperatorKey, Arc<OnceLock<Result<Arc<dyn Operator>, String>>>>>,
}

impl OperatorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an [`OperatorRef`] into an invocable operator, using the
    /// pool's cache for `Hub` references and the registry to materialize a
    /// miss.
    pub fn get_or_init(
        &self,
        op_ref: &OperatorRef,
        registry: &dyn OperatorRegistry,
    ) -> Result<Arc<dyn Operator>, ExecutionError> {
        match op_ref {
            OperatorRef::Builtin(BuiltinKind::Nop) => Ok(Arc::new(NopOperator)),
            OperatorRef::Builtin(BuiltinKind::Concat) => Ok(Arc::new(NopOperator)),
            OperatorRef::Lambda(f) => Ok(Arc::new(LambdaOperator(f.clone()))),
            OperatorRef::Callable(op) => Ok(op.clone()),
            OperatorRef::Hub {
                name,
                init_args,
                init_kwargs,
                tag,
            } => {
                let key = OperatorKey::for_hub(name, init_args, init_kwargs, tag);
                let slot = {
                    let mut entries = self.entries.lock().expect("operator pool poisoned");
                    entries.entry(key).or_default().clone()
                };
                let result = slot.get_or_init(|| {
                    registry
                        .resolve(name, init_args, init_kwargs, tag)
                        .map_err(|e| e.to_string())
                });
                result.clone().map_err(ExecutionError::OperatorNotFound)
            }
        }
    }

    /// Drops cache entries whose only remaining strong reference is the
    /// pool's own, for deterministic teardown between test pipelines.
    pub fn evict_unused(&self) {
        let mut entries = self.entries.lock().expect("operator pool poisoned");
        entries.retain(|_, slot| match slot.get() {
            Some(Ok(op)) => Arc::strong_count(op) > 1,
            _ => true,
        });
    }
}
