use std::collections::BTreeSet;

use thiserror::Error;

use crate::schema::ColumnType;

/// The single error type surfaced by every stage of compilation and execution.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("node {node:?} is missing required attributes: {missing:?}")]
    MissingAttributes {
        node: String,
        missing: BTreeSet<String>,
    },
    #[error("unknown iteration kind {0:?}")]
    UnknownIterationKind(String),
    #[error("unknown operator kind {0:?}")]
    UnknownOperatorKind(String),
    #[error("node name {0:?} is reserved")]
    ReservedNodeName(String),

    #[error("the DAG has no valid source/sink: expected topological order to start at `_input` and end at `_output`")]
    NoValidSourceOrSink,
    #[error("the DAG contains a cycle: nodes {0:?} could not be ordered")]
    Cycle(BTreeSet<String>),
    #[error("node {node:?} consumes undeclared columns {columns:?}")]
    UndeclaredColumns {
        node: String,
        columns: BTreeSet<String>,
    },
    #[error("node {node:?} must have identical inputs and outputs, got inputs {inputs:?} and outputs {outputs:?}")]
    InputOutputMismatch {
        node: String,
        inputs: Vec<String>,
        outputs: Vec<String>,
    },
    #[error("duplicate node name {0:?}")]
    DuplicateNode(String),
    #[error("node {0:?} not found")]
    NodeNotFound(String),
    #[error("node {node:?} has iteration kind {kind:?} incompatible with column type propagation: {reason}")]
    IncompatibleIteration {
        node: String,
        kind: String,
        reason: String,
    },
    #[error("column {column:?} on edge from {from:?} has conflicting types {left:?} and {right:?}")]
    ConflictingColumnType {
        column: String,
        from: String,
        left: ColumnType,
        right: ColumnType,
    },

    #[error("failed to initialize operator for node {node:?}: {source}")]
    OperatorInit {
        node: String,
        #[source]
        source: Box<ExecutionError>,
    },
    #[error("operator not found: {0}")]
    OperatorNotFound(String),

    #[error("node {node:?} operator failed: {source}")]
    OperatorFailed {
        node: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("node {node:?} operator returned a value shaped wrong for its iteration kind")]
    MalformedOperatorOutput { node: String },
    #[error("put on a sealed queue (node {node:?}, port {port:?})")]
    QueueSealed { node: String, port: String },

    #[error("{0} node(s) failed during execution:\n{1}")]
    Aggregate(usize, String),

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    #[error("failed to parse DAG description: {0}")]
    Deserialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
