mod compiler;
mod descriptor;
mod errors;
mod executor;
mod operator;
mod plan;
mod queue;
mod runner;
mod schema;
mod value;

pub use compiler::Compiler;
pub use descriptor::{IterKind, NodeConfig, NodeDescriptor, RawDag, INPUT_NODE, OUTPUT_NODE};
pub use errors::{ExecutionError, Result};
pub use executor::{run, ExecutorOptions, GraphExecutor, GraphExecutorHandle};
pub use operator::{
    BuiltinKind, Operator, OperatorError, OperatorInput, OperatorOutput, OperatorPool,
    OperatorRef, OperatorRegistry, StaticRegistry,
};
pub use plan::{CompiledEdge, CompiledNode, CompiledPlan};
pub use queue::{typed_queue, QueueConsumer, QueueProducer};
pub use runner::{NodeRunner, NodeStatus, NodeStatusHandle};
pub use schema::{ColumnType, SchemaEntry};
pub use value::{row, Row, Value};
