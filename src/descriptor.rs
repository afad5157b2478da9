//! The raw DAG description and its promotion into validated
//! [`NodeDescriptor`]s. This module only checks *structural*
//! well-formedness — required keys present, iteration/operator kinds
//! recognized; the Compiler (`crate::compiler`) is what checks the DAG as a
//! whole (reachability, cycles, schema consistency).

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::errors::ExecutionError;
use crate::operator::OperatorRef;

pub const INPUT_NODE: &str = "_input";
pub const OUTPUT_NODE: &str = "_output";

/// The iteration kind named on a node, with whatever parameters that kind
/// requires.
#[derive(Debug, Clone, PartialEq)]
pub enum IterKind {
    Map,
    FlatMap,
    Filter,
    Window { size: usize, step: usize },
    TimeWindow { time_range_sec: f64, time_step_sec: f64 },
    Concat,
    Nop,
}

impl IterKind {
    /// Does this iteration kind preserve row cardinality (and so leave a
    /// SCALAR input SCALAR), or does it always produce a stream (forcing
    /// QUEUE regardless of what came in)?
    pub fn is_cardinality_preserving(&self) -> bool {
        !matches!(
            self,
            IterKind::FlatMap | IterKind::Window { .. } | IterKind::TimeWindow { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            IterKind::Map => "map",
            IterKind::FlatMap => "flat_map",
            IterKind::Filter => "filter",
            IterKind::Window { .. } => "window",
            IterKind::TimeWindow { .. } => "time_window",
            IterKind::Concat => "concat",
            IterKind::Nop => "nop",
        }
    }
}

/// The raw `iter_info` object: a `type` tag plus a loosely typed `param`
/// bag, mirrored directly off the wire before being checked against
/// `IterKind`'s actual parameter requirements.
#[derive(Debug, Clone, Deserialize)]
struct RawIterInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    param: BTreeMap<String, Value>,
}

impl RawIterInfo {
    fn into_iter_kind(self) -> Result<IterKind, ExecutionError> {
        let get_usize = |key: &str| -> Option<usize> {
            self.param.get(key).and_then(Value::as_u64).map(|v| v as usize)
        };
        let get_f64 = |key: &str| -> Option<f64> { self.param.get(key).and_then(Value::as_f64) };

        match self.kind.as_str() {
            "map" => Ok(IterKind::Map),
            "flat_map" => Ok(IterKind::FlatMap),
            "filter" => Ok(IterKind::Filter),
            "concat" => Ok(IterKind::Concat),
            "nop" => Ok(IterKind::Nop),
            "window" => Ok(IterKind::Window {
                size: get_usize("size").unwrap_or(1),
                step: get_usize("step").unwrap_or(1),
            }),
            "time_window" => Ok(IterKind::TimeWindow {
                time_range_sec: get_f64("time_range_sec").unwrap_or(0.0),
                time_step_sec: get_f64("time_step_sec").unwrap_or(0.0),
            }),
            other => Err(ExecutionError::UnknownIterationKind(other.to_string())),
        }
    }
}

/// The raw `op_info` object: which of hub/lambda/callable/builtin an
/// operator reference is, plus its construction arguments. There is no
/// runtime type inspection to pick the variant — the `type` tag says so
/// directly.
#[derive(Debug, Clone, Deserialize)]
struct RawOpInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    init_args: Vec<Value>,
    #[serde(default)]
    init_kwargs: serde_json::Map<String, Value>,
    #[serde(default)]
    tag: Option<String>,
}

impl RawOpInfo {
    fn into_operator_ref(self) -> Result<OperatorRef, ExecutionError> {
        match self.kind.as_str() {
            "hub" => Ok(OperatorRef::Hub {
                name: self
                    .name
                    .ok_or_else(|| ExecutionError::UnknownOperatorKind("hub (missing name)".into()))?,
                init_args: self.init_args,
                init_kwargs: self.init_kwargs,
                tag: self.tag.unwrap_or_else(|| "main".to_string()),
            }),
            "builtin" => match self.name.as_deref() {
                Some("nop") => Ok(OperatorRef::Builtin(crate::operator::BuiltinKind::Nop)),
                Some("concat") => Ok(OperatorRef::Builtin(crate::operator::BuiltinKind::Concat)),
                other => Err(ExecutionError::UnknownOperatorKind(format!(
                    "builtin {other:?}"
                ))),
            },
            other => Err(ExecutionError::UnknownOperatorKind(other.to_string())),
        }
    }
}

/// Per-node concurrency tuning: how many replicas of this node's runner
/// should be spun up. `None`/absent means one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub parallel: Option<usize>,
}

/// A node exactly as declared on the wire, before DAG-wide validation. The
/// required key set differs for `_input`/`_output` versus ordinary nodes;
/// `op_info`/`config`/`next_nodes` are therefore optional here and required
/// in [`NodeDescriptor`].
#[derive(Debug, Clone, Deserialize)]
struct RawNode {
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    iter_info: Option<RawIterInfo>,
    op_info: Option<RawOpInfo>,
    config: Option<NodeConfig>,
    #[serde(default)]
    next_nodes: Vec<String>,
}

/// The raw DAG description as deserialized from the wire: a mapping from
/// node name to its declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDag(BTreeMap<String, RawNode>);

impl RawDag {
    pub fn from_json(text: &str) -> Result<Self, ExecutionError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ExecutionError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A fully parsed, structurally valid node declaration: every field that
/// role requires is present and well-typed. This is the unit the Compiler
/// operates on.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub iter_kind: IterKind,
    pub op_ref: Option<OperatorRef>,
    pub config: NodeConfig,
    pub next_nodes: Vec<String>,
}

impl NodeDescriptor {
    pub fn is_input(&self) -> bool {
        self.name == INPUT_NODE
    }

    pub fn is_output(&self) -> bool {
        self.name == OUTPUT_NODE
    }
}

/// Promotes a [`RawDag`] into a name-keyed map of [`NodeDescriptor`]s,
/// checking per-node required attributes along the way. DAG-wide checks
/// (toposort, reachability, schema) are the Compiler's job.
pub fn parse_nodes(raw: RawDag) -> Result<BTreeMap<String, NodeDescriptor>, ExecutionError> {
    let mut nodes = BTreeMap::new();
    for (name, raw_node) in raw.0 {
        let descriptor = parse_node(&name, raw_node)?;
        nodes.insert(name, descriptor);
    }
    Ok(nodes)
}

fn parse_node(name: &str, raw: RawNode) -> Result<NodeDescriptor, ExecutionError> {
    let is_boundary = name == INPUT_NODE || name == OUTPUT_NODE;

    let mut missing = BTreeSet::new();
    if raw.iter_info.is_none() {
        missing.insert("iter_info".to_string());
    }
    if !is_boundary {
        if raw.op_info.is_none() {
            missing.insert("op_info".to_string());
        }
        if raw.config.is_none() {
            missing.insert("config".to_string());
        }
    }
    if !missing.is_empty() {
        return Err(ExecutionError::MissingAttributes {
            node: name.to_string(),
            missing,
        });
    }

    let iter_kind = raw.iter_info.unwrap().into_iter_kind()?;
    let op_ref = raw.op_info.map(RawOpInfo::into_operator_ref).transpose()?;

    if is_boundary && !matches!(iter_kind, IterKind::Nop) {
        return Err(ExecutionError::IncompatibleIteration {
            node: name.to_string(),
            kind: iter_kind.name().to_string(),
            reason: format!("{name} must use iteration kind \"nop\""),
        });
    }

    Ok(NodeDescriptor {
        name: name.to_string(),
        inputs: raw.inputs,
        outputs: raw.outputs,
        iter_kind,
        op_ref,
        config: raw.config.unwrap_or_default(),
        next_nodes: raw.next_nodes,
    })
}
