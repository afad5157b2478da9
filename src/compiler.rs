//! The three-pass DAG Compiler: structural/topological validation,
//! reachability/undeclared-column checking, then edge assignment and
//! schema propagation. Validates connectivity first and only populates
//! schemas once that succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use daggy::Dag;
use log::{error, info};

use crate::descriptor::{NodeDescriptor, RawDag, INPUT_NODE, OUTPUT_NODE};
use crate::errors::{ExecutionError, Result};
use crate::plan::{CompiledEdge, CompiledNode, CompiledPlan};
use crate::schema::{ColumnType, SchemaEntry};

pub struct Compiler;

impl Compiler {
    /// Compiles a raw DAG description into a [`CompiledPlan`], running all
    /// three passes in order. Each pass only runs once the previous one has
    /// succeeded: check structure, then reachability, then schemas.
    pub fn compile(raw: RawDag) -> Result<CompiledPlan> {
        let nodes = crate::descriptor::parse_nodes(raw)?;
        Self::compile_nodes(nodes)
    }

    pub fn compile_nodes(nodes: BTreeMap<String, NodeDescriptor>) -> Result<CompiledPlan> {
        let order = match topological_order(&nodes) {
            Ok(order) => order,
            Err(e) => {
                error!("DAG failed topological validation: {e}");
                return Err(e);
            }
        };
        check_reachability(&nodes, &order)?;
        let plan = assign_edges_and_schemas(&nodes, &order)?;
        info!(
            "compiled DAG with {} nodes and {} edges",
            plan.graph.node_count(),
            plan.graph.edge_count()
        );
        Ok(plan)
    }
}

/// Pass 1: Kahn's algorithm over the `next_nodes` successor graph.
/// Repeatedly removes a node with no remaining unremoved predecessor; the
/// order this produces already starts at `_input` and ends at `_output`,
/// with no reversal step needed.
fn topological_order(nodes: &BTreeMap<String, NodeDescriptor>) -> Result<Vec<String>> {
    if !nodes.contains_key(INPUT_NODE) || !nodes.contains_key(OUTPUT_NODE) {
        return Err(ExecutionError::NoValidSourceOrSink);
    }

    let mut in_degree: HashMap<&str, usize> = nodes.keys().map(|n| (n.as_str(), 0)).collect();
    for node in nodes.values() {
        for succ in &node.next_nodes {
            if !nodes.contains_key(succ) {
                return Err(ExecutionError::NodeNotFound(succ.clone()));
            }
            *in_degree.get_mut(succ.as_str()).unwrap() += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| *n)
        .collect();
    ready.sort();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = ready.pop() {
        order.push(name.to_string());
        let mut newly_ready = Vec::new();
        for succ in &nodes[name].next_nodes {
            let deg = in_degree.get_mut(succ.as_str()).unwrap();
            *deg -= 1;
            if *deg == 0 {
                newly_ready.push(succ.as_str());
            }
        }
        newly_ready.sort();
        ready.extend(newly_ready);
        ready.sort();
    }

    if order.len() != nodes.len() {
        let remaining: BTreeSet<String> = nodes
            .keys()
            .filter(|n| !order.contains(n))
            .cloned()
            .collect();
        return Err(ExecutionError::Cycle(remaining));
    }

    if order.first().map(String::as_str) != Some(INPUT_NODE)
        || order.last().map(String::as_str) != Some(OUTPUT_NODE)
    {
        return Err(ExecutionError::NoValidSourceOrSink);
    }

    Ok(order)
}

/// Pass 2: walking the topological order, accumulate the set of columns
/// produced by each node's ancestors and check that every node's declared
/// `inputs` is a subset of what's actually reachable.
fn check_reachability(
    nodes: &BTreeMap<String, NodeDescriptor>,
    order: &[String],
) -> Result<()> {
    let predecessors = predecessor_map(nodes);
    let mut produced: HashMap<&str, BTreeSet<String>> = HashMap::new();

    for name in order {
        let node = &nodes[name];
        let available: BTreeSet<String> = predecessors
            .get(name.as_str())
            .into_iter()
            .flatten()
            .flat_map(|pred| produced[pred].iter().cloned())
            .collect();

        if name != INPUT_NODE {
            let undeclared: BTreeSet<String> = node
                .inputs
                .iter()
                .filter(|c| !available.contains(*c))
                .cloned()
                .collect();
            if !undeclared.is_empty() {
                return Err(ExecutionError::UndeclaredColumns {
                    node: name.clone(),
                    columns: undeclared,
                });
            }
        }

        let mut this_produced = available;
        this_produced.extend(node.outputs.iter().cloned());
        produced.insert(name.as_str(), this_produced);
    }

    let output_node = &nodes[OUTPUT_NODE];
    let output_inputs: BTreeSet<&String> = output_node.inputs.iter().collect();
    let output_outputs: BTreeSet<&String> = output_node.outputs.iter().collect();
    if output_inputs != output_outputs {
        return Err(ExecutionError::InputOutputMismatch {
            node: OUTPUT_NODE.to_string(),
            inputs: output_node.inputs.clone(),
            outputs: output_node.outputs.clone(),
        });
    }

    Ok(())
}

fn predecessor_map(nodes: &BTreeMap<String, NodeDescriptor>) -> HashMap<&str, Vec<&str>> {
    let mut preds: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes.values() {
        for succ in &node.next_nodes {
            preds.entry(succ.as_str()).or_default().push(node.name.as_str());
        }
    }
    preds
}

/// Pass 3: assigns an edge number to every hop in the DAG, restricts each
/// out-edge to the columns some downstream node will actually consume, and
/// propagates column schemas (type plus upstream-producer count) forward.
/// Builds the [`CompiledPlan`]'s `daggy::Dag` directly as edges are
/// numbered, once topology is known.
fn assign_edges_and_schemas(
    nodes: &BTreeMap<String, NodeDescriptor>,
    order: &[String],
) -> Result<CompiledPlan> {
    let successors = successor_map(nodes);

    let mut graph: Dag<CompiledNode, CompiledEdge> = Dag::new();
    let mut node_index = HashMap::new();
    for name in order {
        let node = &nodes[name];
        let idx = graph.add_node(CompiledNode {
            name: node.name.clone(),
            iter_kind: node.iter_kind.clone(),
            op_ref: node.op_ref.clone(),
            config: node.config.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        });
        node_index.insert(name.as_str(), idx);
    }

    // ahead_schema[node] = the merged schema of everything available at that
    // node's position, kept so later edges can read it without re-deriving.
    let mut ahead_schema: HashMap<&str, Vec<SchemaEntry>> = HashMap::new();
    ahead_schema.insert(INPUT_NODE, Vec::new());

    let mut next_edge_num = 0usize;
    let mut out_edges: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut in_edges: HashMap<&str, Vec<usize>> = HashMap::new();

    for name in order {
        if name == OUTPUT_NODE {
            continue;
        }
        let node = &nodes[name];
        let succs = &successors[name.as_str()];

        // `_input` with exactly one successor doesn't get a second edge for
        // that hop: the entry edge itself is the sole input->successor edge,
        // built directly from `_input`'s own outputs with no DFS
        // restriction. Handled here, in `_input`'s own topological slot, so
        // `ahead_schema[succ]` is populated before the loop reaches `succ`.
        if name == INPUT_NODE && succs.len() == 1 {
            let succ = succs[0];
            let edge_num = next_edge_num;
            next_edge_num += 1;
            out_edges.entry(INPUT_NODE).or_default().push(edge_num);
            in_edges.entry(INPUT_NODE).or_default().push(edge_num);
            in_edges.entry(succ).or_default().push(edge_num);

            let produced_here: BTreeSet<&str> = node.outputs.iter().map(String::as_str).collect();
            let my_schema = edge_schema_for(node, &HashMap::new(), &produced_here);
            merge_ahead(&mut ahead_schema, succ, &my_schema);

            let from_idx = node_index[INPUT_NODE];
            let to_idx = node_index[succ];
            graph
                .add_edge(
                    from_idx,
                    to_idx,
                    CompiledEdge {
                        edge_num,
                        schema: my_schema,
                    },
                )
                .expect("single _input edge cannot cycle");
            continue;
        }

        // Own copy, not a borrow of `ahead_schema`: the per-successor loop
        // below needs to mutate `ahead_schema` (for other nodes' entries)
        // while this node's ahead schema is still in scope.
        let ahead: Vec<SchemaEntry> = ahead_schema[name.as_str()].clone();
        let ahead_by_name: HashMap<&str, &SchemaEntry> =
            ahead.iter().map(|e| (e.name.as_str(), e)).collect();
        let produced_here: BTreeSet<&str> = node.outputs.iter().map(String::as_str).collect();
        let mut candidate: BTreeSet<&str> = ahead_by_name.keys().copied().collect();
        candidate.extend(produced_here.iter().copied());

        for &succ in succs {
            let edge_num = next_edge_num;
            next_edge_num += 1;
            out_edges.entry(name.as_str()).or_default().push(edge_num);
            in_edges.entry(succ).or_default().push(edge_num);

            let used = restrict_used_columns(nodes, &successors, succ, candidate.clone());
            let my_schema = edge_schema_for(node, &ahead_by_name, &used);

            merge_ahead(&mut ahead_schema, succ, &my_schema);

            let from_idx = node_index[name.as_str()];
            let to_idx = node_index[succ];
            graph
                .add_edge(
                    from_idx,
                    to_idx,
                    CompiledEdge {
                        edge_num,
                        schema: my_schema,
                    },
                )
                .expect("edge would introduce a cycle, but topological order was already validated");
        }
    }

    // `_output` always gets exactly one true terminal queue. With one
    // in-edge that queue *is* the in-edge; with several, a fresh merge edge
    // number carries the union forward and the `output` runner concatenates
    // the in-edges into it. `_output` can't hold a real graph out-edge
    // (that would be a self-loop, which a DAG forbids), so the terminal
    // queue is kept on the plan directly.
    let output_in_edges = in_edges.get(OUTPUT_NODE).cloned().unwrap_or_default();
    let output_idx = node_index[OUTPUT_NODE];
    let terminal_edge = if output_in_edges.len() > 1 {
        let merge_num = next_edge_num;
        next_edge_num += 1;
        CompiledEdge {
            edge_num: merge_num,
            schema: ahead_schema[OUTPUT_NODE].clone(),
        }
    } else {
        let sole_edge = graph
            .raw_edges()
            .iter()
            .find(|e| e.target() == output_idx)
            .map(|e| e.weight.clone())
            .unwrap_or_else(|| CompiledEdge {
                edge_num: next_edge_num,
                schema: ahead_schema[OUTPUT_NODE].clone(),
            });
        if graph.raw_edges().iter().all(|e| e.target() != output_idx) {
            next_edge_num += 1;
        }
        sole_edge
    };
    let _ = next_edge_num;

    let topo_order: Vec<daggy::NodeIndex> = order.iter().map(|n| node_index[n.as_str()]).collect();

    Ok(CompiledPlan {
        graph,
        input_index: node_index[INPUT_NODE],
        output_index: output_idx,
        topo_order,
        terminal_edge,
    })
}

fn successor_map<'a>(
    nodes: &'a BTreeMap<String, NodeDescriptor>,
) -> HashMap<&'a str, Vec<&'a str>> {
    nodes
        .values()
        .map(|n| (n.name.as_str(), n.next_nodes.iter().map(String::as_str).collect()))
        .collect()
}

/// Schema propagation for a single (node, successor) edge, restricted to
/// `used` (the columns some node reachable from that successor actually
/// consumes). For every column the node declares in `outputs`, promotes its
/// type and bumps its count; every other column it merely passes through
/// keeps its upstream type and count untouched. A column with no ahead
/// entry is appearing for the first time on this edge and starts at count 1.
fn edge_schema_for(
    node: &NodeDescriptor,
    ahead_by_name: &HashMap<&str, &SchemaEntry>,
    used: &BTreeSet<&str>,
) -> Vec<SchemaEntry> {
    let cardinality_preserving = node.iter_kind.is_cardinality_preserving();
    let produced_here: BTreeSet<&str> = node.outputs.iter().map(String::as_str).collect();

    used.iter()
        .map(|&col| {
            let ahead_entry = ahead_by_name.get(col).copied();
            let is_output = produced_here.contains(col);
            let upstream = ahead_entry.map(|e| e.ty);
            let ty = if is_output {
                ColumnType::promote(upstream, cardinality_preserving)
            } else {
                upstream.unwrap_or(ColumnType::Scalar)
            };
            let count = match ahead_entry {
                None => 1,
                Some(e) if is_output => e.count + 1,
                Some(e) => e.count,
            };
            SchemaEntry::new(col, ty, count)
        })
        .collect()
}

/// Merges a node's outgoing schema into its successor's accumulated ahead
/// schema, keeping the entry with the larger `count` on conflict.
fn merge_ahead<'a>(
    ahead_schema: &mut HashMap<&'a str, Vec<SchemaEntry>>,
    succ: &'a str,
    incoming: &[SchemaEntry],
) {
    let entry = ahead_schema.entry(succ).or_default();
    for new_entry in incoming {
        if let Some(existing) = entry.iter_mut().find(|e| e.name == new_entry.name) {
            if new_entry.count > existing.count {
                *existing = new_entry.clone();
            }
        } else {
            entry.push(new_entry.clone());
        }
    }
}

/// Restricts a node's candidate outgoing columns to the subset some node
/// reachable from `start` (following `next_nodes`) actually consumes.
/// Walks forward from `start`; at each visited node, any candidate column
/// that appears in its declared `inputs` is moved out of the remaining
/// candidate set and into the result. Stops as soon as no candidates
/// remain, so a column consumed early on one branch never needs the rest
/// of that branch explored.
fn restrict_used_columns<'a>(
    nodes: &'a BTreeMap<String, NodeDescriptor>,
    successors: &HashMap<&'a str, Vec<&'a str>>,
    start: &'a str,
    mut remaining: BTreeSet<&'a str>,
) -> BTreeSet<&'a str> {
    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = vec![start];
    visited.insert(start);

    while let Some(current) = stack.pop() {
        let node = &nodes[current];
        let consumed: Vec<&str> = node
            .inputs
            .iter()
            .map(String::as_str)
            .filter(|c| remaining.contains(c))
            .collect();
        for col in consumed {
            remaining.remove(col);
            used.insert(col);
        }
        if remaining.is_empty() {
            break;
        }
        for &next in successors.get(current).into_iter().flatten().rev() {
            if visited.insert(next) {
                stack.push(next);
            }
        }
    }
    used
}
