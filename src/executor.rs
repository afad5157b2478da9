//! `GraphExecutor`: turns a [`CompiledPlan`] into a running pipeline,
//! thread-per-node, spawning one `std::thread::Builder`-built thread per
//! source/processor/sink.
//!
//! `_input` and `_output` are handled directly here rather than through a
//! [`NodeRunner`]: `_input` has no operator to invoke (the executor seeds
//! its out-edges with the caller's rows itself), and `_output` either *is*
//! its sole in-edge or gets a small merge runner spun up for fan-in.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use daggy::EdgeIndex;
use log::{debug, info, warn};

use crate::descriptor::IterKind;
use crate::errors::{ExecutionError, Result};
use crate::operator::{BuiltinKind, OperatorPool, OperatorRef, OperatorRegistry};
use crate::plan::CompiledPlan;
use crate::queue::{typed_queue, QueueConsumer, QueueProducer};
use crate::runner::{NodeRunner, NodeStatus, NodeStatusHandle};
use crate::value::Row;

/// In-process tuning for a run (outer deployment-config file parsing stays
/// out of scope).
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Bounded channel capacity for every edge's `TypedQueue`.
    pub channel_buffer_sz: usize,
    /// Advisory sizing hint; a thread-per-node model has no pool to bound,
    /// so this currently only documents the expected concurrency and isn't
    /// enforced.
    pub worker_threads: Option<usize>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            channel_buffer_sz: 1024,
            worker_threads: None,
        }
    }
}

pub struct GraphExecutor {
    plan: CompiledPlan,
    registry: Arc<dyn OperatorRegistry>,
    pool: Arc<OperatorPool>,
    options: ExecutorOptions,
}

impl GraphExecutor {
    pub fn new(
        plan: CompiledPlan,
        registry: Arc<dyn OperatorRegistry>,
        pool: Arc<OperatorPool>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            plan,
            registry,
            pool,
            options,
        }
    }

    /// Starts every node's worker thread, seeds `_input`'s out-edges with
    /// `input_rows`, and returns a handle to join on.
    pub fn start(&self, input_rows: Vec<Row>) -> Result<GraphExecutorHandle> {
        let mut producers: HashMap<EdgeIndex, QueueProducer> = HashMap::new();
        let mut consumers: HashMap<EdgeIndex, QueueConsumer> = HashMap::new();
        for edge_idx in self.plan.graph.edge_indices() {
            let edge = self.plan.edge(edge_idx);
            let (p, c) = typed_queue(edge.schema.clone(), self.options.channel_buffer_sz);
            producers.insert(edge_idx, p);
            consumers.insert(edge_idx, c);
        }

        let mut join_handles = Vec::new();
        let mut statuses = Vec::new();

        self.seed_input(&mut producers, input_rows)?;

        for &node_idx in &self.plan.topo_order {
            if node_idx == self.plan.input_index || node_idx == self.plan.output_index {
                continue;
            }
            self.spawn_node(node_idx, &mut producers, &mut consumers, &mut join_handles, &mut statuses)?;
        }

        let terminal_consumer =
            self.wire_output(&mut consumers, &mut join_handles, &mut statuses)?;

        info!(
            "started {} worker thread(s)",
            join_handles.len()
        );

        Ok(GraphExecutorHandle {
            join_handles,
            statuses,
            terminal_consumer,
        })
    }

    fn seed_input(
        &self,
        producers: &mut HashMap<EdgeIndex, QueueProducer>,
        input_rows: Vec<Row>,
    ) -> Result<()> {
        let out_edges = self.plan.out_edges(self.plan.input_index);
        let entry_producers: Vec<QueueProducer> = out_edges
            .iter()
            .map(|e| producers.remove(e).expect("_input edge producer taken twice"))
            .collect();

        for producer in &entry_producers {
            for row in &input_rows {
                producer.set_scalars(row);
            }
        }
        for row in &input_rows {
            for producer in &entry_producers {
                if producer.push(row.clone()).is_err() {
                    warn!("_input could not push row: no consumer left");
                }
            }
        }
        for producer in entry_producers {
            producer.seal();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_node(
        &self,
        node_idx: daggy::NodeIndex,
        producers: &mut HashMap<EdgeIndex, QueueProducer>,
        consumers: &mut HashMap<EdgeIndex, QueueConsumer>,
        join_handles: &mut Vec<(String, JoinHandle<()>)>,
        statuses: &mut Vec<NodeStatusHandle>,
    ) -> Result<()> {
        let node = self.plan.node(node_idx);
        let in_edges = self.plan.in_edges(node_idx);
        let out_edges = self.plan.out_edges(node_idx);
        let replicas = node.config.parallel.unwrap_or(1).max(1);

        let mut per_replica_inputs: Vec<Vec<QueueConsumer>> = (0..replicas).map(|_| Vec::new()).collect();
        for edge in &in_edges {
            let consumer = consumers.remove(edge).expect("edge consumer taken twice");
            for slot in per_replica_inputs.iter_mut() {
                slot.push(consumer.clone());
            }
        }

        let mut per_replica_outputs: Vec<Vec<QueueProducer>> = (0..replicas).map(|_| Vec::new()).collect();
        for edge in &out_edges {
            let producer = producers.remove(edge).expect("edge producer taken twice");
            for slot in per_replica_outputs.iter_mut() {
                slot.push(producer.clone());
            }
        }

        let op_ref = node
            .op_ref
            .clone()
            .unwrap_or(OperatorRef::Builtin(BuiltinKind::Nop));
        let operator = self
            .pool
            .get_or_init(&op_ref, self.registry.as_ref())
            .map_err(|e| ExecutionError::OperatorInit {
                node: node.name.clone(),
                source: Box::new(e),
            })?;

        for (replica_idx, (inputs, outputs)) in per_replica_inputs
            .into_iter()
            .zip(per_replica_outputs)
            .enumerate()
        {
            let runner = NodeRunner::new(
                node.name.clone(),
                node.iter_kind.clone(),
                Some(operator.clone()),
                inputs,
                outputs,
            );
            let status = runner.status_handle();
            let thread_name = if replicas > 1 {
                format!("{}-{replica_idx}", node.name)
            } else {
                node.name.clone()
            };
            debug!("spawning worker thread {thread_name}");
            let handle = Builder::new().name(thread_name.clone()).spawn(move || runner.run())?;
            join_handles.push((thread_name, handle));
            statuses.push(status);
        }

        Ok(())
    }

    fn wire_output(
        &self,
        consumers: &mut HashMap<EdgeIndex, QueueConsumer>,
        join_handles: &mut Vec<(String, JoinHandle<()>)>,
        statuses: &mut Vec<NodeStatusHandle>,
    ) -> Result<QueueConsumer> {
        let in_edges = self.plan.in_edges(self.plan.output_index);

        if in_edges.len() <= 1 {
            return Ok(match in_edges.first() {
                Some(edge) => consumers.remove(edge).expect("_output edge consumer taken twice"),
                None => {
                    let (producer, consumer) =
                        typed_queue(self.plan.terminal_edge.schema.clone(), self.options.channel_buffer_sz);
                    producer.seal();
                    consumer
                }
            });
        }

        // Several in-edges means a dedicated merge runner concatenates them
        // (arrival order) into the one terminal queue.
        let merge_inputs: Vec<QueueConsumer> = in_edges
            .iter()
            .map(|e| consumers.remove(e).expect("_output merge input taken twice"))
            .collect();
        let (terminal_producer, terminal_consumer) =
            typed_queue(self.plan.terminal_edge.schema.clone(), self.options.channel_buffer_sz);

        let runner = NodeRunner::new(
            "_output".to_string(),
            IterKind::Concat,
            None,
            merge_inputs,
            vec![terminal_producer],
        );
        let status = runner.status_handle();
        let handle = Builder::new().name("_output".to_string()).spawn(move || runner.run())?;
        join_handles.push(("_output".to_string(), handle));
        statuses.push(status);

        Ok(terminal_consumer)
    }
}

/// A started run: join to wait for every node to finish and collect the
/// output rows.
pub struct GraphExecutorHandle {
    join_handles: Vec<(String, JoinHandle<()>)>,
    statuses: Vec<NodeStatusHandle>,
    terminal_consumer: QueueConsumer,
}

impl GraphExecutorHandle {
    /// Waits for every worker thread to finish, then drains the terminal
    /// queue into the final row set. Any runner that recorded a failure is
    /// reported as a single [`ExecutionError::Aggregate`] rather than the
    /// first one encountered, so a caller sees every failing node at once.
    pub fn join(self) -> Result<Vec<Row>> {
        for (name, handle) in self.join_handles {
            if handle.join().is_err() {
                return Err(ExecutionError::ThreadSpawn(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("worker thread {name} panicked"),
                )));
            }
        }

        let mut failures = Vec::new();
        for status in &self.statuses {
            if let NodeStatus::Failed(reason) = status.get() {
                failures.push(format!("{}: {reason}", status.name()));
            }
        }
        if !failures.is_empty() {
            return Err(ExecutionError::Aggregate(failures.len(), failures.join("\n")));
        }

        let mut rows = Vec::new();
        while let Ok(row) = self.terminal_consumer.recv() {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn statuses(&self) -> Vec<(String, NodeStatus)> {
        self.statuses
            .iter()
            .map(|s| (s.name().to_string(), s.get()))
            .collect()
    }
}

/// Compiles and runs a DAG in one call, for callers that don't need to
/// hold onto the `CompiledPlan` separately.
pub fn run(
    plan: CompiledPlan,
    registry: Arc<dyn OperatorRegistry>,
    pool: Arc<OperatorPool>,
    options: ExecutorOptions,
    input_rows: Vec<Row>,
) -> Result<Vec<Row>> {
    let executor = GraphExecutor::new(plan, registry, pool, options);
    executor.start(input_rows)?.join()
}
