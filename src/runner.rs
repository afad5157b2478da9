//! `NodeRunner`: the per-node worker loop a [`GraphExecutor`](
//! crate::executor::GraphExecutor) spawns one OS thread for. A "receive,
//! invoke, forward" loop, generalized across every iteration kind this
//! crate compiles.
//!
//! `_input` and `_output` are not represented here: `_input` is seeded
//! directly by the [`GraphExecutor`] (it has no operator to invoke), and
//! `_output` either *is* its sole in-edge (no runner needed) or is the
//! small merge loop the executor spawns for fan-in. Every other iteration
//! kind — including `concat`, which is the one ordinary node kind with
//! more than one in-edge — runs here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Select;
use log::{debug, warn};

use crate::descriptor::IterKind;
use crate::errors::ExecutionError;
use crate::operator::{Operator, OperatorInput, OperatorOutput};
use crate::queue::{QueueConsumer, QueueProducer};
use crate::value::Row;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Running,
    Finished,
    Failed(String),
}

/// One node's worker: its iteration kind, its materialized operator (if
/// any — `nop` needs none), and the queues wiring it to the rest of the
/// compiled plan.
pub struct NodeRunner {
    pub name: String,
    iter_kind: IterKind,
    operator: Option<Arc<dyn Operator>>,
    inputs: Vec<QueueConsumer>,
    outputs: Vec<QueueProducer>,
    status: Arc<AtomicStatus>,
}

/// `NodeStatus` behind an atomic-friendly cell the executor can poll from
/// another thread without taking a lock on the runner itself.
struct AtomicStatus {
    finished: AtomicBool,
    failed: std::sync::Mutex<Option<String>>,
}

/// A cloneable, cheap handle onto a [`NodeRunner`]'s status, taken before
/// the runner is moved into its worker thread (`NodeRunner::run` consumes
/// `self`) so the executor can still poll it after spawning.
#[derive(Clone)]
pub struct NodeStatusHandle {
    name: String,
    status: Arc<AtomicStatus>,
}

impl NodeStatusHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> NodeStatus {
        if let Some(reason) = self.status.failed.lock().unwrap().clone() {
            return NodeStatus::Failed(reason);
        }
        if self.status.finished.load(Ordering::SeqCst) {
            NodeStatus::Finished
        } else {
            NodeStatus::Running
        }
    }
}

impl NodeRunner {
    pub fn new(
        name: String,
        iter_kind: IterKind,
        operator: Option<Arc<dyn Operator>>,
        inputs: Vec<QueueConsumer>,
        outputs: Vec<QueueProducer>,
    ) -> Self {
        Self {
            name,
            iter_kind,
            operator,
            inputs,
            outputs,
            status: Arc::new(AtomicStatus {
                finished: AtomicBool::new(false),
                failed: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status_handle().get()
    }

    pub fn status_handle(&self) -> NodeStatusHandle {
        NodeStatusHandle {
            name: self.name.clone(),
            status: self.status.clone(),
        }
    }

    /// The worker loop proper. Runs until every input is sealed and
    /// drained, forwarding each operator result to every output edge.
    /// Errors are recorded on `status` rather than unwound, so the
    /// executor can join every thread before deciding whether the overall
    /// run failed.
    pub fn run(self) {
        debug!("node {} starting", self.name);
        let result = match self.iter_kind.clone() {
            IterKind::Map | IterKind::FlatMap | IterKind::Filter | IterKind::Nop
                if self.inputs.len() <= 1 =>
            {
                self.run_single_input()
            }
            IterKind::Window { size, step } => self.run_window(size, step),
            IterKind::TimeWindow {
                time_range_sec,
                time_step_sec,
            } => self.run_time_window(time_range_sec, time_step_sec),
            IterKind::Concat | _ => self.run_merged(),
        };
        match result {
            Ok(()) => {
                self.status.finished.store(true, Ordering::SeqCst);
                debug!("node {} finished", self.name);
            }
            Err(e) => {
                warn!("node {} failed: {e}", self.name);
                *self.status.failed.lock().unwrap() = Some(e.to_string());
            }
        }
    }

    fn run_single_input(&self) -> Result<(), ExecutionError> {
        let Some(input) = self.inputs.first() else {
            return Ok(());
        };
        loop {
            let row = match input.recv() {
                Ok(row) => row,
                Err(_) => break,
            };
            self.process_row(row)?;
        }
        Ok(())
    }

    /// Reads from every in-edge via `Select`, in arrival order, until all
    /// are sealed and drained — the shape `concat` nodes (and `_output`'s
    /// fan-in merge) need.
    fn run_merged(&self) -> Result<(), ExecutionError> {
        let mut live: Vec<usize> = (0..self.inputs.len()).collect();
        while !live.is_empty() {
            let mut select = Select::new();
            for &idx in &live {
                select.recv(self.inputs[idx].receiver());
            }
            let oper = select.select();
            let pos_in_live = oper.index();
            let idx = live[pos_in_live];
            match oper.recv(self.inputs[idx].receiver()) {
                Ok(mut row) => {
                    self.inputs[idx].fold_scalars(&mut row);
                    self.process_row(row)?;
                }
                Err(_) => {
                    live.remove(pos_in_live);
                }
            }
        }
        Ok(())
    }

    fn run_window(&self, size: usize, step: usize) -> Result<(), ExecutionError> {
        let Some(input) = self.inputs.first() else {
            return Ok(());
        };
        let mut buffer: Vec<Row> = Vec::new();
        loop {
            match input.recv() {
                Ok(row) => {
                    buffer.push(row);
                    if buffer.len() >= size {
                        self.invoke_window(&buffer)?;
                        let drain_to = step.min(buffer.len());
                        buffer.drain(0..drain_to);
                    }
                }
                Err(_) => {
                    if !buffer.is_empty() {
                        self.invoke_window(&buffer)?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn run_time_window(
        &self,
        time_range_sec: f64,
        time_step_sec: f64,
    ) -> Result<(), ExecutionError> {
        let Some(input) = self.inputs.first() else {
            return Ok(());
        };
        let mut buffer: Vec<Row> = Vec::new();
        let mut window_start = Instant::now();
        let range = Duration::from_secs_f64(time_range_sec.max(0.0));
        let step = Duration::from_secs_f64(time_step_sec.max(0.0));
        loop {
            match input.recv() {
                Ok(row) => {
                    buffer.push(row);
                    if window_start.elapsed() >= range {
                        self.invoke_window(&buffer)?;
                        buffer.clear();
                        window_start = if step.is_zero() {
                            Instant::now()
                        } else {
                            window_start + step
                        };
                    }
                }
                Err(_) => {
                    if !buffer.is_empty() {
                        self.invoke_window(&buffer)?;
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn invoke_window(&self, buffer: &[Row]) -> Result<(), ExecutionError> {
        let output = self.call_operator(OperatorInput::Window(buffer))?;
        self.forward(output, None)
    }

    fn process_row(&self, row: Row) -> Result<(), ExecutionError> {
        let output = self.call_operator(OperatorInput::Row(&row))?;
        self.forward(output, Some(row))
    }

    fn call_operator(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, ExecutionError> {
        match &self.operator {
            Some(op) => op.call(input).map_err(|e| ExecutionError::OperatorFailed {
                node: self.name.clone(),
                source: e,
            }),
            None => match input {
                OperatorInput::Row(row) => Ok(OperatorOutput::Row(row.clone())),
                OperatorInput::Window(rows) => Ok(OperatorOutput::Rows(rows.to_vec())),
            },
        }
    }

    /// Turns an operator's result into the rows actually forwarded
    /// downstream. `filter` is the one iteration kind where the operator's
    /// output doesn't directly describe the row to forward: a `Bool`
    /// means "keep the source row unchanged or drop it". Outside `filter`,
    /// an operator returns only the columns it adds or changes, so its
    /// returned row is merged onto a clone of the source row rather than
    /// forwarded on its own — otherwise every column the operator didn't
    /// touch would be silently dropped.
    fn forward(&self, output: OperatorOutput, source_row: Option<Row>) -> Result<(), ExecutionError> {
        let rows = match (output, &self.iter_kind) {
            (OperatorOutput::Bool(keep), IterKind::Filter) => {
                if keep {
                    source_row.into_iter().collect()
                } else {
                    vec![]
                }
            }
            (OperatorOutput::Row(row), IterKind::Filter) => {
                if row_truthy(&row) {
                    vec![row]
                } else {
                    vec![]
                }
            }
            (OperatorOutput::Row(row), _) => vec![merge_onto_source(row, source_row)],
            (OperatorOutput::Rows(rows), _) => rows
                .into_iter()
                .map(|row| merge_onto_source(row, source_row.clone()))
                .collect(),
            (OperatorOutput::Bool(_), _) => {
                return Err(ExecutionError::MalformedOperatorOutput {
                    node: self.name.clone(),
                });
            }
        };
        for row in rows {
            for out in &self.outputs {
                if let Err(e) = out.push(row.clone()) {
                    warn!("node {} dropped a row: downstream queue closed ({e})", self.name);
                }
            }
        }
        Ok(())
    }
}

/// Merges an operator's returned columns onto a clone of the row that fed
/// it, so columns the operator didn't touch still reach downstream nodes.
/// Window-driven invocations have no single source row (`source_row` is
/// `None`), so there's nothing to merge onto.
fn merge_onto_source(row: Row, source_row: Option<Row>) -> Row {
    match source_row {
        Some(mut merged) => {
            merged.extend(row);
            merged
        }
        None => row,
    }
}

fn row_truthy(row: &Row) -> bool {
    row.values().next().map(value_truthy).unwrap_or(false)
}

fn value_truthy(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        _ => true,
    }
}
