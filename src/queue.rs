//! `TypedQueue`: the bounded, sealable channel an edge in a [`CompiledPlan`](
//! crate::plan::CompiledPlan) is realized as at runtime. Built directly on
//! `crossbeam::channel::bounded`.
//!
//! A queue's SCALAR columns are stored once and broadcast to every
//! consumer; its QUEUE columns flow one [`Row`] at a time through the
//! channel. Sealing a queue means dropping a producer's [`QueueProducer`]
//! clone — crossbeam's channel closes on its own once every `Sender` clone
//! is gone, so there is no separate "sealed" flag to get out of sync with
//! reality; [`QueueProducer::is_sealed`] only exists for introspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, RecvError, SendError, Sender};

use crate::schema::SchemaEntry;
use crate::value::Row;

struct Shared {
    schema: Vec<SchemaEntry>,
    scalars: Mutex<Row>,
    live_producers: AtomicUsize,
}

/// Builds the producer/consumer pair for one compiled edge. `capacity` is
/// the bounded channel's buffer size (`ExecutorOptions::channel_buffer_sz`).
pub fn typed_queue(schema: Vec<SchemaEntry>, capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let shared = Arc::new(Shared {
        schema,
        scalars: Mutex::new(Row::new()),
        live_producers: AtomicUsize::new(1),
    });
    (
        QueueProducer {
            tx,
            shared: shared.clone(),
        },
        QueueConsumer { rx, shared },
    )
}

/// The producing half of a [`TypedQueue`](self). Cloning it (for a fan-out
/// `_input` or a replicated node) bumps the live-producer count; every
/// clone must eventually be dropped (or [`seal`](Self::seal)ed explicitly)
/// for the consumer side to observe end-of-stream.
pub struct QueueProducer {
    tx: Sender<Row>,
    shared: Arc<Shared>,
}

impl Clone for QueueProducer {
    fn clone(&self) -> Self {
        self.shared.live_producers.fetch_add(1, Ordering::SeqCst);
        QueueProducer {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        self.shared.live_producers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueProducer {
    /// Records this edge's SCALAR columns, overwriting any broadcast value
    /// already set. Safe to call more than once if every caller agrees on
    /// the value (the common case: `_input` setting the initial scalars
    /// before sealing edge 0).
    pub fn set_scalars(&self, row: &Row) {
        let mut scalars = self.shared.scalars.lock().expect("scalar store poisoned");
        for entry in self.shared.schema.iter().filter(|e| e.ty.is_scalar()) {
            if let Some(value) = row.get(&entry.name) {
                scalars.insert(entry.name.clone(), value.clone());
            }
        }
    }

    /// Pushes one QUEUE-column row. Blocks if the channel is at capacity
    /// (back-pressure); returns [`QueueSealed`](
    /// crate::errors::ExecutionError::QueueSealed) equivalent information
    /// if every consumer has already been dropped.
    pub fn push(&self, row: Row) -> Result<(), SendError<Row>> {
        self.tx.send(row)
    }

    /// Explicitly drops this producer handle, sealing the queue if it was
    /// the last live one.
    pub fn seal(self) {
        drop(self)
    }

    pub fn is_sealed(&self) -> bool {
        self.shared.live_producers.load(Ordering::SeqCst) == 0
    }
}

/// The consuming half of a [`TypedQueue`](self). Clonable so a node with
/// several predecessors (a merge/concat) can hold one consumer per
/// in-edge.
#[derive(Clone)]
pub struct QueueConsumer {
    rx: Receiver<Row>,
    shared: Arc<Shared>,
}

impl QueueConsumer {
    pub fn schema(&self) -> &[SchemaEntry] {
        &self.shared.schema
    }

    /// The raw crossbeam receiver, for runners that need to `Select` over
    /// several in-edges at once (concat/window fan-in). Rows read this way
    /// still need [`Self::fold_scalars`] applied.
    pub fn receiver(&self) -> &Receiver<Row> {
        &self.rx
    }

    /// Fills in this edge's broadcast SCALAR columns on a row received
    /// through the raw [`Self::receiver`] (e.g. via `Select`).
    pub fn fold_scalars(&self, row: &mut Row) {
        let scalars = self.shared.scalars.lock().expect("scalar store poisoned");
        for (k, v) in scalars.iter() {
            row.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Receives the next row, folding in this edge's broadcast SCALAR
    /// columns so the caller sees a complete row regardless of which
    /// columns are QUEUE vs SCALAR. Blocks until a row arrives or the
    /// queue is sealed and drained.
    pub fn recv(&self) -> Result<Row, RecvError> {
        let mut row = self.rx.recv()?;
        self.fold_scalars(&mut row);
        Ok(row)
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.shared.live_producers.load(Ordering::SeqCst) == 0
    }
}

impl crate::schema::ColumnType {
    pub fn is_scalar(self) -> bool {
        matches!(self, crate::schema::ColumnType::Scalar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use crate::value::row;

    #[test]
    fn scalar_columns_are_broadcast_to_every_row() {
        let schema = vec![SchemaEntry::new("a", ColumnType::Scalar, 1)];
        let (producer, consumer) = typed_queue(schema, 4);
        producer.set_scalars(&row([("a", serde_json::json!(1))]));
        producer.push(Row::new()).unwrap();
        producer.seal();

        let received = consumer.recv().unwrap();
        assert_eq!(received.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn queue_closes_once_every_producer_drops() {
        let schema = vec![SchemaEntry::new("a", ColumnType::Queue, 1)];
        let (producer, consumer) = typed_queue(schema, 4);
        let second = producer.clone();
        producer.push(row([("a", serde_json::json!(1))])).unwrap();
        drop(second);
        assert!(consumer.recv().is_ok());
        assert!(consumer.recv().is_err());
    }

    #[test]
    fn is_sealed_reflects_live_producer_count() {
        let schema = vec![];
        let (producer, consumer) = typed_queue(schema, 1);
        let clone = producer.clone();
        assert!(!consumer.is_sealed());
        drop(clone);
        assert!(!consumer.is_sealed());
        producer.seal();
        assert!(consumer.is_sealed());
    }
}
