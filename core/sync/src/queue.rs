//! Ordered queue of pending writes.

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

use batchline_common::{Collection, Record, RecordId};

/// Type of pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// New record.
    Create,
    /// Partial update of an existing record.
    Update,
    /// Record removal.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A write waiting to be dispatched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Logical timestamp assigned when the operation entered the queue.
    pub seq: u64,
    /// Type of write.
    pub kind: OperationKind,
    /// Target collection.
    pub collection: Collection,
    /// Target record; absent for creates.
    pub id: Option<RecordId>,
    /// Full record for creates, changed fields for updates, absent for deletes.
    pub payload: Option<Record>,
    /// Failed dispatches so far.
    pub attempt: u32,
    /// When the operation entered the queue.
    #[serde(skip)]
    pub enqueued_at: Instant,
}

impl Operation {
    /// A create of `data` in `collection`.
    pub fn create(collection: Collection, data: Record) -> Self {
        Self::new(OperationKind::Create, collection, None, Some(data))
    }

    /// An update of `id` with the fields in `data`.
    pub fn update(collection: Collection, id: RecordId, data: Record) -> Self {
        Self::new(OperationKind::Update, collection, Some(id), Some(data))
    }

    /// A delete of `id`.
    pub fn delete(collection: Collection, id: RecordId) -> Self {
        Self::new(OperationKind::Delete, collection, Some(id), None)
    }

    fn new(
        kind: OperationKind,
        collection: Collection,
        id: Option<RecordId>,
        payload: Option<Record>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            collection,
            id,
            payload,
            attempt: 0,
            enqueued_at: Instant::now(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "#{} {} {}:{}", self.seq, self.kind, self.collection, id),
            None => write!(f, "#{} {} {}", self.seq, self.kind, self.collection),
        }
    }
}

/// Pending writes in submission order.
#[derive(Debug, Default)]
pub struct OperationQueue {
    ops: Vec<Operation>,
    next_seq: u64,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `op`, stamping it with the next sequence number and `now`.
    ///
    /// Returns the new queue length.
    pub fn push(&mut self, mut op: Operation, now: Instant) -> usize {
        self.next_seq += 1;
        op.seq = self.next_seq;
        op.enqueued_at = now;
        self.ops.push(op);
        self.ops.len()
    }

    /// Take every queued operation, leaving the queue empty.
    pub fn take_all(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.ops)
    }

    /// Put a previously taken snapshot back in front of anything queued since.
    ///
    /// Sequence numbers and timestamps are kept as they were.
    pub fn requeue_front(&mut self, mut snapshot: Vec<Operation>) {
        snapshot.append(&mut self.ops);
        self.ops = snapshot;
    }

    /// Queued operations in order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Split a snapshot by collection.
///
/// Groups are ordered by first appearance; operations keep queue order
/// within their group.
pub fn group_by_collection(ops: Vec<Operation>) -> Vec<(Collection, Vec<Operation>)> {
    let mut groups: Vec<(Collection, Vec<Operation>)> = Vec::new();
    for op in ops {
        match groups.iter_mut().find(|(c, _)| *c == op.collection) {
            Some((_, group)) => group.push(op),
            None => groups.push((op.collection.clone(), vec![op])),
        }
    }
    groups
}
