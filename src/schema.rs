use serde::{Deserialize, Serialize};

/// Whether a column on an edge carries a single broadcast value or a
/// per-row stream element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Scalar,
    Queue,
}

impl ColumnType {
    /// Column-type promotion restricted to the "which of SCALAR/QUEUE"
    /// axis; callers decide the effective [`crate::descriptor::IterKind`] first
    /// (map/filter/nop/concat/input/output are cardinality-preserving;
    /// flat_map/window/time_window are not).
    pub fn promote(upstream: Option<ColumnType>, cardinality_preserving: bool) -> ColumnType {
        match (cardinality_preserving, upstream) {
            (false, _) => ColumnType::Queue,
            (true, None) => ColumnType::Scalar,
            (true, Some(t)) => t,
        }
    }
}

/// Per-(edge, column) schema record: the column's type plus a count of how
/// many upstream producers along the paths reaching this edge have
/// contributed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    pub name: String,
    pub ty: ColumnType,
    pub count: u32,
}

impl SchemaEntry {
    pub fn new(name: impl Into<String>, ty: ColumnType, count: u32) -> Self {
        Self {
            name: name.into(),
            ty,
            count,
        }
    }
}
