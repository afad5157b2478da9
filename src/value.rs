/// A single column value. Columns are untyped at the Rust level; the
/// compiler only reasons about [`crate::schema::ColumnType`] (SCALAR vs
/// QUEUE), never about the payload shape.
pub type Value = serde_json::Value;

/// A row flowing across an edge: a mapping from column name to value.
///
/// For a SCALAR column this holds the single broadcast value; for a QUEUE
/// column it holds that row's element.
pub type Row = serde_json::Map<String, Value>;

/// Builds a [`Row`] from `(name, value)` pairs, for tests and small call
/// sites that would otherwise construct a `serde_json::Map` by hand.
pub fn row<I, K>(fields: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
