//! Static table metadata used by the query facade to validate predicates.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Text,
    Integer,
    Float,
    Boolean,
    /// Calendar date rendered as `YYYY-MM-DD` (or "" when unknown).
    Date,
    /// RFC3339 timestamp (or "" when unknown).
    Timestamp,
    /// Closed vocabulary rendered as text (status, risk level, ...).
    Enum,
}

impl SemanticType {
    /// Types that support range predicates and min/max.
    pub fn is_ordered(self) -> bool {
        !matches!(self, SemanticType::Boolean)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, SemanticType::Integer | SemanticType::Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexHint {
    None,
    /// Unique identifier column.
    Primary,
    /// Low-cardinality column that the remote API filters on natively.
    Filterable,
    /// Column used as the incremental sync watermark.
    Watermark,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: SemanticType,
    pub nullable: bool,
    pub index: IndexHint,
    /// Computed from stored fields at read time; never sent to the remote API.
    pub derived: bool,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: SemanticType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            index: IndexHint::None,
            derived: false,
        }
    }

    pub const fn primary(mut self) -> Self {
        self.index = IndexHint::Primary;
        self.nullable = false;
        self
    }

    pub const fn filterable(mut self) -> Self {
        self.index = IndexHint::Filterable;
        self
    }

    pub const fn watermark(mut self) -> Self {
        self.index = IndexHint::Watermark;
        self
    }

    pub const fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn derived(mut self) -> Self {
        self.derived = true;
        self
    }

    /// Whether the remote API can evaluate predicates on this column.
    pub fn is_pushable(&self) -> bool {
        !self.derived && matches!(self.index, IndexHint::Primary | IndexHint::Filterable)
    }
}

/// Immutable description of one connector's virtual table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(table: &'static str, columns: Vec<ColumnDef>) -> Self {
        Self { table, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.index == IndexHint::Primary)
    }

    /// Column the remote compares incremental sync cursors against.
    pub fn watermark(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.index == IndexHint::Watermark)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let schema = TableSchema::new(
            "people",
            vec![
                ColumnDef::new("id", SemanticType::Text).primary(),
                ColumnDef::new("hire_date", SemanticType::Date),
            ],
        );
        assert_eq!(schema.column("HIRE_DATE").map(|c| c.name), Some("hire_date"));
        assert_eq!(schema.primary_key().map(|c| c.name), Some("id"));
        assert!(schema.column("salary").is_none());
        assert!(!schema.primary_key().map(|c| c.nullable).unwrap_or(true));
    }
}
