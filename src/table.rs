use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::FocosError;

/// A single cell. Missing values are explicit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Parses a raw text cell the way the observation exports are written:
    /// empty and NA-like markers are missing, then integer, float, text.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || is_na_marker(trimmed) {
            return Value::Null;
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Value::Int(int);
        }
        if let Ok(float) = trimmed.parse::<f64>() {
            if float.is_nan() {
                return Value::Null;
            }
            return Value::Float(float);
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) if value.is_finite() => Some(*value),
            Value::Text(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(value) => Some(value.to_string()),
            Value::Float(value) => Some(value.to_string()),
            Value::Text(text) => Some(text.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(text) => write!(f, "{text}"),
        }
    }
}

fn is_na_marker(value: &str) -> bool {
    matches!(
        value,
        "NA" | "N/A" | "NaN" | "nan" | "NULL" | "null" | "None" | "#N/A" | "<NA>"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Text,
}

/// Ordered mapping of column name to column values, all columns the same
/// length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: IndexMap<String, Vec<Value>>,
    rows: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: usize) -> Self {
        Self {
            columns: IndexMap::new(),
            rows,
        }
    }

    /// Builds a table from a header and row-major records. Short records are
    /// padded with nulls, long ones truncated to the header.
    pub fn from_records(header: &[String], records: Vec<Vec<Value>>) -> Self {
        let rows = records.len();
        let mut columns: IndexMap<String, Vec<Value>> = header
            .iter()
            .map(|name| (name.clone(), Vec::with_capacity(rows)))
            .collect();
        for mut record in records {
            record.resize(header.len(), Value::Null);
            for (values, cell) in columns.values_mut().zip(record) {
                values.push(cell);
            }
        }
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) -> Result<(), FocosError> {
        let name = name.into();
        if values.len() != self.rows {
            return Err(FocosError::TableShape(format!(
                "column {name} has {} values, table has {} rows",
                values.len(),
                self.rows
            )));
        }
        if self.columns.contains_key(&name) {
            return Err(FocosError::TableShape(format!("duplicate column {name}")));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Vec<Value>> {
        self.columns.shift_remove(name)
    }

    /// Renames in place, keeping the column position.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if from == to || self.columns.contains_key(to) {
            return false;
        }
        match self.columns.get_index_of(from) {
            Some(index) => {
                let values = self.columns.shift_remove(from).unwrap_or_default();
                self.columns.shift_insert(index, to.to_string(), values);
                true
            }
            None => false,
        }
    }

    /// Fills nulls in `target` from `source` and drops `source`.
    pub fn coalesce_into(&mut self, source: &str, target: &str) {
        let Some(source_values) = self.columns.shift_remove(source) else {
            return;
        };
        if let Some(target_values) = self.columns.get_mut(target) {
            for (slot, value) in target_values.iter_mut().zip(source_values) {
                if slot.is_null() {
                    *slot = value;
                }
            }
        }
    }

    pub fn retain_rows(&mut self, keep: &[bool]) {
        for values in self.columns.values_mut() {
            let mut flags = keep.iter();
            values.retain(|_| *flags.next().unwrap_or(&false));
        }
        self.rows = keep.iter().take(self.rows).filter(|flag| **flag).count();
    }

    /// Narrowest type holding every non-null value of the column.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        let values = self.columns.get(name)?;
        let mut kind = ColumnType::Int;
        for value in values {
            match value {
                Value::Null | Value::Int(_) => {}
                Value::Float(_) => {
                    if kind == ColumnType::Int {
                        kind = ColumnType::Float;
                    }
                }
                Value::Text(_) => return Some(ColumnType::Text),
            }
        }
        Some(kind)
    }

    /// Row-wise concatenation over the union of columns. Columns keep the
    /// order in which they are first seen; rows from a table lacking a column
    /// get nulls.
    pub fn concat(tables: Vec<Table>) -> Table {
        let mut order: IndexMap<String, ()> = IndexMap::new();
        for table in &tables {
            for name in table.columns.keys() {
                order.entry(name.clone()).or_insert(());
            }
        }
        let total: usize = tables.iter().map(|table| table.rows).sum();
        let mut columns: IndexMap<String, Vec<Value>> = order
            .keys()
            .map(|name| (name.clone(), Vec::with_capacity(total)))
            .collect();
        for mut table in tables {
            for (name, values) in columns.iter_mut() {
                match table.columns.shift_remove(name) {
                    Some(source) => values.extend(source),
                    None => values.extend(std::iter::repeat_n(Value::Null, table.rows)),
                }
            }
        }
        Table {
            columns,
            rows: total,
        }
    }
}
