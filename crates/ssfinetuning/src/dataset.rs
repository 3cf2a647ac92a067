use crate::error::{FinetuneError, FinetuneResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Column name → values for a contiguous run of rows.
pub type Batch = BTreeMap<String, Vec<Value>>;

/// A column-oriented table of JSON values.
///
/// Every column holds exactly `num_rows` values; rows missing a field are
/// filled with `null` when built from rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Batch,
    num_rows: usize,
}

impl Dataset {
    /// Build from named columns. All columns must have the same length.
    pub fn from_columns(columns: Batch) -> FinetuneResult<Self> {
        let num_rows = columns.values().next().map_or(0, Vec::len);
        for (name, values) in &columns {
            if values.len() != num_rows {
                return Err(FinetuneError::Dataset(format!(
                    "column `{name}` has {} rows, expected {num_rows}",
                    values.len()
                )));
            }
        }
        Ok(Self { columns, num_rows })
    }

    #[must_use]
    pub fn from_rows(rows: Vec<Map<String, Value>>) -> Self {
        let mut names: Vec<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        names.sort();
        names.dedup();

        let num_rows = rows.len();
        let mut columns: Batch = names
            .iter()
            .map(|n| (n.clone(), Vec::with_capacity(num_rows)))
            .collect();

        for mut row in rows {
            for (name, values) in &mut columns {
                values.push(row.remove(name).unwrap_or(Value::Null));
            }
        }

        Self { columns, num_rows }
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn row(&self, idx: usize) -> Option<Map<String, Value>> {
        if idx >= self.num_rows {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(name, values)| (name.clone(), values[idx].clone()))
                .collect(),
        )
    }

    pub fn rows(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        (0..self.num_rows).filter_map(|idx| self.row(idx))
    }

    fn slice(&self, start: usize, end: usize) -> Batch {
        self.columns
            .iter()
            .map(|(name, values)| (name.clone(), values[start..end].to_vec()))
            .collect()
    }

    /// Read a JSONL file where each line is one row object.
    pub fn read_jsonl(path: &Path) -> FinetuneResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Map<String, Value> = serde_json::from_str(line).map_err(|e| {
                FinetuneError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
            })?;
            rows.push(row);
        }

        Ok(Self::from_rows(rows))
    }

    pub fn write_jsonl(&self, path: &Path) -> FinetuneResult<()> {
        let mut out = String::new();
        for row in self.rows() {
            out.push_str(&serde_json::to_string(&row)?);
            out.push('\n');
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Named splits, e.g. `labeled`, `unlabeled` and `validation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDict {
    splits: BTreeMap<String, Dataset>,
}

impl DatasetDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_split(mut self, name: impl Into<String>, dataset: Dataset) -> Self {
        self.insert(name, dataset);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, dataset: Dataset) -> Option<Dataset> {
        self.splits.insert(name.into(), dataset)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.splits.get(name)
    }

    pub fn split_names(&self) -> impl Iterator<Item = &str> {
        self.splits.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.splits.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// Batched column transform, applied in place of the external `map(batched=True)`.
///
/// Columns returned by `f` are added to the dataset, replacing existing columns
/// of the same name. Each returned column must have one value per input row.
pub trait BatchMap: Sized {
    fn map_batched<F>(self, batch_size: usize, f: F) -> FinetuneResult<Self>
    where
        F: FnMut(&Batch) -> FinetuneResult<Batch>;
}

impl BatchMap for Dataset {
    fn map_batched<F>(mut self, batch_size: usize, mut f: F) -> FinetuneResult<Self>
    where
        F: FnMut(&Batch) -> FinetuneResult<Batch>,
    {
        if batch_size == 0 {
            return Err(FinetuneError::Dataset("batch size must be >= 1".to_string()));
        }

        // An empty dataset still gets one (empty) call so it ends up with the
        // same columns as its non-empty siblings.
        let bounds: Vec<(usize, usize)> = if self.num_rows == 0 {
            vec![(0, 0)]
        } else {
            (0..self.num_rows)
                .step_by(batch_size)
                .map(|start| (start, (start + batch_size).min(self.num_rows)))
                .collect()
        };

        let mut produced: Batch = BTreeMap::new();
        for (start, end) in bounds {
            let input = self.slice(start, end);
            let output = f(&input)?;

            for (name, values) in output {
                if values.len() != end - start {
                    return Err(FinetuneError::Dataset(format!(
                        "map returned {} values for column `{name}` in a batch of {} rows",
                        values.len(),
                        end - start
                    )));
                }
                let column = produced.entry(name).or_default();
                if column.len() != start {
                    return Err(FinetuneError::Dataset(
                        "map must return the same columns for every batch".to_string(),
                    ));
                }
                column.extend(values);
            }
        }

        for (name, values) in produced {
            if values.len() != self.num_rows {
                return Err(FinetuneError::Dataset(format!(
                    "column `{name}` was not produced for every batch"
                )));
            }
            self.columns.insert(name, values);
        }

        Ok(self)
    }
}

impl BatchMap for DatasetDict {
    fn map_batched<F>(self, batch_size: usize, mut f: F) -> FinetuneResult<Self>
    where
        F: FnMut(&Batch) -> FinetuneResult<Batch>,
    {
        let mut splits = BTreeMap::new();
        for (name, dataset) in self.splits {
            let mapped = dataset
                .map_batched(batch_size, &mut f)
                .map_err(|e| match e {
                    FinetuneError::Dataset(msg) => FinetuneError::Dataset(format!("split `{name}`: {msg}")),
                    other => other,
                })?;
            splits.insert(name, mapped);
        }
        Ok(Self { splits })
    }
}
