//! Numeric datasets passed to the runtime.
//!
//! A dataset is an ordered set of named numeric columns. Missing values
//! (`null` inline, an empty cell or `NA` in a CSV file) are kept as `None`
//! and reach R as `NA`.

use std::path::Path;

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Cell values read as missing.
const MISSING_MARKERS: &[&str] = &["", "NA", "NaN", "null"];

/// Shape constraints an analysis puts on its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// Fewest columns accepted.
    pub min_columns: usize,
    /// Most columns accepted.
    pub max_columns: Option<usize>,
    /// Whether columns are paired observations and must be the same length.
    pub paired: bool,
}

/// Named numeric columns in a fixed order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: IndexMap<String, Vec<Option<f64>>>,
    /// CSV columns that were not numeric; selecting one is an error.
    non_numeric: Vec<String>,
}

impl Dataset {
    /// Reads the inline `data` argument: an object of numeric arrays.
    ///
    /// # Errors
    ///
    /// Returns a message if `data` is not an object of arrays of numbers or
    /// nulls.
    pub fn from_inline(data: &Value) -> Result<Self, String> {
        let object = data
            .as_object()
            .ok_or_else(|| "`data` must be an object of named numeric columns".to_string())?;

        let mut columns = IndexMap::with_capacity(object.len());
        for (name, values) in object {
            let values = values
                .as_array()
                .ok_or_else(|| format!("column '{name}' must be an array"))?;
            let parsed = values
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::Null => Ok(None),
                    Value::Number(n) => Ok(n.as_f64()),
                    other => Err(format!(
                        "column '{name}' row {}: {other} is not a number",
                        i + 1
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            columns.insert(name.clone(), parsed);
        }

        Ok(Self {
            columns,
            non_numeric: Vec::new(),
        })
    }

    /// Reads a CSV file with a header row.
    ///
    /// # Errors
    ///
    /// Returns a message if the file cannot be read or is not valid CSV.
    pub async fn from_csv_file(path: &Path) -> Result<Self, String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
        Self::from_csv(&bytes)
    }

    /// Parses CSV text with a header row.
    ///
    /// Columns holding anything other than numbers and missing markers are
    /// remembered as non-numeric rather than rejected, so a file with an id
    /// or label column can still be analysed.
    ///
    /// # Errors
    ///
    /// Returns a message if the CSV is malformed or has no header.
    pub fn from_csv(bytes: &[u8]) -> Result<Self, String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| format!("invalid CSV header: {e}"))?
            .iter()
            .map(ToString::to_string)
            .collect();
        if headers.is_empty() || headers.iter().all(String::is_empty) {
            return Err("CSV file has no header row".to_string());
        }

        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|e| format!("invalid CSV at row {}: {e}", row + 2))?;
            for (i, cell) in record.iter().enumerate().take(headers.len()) {
                raw[i].push(cell.to_string());
            }
        }

        let mut dataset = Self::default();
        for (name, cells) in headers.into_iter().zip(raw) {
            match parse_numeric(&cells) {
                Some(values) => {
                    dataset.columns.insert(name, values);
                }
                None => {
                    tracing::debug!(column = %name, "Skipping non-numeric CSV column");
                    dataset.non_numeric.push(name);
                }
            }
        }
        Ok(dataset)
    }

    /// Keeps only `names`, in that order. `None` keeps every numeric column.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first unknown or non-numeric column.
    pub fn select(mut self, names: Option<&[String]>) -> Result<Self, String> {
        let Some(names) = names else {
            return Ok(self);
        };

        let mut selected = IndexMap::with_capacity(names.len());
        for name in names {
            if selected.contains_key(name) {
                return Err(format!("column '{name}' is selected twice"));
            }
            if self.non_numeric.contains(name) {
                return Err(format!("column '{name}' is not numeric"));
            }
            let values = self
                .columns
                .shift_remove(name)
                .ok_or_else(|| format!("column '{name}' not found"))?;
            selected.insert(name.clone(), values);
        }
        self.columns = selected;
        Ok(self)
    }

    /// Moves `name` to the front.
    ///
    /// # Errors
    ///
    /// Returns a message if the column is not present.
    pub fn move_to_front(&mut self, name: &str) -> Result<(), String> {
        let index = self
            .columns
            .get_index_of(name)
            .ok_or_else(|| format!("column '{name}' not found"))?;
        self.columns.move_index(index, 0);
        Ok(())
    }

    /// Checks the column count, emptiness and, for paired data, lengths.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first violation.
    pub fn check_shape(&self, shape: Shape) -> Result<(), String> {
        let count = self.columns.len();
        if count < shape.min_columns {
            return Err(format!(
                "needs at least {} numeric column(s), got {count}",
                shape.min_columns
            ));
        }
        if let Some(max) = shape.max_columns {
            if count > max {
                return Err(format!(
                    "accepts at most {max} column(s), got {count}; choose them with `columns`"
                ));
            }
        }

        for (name, values) in &self.columns {
            if values.iter().all(Option::is_none) {
                return Err(format!("column '{name}' is empty"));
            }
        }

        if shape.paired {
            let mut lengths = self.columns.iter().map(|(name, v)| (name, v.len()));
            if let Some((first_name, first_len)) = lengths.next() {
                if let Some((name, len)) = lengths.find(|(_, len)| *len != first_len) {
                    return Err(format!(
                        "paired columns must have equal lengths: '{first_name}' has {first_len}, '{name}' has {len}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no numeric columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The columns as a JSON object, missing values as `null`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .columns
            .iter()
            .map(|(name, values)| {
                let values = values
                    .iter()
                    .map(|v| v.map_or(Value::Null, Value::from))
                    .collect();
                (name.clone(), Value::Array(values))
            })
            .collect();
        Value::Object(map)
    }
}

fn parse_numeric(cells: &[String]) -> Option<Vec<Option<f64>>> {
    cells
        .iter()
        .map(|cell| {
            if MISSING_MARKERS.contains(&cell.as_str()) {
                Some(None)
            } else {
                cell.parse::<f64>().ok().filter(|v| v.is_finite()).map(Some)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAIRED: Shape = Shape {
        min_columns: 2,
        max_columns: Some(2),
        paired: true,
    };

    #[test]
    fn inline_keeps_order_and_nulls() {
        let dataset = Dataset::from_inline(&json!({"y": [1, null, 3], "x": [0.5]})).unwrap();
        assert_eq!(dataset.names().collect::<Vec<_>>(), vec!["y", "x"]);
        assert_eq!(dataset.to_json()["y"], json!([1.0, null, 3.0]));
    }

    #[test]
    fn inline_rejects_strings() {
        let err = Dataset::from_inline(&json!({"x": [1, "two"]})).unwrap_err();
        assert!(err.contains("row 2"));
        assert!(Dataset::from_inline(&json!([1, 2])).is_err());
    }

    #[test]
    fn mismatched_pairs_are_rejected() {
        let dataset = Dataset::from_inline(&json!({"x": [1, 2], "y": [1, 2, 3]})).unwrap();
        let err = dataset.check_shape(PAIRED).unwrap_err();
        assert!(err.contains("equal lengths"));
    }

    #[test]
    fn column_counts_and_empty_columns() {
        let one = Dataset::from_inline(&json!({"x": [1, 2]})).unwrap();
        assert!(one.check_shape(PAIRED).unwrap_err().contains("at least 2"));

        let empty = Dataset::from_inline(&json!({"x": [], "y": [1]})).unwrap();
        let shape = Shape {
            paired: false,
            ..PAIRED
        };
        assert!(empty.check_shape(shape).unwrap_err().contains("'x' is empty"));

        let three = Dataset::from_inline(&json!({"a": [1], "b": [2], "c": [3]})).unwrap();
        assert!(three.check_shape(shape).unwrap_err().contains("at most 2"));
    }

    #[test]
    fn csv_skips_text_columns_and_reads_missing() {
        let csv = "id,height,weight\na,1.5,60\nb,NA,\nc,1.7,72\n";
        let dataset = Dataset::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(dataset.names().collect::<Vec<_>>(), vec!["height", "weight"]);
        assert_eq!(dataset.to_json()["weight"], json!([60.0, null, 72.0]));

        let err = dataset.select(Some(&["id".to_string()])).unwrap_err();
        assert!(err.contains("not numeric"));
    }

    #[test]
    fn select_orders_and_rejects_unknown() {
        let dataset = Dataset::from_inline(&json!({"a": [1], "b": [2], "c": [3]})).unwrap();
        let selected = dataset
            .clone()
            .select(Some(&["c".to_string(), "a".to_string()]))
            .unwrap();
        assert_eq!(selected.names().collect::<Vec<_>>(), vec!["c", "a"]);

        let err = dataset.select(Some(&["z".to_string()])).unwrap_err();
        assert!(err.contains("'z' not found"));
    }

    #[test]
    fn move_to_front() {
        let mut dataset = Dataset::from_inline(&json!({"a": [1], "b": [2]})).unwrap();
        dataset.move_to_front("b").unwrap();
        assert_eq!(dataset.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(dataset.move_to_front("z").is_err());
    }

    #[tokio::test]
    async fn reads_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "x,y\n1,2\n2,4\n").unwrap();
        let dataset = Dataset::from_csv_file(&path).await.unwrap();
        assert_eq!(dataset.len(), 2);

        let missing = Dataset::from_csv_file(&dir.path().join("nope.csv")).await;
        assert!(missing.unwrap_err().contains("cannot read"));
    }
}
