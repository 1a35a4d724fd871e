use crate::config::ClassifierConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// Storage bucket recommended for a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bucket {
    /// Tabular data that maps onto columns
    RowOriented,
    /// Nested or irregular data kept as documents
    DocumentOriented,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::RowOriented => "row-oriented",
            Bucket::DocumentOriented => "document-oriented",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural facts gathered while classifying
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Structure {
    /// Uniform array of flat objects
    Columns {
        columns: Vec<String>,
        estimated_rows: usize,
    },
    /// Flat object
    Keys { keys: Vec<String> },
    /// Nested content and its maximum depth
    Nested { depth: u32 },
}

/// Outcome of classifying one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub recommendation: Bucket,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
}

impl AnalysisResult {
    fn document(reason: impl Into<String>) -> Self {
        Self {
            recommendation: Bucket::DocumentOriented,
            reason: reason.into(),
            structure: None,
        }
    }

    fn nested(reason: impl Into<String>, depth: u32) -> Self {
        Self {
            recommendation: Bucket::DocumentOriented,
            reason: reason.into(),
            structure: Some(Structure::Nested { depth }),
        }
    }

    /// Column list for row-oriented arrays, key list for flat objects
    pub fn column_names(&self) -> &[String] {
        match &self.structure {
            Some(Structure::Columns { columns, .. }) => columns,
            Some(Structure::Keys { keys }) => keys,
            _ => &[],
        }
    }

    /// Reported nesting depth, if the content was nested
    pub fn nesting_depth(&self) -> Option<u32> {
        match self.structure {
            Some(Structure::Nested { depth }) => Some(depth),
            _ => None,
        }
    }
}

/// Content classifier that recommends a bucket for parsed JSON
///
/// Classification is a pure function of the value, its byte size and the
/// configured thresholds:
/// - Oversized content skips inspection
/// - Scalars and empty arrays are documents
/// - Arrays must hold uniform, flat objects with a table-like key set
/// - Objects are rows only when no value is a non-empty container
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    /// Create a new classifier with the given configuration
    pub fn new(mut config: ClassifierConfig) -> Self {
        // The first sampled item is the reference key set.
        config.sample_size = config.sample_size.max(1);
        Self { config }
    }

    /// Classify a parsed document whose raw form was `size_bytes` long
    pub fn classify(&self, value: &Value, size_bytes: usize) -> AnalysisResult {
        if size_bytes > self.config.max_analysis_bytes {
            return AnalysisResult::document(format!(
                "Content too large for structured optimization ({} bytes > {} bytes)",
                size_bytes, self.config.max_analysis_bytes
            ));
        }

        let result = match value {
            Value::Array(items) => self.classify_array(items),
            Value::Object(map) => self.classify_object(map),
            _ => AnalysisResult::document("Simple scalar data"),
        };

        trace!(
            recommendation = %result.recommendation,
            reason = %result.reason,
            "Classified content"
        );

        result
    }

    fn classify_array(&self, items: &[Value]) -> AnalysisResult {
        if items.is_empty() {
            return AnalysisResult::document("Empty array");
        }

        let sample = &items[..items.len().min(self.config.sample_size)];

        let objects: Vec<&Map<String, Value>> =
            sample.iter().filter_map(Value::as_object).collect();
        if objects.len() != sample.len() {
            return AnalysisResult::document("Non-uniform: array contains non-object items");
        }

        let first_keys: BTreeSet<&str> = objects[0].keys().map(String::as_str).collect();
        let uniform = objects[1..]
            .iter()
            .all(|item| item.keys().map(String::as_str).collect::<BTreeSet<_>>() == first_keys);
        if !uniform {
            return AnalysisResult::document("Variable structure: sampled items have differing keys");
        }

        let depth = max_child_depth(objects[0].values());
        if depth >= self.config.nesting_threshold {
            return AnalysisResult::nested(format!("Nested array items (depth: {})", depth), depth);
        }

        let columns: Vec<String> = objects[0].keys().cloned().collect();
        if !self.is_row_shaped(&columns) {
            return AnalysisResult::document(format!(
                "Variable or complex data: {} columns not suited to row storage",
                columns.len()
            ));
        }

        AnalysisResult {
            recommendation: Bucket::RowOriented,
            reason: "Uniform structured data optimized for row storage".to_string(),
            structure: Some(Structure::Columns {
                columns,
                estimated_rows: items.len(),
            }),
        }
    }

    fn classify_object(&self, map: &Map<String, Value>) -> AnalysisResult {
        let depth = max_child_depth(map.values());
        if depth >= self.config.nesting_threshold {
            return AnalysisResult::nested(format!("Nested structure (depth: {})", depth), depth);
        }

        AnalysisResult {
            recommendation: Bucket::RowOriented,
            reason: "Flat structure".to_string(),
            structure: Some(Structure::Keys {
                keys: map.keys().cloned().collect(),
            }),
        }
    }

    /// Column count within limits, and either an identifier column or a narrow table
    fn is_row_shaped(&self, columns: &[String]) -> bool {
        if columns.len() > self.config.max_columns {
            return false;
        }

        let has_id = columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case("id") || c.eq_ignore_ascii_case("_id"));
        let has_foreign_key = columns.iter().any(|c| c.ends_with("_id"));

        has_id || has_foreign_key || columns.len() <= self.config.small_table_columns
    }
}

/// Maximum nesting depth below a container.
///
/// Each non-empty object or array along a path adds one level; scalars and
/// empty containers add none.
pub fn nesting_depth(value: &Value) -> u32 {
    match value {
        Value::Object(map) => max_child_depth(map.values()),
        Value::Array(items) => max_child_depth(items.iter()),
        _ => 0,
    }
}

fn max_child_depth<'a>(children: impl Iterator<Item = &'a Value>) -> u32 {
    children
        .filter(|child| is_non_empty_container(child))
        .map(|child| 1 + nesting_depth(child))
        .max()
        .unwrap_or(0)
}

fn is_non_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

/// Builder for creating a Classifier with custom thresholds
pub struct ClassifierBuilder {
    config: ClassifierConfig,
}

impl ClassifierBuilder {
    pub fn new() -> Self {
        Self {
            config: ClassifierConfig::default(),
        }
    }

    pub fn max_analysis_bytes(mut self, bytes: usize) -> Self {
        self.config.max_analysis_bytes = bytes;
        self
    }

    pub fn sample_size(mut self, size: usize) -> Self {
        self.config.sample_size = size;
        self
    }

    pub fn max_columns(mut self, columns: usize) -> Self {
        self.config.max_columns = columns;
        self
    }

    pub fn small_table_columns(mut self, columns: usize) -> Self {
        self.config.small_table_columns = columns;
        self
    }

    pub fn nesting_threshold(mut self, depth: u32) -> Self {
        self.config.nesting_threshold = depth;
        self
    }

    pub fn build(self) -> Classifier {
        Classifier::new(self.config)
    }
}

impl Default for ClassifierBuilder {
    fn default() -> Self {
        Self::new()
    }
}
