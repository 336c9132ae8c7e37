use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Sort priorities for one column, mirroring the engine's
/// `qSortCriterias` block. Each priority is -1 (descending), 0 (off) or
/// 1 (ascending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortRule {
    pub by_state: i8,
    pub by_frequency: i8,
    pub by_numeric: i8,
    pub by_ascii: i8,
    pub by_load_order: i8,
    pub by_expression: i8,
    pub expression: String,
}

impl Default for SortRule {
    fn default() -> Self {
        Self {
            by_state: 0,
            by_frequency: 0,
            by_numeric: 0,
            by_ascii: 0,
            by_load_order: 0,
            by_expression: 0,
            expression: String::new(),
        }
    }
}

impl SortRule {
    /// Default dimension sort: lexical ascending.
    pub fn ascii_ascending() -> Self {
        Self {
            by_ascii: 1,
            ..Self::default()
        }
    }

    /// Default measure sort: numeric descending.
    pub fn numeric_descending() -> Self {
        Self {
            by_numeric: -1,
            ..Self::default()
        }
    }

    /// Table-extraction sort: numeric, then lexical, then load order, so
    /// extracted rows come back in a stable source-like order.
    pub fn numeric_ascii_load_order() -> Self {
        Self {
            by_numeric: 1,
            by_ascii: 1,
            by_load_order: 1,
            ..Self::default()
        }
    }

    fn to_criteria(&self) -> Value {
        json!({
            "qSortByState": self.by_state,
            "qSortByFrequency": self.by_frequency,
            "qSortByNumeric": self.by_numeric,
            "qSortByAscii": self.by_ascii,
            "qSortByLoadOrder": self.by_load_order,
            "qSortByExpression": self.by_expression,
            "qExpression": {"qv": self.expression},
        })
    }

    fn to_measure_sort(&self) -> Value {
        json!({
            "qSortByState": self.by_state,
            "qSortByFrequency": self.by_frequency,
            "qSortByNumeric": self.by_numeric,
            "qSortByAscii": self.by_ascii,
            "qSortByLoadOrder": self.by_load_order,
            "qSortByExpression": self.by_expression,
        })
    }
}

/// One dimension column: a field name (or derived expression) with an
/// optional sort override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub field: String,
    #[serde(default)]
    pub sort: Option<SortRule>,
}

impl DimensionSpec {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            sort: None,
        }
    }

    fn effective_sort(&self) -> SortRule {
        self.sort.clone().unwrap_or_else(SortRule::ascii_ascending)
    }
}

impl<S: Into<String>> From<S> for DimensionSpec {
    fn from(field: S) -> Self {
        Self::new(field)
    }
}

/// One measure column: an aggregation expression with optional label and
/// sort override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub expression: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sort: Option<SortRule>,
}

impl MeasureSpec {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            label: None,
            sort: None,
        }
    }

    fn effective_sort(&self) -> SortRule {
        self.sort
            .clone()
            .unwrap_or_else(SortRule::numeric_descending)
    }
}

impl<S: Into<String>> From<S> for MeasureSpec {
    fn from(expression: S) -> Self {
        Self::new(expression)
    }
}

/// The single initial page requested when a session object materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

impl FetchWindow {
    fn to_value(self) -> Value {
        json!({
            "qTop": self.top,
            "qLeft": self.left,
            "qHeight": self.height,
            "qWidth": self.width,
        })
    }
}

/// A declarative hypercube query, compiled into the engine's
/// `CreateSessionObject` definition.
#[derive(Debug, Clone)]
pub struct HypercubeQuery {
    pub dimensions: Vec<DimensionSpec>,
    pub measures: Vec<MeasureSpec>,
    pub row_limit: usize,
    pub offset: (usize, usize),
    object_id: String,
}

impl HypercubeQuery {
    /// `discriminator` keys the deterministic object id: repeated calls for
    /// the same logical query collide on one id, which the lifecycle
    /// manager relies on for targeted destruction.
    pub fn new(
        discriminator: &str,
        dimensions: Vec<DimensionSpec>,
        measures: Vec<MeasureSpec>,
        row_limit: usize,
    ) -> Self {
        Self {
            dimensions,
            measures,
            row_limit,
            offset: (0, 0),
            object_id: format!("hypercube-{discriminator}"),
        }
    }

    /// Id keyed by column shape, matching ad-hoc queries with no natural
    /// discriminator.
    pub fn ad_hoc(
        dimensions: Vec<DimensionSpec>,
        measures: Vec<MeasureSpec>,
        row_limit: usize,
    ) -> Self {
        let object_id = format!("hypercube-{}d-{}m", dimensions.len(), measures.len());
        Self {
            dimensions,
            measures,
            row_limit,
            offset: (0, 0),
            object_id,
        }
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = object_id.into();
        self
    }

    pub fn with_offset(mut self, top: usize, left: usize) -> Self {
        self.offset = (top, left);
        self
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Column titles in declaration order: dimension fields, then measure
    /// labels (defaulting to `Measure_<i>`).
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dimensions.iter().map(|d| d.field.clone()).collect();
        names.extend(self.measures.iter().enumerate().map(|(i, m)| {
            m.label.clone().unwrap_or_else(|| format!("Measure_{i}"))
        }));
        names
    }

    pub fn window(&self) -> FetchWindow {
        FetchWindow {
            top: self.offset.0,
            left: self.offset.1,
            height: self.row_limit,
            width: self.dimensions.len() + self.measures.len(),
        }
    }

    /// The full `CreateSessionObject` property tree.
    pub fn compile(&self) -> Value {
        let dimensions: Vec<Value> = self
            .dimensions
            .iter()
            .map(|dim| {
                json!({
                    "qDef": {
                        "qFieldDefs": [dim.field],
                        "qSortCriterias": [dim.effective_sort().to_criteria()],
                    },
                    "qNullSuppression": false,
                    "qIncludeElemValue": true,
                })
            })
            .collect();

        let measures: Vec<Value> = self
            .measures
            .iter()
            .enumerate()
            .map(|(i, measure)| {
                let label = measure
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("Measure_{i}"));
                json!({
                    "qDef": {"qDef": measure.expression, "qLabel": label},
                    "qSortBy": measure.effective_sort().to_measure_sort(),
                })
            })
            .collect();

        let column_count = self.dimensions.len() + self.measures.len();
        json!({
            "qInfo": {"qId": self.object_id, "qType": "HyperCube"},
            "qHyperCubeDef": {
                "qDimensions": dimensions,
                "qMeasures": measures,
                "qInitialDataFetch": [self.window().to_value()],
                "qSuppressZero": false,
                "qSuppressMissing": false,
                "qMode": "S",
                "qInterColumnSortOrder": (0..column_count).collect::<Vec<usize>>(),
            },
        })
    }
}

/// A single-field list-object query (distinct values with optional
/// frequency).
#[derive(Debug, Clone)]
pub struct ListObjectQuery {
    pub field: String,
    pub max_values: usize,
    pub include_frequency: bool,
}

impl ListObjectQuery {
    pub fn object_id(&self) -> String {
        format!("field-values-{}", self.field)
    }

    pub fn compile(&self) -> Value {
        let sort = SortRule {
            by_frequency: if self.include_frequency { 1 } else { 0 },
            by_numeric: 1,
            by_ascii: 1,
            ..SortRule::default()
        };
        json!({
            "qInfo": {"qId": self.object_id(), "qType": "ListObject"},
            "qListObjectDef": {
                "qStateName": "$",
                "qLibraryId": "",
                "qDef": {
                    "qFieldDefs": [self.field],
                    "qFieldLabels": [],
                    "qSortCriterias": [sort.to_criteria()],
                },
                "qInitialDataFetch": [FetchWindow {
                    top: 0,
                    left: 0,
                    height: self.max_values,
                    width: 1,
                }.to_value()],
            },
        })
    }
}
