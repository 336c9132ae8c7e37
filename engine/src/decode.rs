use serde::Serialize;
use serde_json::{Map, Value, json};

/// Per-cell tag from the engine's associative selection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Optional,
    Selected,
    Alternative,
    Excluded,
}

impl SelectionState {
    /// Engine cells carry a one-letter tag. Unknown tags fold to Optional.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "S" => Self::Selected,
            "A" => Self::Alternative,
            "X" => Self::Excluded,
            _ => Self::Optional,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optional => "O",
            Self::Selected => "S",
            Self::Alternative => "A",
            Self::Excluded => "X",
        }
    }
}

impl Serialize for SelectionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One decoded matrix cell.
#[derive(Debug, Clone, Serialize)]
pub struct Cell {
    pub text: String,
    /// Absent when the engine reported no numeric value or the NaN
    /// sentinel.
    pub numeric: Option<f64>,
    pub is_numeric: bool,
    pub state: SelectionState,
}

impl Cell {
    pub fn decode(raw: &Value) -> Self {
        Self {
            text: raw
                .get("qText")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            numeric: decode_number(raw.get("qNum")),
            is_numeric: raw
                .get("qIsNumeric")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            state: SelectionState::from_tag(
                raw.get("qState").and_then(Value::as_str).unwrap_or("O"),
            ),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "text": self.text,
            "numeric": self.numeric,
            "is_numeric": self.is_numeric,
            "state": self.state.as_str(),
        })
    }
}

/// The engine encodes "not a number" either as a missing `qNum`, a JSON
/// null, a string NaN sentinel, or an actual NaN double. Rust's float
/// parser accepts spellings like `"nan"` and `"+NaN"`, so the filter runs
/// on the parsed value rather than on the literal text.
fn decode_number(raw: Option<&Value>) -> Option<f64> {
    match raw {
        Some(Value::Number(n)) => n.as_f64().filter(|v| !v.is_nan()),
        Some(Value::String(s)) => s.parse::<f64>().ok().filter(|v| !v.is_nan()),
        _ => None,
    }
}

/// Walk a hypercube layout's pages into row-oriented records.
///
/// Row order is preserved exactly as returned. Column-to-field mapping is
/// positional; rows wider than `field_names` are silently truncated (known
/// simplification carried over from the source protocol client).
pub fn decode_rows(hypercube: &Value, field_names: &[String]) -> Vec<Map<String, Value>> {
    let mut rows = Vec::new();
    for page in iter_array(hypercube.get("qDataPages")) {
        for row in iter_array(page.get("qMatrix")) {
            let mut record = Map::new();
            for (i, raw_cell) in iter_array(Some(row)).enumerate() {
                let Some(name) = field_names.get(i) else {
                    break;
                };
                record.insert(name.clone(), Cell::decode(raw_cell).to_value());
            }
            rows.push(record);
        }
    }
    rows
}

/// Decode a single-column list-object layout: one value per row, plus
/// frequency when the engine included it.
pub fn decode_list_values(list_object: &Value) -> Vec<Value> {
    let mut values = Vec::new();
    for page in iter_array(list_object.get("qDataPages")) {
        for row in iter_array(page.get("qMatrix")) {
            let Some(raw_cell) = row.get(0) else {
                continue;
            };
            let cell = Cell::decode(raw_cell);
            let mut entry = json!({
                "value": cell.text,
                "state": cell.state.as_str(),
                "numeric_value": cell.numeric,
                "is_numeric": cell.is_numeric,
            });
            if let Some(frequency) = raw_cell.get("qFrequency") {
                entry["frequency"] = frequency.clone();
            }
            values.push(entry);
        }
    }
    values
}

/// Total (rows, columns) from a layout's `qSize`.
pub fn matrix_size(layout: &Value) -> (u64, u64) {
    let size = layout.get("qSize");
    let rows = size
        .and_then(|s| s.get("qcy"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let columns = size
        .and_then(|s| s.get("qcx"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (rows, columns)
}

fn iter_array(value: Option<&Value>) -> impl Iterator<Item = &Value> {
    value
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rows_round_trip_field_names_in_order() {
        let hypercube = json!({
            "qDataPages": [{
                "qMatrix": [
                    [
                        {"qText": "US", "qNum": "NaN", "qIsNumeric": false, "qState": "O"},
                        {"qText": "100", "qNum": 100.0, "qIsNumeric": true, "qState": "O"}
                    ],
                    [
                        {"qText": "FR", "qNum": "NaN", "qIsNumeric": false, "qState": "S"},
                        {"qText": "50", "qNum": 50.0, "qIsNumeric": true, "qState": "O"}
                    ]
                ]
            }]
        });
        let rows = decode_rows(&hypercube, &field_names(&["Country", "Sum"]));
        assert_eq!(rows.len(), 2);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, ["Country", "Sum"]);
        assert_eq!(rows[0]["Country"]["text"], "US");
        assert_eq!(rows[0]["Sum"]["numeric"], 100.0);
        assert_eq!(rows[1]["Country"]["text"], "FR");
        assert_eq!(rows[1]["Country"]["state"], "S");
        assert_eq!(rows[1]["Sum"]["numeric"], 50.0);
    }

    #[test]
    fn nan_sentinel_decodes_to_null() {
        let cell = Cell::decode(&json!({"qText": "-", "qNum": "NaN", "qIsNumeric": false}));
        assert_eq!(cell.numeric, None);
        assert_eq!(cell.text, "-");

        let missing = Cell::decode(&json!({"qText": "x"}));
        assert_eq!(missing.numeric, None);
        assert_eq!(missing.state, SelectionState::Optional);
    }

    #[test]
    fn alternate_nan_spellings_decode_to_null() {
        for sentinel in ["nan", "+NaN", "-nan", "NAN"] {
            let cell = Cell::decode(&json!({"qText": "-", "qNum": sentinel}));
            assert_eq!(cell.numeric, None, "sentinel {sentinel:?} leaked");
        }
        let numeric_string = Cell::decode(&json!({"qText": "3", "qNum": "3.5"}));
        assert_eq!(numeric_string.numeric, Some(3.5));
    }

    #[test]
    fn excess_cells_are_silently_truncated() {
        let hypercube = json!({
            "qDataPages": [{
                "qMatrix": [[
                    {"qText": "a"}, {"qText": "b"}, {"qText": "c"}
                ]]
            }]
        });
        let rows = decode_rows(&hypercube, &field_names(&["only"]));
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["only"]["text"], "a");
    }

    #[test]
    fn empty_page_set_yields_zero_rows() {
        let hypercube = json!({"qDataPages": []});
        assert!(decode_rows(&hypercube, &field_names(&["f"])).is_empty());
        // Absent key entirely, as for a height=0 window.
        assert!(decode_rows(&json!({}), &field_names(&["f"])).is_empty());
    }

    #[test]
    fn list_values_carry_state_and_frequency() {
        let list_object = json!({
            "qDataPages": [{
                "qMatrix": [
                    [{"qText": "DE", "qState": "X", "qFrequency": "12", "qIsNumeric": false}],
                    [{"qText": "IT", "qState": "O", "qIsNumeric": false}]
                ]
            }]
        });
        let values = decode_list_values(&list_object);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["value"], "DE");
        assert_eq!(values[0]["state"], "X");
        assert_eq!(values[0]["frequency"], "12");
        assert!(values[1].get("frequency").is_none());
    }

    #[test]
    fn selection_state_tags_round_trip() {
        for tag in ["O", "S", "A", "X"] {
            assert_eq!(SelectionState::from_tag(tag).as_str(), tag);
        }
        assert_eq!(SelectionState::from_tag("?"), SelectionState::Optional);
    }
}
