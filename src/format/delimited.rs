use serde_json::Value;

use super::SerializeError;

/// Render `value` as exactly two CSV records: flattened keys, then values.
pub(super) fn to_csv(value: &Value) -> Result<Vec<u8>, SerializeError> {
    let mut columns = Vec::new();
    flatten("", value, &mut columns);

    let mut writer = ::csv::WriterBuilder::new()
        .terminator(::csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer
        .write_record(columns.iter().map(|(key, _)| key.as_str()))
        .map_err(|e| SerializeError::Csv(e.to_string()))?;
    writer
        .write_record(columns.iter().map(|(_, value)| value.as_str()))
        .map_err(|e| SerializeError::Csv(e.to_string()))?;

    writer
        .into_inner()
        .map_err(|e| SerializeError::Csv(e.to_string()))
}

/// Flatten nested objects and arrays into `_`-joined key paths
fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}_{}", prefix, key)
        }
    };

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&join(key), child, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten(&join(&index.to_string()), item, out);
            }
        }
        Value::Null => out.push((column_name(prefix), String::new())),
        Value::String(s) => out.push((column_name(prefix), s.clone())),
        Value::Bool(b) => out.push((column_name(prefix), b.to_string())),
        Value::Number(n) => out.push((column_name(prefix), n.to_string())),
    }
}

fn column_name(prefix: &str) -> String {
    if prefix.is_empty() {
        "value".to_string()
    } else {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(value: &Value) -> String {
        String::from_utf8(to_csv(value).unwrap()).unwrap()
    }

    #[test]
    fn test_two_rows_with_matching_columns() {
        let csv = render(&json!({"ip": "8.8.8.8", "city": null, "latitude": 37.751}));
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines, vec!["ip,city,latitude", "8.8.8.8,,37.751"]);
    }

    #[test]
    fn test_nested_keys_are_flattened() {
        let csv = render(&json!({
            "error": true,
            "details": {"max_attempts": 3, "retry_after": "60 seconds"}
        }));
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "error,details_max_attempts,details_retry_after");
        assert_eq!(lines[1], "true,3,60 seconds");
    }

    #[test]
    fn test_values_are_quoted_when_needed() {
        let csv = render(&json!({"asn_organization": "Example, Inc."}));
        assert!(csv.contains("\"Example, Inc.\""));
    }

    #[test]
    fn test_arrays_use_index_segments() {
        let csv = render(&json!({"providers": ["maxmind", "dbip"]}));
        assert_eq!(csv.lines().next(), Some("providers_0,providers_1"));
    }
}
