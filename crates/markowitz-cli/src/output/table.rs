use serde_json::{Map, Value};
use tabled::{builder::Builder, Table};

/// Format output as tables using the tabled crate.
///
/// Scalars of the result go into one field/value table. Nested objects,
/// lists of records and numeric matrices (the covariance) each get their own
/// titled table underneath.
pub fn print_table(value: &Value) {
    match value {
        Value::Object(map) => match map.get("result") {
            Some(Value::Object(result)) => {
                print_section(None, result);
                print_footer(map);
            }
            _ => print_section(None, map),
        },
        Value::Array(arr) => print_records(arr),
        _ => println!("{}", format_value(value)),
    }
}

fn print_section(title: Option<&str>, map: &Map<String, Value>) {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    let mut deferred = Vec::new();

    for (key, val) in map {
        match val {
            Value::Object(_) => deferred.push((key, val)),
            Value::Array(items) if items.first().is_some_and(|v| v.is_object() || v.is_array()) => {
                deferred.push((key, val));
            }
            _ => {
                builder.push_record([key.as_str(), &format_value(val)]);
            }
        }
    }

    if let Some(t) = title {
        println!("\n{}:", t);
    }
    println!("{}", Table::from(builder));

    let labels = matrix_labels(map);
    for (key, val) in deferred {
        let title = match title {
            Some(t) => format!("{}.{}", t, key),
            None => key.clone(),
        };
        match val {
            Value::Object(inner) => print_section(Some(&title), inner),
            Value::Array(items) if items.first().is_some_and(Value::is_array) => {
                println!("\n{}:", title);
                println!("{}", matrix_table(items, labels.as_deref()));
            }
            Value::Array(items) => {
                println!("\n{}:", title);
                print_records(items);
            }
            _ => {}
        }
    }
}

/// One row per record, columns from the first record's keys.
fn print_records(arr: &[Value]) {
    let Some(Value::Object(first)) = arr.first() else {
        for item in arr {
            println!("{}", format_value(item));
        }
        return;
    };

    let headers: Vec<String> = first.keys().cloned().collect();
    let mut builder = Builder::default();
    builder.push_record(&headers);
    for item in arr {
        if let Value::Object(map) = item {
            let row: Vec<String> = headers
                .iter()
                .map(|h| map.get(h.as_str()).map(format_value).unwrap_or_default())
                .collect();
            builder.push_record(row);
        }
    }
    println!("{}", Table::from(builder));
}

/// Tickers of the section's `assets` rows, in matrix column order.
fn matrix_labels(map: &Map<String, Value>) -> Option<Vec<String>> {
    let assets = map.get("assets")?.as_array()?;
    assets
        .iter()
        .map(|a| a.get("ticker")?.as_str().map(str::to_string))
        .collect()
}

/// Rows of numbers. Axes carry the given labels, or positions when absent.
fn matrix_table(rows: &[Value], labels: Option<&[String]>) -> Table {
    let width = rows
        .iter()
        .filter_map(Value::as_array)
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    let label = |i: usize| {
        labels
            .and_then(|l| l.get(i))
            .cloned()
            .unwrap_or_else(|| i.to_string())
    };

    let mut builder = Builder::default();
    let mut header = vec![String::new()];
    header.extend((0..width).map(label));
    builder.push_record(header);

    for (i, row) in rows.iter().enumerate() {
        let mut record = vec![label(i)];
        if let Some(cells) = row.as_array() {
            record.extend(cells.iter().map(format_value));
        }
        builder.push_record(record);
    }
    Table::from(builder)
}

fn print_footer(envelope: &Map<String, Value>) {
    if let Some(Value::Array(warnings)) = envelope.get("warnings") {
        if !warnings.is_empty() {
            println!("\nWarnings:");
            for w in warnings.iter().filter_map(Value::as_str) {
                println!("  - {}", w);
            }
        }
    }

    if let Some(Value::String(meth)) = envelope.get("methodology") {
        println!("\nMethodology: {}", meth);
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => format!("{:.6}", f),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "-".to_string(),
        Value::Array(arr) => arr.iter().map(format_value).collect::<Vec<_>>().join(", "),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matrix_labelled_with_asset_tickers() {
        let section = json!({
            "assets": [
                {"ticker": "MSFT", "mean_return": 0.12, "volatility": 0.2},
                {"ticker": "AAPL", "mean_return": 0.10, "volatility": 0.3},
            ],
            "covariance": [[0.04, 0.01], [0.01, 0.09]],
        });
        let map = section.as_object().unwrap();
        let labels = matrix_labels(map).unwrap();
        assert_eq!(labels, vec!["MSFT".to_string(), "AAPL".to_string()]);

        let rows = map["covariance"].as_array().unwrap();
        let rendered = matrix_table(rows, Some(&labels)).to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        let header = lines.iter().find(|l| l.contains("MSFT")).unwrap();
        // Column order follows the covariance, not the alphabet.
        assert!(header.find("MSFT").unwrap() < header.find("AAPL").unwrap());
        let row = |label: &str| lines.iter().rev().find(|l| l.contains(label)).unwrap();
        assert!(row("MSFT").contains("0.040000"));
        assert!(row("AAPL").contains("0.090000"));
    }

    #[test]
    fn test_matrix_without_labels_uses_positions() {
        let section = json!({"covariance": [[1.0, 0.5], [0.5, 2.0]]});
        let map = section.as_object().unwrap();
        assert!(matrix_labels(map).is_none());

        let rows = map["covariance"].as_array().unwrap();
        let rendered = matrix_table(rows, None).to_string();
        let last = rendered.lines().rev().find(|l| l.contains("2.000000"));
        assert!(last.unwrap().contains('1'));
    }
}
