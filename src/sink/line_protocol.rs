//! Line-protocol record formatting
//!
//! Escaping rules: commas and spaces escape in measurements; commas,
//! equals signs and spaces escape in tag keys, tag values and field
//! keys; double quotes and backslashes escape inside string field
//! values. Newlines are forbidden in tag values and identifiers starting
//! with an underscore are reserved.

use crate::error::{AcqSrvError, Result};
use crate::point::{Sample, Value};

/// Escape a measurement name (commas and spaces).
pub fn escape_measurement(measurement: &str) -> String {
    escape_chars(measurement, &[',', ' '])
}

/// Escape a tag key (commas, equals signs and spaces).
pub fn escape_tag_key(key: &str) -> String {
    escape_chars(key, &[',', '=', ' '])
}

/// Escape a tag value (commas, equals signs and spaces).
pub fn escape_tag_value(value: &str) -> String {
    escape_chars(value, &[',', '=', ' '])
}

/// Escape a field key (commas, equals signs and spaces).
pub fn escape_field_key(key: &str) -> String {
    escape_chars(key, &[',', '=', ' '])
}

/// Escape a string field value (double quotes and backslashes), without
/// the surrounding quotes.
pub fn escape_string_field_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

fn escape_chars(input: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn check_identifier(kind: &str, identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(AcqSrvError::invalid_data(format!("empty {kind}")));
    }
    if identifier.starts_with('_') {
        return Err(AcqSrvError::invalid_data(format!(
            "{kind} '{identifier}' uses the reserved leading underscore"
        )));
    }
    Ok(())
}

/// Render a value as a line-protocol field value. Integers carry the
/// `i` suffix; floats use their shortest decimal form.
pub fn render_field_value(value: &Value) -> String {
    match value {
        Value::U16(v) => format!("{v}i"),
        Value::I32(v) => format!("{v}i"),
        Value::I64(v) => format!("{v}i"),
        Value::F32(v) => format!("{v}"),
        Value::F64(v) => format!("{v}"),
        Value::Bool(v) => format!("{v}"),
    }
}

/// Format one record: `measurement,tags field=value timestamp`.
///
/// The timestamp is in nanoseconds since the Unix epoch.
pub fn format_record(
    measurement: &str,
    tags: impl IntoIterator<Item = (String, String)>,
    fields: &[(String, String)],
    timestamp_ns: i64,
) -> Result<String> {
    check_identifier("measurement", measurement)?;
    if fields.is_empty() {
        return Err(AcqSrvError::invalid_data(
            "record requires at least one field",
        ));
    }

    let mut line = escape_measurement(measurement);

    for (key, value) in tags {
        check_identifier("tag key", &key)?;
        if value.contains('\n') {
            return Err(AcqSrvError::invalid_data(format!(
                "tag '{key}' contains a newline"
            )));
        }
        // Empty tag values are dropped rather than emitted as `key=`.
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_tag_key(&key));
        line.push('=');
        line.push_str(&escape_tag_value(&value));
    }

    line.push(' ');
    for (i, (key, rendered)) in fields.iter().enumerate() {
        check_identifier("field key", key)?;
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_field_key(key));
        line.push('=');
        line.push_str(rendered);
    }

    line.push(' ');
    line.push_str(&timestamp_ns.to_string());

    Ok(line)
}

/// Format a sample as one line-protocol record.
pub fn sample_to_line(sample: &Sample) -> Result<String> {
    let fields = vec![("value".to_string(), render_field_value(&sample.value))];
    format_record(
        &sample.measurement,
        sample
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
        &fields,
        sample.timestamp_ms.saturating_mul(1_000_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_measurement_escaping() {
        assert_eq!(escape_measurement("cpu load"), "cpu\\ load");
        assert_eq!(escape_measurement("cpu,load"), "cpu\\,load");
        assert_eq!(escape_measurement("plain"), "plain");
    }

    #[test]
    fn test_tag_escaping() {
        assert_eq!(escape_tag_key("my key"), "my\\ key");
        assert_eq!(escape_tag_value("a=b,c d"), "a\\=b\\,c\\ d");
    }

    #[test]
    fn test_string_field_escaping() {
        assert_eq!(escape_string_field_value(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_string_field_value(r"back\slash"), r"back\\slash");
    }

    #[test]
    fn test_format_record_shape() {
        let tags = vec![
            ("device_name".to_string(), "pump_a".to_string()),
            ("address".to_string(), "104".to_string()),
        ];
        let fields = vec![("value".to_string(), "3.14".to_string())];
        let line = format_record("pressure", tags, &fields, 1_700_000_000_000_000_000).unwrap();
        assert_eq!(
            line,
            "pressure,device_name=pump_a,address=104 value=3.14 1700000000000000000"
        );
    }

    #[test]
    fn test_format_record_rejects_reserved_identifiers() {
        let fields = vec![("value".to_string(), "1".to_string())];
        assert!(format_record("_internal", Vec::new(), &fields, 0).is_err());

        let tags = vec![("_reserved".to_string(), "x".to_string())];
        assert!(format_record("m", tags, &fields, 0).is_err());
    }

    #[test]
    fn test_format_record_rejects_newline_tag_value() {
        let fields = vec![("value".to_string(), "1".to_string())];
        let tags = vec![("k".to_string(), "line1\nline2".to_string())];
        assert!(format_record("m", tags, &fields, 0).is_err());
    }

    #[test]
    fn test_format_record_drops_empty_tag_values() {
        let fields = vec![("value".to_string(), "1".to_string())];
        let tags = vec![
            ("empty".to_string(), String::new()),
            ("kept".to_string(), "v".to_string()),
        ];
        let line = format_record("m", tags, &fields, 42).unwrap();
        assert_eq!(line, "m,kept=v value=1 42");
    }

    #[test]
    fn test_render_field_values() {
        assert_eq!(render_field_value(&Value::U16(7)), "7i");
        assert_eq!(render_field_value(&Value::I32(-3)), "-3i");
        assert_eq!(render_field_value(&Value::I64(1 << 40)), "1099511627776i");
        assert_eq!(render_field_value(&Value::F64(2.5)), "2.5");
        assert_eq!(render_field_value(&Value::Bool(true)), "true");
    }

    #[test]
    fn test_sample_to_line() {
        let mut tags = BTreeMap::new();
        tags.insert("device_name".to_string(), "rtu 7".to_string());
        let sample = Sample {
            point_name: "p1".into(),
            value: Value::F32(1.5),
            timestamp_ms: 1_700_000_000_000,
            measurement: "flow rate".into(),
            tags,
            valid: true,
            error: None,
        };

        let line = sample_to_line(&sample).unwrap();
        assert_eq!(
            line,
            "flow\\ rate,device_name=rtu\\ 7 value=1.5 1700000000000000000"
        );
    }
}
