//! PHP `serialize()` encoding for manifest metadata.
//!
//! The container stores archive metadata in PHP's native serialization
//! format so the host interpreter can `unserialize()` it directly. Only the
//! value shapes expressible in the build configuration (JSON) are needed:
//! null, bool, integer, float, string, array, object-as-map.

use serde_json::Value;

/// Serialize a JSON value into PHP `serialize()` bytes.
///
/// JSON arrays become PHP arrays with integer keys; JSON objects become PHP
/// arrays with string keys (the form `unserialize()` produces for associative
/// data). Strings are length-prefixed in bytes, not characters.
pub fn php_serialize(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"N;"),
        Value::Bool(b) => {
            out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" });
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(format!("i:{};", i).as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(format!("i:{};", u).as_bytes());
            } else {
                // PHP prints floats with up to 17 significant digits.
                let f = n.as_f64().unwrap_or(0.0);
                out.extend_from_slice(format!("d:{};", format_float(f)).as_bytes());
            }
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.extend_from_slice(format!("a:{}:{{", items.len()).as_bytes());
            for (i, item) in items.iter().enumerate() {
                out.extend_from_slice(format!("i:{};", i).as_bytes());
                write_value(out, item);
            }
            out.extend_from_slice(b"}");
        }
        Value::Object(map) => {
            out.extend_from_slice(format!("a:{}:{{", map.len()).as_bytes());
            for (key, item) in map {
                write_string(out, key);
                write_value(out, item);
            }
            out.extend_from_slice(b"}");
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(format!("s:{}:\"", s.len()).as_bytes());
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\";");
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e15 {
        // Integral floats keep a trailing ".0"-free form, as PHP prints them.
        format!("{}", f)
    } else {
        format!("{:.17}", f)
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enc(v: Value) -> String {
        String::from_utf8(php_serialize(&v)).unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(enc(json!(null)), "N;");
        assert_eq!(enc(json!(true)), "b:1;");
        assert_eq!(enc(json!(false)), "b:0;");
        assert_eq!(enc(json!(42)), "i:42;");
        assert_eq!(enc(json!(-7)), "i:-7;");
        assert_eq!(enc(json!("hi")), "s:2:\"hi\";");
    }

    #[test]
    fn string_length_counts_bytes_not_chars() {
        assert_eq!(enc(json!("héllo")), "s:6:\"héllo\";");
    }

    #[test]
    fn arrays_use_integer_keys() {
        assert_eq!(enc(json!([1, "a"])), "a:2:{i:0;i:1;i:1;s:1:\"a\";}");
    }

    #[test]
    fn objects_become_string_keyed_arrays() {
        assert_eq!(enc(json!({"rand": 42})), "a:1:{s:4:\"rand\";i:42;}");
    }

    #[test]
    fn nested_values() {
        assert_eq!(
            enc(json!({"a": [true, null]})),
            "a:1:{s:1:\"a\";a:2:{i:0;b:1;i:1;N;}}"
        );
    }
}
