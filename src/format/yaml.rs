use serde_json::Value;

const INDENT: &str = "  ";

/// Render `value` as block-style YAML with 2-space indentation
pub(super) fn to_yaml(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) if !map.is_empty() => write_map(&mut out, map, 0),
        Value::Array(items) if !items.is_empty() => write_seq(&mut out, items, 0),
        scalar => {
            out.push_str(&inline(scalar));
            out.push('\n');
        }
    }
    out
}

fn write_map(out: &mut String, map: &serde_json::Map<String, Value>, depth: usize) {
    let pad = INDENT.repeat(depth);
    for (key, value) in map {
        out.push_str(&pad);
        out.push_str(&scalar_string(key));
        out.push(':');
        write_child(out, value, depth);
    }
}

fn write_seq(out: &mut String, items: &[Value], depth: usize) {
    let pad = INDENT.repeat(depth);
    for item in items {
        out.push_str(&pad);
        out.push('-');
        write_child(out, item, depth);
    }
}

/// Write what follows `key:` or `-`
fn write_child(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            out.push('\n');
            write_map(out, map, depth + 1);
        }
        Value::Array(items) if !items.is_empty() => {
            out.push('\n');
            write_seq(out, items, depth + 1);
        }
        scalar => {
            out.push(' ');
            out.push_str(&inline(scalar));
            out.push('\n');
        }
    }
}

fn inline(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => scalar_string(s),
        Value::Object(_) => "{}".to_string(),
        Value::Array(_) => "[]".to_string(),
    }
}

/// Quote a string when a plain scalar would be read back as something else
fn scalar_string(s: &str) -> String {
    if needs_quotes(s) {
        // A JSON string literal is a valid double-quoted YAML scalar
        serde_json::to_string(s).unwrap_or_else(|_| format!("'{}'", s.replace('\'', "''")))
    } else {
        s.to_string()
    }
}

fn needs_quotes(s: &str) -> bool {
    if s.is_empty() || s.trim() != s {
        return true;
    }

    let lowered = s.to_ascii_lowercase();
    if matches!(
        lowered.as_str(),
        "null"
            | "~"
            | "true"
            | "false"
            | "yes"
            | "no"
            | "on"
            | "off"
            | "y"
            | "n"
            | ".inf"
            | "-.inf"
            | "+.inf"
            | ".nan"
    ) {
        return true;
    }

    if s.parse::<f64>().is_ok()
        || s.starts_with("0x")
        || s.starts_with("0o")
        || s.starts_with("0b")
        || is_underscored_number(s)
        || is_sexagesimal(s)
    {
        return true;
    }

    // Timestamps such as build dates would otherwise load as dates
    let bytes = s.as_bytes();
    if bytes.len() >= 5 && bytes[..4].iter().all(u8::is_ascii_digit) && bytes[4] == b'-' {
        return true;
    }

    if s.starts_with(|c: char| "-?:,[]{}#&*!|>'\"%@`".contains(c)) {
        return true;
    }

    s.contains(": ")
        || s.contains(" #")
        || s.ends_with(':')
        || s.chars().any(|c| c.is_control())
}

/// YAML 1.1 numbers may carry `_` separators (`1_000`, `3.141_592`)
fn is_underscored_number(s: &str) -> bool {
    let digits = s.strip_prefix(|c| c == '-' || c == '+').unwrap_or(s);
    digits.contains('_')
        && digits.starts_with(|c: char| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '_' || c == '.')
}

/// YAML 1.1 base-60 numbers: `190:20:30`, `1:2:3:4:5:6:7:8`, `20:30.15`
fn is_sexagesimal(s: &str) -> bool {
    let s = s.strip_prefix(|c| c == '-' || c == '+').unwrap_or(s);
    let mut parts = s.split(':');

    let head = parts.next().unwrap_or_default();
    if !head.starts_with(|c: char| c.is_ascii_digit())
        || !head.chars().all(|c| c.is_ascii_digit() || c == '_')
    {
        return false;
    }

    let rest: Vec<&str> = parts.collect();
    let Some((last, middle)) = rest.split_last() else {
        return false;
    };

    // Only the final group may carry a fraction
    let last = match last.split_once('.') {
        Some((whole, fraction)) if fraction.chars().all(|c| c.is_ascii_digit() || c == '_') => whole,
        Some(_) => return false,
        None => last,
    };

    middle.iter().chain(std::iter::once(&last)).all(|group| {
        match group.as_bytes() {
            [d] => d.is_ascii_digit(),
            [tens, units] => (b'0'..=b'5').contains(tens) && units.is_ascii_digit(),
            _ => false,
        }
    })
}
