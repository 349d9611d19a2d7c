use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;

use super::SerializeError;

type XmlWriter = Writer<Vec<u8>>;

/// Render `value` under a `<root>` element.
///
/// Objects become nested elements, array items become `<item>` elements and
/// nulls become empty elements.
pub(super) fn to_xml(root: &str, value: &Value) -> Result<Vec<u8>, SerializeError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    write_element(&mut writer, root, value)?;

    let mut body = writer.into_inner();
    body.push(b'\n');
    Ok(body)
}

fn write_element(writer: &mut XmlWriter, name: &str, value: &Value) -> Result<(), SerializeError> {
    let name = element_name(name);

    match value {
        Value::Null => emit(writer, Event::Empty(BytesStart::new(name.as_str()))),
        Value::Object(map) => {
            emit(writer, Event::Start(BytesStart::new(name.as_str())))?;
            for (key, child) in map {
                write_element(writer, key, child)?;
            }
            emit(writer, Event::End(BytesEnd::new(name.as_str())))
        }
        Value::Array(items) => {
            emit(writer, Event::Start(BytesStart::new(name.as_str())))?;
            for item in items {
                write_element(writer, "item", item)?;
            }
            emit(writer, Event::End(BytesEnd::new(name.as_str())))
        }
        scalar => {
            let text = scalar_text(scalar);
            emit(writer, Event::Start(BytesStart::new(name.as_str())))?;
            emit(writer, Event::Text(BytesText::new(&text)))?;
            emit(writer, Event::End(BytesEnd::new(name.as_str())))
        }
    }
}

fn emit(writer: &mut XmlWriter, event: Event<'_>) -> Result<(), SerializeError> {
    writer
        .write_event(event)
        .map_err(|e| SerializeError::Xml(e.to_string()))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Coerce a key into a valid XML element name
fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        name.insert(0, '_');
    }
    name
}
