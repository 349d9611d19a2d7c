//! Content negotiation and response serialization
//!
//! Payloads are first turned into an ordered `serde_json::Value` tree
//! (`preserve_order` keeps struct field order). Every output format is
//! rendered from that tree, so no serializer inspects the original types.

mod delimited;
mod xml;
mod yaml;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("xml: {0}")]
    Xml(String),
    #[error("csv: {0}")]
    Csv(String),
}

/// Output encodings understood by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Xml,
    Csv,
    Yaml,
}

impl Format {
    pub const ALL: [Format; 4] = [Format::Json, Format::Xml, Format::Csv, Format::Yaml];

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Xml => "xml",
            Format::Csv => "csv",
            Format::Yaml => "yaml",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Xml => "application/xml",
            Format::Csv => "text/csv",
            Format::Yaml => "application/x-yaml",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "xml" => Ok(Format::Xml),
            "csv" => Ok(Format::Csv),
            "yaml" | "yml" => Ok(Format::Yaml),
            other => Err(format!("unsupported format '{other}'")),
        }
    }
}

/// Pick the output format for a request.
///
/// An explicit, supported `format` parameter wins. Otherwise the `Accept`
/// header is searched for XML, then CSV, then YAML media types. Anything
/// else gets `default`.
pub fn negotiate(
    format_param: Option<&str>,
    accept: Option<&str>,
    supported: &[Format],
    default: Format,
) -> Format {
    if let Some(format) = format_param
        .and_then(|p| p.parse::<Format>().ok())
        .filter(|f| supported.contains(f))
    {
        return format;
    }

    if let Some(accept) = accept {
        let accept = accept.to_ascii_lowercase();
        if accept.contains("application/xml") || accept.contains("text/xml") {
            return Format::Xml;
        }
        if accept.contains("text/csv") {
            return Format::Csv;
        }
        if accept.contains("application/x-yaml") || accept.contains("text/yaml") {
            return Format::Yaml;
        }
    }

    default
}

/// What a payload represents; selects the XML root element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Data,
    Error,
}

impl PayloadKind {
    fn root_element(self) -> &'static str {
        match self {
            PayloadKind::Data => "geoip",
            PayloadKind::Error => "error",
        }
    }
}

/// A serialized body and its media type
#[derive(Debug, Clone)]
pub struct Rendered {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// Reduce a JSONP callback name to `[A-Za-z0-9_$]`
pub fn sanitize_callback(callback: &str) -> String {
    callback
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect()
}

/// Render `value` in `format`.
///
/// `callback` only applies to JSON; an empty sanitized name disables
/// wrapping.
pub fn render(
    format: Format,
    kind: PayloadKind,
    value: &Value,
    callback: Option<&str>,
) -> Result<Rendered, SerializeError> {
    let rendered = match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(value)?;
            match callback.map(sanitize_callback).filter(|c| !c.is_empty()) {
                Some(callback) => Rendered {
                    body: format!("{}({});", callback, json).into_bytes(),
                    content_type: "application/javascript",
                },
                None => Rendered {
                    body: json.into_bytes(),
                    content_type: Format::Json.content_type(),
                },
            }
        }
        Format::Xml => Rendered {
            body: xml::to_xml(kind.root_element(), value)?,
            content_type: Format::Xml.content_type(),
        },
        Format::Csv => Rendered {
            body: delimited::to_csv(value)?,
            content_type: Format::Csv.content_type(),
        },
        Format::Yaml => Rendered {
            body: yaml::to_yaml(value).into_bytes(),
            content_type: Format::Yaml.content_type(),
        },
    };

    Ok(rendered)
}
