/// Native export parser
///
/// Pull-parses the scanner's XML export into a [`ScanReport`]. The expected
/// shape is the usual nested report document:
///
/// ```text
/// <NessusClientData_v2>
///   <Report name="...">
///     <ReportHost name="10.0.0.5">
///       <ReportItem pluginID="19506" severity="2" pluginName="...">
///         <synopsis>...</synopsis>
///         <cvss_base_score>6.5</cvss_base_score>
///         <cve>CVE-2024-0001</cve>
///         ...
///       </ReportItem>
///     </ReportHost>
///   </Report>
/// </NessusClientData_v2>
/// ```
///
/// Attribute and element names are normalized to the snake_case field names
/// the projection layer filters on (`pluginID` → `plugin_id`,
/// `cvss_base_score` → `cvss_score`). Repeatable reference elements (`cve`,
/// `bid`, `xref`, `see_also`) always land as lists; score fields as numbers;
/// `exploit_available` as a boolean. Unknown elements are kept as strings, so
/// the `full` profile loses nothing.
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::{ScanMetadata, ScanReport, Vulnerability};

/// Fields that repeat and therefore always collect into a list.
const LIST_FIELDS: [&str; 4] = ["cve", "bid", "xref", "see_also"];

/// Fields parsed as numbers when they look numeric.
const NUMERIC_FIELDS: [&str; 6] = [
    "plugin_id",
    "severity",
    "port",
    "cvss_score",
    "cvss3_base_score",
    "cvss_temporal_score",
];

/// Fields parsed as booleans.
const BOOL_FIELDS: [&str; 2] = ["exploit_available", "exploited_by_malware"];

/// Report parse error
#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("artifact is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("export has no <Report> element")]
    MissingReport,
}

/// Parses native export bytes into a [`ScanReport`].
pub fn parse_report(bytes: &[u8]) -> Result<ScanReport, ReportParseError> {
    let xml = std::str::from_utf8(bytes)?;
    let mut reader = Reader::from_str(xml);

    let mut scan_name: Option<String> = None;
    let mut policy_name: Option<String> = None;
    let mut hosts: usize = 0;
    let mut severity_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut vulnerabilities: Vec<Vulnerability> = Vec::new();

    // Parser state
    let mut current_host: Option<String> = None;
    let mut current_item: Option<Map<String, Value>> = None;
    let mut current_element: Option<String> = None;
    let mut in_policy_name = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match local_name(e) {
                "Report" => {
                    scan_name = attr_value(e, "name");
                }
                "ReportHost" => {
                    current_host = attr_value(e, "name");
                    hosts += 1;
                }
                "ReportItem" => {
                    current_item = Some(open_item(e, current_host.as_deref()));
                }
                "policyName" => in_policy_name = true,
                name => {
                    if current_item.is_some() {
                        current_element = Some(normalize_name(name));
                    }
                }
            },
            Event::Empty(ref e) => {
                // Self-closing elements carry attributes only.
                if local_name(e) == "ReportItem" {
                    let item = open_item(e, current_host.as_deref());
                    close_item(item, &mut vulnerabilities, &mut severity_counts);
                }
            }
            Event::Text(ref e) => {
                let text = match e.unescape() {
                    Ok(text) => text.trim().to_string(),
                    Err(_) => continue,
                };
                if text.is_empty() {
                    continue;
                }
                if in_policy_name {
                    policy_name = Some(text);
                } else if let (Some(item), Some(field)) = (&mut current_item, &current_element) {
                    insert_field(item, field, &text);
                }
            }
            Event::End(ref e) => match local_name_end(e.name().as_ref()) {
                "ReportItem" => {
                    if let Some(item) = current_item.take() {
                        close_item(item, &mut vulnerabilities, &mut severity_counts);
                    }
                    current_element = None;
                }
                "ReportHost" => current_host = None,
                "policyName" => in_policy_name = false,
                _ => current_element = None,
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let scan_name = scan_name.ok_or(ReportParseError::MissingReport)?;
    let total_findings = vulnerabilities.len();
    Ok(ScanReport {
        metadata: ScanMetadata {
            scan_name,
            policy_name,
            host_count: hosts,
            total_findings,
            severity_counts,
        },
        vulnerabilities,
    })
}

/// Starts a field map from a ReportItem's attributes, host first.
fn open_item(e: &BytesStart<'_>, host: Option<&str>) -> Map<String, Value> {
    let mut item = Map::new();
    if let Some(host) = host {
        item.insert("host".to_string(), Value::String(host.to_string()));
    }
    for attr in e.attributes().flatten() {
        let key = normalize_name(&String::from_utf8_lossy(attr.key.as_ref()));
        if let Ok(value) = attr.unescape_value() {
            insert_field(&mut item, &key, value.as_ref());
        }
    }
    item
}

fn close_item(
    item: Map<String, Value>,
    vulnerabilities: &mut Vec<Vulnerability>,
    severity_counts: &mut BTreeMap<String, usize>,
) {
    let severity = item
        .get("severity")
        .map(value_to_string)
        .unwrap_or_else(|| "0".to_string());
    *severity_counts.entry(severity).or_insert(0) += 1;
    vulnerabilities.push(Vulnerability { fields: item });
}

/// Inserts a field with its normalized type; repeatable fields accumulate.
fn insert_field(item: &mut Map<String, Value>, field: &str, text: &str) {
    let value = typed_value(field, text);
    if LIST_FIELDS.contains(&field) {
        match item.get_mut(field) {
            Some(Value::Array(list)) => list.push(value),
            _ => {
                item.insert(field.to_string(), Value::Array(vec![value]));
            }
        }
    } else {
        item.insert(field.to_string(), value);
    }
}

fn typed_value(field: &str, text: &str) -> Value {
    if NUMERIC_FIELDS.contains(&field) {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Ok(f) = text.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    if BOOL_FIELDS.contains(&field) {
        match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => return Value::Bool(true),
            "false" | "0" | "no" => return Value::Bool(false),
            _ => {}
        }
    }
    Value::String(text.to_string())
}

/// Stringifies a scalar the way filters see it.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Attribute → field-name normalization table.
fn normalize_name(name: &str) -> String {
    match name {
        "pluginID" => "plugin_id".to_string(),
        "pluginName" => "plugin_name".to_string(),
        "pluginFamily" => "plugin_family".to_string(),
        "svc_name" => "service".to_string(),
        "cvss_base_score" => "cvss_score".to_string(),
        other => other.to_string(),
    }
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn local_name<'a>(e: &'a BytesStart<'a>) -> &'a str {
    local_name_end(e.name().into_inner())
}

fn local_name_end(name: &[u8]) -> &str {
    let name = std::str::from_utf8(name).unwrap_or("");
    name.rsplit(':').next().unwrap_or(name)
}
