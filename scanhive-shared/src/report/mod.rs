/// Scan report parsing and projection
///
/// The worker persists the scanner's native XML export verbatim; this module
/// turns those bytes into typed records ([`parser`]) and renders them as the
/// filterable, paginated, line-delimited JSON the operations surface returns
/// ([`projection`]).
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub mod parser;
pub mod projection;

pub use parser::parse_report;
pub use projection::{project, ProjectionParams, SchemaProfile};

/// Scan-wide attributes pulled from the export
#[derive(Debug, Clone, PartialEq)]
pub struct ScanMetadata {
    /// Scan name from the report header
    pub scan_name: String,

    /// Policy name, when the export carries one
    pub policy_name: Option<String>,

    /// Distinct hosts seen
    pub host_count: usize,

    /// Total vulnerability records
    pub total_findings: usize,

    /// Finding count per severity (keys "0".."4")
    pub severity_counts: BTreeMap<String, usize>,
}

/// One finding, as a field map
///
/// The map preserves source order, so `full`-profile output mirrors the
/// export. Values are typed where the source is unambiguous: plugin ids,
/// ports and severities are numbers, `exploit_available` is a boolean, and
/// CVE references are a list.
#[derive(Debug, Clone, PartialEq)]
pub struct Vulnerability {
    pub fields: Map<String, Value>,
}

impl Vulnerability {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Parsed artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub metadata: ScanMetadata,
    pub vulnerabilities: Vec<Vulnerability>,
}
