//! Core record model, store-document decoding and address normalization for custlink.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "custlink-core";

/// Street-type tokens removed by [`normalized_address`].
pub const STREET_SUFFIXES: &[&str] = &[
    "street",
    "st",
    "avenue",
    "ave",
    "road",
    "rd",
    "drive",
    "dr",
    "lane",
    "ln",
    "boulevard",
    "blvd",
];

/// Field names the applier merges onto source documents.
pub mod link_fields {
    pub const LINKED_TARGET_ID: &str = "linkedTargetId";
    pub const LINKED_TARGET_NAME: &str = "linkedTargetName";
    pub const MATCH_TYPE: &str = "matchType";
    pub const MATCH_CONFIDENCE: &str = "matchConfidence";
    pub const MATCHED_AT: &str = "matchedAt";
}

/// Accepted spellings per logical field, first present wins. Older imports
/// wrote the same value under different names.
mod aliases {
    pub const SOURCE_DISPLAY_NAME: &[&str] = &["displayName", "name"];
    pub const SOURCE_IDENTIFIER_A: &[&str] = &["identifierA", "accountId"];
    pub const SOURCE_IDENTIFIER_B: &[&str] = &["identifierB", "accountNumber"];
    pub const SOURCE_ADDRESS: &[&str] = &["addressLine", "address", "street"];

    pub const TARGET_ID: &[&str] = &["targetId", "id"];
    pub const TARGET_DISPLAY_NAME: &[&str] = &["displayName", "Name", "name"];
    pub const TARGET_IDENTIFIER_A: &[&str] = &["identifierA", "Account ID", "accountId"];
    pub const TARGET_IDENTIFIER_C: &[&str] =
        &["identifierC", "Account Order ID cf_698467", "accountOrderId"];
    pub const TARGET_ADDRESS: &[&str] = &["addressLine", "Street", "street", "Address", "address"];
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("document {key:?} has no usable {field}")]
    MissingKey { key: String, field: &'static str },
    #[error("document {key:?} is not a JSON object")]
    NotAnObject { key: String },
    #[error("document {key:?} field {field:?} holds unsupported {found} value")]
    FieldType {
        key: String,
        field: String,
        found: &'static str,
    },
}

/// Trimmed lookup key, or `None` for absent / blank values.
pub fn lookup_key(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Lower-case, drop punctuation, collapse whitespace, drop street-type
/// tokens, trim. Index builder and matcher must both go through this.
///
/// Suffix tokens are removed after whitespace is collapsed, so an interior
/// suffix leaves two spaces behind (`"main st north"` -> `"main  north"`).
/// Keys already stored by earlier runs depend on that exact output.
pub fn normalized_address(input: &str) -> String {
    let lowered = input.to_lowercase();

    let mut collapsed = String::with_capacity(lowered.len());
    let mut in_space = false;
    for c in lowered.chars() {
        if is_separator(c) {
            if !in_space {
                collapsed.push(' ');
                in_space = true;
            }
        } else if c.is_ascii_alphanumeric() || c == '_' {
            collapsed.push(c);
            in_space = false;
        }
    }

    collapsed
        .split(' ')
        .map(|token| if STREET_SUFFIXES.contains(&token) { "" } else { token })
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(' ')
        .to_string()
}

/// Separator set stored keys were built with: Unicode `White_Space` plus
/// U+FEFF, minus U+0085.
fn is_separator(c: char) -> bool {
    c == '\u{feff}' || (c.is_whitespace() && c != '\u{85}')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    IdentifierA,
    IdentifierB,
    Address,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentifierA => "identifierA",
            Self::IdentifierB => "identifierB",
            Self::Address => "address",
        }
    }

    /// Confidence is fixed by the strategy that produced the match.
    pub fn confidence(self) -> Confidence {
        match self {
            Self::IdentifierA | Self::IdentifierB => Confidence::High,
            Self::Address => Confidence::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
        }
    }
}

/// One ERP customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub source_id: String,
    pub display_name: String,
    /// Business account code such as `C104` or `HQ12`.
    pub identifier_a: Option<String>,
    /// Order-level number; the CRM stores the same value as `identifier_c`.
    pub identifier_b: Option<String>,
    pub address_line: Option<String>,
    pub linked_target_id: Option<String>,
    pub match_type: Option<String>,
    pub match_confidence: Option<String>,
}

impl SourceRecord {
    pub fn new(source_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            identifier_a: None,
            identifier_b: None,
            address_line: None,
            linked_target_id: None,
            match_type: None,
            match_confidence: None,
        }
    }

    pub fn with_identifier_a(mut self, value: impl Into<String>) -> Self {
        self.identifier_a = Some(value.into());
        self
    }

    pub fn with_identifier_b(mut self, value: impl Into<String>) -> Self {
        self.identifier_b = Some(value.into());
        self
    }

    pub fn with_address(mut self, value: impl Into<String>) -> Self {
        self.address_line = Some(value.into());
        self
    }

    pub fn identifier_a_key(&self) -> Option<&str> {
        lookup_key(self.identifier_a.as_deref())
    }

    pub fn identifier_b_key(&self) -> Option<&str> {
        lookup_key(self.identifier_b.as_deref())
    }

    pub fn is_linked(&self) -> bool {
        lookup_key(self.linked_target_id.as_deref()).is_some()
    }

    /// Decode a source document. The store key is the `source_id`.
    pub fn from_document(key: &str, body: &JsonValue) -> Result<Self, MalformedRecord> {
        if key.trim().is_empty() {
            return Err(MalformedRecord::MissingKey {
                key: key.to_string(),
                field: "sourceId",
            });
        }
        let fields = DocumentFields::new(key, body)?;
        Ok(Self {
            source_id: key.to_string(),
            display_name: fields.text(aliases::SOURCE_DISPLAY_NAME)?.unwrap_or_default(),
            identifier_a: fields.text(aliases::SOURCE_IDENTIFIER_A)?,
            identifier_b: fields.text(aliases::SOURCE_IDENTIFIER_B)?,
            address_line: fields.text(aliases::SOURCE_ADDRESS)?,
            linked_target_id: fields.text(&[link_fields::LINKED_TARGET_ID])?,
            match_type: fields.text(&[link_fields::MATCH_TYPE])?,
            match_confidence: fields.text(&[link_fields::MATCH_CONFIDENCE])?,
        })
    }

    /// Canonical store body for this record, link fields included when set.
    pub fn to_document(&self) -> JsonValue {
        let mut map = Map::new();
        put_text(&mut map, "displayName", Some(&self.display_name));
        put_text(&mut map, "identifierA", self.identifier_a.as_ref());
        put_text(&mut map, "identifierB", self.identifier_b.as_ref());
        put_text(&mut map, "addressLine", self.address_line.as_ref());
        put_text(&mut map, link_fields::LINKED_TARGET_ID, self.linked_target_id.as_ref());
        put_text(&mut map, link_fields::MATCH_TYPE, self.match_type.as_ref());
        put_text(&mut map, link_fields::MATCH_CONFIDENCE, self.match_confidence.as_ref());
        JsonValue::Object(map)
    }
}

/// One CRM company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub target_id: String,
    pub display_name: String,
    pub identifier_a: Option<String>,
    /// Newer migration's name for the source system's `identifier_b`.
    pub identifier_c: Option<String>,
    pub address_line: Option<String>,
}

impl TargetRecord {
    pub fn new(target_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            display_name: display_name.into(),
            identifier_a: None,
            identifier_c: None,
            address_line: None,
        }
    }

    pub fn with_identifier_a(mut self, value: impl Into<String>) -> Self {
        self.identifier_a = Some(value.into());
        self
    }

    pub fn with_identifier_c(mut self, value: impl Into<String>) -> Self {
        self.identifier_c = Some(value.into());
        self
    }

    pub fn with_address(mut self, value: impl Into<String>) -> Self {
        self.address_line = Some(value.into());
        self
    }

    pub fn identifier_a_key(&self) -> Option<&str> {
        lookup_key(self.identifier_a.as_deref())
    }

    pub fn identifier_c_key(&self) -> Option<&str> {
        lookup_key(self.identifier_c.as_deref())
    }

    /// Decode a target document. `target_id` comes from the body; the store
    /// key is an internal document id and is only used in error messages.
    pub fn from_document(store_key: &str, body: &JsonValue) -> Result<Self, MalformedRecord> {
        let fields = DocumentFields::new(store_key, body)?;
        let target_id = fields
            .text(aliases::TARGET_ID)?
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| MalformedRecord::MissingKey {
                key: store_key.to_string(),
                field: "targetId",
            })?;
        Ok(Self {
            target_id,
            display_name: fields.text(aliases::TARGET_DISPLAY_NAME)?.unwrap_or_default(),
            identifier_a: fields.text(aliases::TARGET_IDENTIFIER_A)?,
            identifier_c: fields.text(aliases::TARGET_IDENTIFIER_C)?,
            address_line: fields.text(aliases::TARGET_ADDRESS)?,
        })
    }

    pub fn to_document(&self) -> JsonValue {
        let mut map = Map::new();
        put_text(&mut map, "targetId", Some(&self.target_id));
        put_text(&mut map, "displayName", Some(&self.display_name));
        put_text(&mut map, "identifierA", self.identifier_a.as_ref());
        put_text(&mut map, "identifierC", self.identifier_c.as_ref());
        put_text(&mut map, "addressLine", self.address_line.as_ref());
        JsonValue::Object(map)
    }
}

fn put_text(map: &mut Map<String, JsonValue>, name: &str, value: Option<&String>) {
    if let Some(value) = value {
        map.insert(name.to_string(), JsonValue::String(value.clone()));
    }
}

struct DocumentFields<'a> {
    key: &'a str,
    map: &'a Map<String, JsonValue>,
}

impl<'a> DocumentFields<'a> {
    fn new(key: &'a str, body: &'a JsonValue) -> Result<Self, MalformedRecord> {
        match body {
            JsonValue::Object(map) => Ok(Self { key, map }),
            _ => Err(MalformedRecord::NotAnObject {
                key: key.to_string(),
            }),
        }
    }

    /// First alias holding a non-empty string or a number. Numbers keep their
    /// decimal rendering so numeric ERP ids compare as text.
    fn text(&self, names: &[&str]) -> Result<Option<String>, MalformedRecord> {
        for name in names {
            match self.map.get(*name) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::String(s)) if s.is_empty() => continue,
                Some(JsonValue::String(s)) => return Ok(Some(s.clone())),
                Some(JsonValue::Number(n)) => return Ok(Some(number_text(n))),
                Some(other) => {
                    return Err(MalformedRecord::FieldType {
                        key: self.key.to_string(),
                        field: (*name).to_string(),
                        found: json_kind(other),
                    })
                }
            }
        }
        Ok(None)
    }
}

/// Integral floats (`55102.0`) render without the fraction.
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            (f as i64).to_string()
        }
        _ => n.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// A proposed or accepted link between one source and one target. This is
/// both the matcher's output row and the applier's input row; reviewers may
/// drop the display names when re-submitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub source_id: String,
    #[serde(default)]
    pub source_display_name: String,
    pub target_id: String,
    #[serde(default)]
    pub target_display_name: String,
    pub match_type: MatchType,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_identifier_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStats {
    pub total_source: usize,
    pub total_target: usize,
    pub matched_count: usize,
    pub unmatched_count: usize,
    #[serde(default)]
    pub skipped_source: usize,
    #[serde(default)]
    pub skipped_target: usize,
    #[serde(default)]
    pub index_collisions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    pub matches: Vec<MatchResult>,
    pub stats: MatchStats,
}

/// The merge-write the applier issues for one accepted match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUpdate {
    pub source_id: String,
    pub linked_target_id: String,
    pub linked_target_name: String,
    pub match_type: MatchType,
    pub match_confidence: Confidence,
    pub matched_at: DateTime<Utc>,
}

impl LinkUpdate {
    pub fn from_match(result: &MatchResult, matched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: result.source_id.trim().to_string(),
            linked_target_id: result.target_id.trim().to_string(),
            linked_target_name: result.target_display_name.clone(),
            match_type: result.match_type,
            match_confidence: result.confidence,
            matched_at,
        }
    }

    /// JSON object of the link fields only; merged onto the stored document.
    pub fn merge_fields(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(
            link_fields::LINKED_TARGET_ID.to_string(),
            JsonValue::String(self.linked_target_id.clone()),
        );
        map.insert(
            link_fields::LINKED_TARGET_NAME.to_string(),
            JsonValue::String(self.linked_target_name.clone()),
        );
        map.insert(
            link_fields::MATCH_TYPE.to_string(),
            JsonValue::String(self.match_type.as_str().to_string()),
        );
        map.insert(
            link_fields::MATCH_CONFIDENCE.to_string(),
            JsonValue::String(self.match_confidence.as_str().to_string()),
        );
        map.insert(
            link_fields::MATCHED_AT.to_string(),
            JsonValue::String(self.matched_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        JsonValue::Object(map)
    }
}
