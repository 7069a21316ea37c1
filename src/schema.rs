use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref LINK_REGEX: Regex = Regex::new(r"^(https?://)?[^\s/$.?#][^\s]*\.[^\s]+$").unwrap();
    static ref NUMBER_REGEX: Regex = Regex::new(r"^[+-]?([0-9]+([.,][0-9]*)?|[.,][0-9]+)$").unwrap();
    static ref TAG_REGEX: Regex = Regex::new(r"^[^\s,]+(\s*,\s*[^\s,]+)*$").unwrap();
}

/// Kind tag of a column. Unknown tags decode as `Freeform`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldKind {
    Email,
    Secret,
    Link,
    Tag,
    Number,
    Note,
    #[default]
    Freeform,
}

impl From<String> for FieldKind {
    fn from(tag: String) -> Self {
        FieldKind::from_tag(&tag)
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        kind.tag().to_string()
    }
}

impl FieldKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "email" => FieldKind::Email,
            "secret" | "password" => FieldKind::Secret,
            "link" | "url" => FieldKind::Link,
            "tag" => FieldKind::Tag,
            "number" => FieldKind::Number,
            "note" => FieldKind::Note,
            _ => FieldKind::Freeform,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FieldKind::Email => "email",
            FieldKind::Secret => "secret",
            FieldKind::Link => "link",
            FieldKind::Tag => "tag",
            FieldKind::Number => "number",
            FieldKind::Note => "note",
            FieldKind::Freeform => "freeform",
        }
    }

    /// Advisory check of a cell value. Empty cells always pass.
    pub fn check(&self, value: &str) -> Option<&'static str> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        match self {
            FieldKind::Email if !EMAIL_REGEX.is_match(value) => Some("not an email address"),
            FieldKind::Link if !LINK_REGEX.is_match(value) => Some("not a link"),
            FieldKind::Number if !NUMBER_REGEX.is_match(value) => Some("not a number"),
            FieldKind::Tag if !TAG_REGEX.is_match(value) => Some("malformed tag list"),
            _ => None,
        }
    }

    /// Text to show for a value. Secrets are masked.
    pub fn display(&self, value: &str) -> String {
        match self {
            FieldKind::Secret if !value.is_empty() => "\u{2022}".repeat(8),
            FieldKind::Email => value.trim().to_lowercase(),
            FieldKind::Note => value.lines().next().unwrap_or("").to_string(),
            _ => value.to_string(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Ordered column kinds. Its length is the width of every row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldKind>,
}

impl Schema {
    pub fn new(fields: Vec<FieldKind>) -> Self {
        Schema { fields }
    }

    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        Schema {
            fields: tags.iter().map(|t| FieldKind::from_tag(t.as_ref())).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn kind(&self, col: usize) -> Option<FieldKind> {
        self.fields.get(col).copied()
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }
}
