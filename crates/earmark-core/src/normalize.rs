use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::literal::{self, LiteralError};
use crate::opportunity::{GrantRecord, RawDocument};

/// Store reference wrappers that survive text export, e.g.
/// `ObjectId('6612f00e09a0d4b9ee51e2b1')`. The whole token is replaced with
/// an empty string literal so the surrounding body stays parseable.
static REF_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ObjectId\('\w+'\)").expect("valid regex"));

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Unparseable body: {0}")]
    Unparseable(#[from] LiteralError),
    #[error("Body is not a document")]
    NotADocument,
}

pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// Turns raw store documents into prompt-ready grant records.
pub struct Normalizer {
    provenance: BTreeMap<String, String>,
}

impl Normalizer {
    #[must_use]
    pub fn new(provenance: BTreeMap<String, String>) -> Self {
        Self { provenance }
    }

    /// Replace store reference tokens with empty string literals.
    #[must_use]
    pub fn strip_ref_tokens<'a>(&self, body: &'a str) -> Cow<'a, str> {
        REF_TOKEN.replace_all(body, "''")
    }

    /// Parse one raw document body and project the fields the tagging
    /// prompt needs. Callers decide what to do with failures; this only
    /// reports them.
    pub fn normalize(&self, raw: &RawDocument) -> NormalizeResult<GrantRecord> {
        let cleaned = self.strip_ref_tokens(&raw.body);
        let Value::Object(mut fields) = literal::parse(&cleaned)? else {
            return Err(NormalizeError::NotADocument);
        };

        let business_id = fields.get("id").and_then(scalar_to_string);
        let title = fields
            .get("opportunityTitle")
            .and_then(scalar_to_string)
            .unwrap_or_default();
        let synopsis = fields
            .get("synopsis")
            .and_then(scalar_to_string)
            .unwrap_or_default();
        let packages = match fields.remove("opportunityPkgs") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        Ok(GrantRecord::new(business_id, title, synopsis)
            .with_packages(packages)
            .with_provenance(self.provenance.clone()))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
