use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A document as it sits in the opportunity store: an opaque text body plus
/// the identity needed to write tags back later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: i64,
    pub business_id: Option<String>,
    pub body: String,
}

impl RawDocument {
    #[must_use]
    pub fn new(id: i64, business_id: Option<String>, body: String) -> Self {
        Self {
            id,
            business_id,
            body,
        }
    }
}

/// A normalized grant opportunity ready for prompting.
///
/// Only the projected fields serialize. The internal id and provenance ride
/// along for bookkeeping and never reach the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecord {
    #[serde(rename = "id")]
    pub business_id: Option<String>,
    pub opportunity_title: String,
    pub synopsis: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opportunity_pkgs: Vec<Value>,
    #[serde(skip)]
    pub internal_id: Uuid,
    #[serde(skip)]
    pub provenance: BTreeMap<String, String>,
}

impl GrantRecord {
    #[must_use]
    pub fn new(business_id: Option<String>, opportunity_title: String, synopsis: String) -> Self {
        Self {
            business_id,
            opportunity_title,
            synopsis,
            opportunity_pkgs: Vec::new(),
            internal_id: Uuid::new_v4(),
            provenance: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_packages(mut self, packages: Vec<Value>) -> Self {
        self.opportunity_pkgs = packages;
        self
    }

    #[must_use]
    pub fn with_provenance(mut self, provenance: BTreeMap<String, String>) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Which classification fields the completion service is asked to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSchema {
    Core,
    Extended,
}

impl TagSchema {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Extended => "extended",
        }
    }

    /// Extended runs ask the service to echo the title and agency code back
    /// alongside the classification fields.
    #[must_use]
    pub fn includes_identity_fields(&self) -> bool {
        matches!(self, Self::Extended)
    }
}

impl std::fmt::Display for TagSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TagSchema {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(Self::Core),
            "extended" => Ok(Self::Extended),
            _ => Err(crate::Error::InvalidTagSchema(s.to_string())),
        }
    }
}

/// Classification fields returned by the completion service for one record.
///
/// Field names mirror the wire shape. Tag values are kept in sorted sets so
/// that serializing the same record twice produces identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRecord {
    #[serde(rename = "id")]
    pub business_id: String,
    #[serde(default)]
    pub research_type_tags: BTreeSet<String>,
    #[serde(default)]
    pub sbir_tags: BTreeSet<String>,
    #[serde(default)]
    pub company_type_tags: BTreeSet<String>,
    #[serde(default)]
    pub country_based_eligibility: BTreeSet<String>,
    #[serde(default)]
    pub country_operation_eligibility: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_code: Option<String>,
}

impl TagRecord {
    #[must_use]
    pub fn new(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            research_type_tags: BTreeSet::new(),
            sbir_tags: BTreeSet::new(),
            company_type_tags: BTreeSet::new(),
            country_based_eligibility: BTreeSet::new(),
            country_operation_eligibility: BTreeSet::new(),
            opportunity_title: None,
            agency_code: None,
        }
    }

    #[must_use]
    pub fn with_research_type(mut self, tag: impl Into<String>) -> Self {
        self.research_type_tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_sbir(mut self, tag: impl Into<String>) -> Self {
        self.sbir_tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_opportunity_title(mut self, title: impl Into<String>) -> Self {
        self.opportunity_title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_agency_code(mut self, code: impl Into<String>) -> Self {
        self.agency_code = Some(code.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_record_serializes_projected_fields_only() {
        let record = GrantRecord::new(
            Some("GRANT-1".to_string()),
            "Wetland Restoration".to_string(),
            "Restore coastal wetlands.".to_string(),
        )
        .with_provenance(BTreeMap::from([(
            "collection".to_string(),
            "grants".to_string(),
        )]));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "GRANT-1");
        assert_eq!(json["opportunityTitle"], "Wetland Restoration");
        assert_eq!(json["synopsis"], "Restore coastal wetlands.");
        assert!(json.get("internalId").is_none());
        assert!(json.get("provenance").is_none());
        assert!(json.get("internal_id").is_none());
    }

    #[test]
    fn grant_records_get_distinct_internal_ids() {
        let a = GrantRecord::new(None, String::new(), String::new());
        let b = GrantRecord::new(None, String::new(), String::new());
        assert_ne!(a.internal_id, b.internal_id);
    }

    #[test]
    fn tag_record_wire_names_are_camel_case() {
        let tag = TagRecord::new("GRANT-1")
            .with_research_type("Non-Clinical")
            .with_sbir("Non-SBIR-STTR");

        let json = serde_json::to_value(&tag).unwrap();
        assert_eq!(json["id"], "GRANT-1");
        assert_eq!(json["researchTypeTags"][0], "Non-Clinical");
        assert_eq!(json["sbirTags"][0], "Non-SBIR-STTR");
        assert!(json.get("opportunityTitle").is_none());
        assert!(json["companyTypeTags"].as_array().unwrap().is_empty());
    }

    #[test]
    fn tag_record_deserializes_with_missing_fields_defaulted() {
        let tag: TagRecord = serde_json::from_str(r#"{"id": "GRANT-2"}"#).unwrap();
        assert_eq!(tag.business_id, "GRANT-2");
        assert!(tag.research_type_tags.is_empty());
        assert!(tag.agency_code.is_none());
    }

    #[test]
    fn tag_record_serialization_is_stable() {
        let mut tag = TagRecord::new("GRANT-3");
        tag.country_based_eligibility.insert("United States".to_string());
        tag.country_based_eligibility.insert("Canada".to_string());

        let first = serde_json::to_string(&tag).unwrap();
        let second = serde_json::to_string(&tag).unwrap();
        assert_eq!(first, second);
        assert!(first.find("Canada").unwrap() < first.find("United States").unwrap());
    }

    #[test]
    fn tag_schema_round_trips_through_strings() {
        use std::str::FromStr;

        assert_eq!(TagSchema::from_str("core").unwrap(), TagSchema::Core);
        assert_eq!(TagSchema::from_str("extended").unwrap(), TagSchema::Extended);
        assert_eq!(TagSchema::Extended.to_string(), "extended");
        assert!(TagSchema::from_str("full").is_err());
        assert!(TagSchema::Extended.includes_identity_fields());
        assert!(!TagSchema::Core.includes_identity_fields());
    }
}
