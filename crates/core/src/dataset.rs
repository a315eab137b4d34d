//! Parsed instance dataset model.
//!
//! The wire codec for binary instances is a presentation-layer concern; by
//! the time a payload reaches the orchestrator it is handled as the JSON
//! dataset model: an object mapping attribute keywords to values. The raw
//! bytes are persisted verbatim regardless — this model only drives identity
//! extraction, hook payloads and metadata reads.

use crate::{CoreError, CoreResult};
use opal_index::HierarchyIds;
use opal_types::PublicId;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Attribute keywords that identify an instance within the hierarchy.
pub const PATIENT_ID_TAG: &str = "PatientID";
pub const STUDY_UID_TAG: &str = "StudyInstanceUID";
pub const SERIES_UID_TAG: &str = "SeriesInstanceUID";
pub const SOP_UID_TAG: &str = "SOPInstanceUID";

/// The four unique identifiers that place an instance in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
}

/// A parsed instance: a JSON object of attribute keywords to values.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDataset {
    tags: Map<String, Value>,
}

impl InstanceDataset {
    /// Parses instance bytes into a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedInstance`] if the payload is not a JSON
    /// object, or if any of the four identity attributes is missing or empty.
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::MalformedInstance(e.to_string()))?;
        Self::from_value(value)
    }

    /// Builds a dataset from an already-parsed JSON value.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let tags = match value {
            Value::Object(map) => map,
            other => {
                return Err(CoreError::MalformedInstance(format!(
                    "expected a dataset object, got {}",
                    kind_of(&other)
                )))
            }
        };

        let dataset = Self { tags };
        dataset.identity()?;
        Ok(dataset)
    }

    /// Returns the value of a string-typed attribute, if present.
    pub fn tag(&self, keyword: &str) -> Option<&str> {
        self.tags.get(keyword).and_then(Value::as_str)
    }

    /// Sets or replaces a string attribute. Used by modify hooks to alter
    /// metadata before persistence.
    pub fn set_tag(&mut self, keyword: &str, value: &str) {
        self.tags
            .insert(keyword.to_owned(), Value::String(value.to_owned()));
    }

    /// Removes an attribute. Returns whether it was present.
    pub fn remove_tag(&mut self, keyword: &str) -> bool {
        self.tags.remove(keyword).is_some()
    }

    /// Extracts the identity attributes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedInstance`] naming the first missing or
    /// empty identity attribute.
    pub fn identity(&self) -> CoreResult<InstanceIdentity> {
        let required = |keyword: &str| -> CoreResult<String> {
            match self.tag(keyword) {
                Some(value) if !value.trim().is_empty() => Ok(value.to_owned()),
                _ => Err(CoreError::MalformedInstance(format!(
                    "missing identity attribute {keyword}"
                ))),
            }
        };

        Ok(InstanceIdentity {
            patient_id: required(PATIENT_ID_TAG)?,
            study_uid: required(STUDY_UID_TAG)?,
            series_uid: required(SERIES_UID_TAG)?,
            sop_uid: required(SOP_UID_TAG)?,
        })
    }

    /// Derives the public identifiers of the instance's hierarchy path.
    ///
    /// Identifiers are deterministic functions of the identity attributes, so
    /// the same instance always maps to the same resources.
    pub fn hierarchy(&self) -> CoreResult<HierarchyIds> {
        let identity = self.identity()?;
        let p = identity.patient_id.as_str();
        let st = identity.study_uid.as_str();
        let se = identity.series_uid.as_str();
        let i = identity.sop_uid.as_str();

        Ok(HierarchyIds {
            patient: PublicId::derive(&[p]),
            study: PublicId::derive(&[p, st]),
            series: PublicId::derive(&[p, st, se]),
            instance: PublicId::derive(&[p, st, se, i]),
            patient_uid: identity.patient_id,
            study_uid: identity.study_uid,
            series_uid: identity.series_uid,
            instance_uid: identity.sop_uid,
        })
    }

    /// Flat view of the string-valued attributes, the payload handed to
    /// policy and notification hooks.
    pub fn simplified(&self) -> BTreeMap<String, String> {
        self.tags
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect()
    }

    /// The dataset as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.tags.clone())
    }

    /// Serializes the dataset for persistence as the metadata attachment.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(&self.tags).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_bytes(sop_uid: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "PatientID": "patient-1",
            "StudyInstanceUID": "1.2.840.1",
            "SeriesInstanceUID": "1.2.840.1.1",
            "SOPInstanceUID": sop_uid,
            "PatientName": "DOE^JOHN",
            "InstanceNumber": 4,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_extracts_identity() {
        let dataset = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.9")).unwrap();
        let identity = dataset.identity().unwrap();
        assert_eq!(identity.patient_id, "patient-1");
        assert_eq!(identity.sop_uid, "1.2.840.1.1.9");
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            InstanceDataset::parse(b"[1,2,3]"),
            Err(CoreError::MalformedInstance(_))
        ));
        assert!(matches!(
            InstanceDataset::parse(b"not json at all"),
            Err(CoreError::MalformedInstance(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_identity_attribute() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "PatientID": "patient-1",
            "StudyInstanceUID": "1.2.840.1",
            "SeriesInstanceUID": "1.2.840.1.1",
        }))
        .unwrap();
        let err = InstanceDataset::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains(SOP_UID_TAG));
    }

    #[test]
    fn test_parse_rejects_empty_identity_attribute() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "PatientID": "  ",
            "StudyInstanceUID": "1.2.840.1",
            "SeriesInstanceUID": "1.2.840.1.1",
            "SOPInstanceUID": "1.2.840.1.1.9",
        }))
        .unwrap();
        assert!(matches!(
            InstanceDataset::parse(&bytes),
            Err(CoreError::MalformedInstance(_))
        ));
    }

    #[test]
    fn test_hierarchy_is_deterministic_and_nested() {
        let a = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.9")).unwrap();
        let b = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.9")).unwrap();
        assert_eq!(a.hierarchy().unwrap(), b.hierarchy().unwrap());

        let other = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.10")).unwrap();
        let ha = a.hierarchy().unwrap();
        let ho = other.hierarchy().unwrap();
        assert_eq!(ha.series, ho.series);
        assert_ne!(ha.instance, ho.instance);
    }

    #[test]
    fn test_simplified_keeps_only_string_attributes() {
        let dataset = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.9")).unwrap();
        let simplified = dataset.simplified();
        assert_eq!(simplified.get("PatientName").map(String::as_str), Some("DOE^JOHN"));
        assert!(!simplified.contains_key("InstanceNumber"));
    }

    #[test]
    fn test_set_tag_round_trips_through_bytes() {
        let mut dataset = InstanceDataset::parse(&sample_bytes("1.2.840.1.1.9")).unwrap();
        dataset.set_tag("InstitutionName", "General Hospital");
        let back = InstanceDataset::parse(&dataset.to_bytes().unwrap()).unwrap();
        assert_eq!(back.tag("InstitutionName"), Some("General Hospital"));
    }
}
