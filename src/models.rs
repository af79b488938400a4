//! Session document model.
//!
//! The on-disk JSON keeps the key names of previously stored sessions
//! (`Patient Information`, `Lab Test Results`, ...) so existing documents
//! round-trip unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel shown for patient fields no pattern matched.
pub const NOT_FOUND: &str = "Not found";

/// Patient demographics captured from the report, all optional.
///
/// Doubles as the partial-update payload for the profile endpoint: fields
/// present in the patch overwrite, absent ones are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
}

impl PatientInfo {
    /// Shallow merge: fields set in `patch` replace the stored values.
    pub fn merge(&mut self, patch: PatientInfo) {
        if patch.name.is_some() {
            self.name = patch.name;
        }
        if patch.age.is_some() {
            self.age = patch.age;
        }
        if patch.weight.is_some() {
            self.weight = patch.weight;
        }
        if patch.height.is_some() {
            self.height = patch.height;
        }
    }
}

/// Lab test label → value, both kept as the literal report strings.
pub type LabResults = BTreeMap<String, String>;

/// Three-part output of one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    #[serde(rename = "Analysis")]
    pub analysis: String,
    #[serde(rename = "Recommendations")]
    pub recommendations: String,
    #[serde(rename = "Medications")]
    pub medications: String,
}

impl AnalysisBundle {
    pub fn is_empty(&self) -> bool {
        self.analysis.trim().is_empty()
            && self.recommendations.trim().is_empty()
            && self.medications.trim().is_empty()
    }
}

/// One chat exchange, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub user: String,
    pub bot: String,
}

/// The whole session. Exactly one exists at a time; a new upload replaces
/// it wholesale, discarding chat history and any updated analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(rename = "Patient Information")]
    pub patient: PatientInfo,
    #[serde(rename = "Lab Test Results")]
    pub lab_results: LabResults,
    #[serde(rename = "Analysis and Recommendation")]
    pub analysis: AnalysisBundle,
    #[serde(
        rename = "new_updated_Analysis_and_Recommendation",
        with = "updated_slot",
        default
    )]
    pub updated_analysis: Option<AnalysisBundle>,
    #[serde(rename = "Chat History")]
    pub chat_history: Vec<ChatEntry>,
}

impl SessionDocument {
    pub fn new(patient: PatientInfo, lab_results: LabResults, analysis: AnalysisBundle) -> Self {
        Self {
            patient,
            lab_results,
            analysis,
            updated_analysis: None,
            chat_history: Vec::new(),
        }
    }
}

/// The unpopulated updated-analysis slot is stored as `{}`, matching
/// documents written before this slot was ever filled.
mod updated_slot {
    use super::AnalysisBundle;
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<AnalysisBundle>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bundle) => bundle.serialize(serializer),
            None => serializer.serialize_map(Some(0))?.end(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<AnalysisBundle>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value.as_object() {
            Some(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
        }
    }
}
