//! Run-scoped data: triggering event, provenance, outgoing messages, results

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::error::PipelineError;

/// Parsed array element. Opaque to the pipeline.
pub type RecordValue = Value;

/// String-to-string attribute map. Ordered so serialization is deterministic.
pub type Attributes = BTreeMap<String, String>;

/// Event that triggers one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEvent {
    #[serde(default)]
    pub bucket_id: String,
    #[serde(default)]
    pub object_id: String,
    #[serde(default, alias = "rawAttributes")]
    pub attributes: Attributes,
}

impl SourceEvent {
    pub fn new(bucket_id: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            object_id: object_id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Decode a storage notification payload.
    ///
    /// Accepts `{bucketId, objectId, attributes}`; any other top-level string
    /// field (eventType, eventTime, objectGeneration, ...) is folded into
    /// `attributes` without overriding an explicit entry.
    pub fn from_notification(payload: Value) -> Result<Self, PipelineError> {
        let Value::Object(mut fields) = payload else {
            return Err(PipelineError::Input(
                "event payload must be a JSON object".to_string(),
            ));
        };

        let mut take_str = |key: &str| match fields.remove(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let bucket_id = take_str("bucketId");
        let object_id = take_str("objectId");

        let mut attributes = match fields.remove("attributes") {
            Some(raw) => serde_json::from_value::<Attributes>(raw).map_err(|e| {
                PipelineError::Input(format!("event attributes must map strings to strings: {e}"))
            })?,
            None => Attributes::new(),
        };
        for (key, value) in fields {
            if let Value::String(s) = value {
                attributes.entry(key).or_insert(s);
            }
        }

        Ok(Self {
            bucket_id,
            object_id,
            attributes,
        })
    }

    /// Reject events that cannot name a source object.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.bucket_id.trim().is_empty() {
            return Err(PipelineError::Input(
                "Bucket not provided. Make sure you have a \"bucketId\" property in your request"
                    .to_string(),
            ));
        }
        if self.object_id.trim().is_empty() {
            return Err(PipelineError::Input(
                "Filename not provided. Make sure you have an \"objectId\" property in your request"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Short `bucket/object` label for logs and progress lines.
    pub fn label(&self) -> String {
        format!("{}/{}", self.bucket_id, self.object_id)
    }
}

/// Where every message of a run came from. Fixed before the first publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceContext {
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<Attributes>,
}

impl ProvenanceContext {
    pub fn from_event(event: &SourceEvent) -> Self {
        Self {
            attributes: event.attributes.clone(),
            custom_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Attributes) -> Self {
        self.custom_metadata = Some(metadata);
        self
    }

    /// Serialize once so every message of the run embeds identical bytes.
    pub fn freeze(&self) -> Result<FrozenProvenance, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(FrozenProvenance(RawValue::from_string(json)?))
    }
}

/// Pre-serialized [`ProvenanceContext`].
#[derive(Debug)]
pub struct FrozenProvenance(Box<RawValue>);

impl FrozenProvenance {
    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

/// One record ready for the bus.
///
/// `payload` is UTF-8 JSON `{"content": <record>, "header": {"provenance": [<ctx>]}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Position of the record in the parsed sequence
    pub index: usize,
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    content: &'a Value,
    header: WireHeader<'a>,
}

#[derive(Serialize)]
struct WireHeader<'a> {
    provenance: [&'a RawValue; 1],
}

impl OutgoingMessage {
    pub fn encode(
        index: usize,
        content: &Value,
        provenance: &FrozenProvenance,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(&WireMessage {
            content,
            header: WireHeader {
                provenance: [&provenance.0],
            },
        })?;
        Ok(Self { index, payload })
    }

    pub fn as_str(&self) -> &str {
        // Produced by serde_json, always UTF-8
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

/// A record the bus refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub index: usize,
    pub error: String,
}

/// Terminal tally of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub published_count: usize,
    /// Ordered by record index
    pub failures: Vec<RecordFailure>,
    /// Null/empty records dropped before publishing
    #[serde(skip)]
    pub skipped_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_folds_extra_fields() {
        let event = SourceEvent::from_notification(json!({
            "bucketId": "drug_portal",
            "objectId": "data/fda/test.json.zip",
            "eventType": "OBJECT_FINALIZE",
            "objectGeneration": "1531955353874591",
            "attributes": {"eventType": "explicit"},
            "payloadFormat": 1
        }))
        .unwrap();
        assert_eq!(event.bucket_id, "drug_portal");
        assert_eq!(event.object_id, "data/fda/test.json.zip");
        assert_eq!(event.attributes["eventType"], "explicit");
        assert_eq!(event.attributes["objectGeneration"], "1531955353874591");
        assert!(!event.attributes.contains_key("payloadFormat"));
    }

    #[test]
    fn notification_must_be_object() {
        let err = SourceEvent::from_notification(json!([1, 2])).unwrap_err();
        assert_eq!(err.kind(), "InputError");
    }

    #[test]
    fn validate_missing_bucket() {
        let err = SourceEvent::new("", "obj").validate().unwrap_err();
        assert!(err.to_string().contains("Bucket not provided"));
    }

    #[test]
    fn validate_missing_object() {
        let err = SourceEvent::new("b", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("Filename not provided"));
    }

    #[test]
    fn message_wire_shape() {
        let event = SourceEvent::new("b", "o").with_attribute("bucketId", "b");
        let frozen = ProvenanceContext::from_event(&event).freeze().unwrap();
        let msg = OutgoingMessage::encode(4, &json!({"id": 1}), &frozen).unwrap();
        assert_eq!(
            msg.as_str(),
            r#"{"content":{"id":1},"header":{"provenance":[{"attributes":{"bucketId":"b"}}]}}"#
        );
        assert_eq!(msg.index, 4);
    }

    #[test]
    fn custom_metadata_serialized_when_present() {
        let mut meta = Attributes::new();
        meta.insert("source".into(), "fda".into());
        let ctx = ProvenanceContext::default().with_metadata(meta);
        let frozen = ctx.freeze().unwrap();
        assert_eq!(
            frozen.as_json(),
            r#"{"attributes":{},"customMetadata":{"source":"fda"}}"#
        );
    }
}
