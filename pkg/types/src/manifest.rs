use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The pod manifest a daemon set schedules: an id naming the pod plus an
/// opaque payload the controller never interprets. The node agent that
/// consumes intent entries is the only reader of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    id: String,
    #[serde(default)]
    payload: Value,
}

impl Manifest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The byte form persisted verbatim into intent entries.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn byte_form_roundtrips() {
        let manifest = Manifest::with_payload("testPod", json!({"image": "agent:1.4"}));
        let bytes = manifest.to_bytes().expect("encode");
        let back = Manifest::from_bytes(&bytes).expect("decode");
        assert_eq!(back, manifest);
        assert_eq!(back.id(), "testPod");
    }

    #[test]
    fn payload_defaults_to_null() {
        let back: Manifest = serde_json::from_str(r#"{"id":"testPod"}"#).expect("decode");
        assert_eq!(back, Manifest::new("testPod"));
    }
}
