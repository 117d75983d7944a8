use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Trait for type-safe queue events.
///
/// `EVENT_TYPE` is the name persisted in the `class_name` column; it selects
/// the decoder when the row is read back, so it must stay stable across
/// releases (`{domain}.{event}.v{major}` is the convention used here).
pub trait QueueEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// Type name plus encoded body, exactly as stored in a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub class_name: String,
    pub payload: String,
}

impl EventEnvelope {
    pub fn encode<E: QueueEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            class_name: E::EVENT_TYPE.to_string(),
            payload: serde_json::to_string(event)?,
        })
    }

    pub fn decode<E: QueueEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}
