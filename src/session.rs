use serde::{Deserialize, Serialize};

const SESSION_END: &str = "SESSION_END";

/// The counter report a client sends on the session lane when it closes. Encoded as a
/// UTF-8 JSON object; unknown keys are ignored on decode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub total_reliable_sent: u64,
    pub total_unreliable_sent: u64,
}

impl SessionSummary {
    pub fn new(total_reliable_sent: u64, total_unreliable_sent: u64) -> Self {
        Self {
            kind: SESSION_END.to_owned(),
            total_reliable_sent,
            total_unreliable_sent,
        }
    }

    pub fn is_session_end(&self) -> bool {
        self.kind == SESSION_END
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
