//! Decides how a completion request is delivered.
//!
//! Some Copilot models only answer in streaming form. A non-streaming request
//! for one of them is sent upstream with `stream: true` and the fragments are
//! folded into a single reply ([`DeliveryMode::Buffered`]). Everything else is
//! relayed byte-for-byte ([`DeliveryMode::PassThrough`]).

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    PassThrough,
    Buffered,
}

/// The parts of a request body that matter for routing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestIntent {
    pub model: Option<String>,
    pub stream: bool,
}

#[derive(Deserialize)]
struct IntentProbe {
    #[serde(default)]
    model: Option<serde_json::Value>,
    #[serde(default)]
    stream: Option<serde_json::Value>,
}

impl RequestIntent {
    /// Reads `model` and `stream` from a JSON body. Anything unreadable
    /// (empty body, non-JSON, wrong field types) yields the default intent,
    /// which routes to pass-through.
    pub fn from_body(body: &[u8]) -> Self {
        let Ok(probe) = serde_json::from_slice::<IntentProbe>(body) else {
            return Self::default();
        };
        Self {
            model: probe
                .model
                .and_then(|m| m.as_str().map(str::to_string)),
            stream: probe
                .stream
                .and_then(|s| s.as_bool())
                .unwrap_or(false),
        }
    }
}

/// Model-name prefixes whose non-streaming requests must be emulated.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPolicy {
    buffered_prefixes: Vec<String>,
}

impl DeliveryPolicy {
    pub fn new(buffered_prefixes: Vec<String>) -> Self {
        Self { buffered_prefixes }
    }

    /// Pure function of (model name, requested-streaming flag).
    pub fn mode_for(&self, model: Option<&str>, stream: bool) -> DeliveryMode {
        if stream {
            return DeliveryMode::PassThrough;
        }
        match model {
            Some(model)
                if self
                    .buffered_prefixes
                    .iter()
                    .any(|prefix| model.starts_with(prefix.as_str())) =>
            {
                DeliveryMode::Buffered
            }
            _ => DeliveryMode::PassThrough,
        }
    }

    pub fn classify(&self, intent: &RequestIntent) -> DeliveryMode {
        self.mode_for(intent.model.as_deref(), intent.stream)
    }
}
