use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CHAT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant.";
const CHAT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptPayload {
    #[serde(default, alias = "message")]
    pub prompt: Option<String>,
    #[serde(default, alias = "system_instruction")]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl PromptPayload {
    pub fn into_generation_request(self) -> Result<GenerationRequest, String> {
        let prompt = self
            .prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .ok_or_else(|| "prompt must not be empty".to_owned())?;

        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
                return Err("temperature must be between 0 and 2".to_owned());
            }
        }
        if let Some(top_p) = self.top_p {
            if !top_p.is_finite() || top_p <= 0.0 || top_p > 1.0 {
                return Err("top_p must be in (0, 1]".to_owned());
            }
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be greater than zero".to_owned());
        }

        let system_instruction = self.system.filter(|system| !system.trim().is_empty());

        Ok(GenerationRequest {
            request_id: format!("req_{}", Uuid::new_v4()),
            prompt,
            system_instruction,
            sampling: SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                max_tokens: self.max_tokens,
            },
        })
    }
}

impl GenerationRequest {
    /// Fills the defaults used by the one-shot chat call when the caller left them out.
    pub fn with_chat_defaults(mut self) -> Self {
        if self.system_instruction.is_none() {
            self.system_instruction = Some(CHAT_SYSTEM_INSTRUCTION.to_owned());
        }
        if self.sampling.temperature.is_none() {
            self.sampling.temperature = Some(CHAT_TEMPERATURE);
        }
        self
    }
}

/// One ordered chunk of generated text. Concatenating every fragment of a
/// stream in arrival order yields the full reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(String);

impl Fragment {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Fragment {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Fragment {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub reply: String,
}

impl ChatReply {
    pub fn new(content: String) -> Self {
        let reply = if content.is_empty() {
            "(no reply)".to_owned()
        } else {
            content
        };
        Self { reply }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub up: bool,
    pub configured: bool,
    pub upstream: Option<String>,
}
