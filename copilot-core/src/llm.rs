use crate::error::IncidentError;
use futures::future::BoxFuture;
use futures::FutureExt;
use rig::client::{completion::CompletionClient, transcription::TranscriptionClient};
use rig::completion::{Chat, Message as RigMessage};
use rig::providers::openai;
use rig::transcription::TranscriptionModel;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub transcription_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            transcription_model: "whisper-1".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub temperature: f64,
    pub max_tokens: u64,
}

impl InferenceParams {
    pub fn new(temperature: f64, max_tokens: u64) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Black-box text generation. Failures surface as `IncidentError::Service`.
pub trait Inference: Send + Sync {
    fn infer<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        params: InferenceParams,
    ) -> BoxFuture<'a, Result<String, IncidentError>>;
}

/// Black-box speech-to-text. Empty output means "no input".
pub trait Transcriber: Send + Sync {
    fn transcribe<'a>(&'a self, audio: &'a [u8]) -> BoxFuture<'a, Result<String, IncidentError>>;
}

fn client(config: &LlmConfig) -> Result<openai::Client, IncidentError> {
    if config.provider.to_lowercase() != "openai" {
        return Err(IncidentError::Service(format!(
            "unsupported llm provider '{}'",
            config.provider
        )));
    }

    // Read the key ourselves: rig's `from_env` panics when it is unset.
    let api_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| IncidentError::Service(format!("missing env var {}", config.api_key_env)))?;
    openai::Client::new(&api_key)
        .map_err(|e| IncidentError::Service(format!("openai client error: {e}")))
}

/// [`Inference`] over a rig provider agent. System messages become the
/// preamble; the last message is the prompt and the rest are chat history.
#[derive(Clone, Debug)]
pub struct RigInference {
    config: LlmConfig,
}

impl RigInference {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

impl Inference for RigInference {
    fn infer<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        params: InferenceParams,
    ) -> BoxFuture<'a, Result<String, IncidentError>> {
        async move {
            let (preamble, mut history) = split_for_rig(messages);
            let prompt = history
                .pop()
                .ok_or_else(|| IncidentError::Service("inference called without a prompt".into()))?;

            let agent = client(&self.config)?
                .agent(&self.config.model)
                .preamble(&preamble)
                .temperature(params.temperature)
                .max_tokens(params.max_tokens)
                .build();

            agent
                .chat(prompt, history)
                .await
                .map_err(|e| IncidentError::Service(format!("llm prompt failed: {e}")))
        }
        .boxed()
    }
}

fn split_for_rig(messages: &[ChatMessage]) -> (String, Vec<RigMessage>) {
    let preamble = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let history = messages
        .iter()
        .filter_map(|m| match m.role {
            ChatRole::System => None,
            ChatRole::User => Some(RigMessage::user(m.content.clone())),
            ChatRole::Assistant => Some(RigMessage::assistant(m.content.clone())),
        })
        .collect();
    (preamble, history)
}

#[derive(Clone, Debug)]
pub struct RigTranscriber {
    config: LlmConfig,
}

impl RigTranscriber {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

impl Transcriber for RigTranscriber {
    fn transcribe<'a>(&'a self, audio: &'a [u8]) -> BoxFuture<'a, Result<String, IncidentError>> {
        async move {
            let model = client(&self.config)?.transcription_model(&self.config.transcription_model);
            let response = model
                .transcription_request()
                .data(audio.to_vec())
                .filename(Some("recording.webm".into()))
                .send()
                .await
                .map_err(|e| IncidentError::Service(format!("transcription failed: {e}")))?;
            Ok(response.text.trim().to_string())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_fold_into_preamble() {
        let messages = vec![
            ChatMessage::system("persona"),
            ChatMessage::user("what broke?"),
            ChatMessage::assistant("the cache"),
            ChatMessage::system("incident context"),
            ChatMessage::user("how do we fix it?"),
        ];
        let (preamble, history) = split_for_rig(&messages);
        assert_eq!(preamble, "persona\n\nincident context");
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn unsupported_provider_is_a_service_error() {
        let config = LlmConfig {
            provider: "carrier-pigeon".into(),
            ..LlmConfig::default()
        };
        assert!(matches!(client(&config), Err(IncidentError::Service(_))));
    }

    #[test]
    fn missing_api_key_is_a_service_error() {
        let config = LlmConfig {
            api_key_env: "COPILOT_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..LlmConfig::default()
        };
        match client(&config) {
            Err(IncidentError::Service(message)) => {
                assert!(message.contains("COPILOT_TEST_KEY_THAT_IS_NEVER_SET"))
            }
            other => panic!("expected a service error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn inference_without_a_key_fails_instead_of_panicking() {
        let inference = RigInference::new(LlmConfig {
            api_key_env: "COPILOT_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..LlmConfig::default()
        });
        let messages = [ChatMessage::system("persona"), ChatMessage::user("status?")];
        let result = inference.infer(&messages, InferenceParams::new(0.5, 64)).await;
        assert!(matches!(result, Err(IncidentError::Service(_))));
    }
}
