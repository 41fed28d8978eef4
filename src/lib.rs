pub mod cli;
pub mod error;
pub mod events;
pub mod experiment;
pub mod providers;
pub mod session;
pub mod web;

use std::env;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

pub use error::StudyError;
use providers::{
    AnthropicRequest, AnthropicStreamEvent, OpenAIChatRequest, OpenAIChunk, Provider, WireMessage,
};
use session::Message;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";

// ---------------------------------------------------------------------------
// CompletionClient — streaming chat-completion adapter
// ---------------------------------------------------------------------------

/// Wraps the hosted chat-completion endpoint. The full ordered transcript is
/// resent on every call; the remote API holds no conversation state.
pub struct CompletionClient {
    client: Client,
    api_key: String,
    pub provider: Provider,
    pub model: String,
}

impl CompletionClient {
    /// Build a client whose credential comes from the provider's environment
    /// variable. A missing credential is fatal; callers check this before
    /// serving any page.
    pub fn new(provider: Provider, model: String) -> Result<Self, StudyError> {
        let api_key = env::var(provider.key_var())
            .map_err(|_| StudyError::MissingCredential { provider })?;
        Ok(Self::with_api_key(provider, model, api_key))
    }

    /// Build a client with an explicit credential (tests, secret stores).
    pub fn with_api_key(provider: Provider, model: String, api_key: String) -> Self {
        // Connect timeout only: an overall deadline would kill long streams.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        CompletionClient {
            client,
            api_key,
            provider,
            model,
        }
    }

    /// Issue one streaming completion over the given transcript.
    ///
    /// The returned stream yields text fragments in arrival order and ends
    /// when the remote side signals completion. Dropping or aborting the
    /// stream cancels the in-flight request; whatever partial buffer the
    /// caller accumulated is theirs to discard.
    pub fn stream_completion(&self, transcript: &[Message]) -> CompletionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let messages: Vec<WireMessage> = transcript.iter().map(WireMessage::from).collect();
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let provider = self.provider;

        let handle = tokio::spawn(async move {
            let result = match provider {
                Provider::Openai => {
                    stream_openai(&client, &api_key, &model, messages, &tx).await
                }
                Provider::Anthropic => {
                    stream_anthropic(&client, &api_key, &model, messages, &tx).await
                }
            };
            if let Err(e) = result {
                let _ = tx.send(Err(e));
            }
        });

        CompletionStream { rx, handle }
    }
}

/// Pull-based handle over one in-flight completion.
///
/// `next_fragment` returns `None` once the remote stream is exhausted; an
/// `Err` fragment means the turn failed and no further fragments follow.
pub struct CompletionStream {
    rx: mpsc::UnboundedReceiver<Result<String, StudyError>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CompletionStream {
    pub async fn next_fragment(&mut self) -> Option<Result<String, StudyError>> {
        self.rx.recv().await
    }

    /// Cancel the in-flight request and discard anything not yet pulled.
    pub fn abort(self) {
        self.handle.abort();
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// OpenAI streaming
// ---------------------------------------------------------------------------

async fn stream_openai(
    client: &Client,
    api_key: &str,
    model: &str,
    messages: Vec<WireMessage>,
    tx: &mpsc::UnboundedSender<Result<String, StudyError>>,
) -> Result<(), StudyError> {
    let request = OpenAIChatRequest {
        model: model.to_string(),
        messages,
        stream: true,
        temperature: 0.7,
    };

    let response = client
        .post(OPENAI_CHAT_URL)
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(StudyError::Api {
            provider: Provider::Openai,
            detail,
        });
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer.drain(..=line_end);

            if line == "data: [DONE]" {
                return Ok(());
            }
            if let Some(text) = parse_openai_line(&line) {
                if tx.send(Ok(text)).is_err() {
                    // Consumer went away; stop pulling from the remote.
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Extract the content fragment from one OpenAI SSE line. Non-data lines,
/// unparseable payloads, and empty deltas yield `None` and are skipped.
fn parse_openai_line(line: &str) -> Option<String> {
    let json_str = line.strip_prefix("data: ")?;
    let chunk: OpenAIChunk = serde_json::from_str(json_str).ok()?;
    let content = chunk.choices.first()?.delta.content.as_deref()?;
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

// ---------------------------------------------------------------------------
// Anthropic streaming
// ---------------------------------------------------------------------------

async fn stream_anthropic(
    client: &Client,
    api_key: &str,
    model: &str,
    messages: Vec<WireMessage>,
    tx: &mpsc::UnboundedSender<Result<String, StudyError>>,
) -> Result<(), StudyError> {
    let request = AnthropicRequest {
        model: model.to_string(),
        messages,
        max_tokens: 4096,
        stream: true,
        temperature: 0.7,
    };

    let response = client
        .post(ANTHROPIC_MESSAGES_URL)
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(StudyError::Api {
            provider: Provider::Anthropic,
            detail,
        });
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer.drain(..=line_end);

            if let Some(event) = parse_anthropic_line(&line) {
                match event.event_type.as_str() {
                    "content_block_delta" => {
                        if let Some(text) = event.delta.and_then(|d| d.text) {
                            if !text.is_empty() && tx.send(Ok(text)).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    "message_stop" => return Ok(()),
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

/// Parse one Anthropic SSE line into its event, skipping anything that is
/// not a `data:` payload.
fn parse_anthropic_line(line: &str) -> Option<AnthropicStreamEvent> {
    let json_str = line.strip_prefix("data: ")?;
    serde_json::from_str(json_str).ok()
}
