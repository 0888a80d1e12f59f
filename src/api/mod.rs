pub mod fish_speech;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use fish_speech::{FishSpeechClient, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("narration text is empty after preprocessing")]
    EmptyText,
    #[error("speech service timed out")]
    Timeout,
    #[error("speech service returned HTTP {0}")]
    Status(u16),
    #[error("malformed response archive: {0}")]
    Archive(String),
    #[error("speech service request failed: {0}")]
    Transport(String),
}

impl SynthesisError {
    /// Worth another attempt from the client itself.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Status(429) | Self::Status(503))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: Option<f64>,
    pub seed: i64,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.7,
            repetition_penalty: None,
            seed: 42,
        }
    }
}

/// Voice-cloning sample: raw audio plus what is said in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceVoice {
    pub audio: Vec<u8>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Preprocessed TTS text.
    pub text: String,
    pub voice: VoiceParams,
    pub reference: Option<Arc<ReferenceVoice>>,
    pub use_cache: bool,
    pub max_new_tokens: Option<u32>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice: VoiceParams) -> Self {
        Self {
            text: text.into(),
            voice,
            reference: None,
            use_cache: true,
            max_new_tokens: None,
        }
    }

    /// Copy with a different seed and the service-side cache bypassed.
    pub fn reseeded(&self, seed: i64) -> Self {
        let mut next = self.clone();
        next.voice.seed = seed;
        next.use_cache = false;
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOutput {
    pub audio: Vec<u8>,
    /// Raw word timing transcript, when the service packaged one.
    pub timing: Option<Vec<u8>>,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest)
    -> Result<SynthesisOutput, SynthesisError>;
}
