use super::{SpeechSynthesizer, SynthesisError, SynthesisOutput, SynthesisRequest};
use crate::config::Config;
use crate::{loge, logw};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::io::{Cursor, Read};
use std::time::Duration;

const AUDIO_ENTRY: &str = "audio.wav";
const ZIP_MAGIC: &[u8] = b"PK";

/// Client-side retries for timeouts and overload responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Wait before the second attempt; doubles for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// Longest one `synthesize` call can take when every attempt runs into `per_attempt`.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.attempts.max(1);
        let backoff: Duration = (0..attempts - 1).map(|n| self.delay_after(n)).sum();
        per_attempt.saturating_mul(attempts).saturating_add(backoff)
    }
}

#[derive(Debug, Serialize)]
struct ReferenceBody {
    audio: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    format: &'static str,
    use_memory_cache: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f64>,
    seed: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    references: Vec<ReferenceBody>,
}

fn build_body(request: &SynthesisRequest) -> TtsBody<'_> {
    let references = request
        .reference
        .iter()
        .filter(|r| !r.audio.is_empty() && !r.text.is_empty())
        .map(|r| ReferenceBody {
            audio: BASE64.encode(&r.audio),
            text: r.text.clone(),
        })
        .collect();

    TtsBody {
        text: &request.text,
        format: "wav",
        use_memory_cache: if request.use_cache { "on" } else { "off" },
        max_new_tokens: request.max_new_tokens,
        temperature: request.voice.temperature,
        top_p: request.voice.top_p,
        repetition_penalty: request.voice.repetition_penalty,
        seed: request.voice.seed,
        references,
    }
}

/// Splits a service response into audio and optional timing transcript.
///
/// A body starting with the ZIP magic is an archive holding `audio.wav` and optionally one
/// `*.srt` entry; anything else is raw audio.
pub fn unpack_response(body: &[u8]) -> Result<SynthesisOutput, SynthesisError> {
    if !body.starts_with(ZIP_MAGIC) {
        return Ok(SynthesisOutput {
            audio: body.to_vec(),
            timing: None,
        });
    }

    let archive_err = |e: zip::result::ZipError| SynthesisError::Archive(e.to_string());
    let mut archive = zip::ZipArchive::new(Cursor::new(body)).map_err(archive_err)?;

    let audio = read_entry(&mut archive, AUDIO_ENTRY)?;
    let srt_name = archive
        .file_names()
        .find(|name| name.to_ascii_lowercase().ends_with(".srt"))
        .map(str::to_owned);
    let timing = match srt_name {
        Some(name) => Some(read_entry(&mut archive, &name)?),
        None => None,
    };

    Ok(SynthesisOutput { audio, timing })
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, SynthesisError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| SynthesisError::Archive(format!("{name}: {e}")))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|e| SynthesisError::Archive(format!("{name}: {e}")))?;
    Ok(buf)
}

pub struct FishSpeechClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl FishSpeechClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Self::new(&config.fish_speech_url, config.request_timeout())?;
        Ok(client.with_retry(RetryPolicy {
            attempts: config.timeout_attempts,
            ..RetryPolicy::default()
        }))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/tts", self.base_url.trim_end_matches('/'))
    }

    async fn send_once(
        &self,
        url: &str,
        body: &TtsBody<'_>,
    ) -> Result<SynthesisOutput, SynthesisError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(SynthesisError::Status(status.as_u16()));
        }

        let bytes = resp.bytes().await.map_err(classify)?;
        unpack_response(&bytes)
    }
}

fn classify(err: reqwest::Error) -> SynthesisError {
    if err.is_timeout() {
        SynthesisError::Timeout
    } else {
        SynthesisError::Transport(err.to_string())
    }
}

#[async_trait]
impl SpeechSynthesizer for FishSpeechClient {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutput, SynthesisError> {
        if request.text.trim().is_empty() {
            return Err(SynthesisError::EmptyText);
        }

        let url = self.endpoint();
        let body = build_body(request);
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.send_once(&url, &body).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retriable() && attempt + 1 < attempts => {
                    let wait = self.retry.delay_after(attempt);
                    logw(format!(
                        "TTS {}; retrying in {:.1}s ({}/{})",
                        err,
                        wait.as_secs_f64(),
                        attempt + 1,
                        attempts
                    ));
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    loge(format!("TTS failed after {} attempt(s): {}", attempt + 1, err));
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ReferenceVoice, VoiceParams};
    use std::io::Write;
    use std::sync::Arc;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn raw_body_is_audio_without_timing() {
        let out = unpack_response(b"RIFF....WAVE").unwrap();
        assert_eq!(out.audio, b"RIFF....WAVE");
        assert!(out.timing.is_none());
    }

    #[test]
    fn archive_yields_audio_and_timing() {
        let body = archive(&[("audio.wav", &b"wav-bytes"[..]), ("audio.srt", &b"1\n..."[..])]);
        let out = unpack_response(&body).unwrap();
        assert_eq!(out.audio, b"wav-bytes");
        assert_eq!(out.timing.as_deref(), Some(&b"1\n..."[..]));
    }

    #[test]
    fn archive_without_timing_file() {
        let body = archive(&[("audio.wav", &b"wav-bytes"[..])]);
        let out = unpack_response(&body).unwrap();
        assert!(out.timing.is_none());
    }

    #[test]
    fn archive_without_audio_is_malformed() {
        let body = archive(&[("words.srt", &b"1"[..])]);
        assert!(matches!(unpack_response(&body), Err(SynthesisError::Archive(_))));
    }

    #[test]
    fn truncated_archive_is_malformed() {
        assert!(matches!(
            unpack_response(b"PK\x03\x04garbage"),
            Err(SynthesisError::Archive(_))
        ));
    }

    #[test]
    fn body_carries_voice_parameters_and_reference() {
        let mut request = SynthesisRequest::new(
            "안녕하세요",
            VoiceParams {
                temperature: 0.5,
                top_p: 0.8,
                repetition_penalty: Some(1.2),
                seed: 7,
            },
        );
        request.max_new_tokens = Some(2048);
        request.reference = Some(Arc::new(ReferenceVoice {
            audio: b"abc".to_vec(),
            text: "sample".into(),
        }));

        let json = serde_json::to_value(build_body(&request)).unwrap();
        assert_eq!(json["text"], "안녕하세요");
        assert_eq!(json["format"], "wav");
        assert_eq!(json["use_memory_cache"], "on");
        assert_eq!(json["max_new_tokens"], 2048);
        assert_eq!(json["seed"], 7);
        assert_eq!(json["references"][0]["audio"], "YWJj");
        assert_eq!(json["references"][0]["text"], "sample");
    }

    #[test]
    fn body_omits_optional_fields() {
        let request = SynthesisRequest::new("hi", VoiceParams::default()).reseeded(142);
        let json = serde_json::to_value(build_body(&request)).unwrap();
        assert_eq!(json["use_memory_cache"], "off");
        assert_eq!(json["seed"], 142);
        assert!(json.get("references").is_none());
        assert!(json.get("repetition_penalty").is_none());
        assert!(json.get("max_new_tokens").is_none());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(
            policy.worst_case(Duration::from_secs(180)),
            Duration::from_secs(543)
        );
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_any_request() {
        let client = FishSpeechClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let request = SynthesisRequest::new("   ", VoiceParams::default());
        assert_eq!(
            client.synthesize(&request).await,
            Err(SynthesisError::EmptyText)
        );
    }
}
