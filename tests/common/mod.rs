#![allow(dead_code)]

use async_trait::async_trait;
use scene_tts::api::{SpeechSynthesizer, SynthesisError, SynthesisOutput, SynthesisRequest};
use scene_tts::config::Config;
use scene_tts::store::Database;
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub fn wav(seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buf, spec).unwrap();
        for _ in 0..(seconds * 8000.0) as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    buf.into_inner()
}

/// Word timing transcript with one block per word, 300 ms each unless overridden.
pub fn timing(words: &[&str]) -> String {
    timing_with(&words.iter().map(|w| (*w, 300)).collect::<Vec<_>>())
}

pub fn timing_with(words: &[(&str, u64)]) -> String {
    let mut start = 0;
    let blocks: Vec<_> = words
        .iter()
        .map(|(w, ms)| {
            let block = (Duration::from_millis(start), Duration::from_millis(start + ms), *w);
            start += ms;
            block
        })
        .collect();
    scene_tts::srt::render_blocks(blocks)
}

pub fn archive(audio: &[u8], srt: Option<&str>) -> Vec<u8> {
    let options = zip::write::SimpleFileOptions::default();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("audio.wav", options).unwrap();
    writer.write_all(audio).unwrap();
    if let Some(srt) = srt {
        writer.start_file("audio.srt", options).unwrap();
        writer.write_all(srt.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Replays scripted results in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedSynth {
    replies: Mutex<VecDeque<Result<SynthesisOutput, SynthesisError>>>,
    pub requests: Mutex<Vec<SynthesisRequest>>,
    /// Signalled each time a call starts.
    pub started: Notify,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedSynth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, seconds: f64, srt: Option<String>) -> &Self {
        self.replies.lock().unwrap().push_back(Ok(SynthesisOutput {
            audio: wav(seconds),
            timing: srt.map(String::into_bytes),
        }));
        self
    }

    pub fn fail(&self, err: SynthesisError) -> &Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    /// Every later call blocks until `release` is notified once for it.
    pub fn hold(&self, release: Arc<Notify>) -> &Self {
        *self.gate.lock().unwrap() = Some(release);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn seeds(&self) -> Vec<i64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.voice.seed)
            .collect()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutput, SynthesisError> {
        self.requests.lock().unwrap().push(request.clone());
        self.started.notify_one();
        let gate = self.gate.lock().unwrap().clone();
        if let Some(release) = gate {
            release.notified().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(SynthesisError::Status(599)))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub db: Arc<Database>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("tts.db"),
            media_root: dir.path().join("media"),
            poll_interval_secs: 1,
            ..Config::default()
        };
        let db = Arc::new(Database::open(&config.database_path).unwrap());
        Self { dir, config, db }
    }

    /// Project with one scene and a queued job; returns (scene_id, job_id).
    pub fn queue_scene(&self, narration: &str) -> (i64, i64) {
        let project = self.db.add_project("demo", None).unwrap();
        let scene = self.db.add_scene(project, 1, narration, "").unwrap();
        let job = self.db.create_job(project, scene).unwrap();
        (scene, job)
    }
}

pub struct StubResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl StubResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: b"error".to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next scripted response.
pub struct StubServer {
    pub url: String,
    pub bodies: Arc<Mutex<Vec<serde_json::Value>>>,
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

pub async fn serve(responses: Vec<StubResponse>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&bodies);

    tokio::spawn(async move {
        let mut queue: VecDeque<StubResponse> = responses.into();
        while let Ok((mut stream, _)) = listener.accept().await {
            let response = queue.pop_front().unwrap_or_else(|| StubResponse::status(500));
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let body_start = loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(end) = header_end(&buf) {
                        break end;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..body_start]).into_owned();
                let wanted = body_start + content_length(&head);
                while buf.len() < wanted {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                if let Ok(json) = serde_json::from_slice(&buf[body_start..]) {
                    recorded.lock().unwrap().push(json);
                }

                tokio::time::sleep(response.delay).await;
                let head = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    response.status,
                    response.body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&response.body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    StubServer { url, bodies }
}
