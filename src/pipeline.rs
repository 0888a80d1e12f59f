//! One synthesis attempt for one scene: request preparation, caption assessment and
//! persistence of the attempt that is finally accepted.

use crate::align::align_to_narration;
use crate::api::{ReferenceVoice, SynthesisOutput, SynthesisRequest, VoiceParams};
use crate::audio::wav_duration_seconds;
use crate::media::MediaStore;
use crate::srt::parse_timings;
use crate::store::{Database, Scene, SceneArtifacts, SubtitleStatus, Voice};
use crate::text::{narration_words, preprocess_for_tts};
use crate::truncation::{TruncationVerdict, detect_truncation};
use crate::{logi, logw};
use anyhow::Result;
use std::borrow::Cow;
use std::sync::Arc;

/// Normalized texts and the base request for one scene.
#[derive(Debug, Clone)]
pub struct ScenePlan {
    pub scene_id: i64,
    pub project_id: i64,
    pub scene_number: i64,
    /// Caption narration, normalized exactly like the synthesis text.
    pub narration: String,
    pub request: SynthesisRequest,
}

impl ScenePlan {
    /// `None` when there is nothing to speak after preprocessing.
    pub fn build(
        scene: &Scene,
        voice: Option<&Voice>,
        reference: Option<Arc<ReferenceVoice>>,
        max_new_tokens: Option<u32>,
    ) -> Option<Self> {
        let tts_text = preprocess_for_tts(scene.tts_text());
        if tts_text.is_empty() {
            return None;
        }
        if tts_text != scene.tts_text() {
            logi(format!(
                "scene {} text preprocessed: {:?} -> {:?}",
                scene.scene_number,
                crate::truncate_chars(scene.tts_text(), 30),
                crate::truncate_chars(&tts_text, 30)
            ));
        }

        let params = voice.map(voice_params).unwrap_or_default();
        let mut request = SynthesisRequest::new(tts_text, params);
        request.reference = reference;
        request.max_new_tokens = max_new_tokens;

        Some(Self {
            scene_id: scene.id,
            project_id: scene.project_id,
            scene_number: scene.scene_number,
            narration: preprocess_for_tts(&scene.narration),
            request,
        })
    }
}

pub fn voice_params(voice: &Voice) -> VoiceParams {
    VoiceParams {
        temperature: voice.temperature,
        top_p: voice.top_p,
        repetition_penalty: voice.repetition_penalty,
        seed: voice.seed,
    }
}

/// Loads the voice-cloning sample; a missing or unreadable file only costs the cloning.
pub async fn load_reference(media: &MediaStore, voice: Option<&Voice>) -> Option<Arc<ReferenceVoice>> {
    let voice = voice?;
    let path = voice.reference_audio.as_ref()?;
    if voice.reference_text.trim().is_empty() {
        return None;
    }
    match media.read(path).await {
        Ok(audio) => Some(Arc::new(ReferenceVoice {
            audio,
            text: voice.reference_text.clone(),
        })),
        Err(e) => {
            logw(format!("reference voice load failed: {e:#}"));
            None
        }
    }
}

/// A synthesis result judged against the narration.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub audio: Vec<u8>,
    pub seed: i64,
    /// Caption file to store: aligned captions, or the raw transcript when it could not be aligned.
    pub caption: Option<Vec<u8>>,
    pub status: SubtitleStatus,
    pub timing_word_count: usize,
    pub narration_word_count: usize,
    pub verdict: TruncationVerdict,
}

impl Attempt {
    pub fn assess(output: SynthesisOutput, seed: i64, narration: &str) -> Self {
        let narration_word_count = narration_words(narration).len();
        let mut attempt = Attempt {
            audio: output.audio,
            seed,
            caption: None,
            status: SubtitleStatus::None,
            timing_word_count: 0,
            narration_word_count,
            verdict: TruncationVerdict::default(),
        };

        let Some(raw) = output.timing else {
            return attempt;
        };

        let content = decode_transcript(&raw);
        let entries = parse_timings(&content);
        logi(format!("timing transcript parsed: {} entries", entries.len()));

        if entries.is_empty() || narration.is_empty() {
            logw(format!(
                "timing transcript not aligned (entries={}, narration={})",
                entries.len(),
                !narration.is_empty()
            ));
            attempt.caption = Some(raw);
            return attempt;
        }

        let alignment = align_to_narration(&entries, narration);
        let verdict = detect_truncation(&alignment, &entries);
        if verdict.truncated {
            logw(format!("audio truncated: {}", verdict.detail));
        }

        attempt.status = if verdict.truncated {
            SubtitleStatus::Truncated
        } else if alignment.is_valid {
            SubtitleStatus::Matched
        } else {
            SubtitleStatus::Mismatch
        };
        attempt.timing_word_count = alignment.timing_word_count;
        attempt.narration_word_count = alignment.narration_word_count;
        attempt.caption = Some(alignment.to_srt().into_bytes());
        attempt.verdict = verdict;
        attempt
    }

    pub fn is_truncated(&self) -> bool {
        self.verdict.truncated
    }
}

/// Writes the accepted attempt's files and updates the scene row.
/// Decodes the timing transcript, replacing invalid UTF-8 and saying so.
fn decode_transcript(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(e) => {
            logw(format!(
                "timing transcript is not valid UTF-8 (first bad byte at {}), decoding lossily",
                e.valid_up_to()
            ));
            String::from_utf8_lossy(raw)
        }
    }
}

pub async fn persist_attempt(
    db: &Database,
    media: &MediaStore,
    plan: &ScenePlan,
    attempt: &Attempt,
) -> Result<SceneArtifacts> {
    let audio_path = media
        .write_audio(plan.project_id, plan.scene_number, &attempt.audio)
        .await?;

    let audio_duration = match wav_duration_seconds(&attempt.audio) {
        Ok(secs) => secs,
        Err(e) => {
            logw(format!("audio duration unavailable: {e:#}"));
            0.0
        }
    };

    let subtitle_path = match &attempt.caption {
        Some(caption) => Some(
            media
                .write_subtitles(plan.project_id, plan.scene_number, caption)
                .await?,
        ),
        None => {
            media
                .remove(&MediaStore::subtitle_rel_path(plan.project_id, plan.scene_number))
                .await?;
            None
        }
    };

    let artifacts = SceneArtifacts {
        audio_path,
        audio_duration,
        subtitle_path,
        subtitle_status: attempt.status,
        subtitle_word_count: attempt.timing_word_count,
        narration_word_count: attempt.narration_word_count,
    };
    db.save_artifacts(plan.scene_id, &artifacts)?;
    Ok(artifacts)
}
