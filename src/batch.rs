//! Whole-project synthesis: every scene without audio, a bounded number at a time.

use crate::admission::AdmissionController;
use crate::api::SpeechSynthesizer;
use crate::media::MediaStore;
use crate::pipeline::{ScenePlan, load_reference, persist_attempt};
use crate::regenerate::RegenerationController;
use crate::store::{Claim, Database, SubtitleStatus};
use crate::{loge, logi, logok, logw};
use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub success: usize,
    pub errors: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Scenes accepted with a caption mismatch or unresolved truncation.
    pub warnings: usize,
    pub truncated_scenes: Vec<i64>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.success + self.errors
    }

    /// Fails when nothing attempted succeeded or failures outnumber successes.
    pub fn ensure_succeeded(&self) -> Result<()> {
        let attempted = self.attempted();
        if attempted == 0 {
            return Ok(());
        }
        if self.success == 0 {
            bail!("synthesis failed: all {} attempted scenes failed", attempted);
        }
        if self.errors > self.success {
            bail!(
                "synthesis failed: {} of {} scenes failed ({} succeeded)",
                self.errors,
                attempted,
                self.success
            );
        }
        Ok(())
    }
}

enum SceneResult {
    Done {
        scene_number: i64,
        status: SubtitleStatus,
    },
    Failed {
        scene_number: i64,
        message: String,
    },
    /// Another job holds the scene; nothing was synthesized or written.
    Busy {
        scene_number: i64,
    },
    Cancelled,
}

#[derive(Clone)]
pub struct BatchGenerator {
    pub db: Arc<Database>,
    pub media: MediaStore,
    pub synth: Arc<dyn SpeechSynthesizer>,
    pub admission: AdmissionController,
    pub regeneration: RegenerationController,
    pub max_new_tokens: Option<u32>,
}

impl BatchGenerator {
    /// Synthesizes every scene of the project that has text and no audio yet.
    ///
    /// Each scene runs under its own job claim, so a scene a worker is processing is skipped.
    /// Setting `cancel` to `true` stops scenes that have not started; scenes in flight stop at
    /// their next regeneration round and are not persisted.
    pub async fn generate_project(
        &self,
        project_id: i64,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchReport> {
        let scenes = self.db.scenes_for_project(project_id)?;
        let voice = self.db.voice_for_project(project_id)?;
        let reference = load_reference(&self.media, voice.as_ref()).await;

        let mut report = BatchReport::default();
        let mut tasks = JoinSet::new();

        for scene in &scenes {
            if scene.has_audio() {
                report.skipped += 1;
                continue;
            }
            let Some(plan) =
                ScenePlan::build(scene, voice.as_ref(), reference.clone(), self.max_new_tokens)
            else {
                logw(format!("scene {} skipped: narration missing", scene.scene_number));
                report.skipped += 1;
                continue;
            };

            let this = self.clone();
            let cancel = cancel.clone();
            let span = tracing::info_span!("scene", number = plan.scene_number);
            tasks.spawn(async move { this.run_scene(plan, cancel).await }.instrument(span));
        }

        if tasks.is_empty() {
            logi(format!(
                "project {}: nothing to generate, {} skipped",
                project_id, report.skipped
            ));
            return Ok(report);
        }

        logi(format!(
            "project {}: generating {} scene(s), {} at a time",
            project_id,
            tasks.len(),
            self.admission.capacity()
        ));

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(SceneResult::Done {
                    scene_number,
                    status,
                }) => {
                    report.success += 1;
                    match status {
                        SubtitleStatus::Truncated => {
                            report.warnings += 1;
                            report.truncated_scenes.push(scene_number);
                        }
                        SubtitleStatus::Mismatch => report.warnings += 1,
                        SubtitleStatus::Matched | SubtitleStatus::None => {}
                    }
                }
                Ok(SceneResult::Failed {
                    scene_number,
                    message,
                }) => {
                    loge(format!("scene {} failed: {}", scene_number, message));
                    report.errors += 1;
                }
                Ok(SceneResult::Busy { scene_number }) => {
                    logw(format!("scene {} skipped: a job is already in flight", scene_number));
                    report.skipped += 1;
                }
                Ok(SceneResult::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    loge(format!("scene task aborted: {e}"));
                    report.errors += 1;
                }
            }
        }

        report.truncated_scenes.sort_unstable();
        if !report.truncated_scenes.is_empty() {
            logw(format!(
                "scenes still truncated after regeneration: {:?}",
                report.truncated_scenes
            ));
        }
        logok(format!(
            "project {}: {} generated, {} failed, {} skipped, {} warnings",
            project_id, report.success, report.errors, report.skipped, report.warnings
        ));
        Ok(report)
    }

    async fn run_scene(self, plan: ScenePlan, cancel: watch::Receiver<bool>) -> SceneResult {
        let scene_number = plan.scene_number;
        let failed = |message: String| SceneResult::Failed {
            scene_number,
            message,
        };
        let _permit = match self.admission.acquire().await {
            Ok(permit) => permit,
            Err(e) => return failed(format!("{e:#}")),
        };
        if *cancel.borrow() {
            return SceneResult::Cancelled;
        }

        let claim = match self.db.claim_scene(plan.project_id, plan.scene_id) {
            Ok(Some(job)) => match job.claim() {
                Some(claim) => claim,
                None => return failed(format!("job {} came back without a claim", job.id)),
            },
            Ok(None) => return SceneResult::Busy { scene_number },
            Err(e) => return failed(format!("{e:#}")),
        };

        logi(format!(
            "scene {} synthesis started (job {})",
            scene_number, claim.job_id
        ));
        let result = self
            .regeneration
            .run(self.synth.as_ref(), &plan.request, &plan.narration, |_| {
                if *cancel.borrow() {
                    return false;
                }
                match self.db.mark_processing_started(claim) {
                    Ok(alive) => alive,
                    Err(e) => {
                        logw(format!("heartbeat failed: {e:#}"));
                        true
                    }
                }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(claim, failed(e.to_string())),
        };
        match self.db.holds_claim(claim) {
            Ok(true) if !outcome.interrupted => {}
            Ok(_) => {
                if let Err(e) = self.db.release_claim(claim) {
                    logw(format!("job {} release failed: {e:#}", claim.job_id));
                }
                return SceneResult::Cancelled;
            }
            Err(e) => return failed(format!("{e:#}")),
        }

        let artifacts = match persist_attempt(&self.db, &self.media, &plan, &outcome.attempt).await {
            Ok(artifacts) => artifacts,
            Err(e) => return self.fail(claim, failed(format!("{e:#}"))),
        };
        match self.db.mark_completed(claim) {
            Ok(true) => {}
            Ok(false) => {
                logw(format!("job {} left processing before completion", claim.job_id));
                return SceneResult::Cancelled;
            }
            Err(e) => return failed(format!("{e:#}")),
        }

        logok(format!(
            "scene {} done: {:.2}s, captions {}",
            scene_number, artifacts.audio_duration, artifacts.subtitle_status
        ));
        SceneResult::Done {
            scene_number,
            status: artifacts.subtitle_status,
        }
    }

    /// Records a scene failure on its job and passes the result through.
    fn fail(&self, claim: Claim, result: SceneResult) -> SceneResult {
        if let SceneResult::Failed { message, .. } = &result {
            if let Err(e) = self.db.mark_failed(claim, message) {
                logw(format!("job {} failure not recorded: {e:#}", claim.job_id));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: usize, errors: usize) -> BatchReport {
        BatchReport {
            success,
            errors,
            ..Default::default()
        }
    }

    #[test]
    fn nothing_attempted_is_fine() {
        assert!(report(0, 0).ensure_succeeded().is_ok());
    }

    #[test]
    fn all_failed_is_an_error() {
        assert!(report(0, 2).ensure_succeeded().is_err());
    }

    #[test]
    fn majority_failure_is_an_error() {
        assert!(report(1, 2).ensure_succeeded().is_err());
        assert!(report(2, 2).ensure_succeeded().is_ok());
    }
}
