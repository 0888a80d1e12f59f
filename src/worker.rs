//! Polling worker: sweep, claim, process one job end to end, repeat.

use crate::admission::AdmissionController;
use crate::api::SpeechSynthesizer;
use crate::config::Config;
use crate::media::MediaStore;
use crate::pipeline::{ScenePlan, load_reference, persist_attempt};
use crate::regenerate::RegenerationController;
use crate::store::{Claim, Database, Job, SubtitleStatus};
use crate::{loge, logi, logok, logw};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

pub const MISSING_NARRATION: &str = "narration missing";

/// How a claimed job ended from this worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        subtitle_status: SubtitleStatus,
        audio_duration: f64,
        synthesis_calls: u32,
    },
    Failed(String),
    /// Cancelled externally, or the claim was lost to the stuck sweep or another worker.
    Abandoned,
}

pub struct Worker {
    db: Arc<Database>,
    media: MediaStore,
    synth: Arc<dyn SpeechSynthesizer>,
    admission: AdmissionController,
    regeneration: RegenerationController,
    poll_interval: Duration,
    stuck_threshold: Duration,
    max_new_tokens: Option<u32>,
}

impl Worker {
    pub fn new(db: Arc<Database>, synth: Arc<dyn SpeechSynthesizer>, config: &Config) -> Self {
        Self {
            db,
            media: MediaStore::new(&config.media_root),
            synth,
            admission: AdmissionController::new(config.batch_concurrency),
            regeneration: RegenerationController::new(config.regeneration_rounds),
            poll_interval: config.poll_interval(),
            stuck_threshold: config.stuck_threshold(),
            max_new_tokens: Some(config.max_new_tokens).filter(|n| *n > 0),
        }
    }

    /// Shares an admission pool with other synthesis users in this process.
    pub fn with_admission(mut self, admission: AdmissionController) -> Self {
        self.admission = admission;
        self
    }

    /// Runs until `shutdown` flips to `true` or its sender goes away. A job already claimed is
    /// always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        logi(format!(
            "worker started (poll={:?}, stuck threshold={:?})",
            self.poll_interval, self.stuck_threshold
        ));

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => loge(format!("worker iteration failed: {e:#}")),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        logi("worker stopped");
        Ok(())
    }

    /// One loop iteration: stuck sweep, then claim and process at most one job.
    pub async fn run_once(&self) -> Result<Option<(Job, JobOutcome)>> {
        let recovered = self.db.sweep_stuck(self.stuck_threshold)?;
        if recovered > 0 {
            logw(format!("recovered {} stuck job(s)", recovered));
        }

        let Some(job) = self.db.claim_next_pending()? else {
            return Ok(None);
        };

        let span = tracing::info_span!("job", id = job.id, scene = job.scene_id);
        let outcome = match self.process_job(&job).instrument(span).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{e:#}");
                loge(format!("job {} failed: {}", job.id, message));
                match job.claim() {
                    Some(claim) if self.db.mark_failed(claim, &message)? => {
                        JobOutcome::Failed(message)
                    }
                    _ => JobOutcome::Abandoned,
                }
            }
        };
        Ok(Some((job, outcome)))
    }

    fn fail(&self, claim: Claim, message: impl Into<String>) -> Result<JobOutcome> {
        let message = message.into();
        logw(format!("job {} failed: {}", claim.job_id, message));
        if !self.db.mark_failed(claim, &message)? {
            logw(format!("job {} claim lost before failure was recorded", claim.job_id));
            return Ok(JobOutcome::Abandoned);
        }
        Ok(JobOutcome::Failed(message))
    }

    /// Processes a job claimed by this worker. Every write is fenced on the job's claim token.
    pub async fn process_job(&self, job: &Job) -> Result<JobOutcome> {
        let Some(claim) = job.claim() else {
            logi(format!("job {} was never claimed, skipped", job.id));
            return Ok(JobOutcome::Abandoned);
        };
        if !self.db.holds_claim(claim)? {
            logi(format!("job {} no longer ours, skipped", job.id));
            return Ok(JobOutcome::Abandoned);
        }

        let Some(scene) = self.db.get_scene(job.scene_id)? else {
            return self.fail(claim, format!("scene {} not found", job.scene_id));
        };
        logi(format!(
            "job {} started: project {} scene {}",
            job.id, scene.project_id, scene.scene_number
        ));

        let voice = self.db.voice_for_project(scene.project_id)?;
        let reference = load_reference(&self.media, voice.as_ref()).await;
        let Some(plan) = ScenePlan::build(&scene, voice.as_ref(), reference, self.max_new_tokens)
        else {
            return self.fail(claim, MISSING_NARRATION);
        };

        let permit = self.admission.acquire().await?;
        if !self.db.mark_processing_started(claim)? {
            logi(format!("job {} left processing before synthesis, skipped", job.id));
            return Ok(JobOutcome::Abandoned);
        }
        let result = self
            .regeneration
            .run(
                self.synth.as_ref(),
                &plan.request,
                &plan.narration,
                |_round| match self.db.mark_processing_started(claim) {
                    Ok(alive) => alive,
                    Err(e) => {
                        logw(format!("heartbeat failed: {e:#}"));
                        true
                    }
                },
            )
            .await;
        drop(permit);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(claim, e.to_string()),
        };

        if outcome.interrupted || !self.db.holds_claim(claim)? {
            logi(format!("job {} cancelled during synthesis, discarded", job.id));
            return Ok(JobOutcome::Abandoned);
        }

        let artifacts = persist_attempt(&self.db, &self.media, &plan, &outcome.attempt).await?;
        if !self.db.mark_completed(claim)? {
            logw(format!("job {} left processing before completion", job.id));
            return Ok(JobOutcome::Abandoned);
        }

        logok(format!(
            "job {} completed: scene {} {:.2}s, captions {} ({} calls)",
            job.id,
            plan.scene_number,
            artifacts.audio_duration,
            artifacts.subtitle_status,
            outcome.calls
        ));
        Ok(JobOutcome::Completed {
            subtitle_status: artifacts.subtitle_status,
            audio_duration: artifacts.audio_duration,
            synthesis_calls: outcome.calls,
        })
    }
}
