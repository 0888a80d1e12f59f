//! Project-level steps run on demand by the control tool.

use crate::audit::{AuditedFile, audit_directory};
use crate::batch::{BatchGenerator, BatchReport};
use crate::logi;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    TtsGenerate,
    CaptionAudit,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::TtsGenerate => "tts_generate",
            StepKind::CaptionAudit => "caption_audit",
        }
    }

    pub fn handler(&self) -> &'static dyn StepHandler {
        match self {
            StepKind::TtsGenerate => &TtsGenerateStep,
            StepKind::CaptionAudit => &CaptionAuditStep,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tts_generate" => Ok(StepKind::TtsGenerate),
            "caption_audit" => Ok(StepKind::CaptionAudit),
            other => anyhow::bail!("unknown step: {}", other),
        }
    }
}

pub struct StepContext {
    pub generator: BatchGenerator,
    pub cancel: watch::Receiver<bool>,
}

#[derive(Debug)]
pub enum StepReport {
    Generated(BatchReport),
    Audited(Vec<AuditedFile>),
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext, project_id: i64) -> Result<StepReport>;
}

pub struct TtsGenerateStep;

#[async_trait]
impl StepHandler for TtsGenerateStep {
    async fn execute(&self, ctx: &StepContext, project_id: i64) -> Result<StepReport> {
        let report = ctx
            .generator
            .generate_project(project_id, ctx.cancel.clone())
            .await?;
        report.ensure_succeeded()?;
        Ok(StepReport::Generated(report))
    }
}

pub struct CaptionAuditStep;

#[async_trait]
impl StepHandler for CaptionAuditStep {
    async fn execute(&self, ctx: &StepContext, project_id: i64) -> Result<StepReport> {
        let dir = ctx.generator.media.subtitle_dir(project_id);
        if !dir.is_dir() {
            logi(format!("project {}: no caption files yet", project_id));
            return Ok(StepReport::Audited(Vec::new()));
        }
        Ok(StepReport::Audited(audit_directory(&dir)?))
    }
}

pub async fn run_step(kind: StepKind, ctx: &StepContext, project_id: i64) -> Result<StepReport> {
    logi(format!("step {} started for project {}", kind, project_id));
    kind.handler().execute(ctx, project_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in [StepKind::TtsGenerate, StepKind::CaptionAudit] {
            assert_eq!(kind.as_str().parse::<StepKind>().unwrap(), kind);
        }
        assert!("render_video".parse::<StepKind>().is_err());
    }
}
