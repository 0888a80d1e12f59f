use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use scene_tts::admission::AdmissionController;
use scene_tts::api::{FishSpeechClient, VoiceParams};
use scene_tts::audit::{AuditFinding, AuditedFile, audit_directory};
use scene_tts::batch::BatchGenerator;
use scene_tts::config::Config;
use scene_tts::media::MediaStore;
use scene_tts::regenerate::RegenerationController;
use scene_tts::steps::{StepContext, StepKind, StepReport, run_step};
use scene_tts::store::{Database, NewVoice};
use scene_tts::{init_tracing, logi, logok, logw};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Entries printed per finding before eliding the rest.
const SHOWN_ENTRIES: usize = 5;

/// Operator tool for the narration job queue.
#[derive(Parser, Debug)]
#[command(name = "tts-ctl", version)]
struct Cli {
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage voices
    #[command(subcommand)]
    Voice(VoiceCommand),
    /// Manage scenes
    #[command(subcommand)]
    Scene(SceneCommand),
    /// Queue synthesis jobs for a project's scenes
    Enqueue {
        project: i64,
        /// Only this scene number
        #[arg(long)]
        scene: Option<i64>,
    },
    /// Cancel a pending or processing job
    Cancel { job: i64 },
    /// Show one job
    Status { job: i64 },
    /// List jobs
    List {
        #[arg(long)]
        project: Option<i64>,
    },
    /// Return stuck processing jobs to the queue
    Sweep {
        /// Seconds in processing before a job counts as stuck
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Synthesize every scene of a project that has no audio yet
    Generate { project: i64 },
    /// Flag caption files whose timing suggests clipped audio
    Audit {
        #[arg(long, conflicts_with = "dir", required_unless_present = "dir")]
        project: Option<i64>,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Add {
        name: String,
        #[arg(long)]
        voice: Option<i64>,
    },
    SetVoice {
        project: i64,
        voice: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum VoiceCommand {
    Add {
        name: String,
        /// Reference audio for voice cloning, relative to the media root or absolute
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Transcript of the reference audio
        #[arg(long, default_value = "")]
        reference_text: String,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        top_p: Option<f64>,
        #[arg(long)]
        repetition_penalty: Option<f64>,
        #[arg(long)]
        seed: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum SceneCommand {
    Add {
        project: i64,
        number: i64,
        narration: String,
        /// Narration with numerals spelled out for speech
        #[arg(long, default_value = "")]
        tts: String,
    },
    /// List a project's scenes with their caption status
    List { project: i64 },
}

fn print_audit(files: &[AuditedFile]) {
    println!("{} file(s) flagged", files.len());
    for file in files {
        println!("\n{}", file.path.display());
        match &file.finding {
            AuditFinding::TailCompression {
                total_entries,
                head_avg_ms,
                tail_avg_ms,
                ratio,
                tail,
            } => {
                println!(
                    "  tail compression: {} entries, head avg {}ms, tail avg {}ms (1/{})",
                    total_entries, head_avg_ms, tail_avg_ms, ratio
                );
                for e in tail.iter().take(SHOWN_ENTRIES) {
                    println!("    #{}: {} -> {}ms", e.position, e.text, e.duration_ms);
                }
                if tail.len() > SHOWN_ENTRIES {
                    println!("    ... {} more", tail.len() - SHOWN_ENTRIES);
                }
            }
            AuditFinding::ConsecutiveFast { streaks } => {
                for streak in streaks {
                    println!("  {} consecutive fast entries:", streak.len());
                    for e in streak.iter().take(SHOWN_ENTRIES) {
                        println!("    #{}: {} -> {}ms", e.position, e.text, e.duration_ms);
                    }
                    if streak.len() > SHOWN_ENTRIES {
                        println!("    ... {} more", streak.len() - SHOWN_ENTRIES);
                    }
                }
            }
        }
    }
}

fn step_context(config: &Config, db: Arc<Database>) -> Result<(StepContext, watch::Sender<bool>)> {
    let synth = Arc::new(FishSpeechClient::from_config(config)?);
    let generator = BatchGenerator {
        db,
        media: MediaStore::new(&config.media_root),
        synth,
        admission: AdmissionController::new(config.batch_concurrency),
        regeneration: RegenerationController::new(config.regeneration_rounds),
        max_new_tokens: Some(config.max_new_tokens).filter(|n| *n > 0),
    };
    let (cancel_tx, cancel) = watch::channel(false);
    Ok((StepContext { generator, cancel }, cancel_tx))
}

async fn generate(config: &Config, db: Arc<Database>, project: i64) -> Result<()> {
    if db.get_project(project)?.is_none() {
        bail!("project {} not found", project);
    }
    let (ctx, cancel_tx) = step_context(config, db)?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logw("Ctrl+C received, cancelling remaining scenes");
            let _ = cancel_tx.send(true);
        }
    });

    if let StepReport::Generated(report) = run_step(StepKind::TtsGenerate, &ctx, project).await? {
        println!(
            "generated {}, failed {}, skipped {}, cancelled {}, warnings {}",
            report.success, report.errors, report.skipped, report.cancelled, report.warnings
        );
    }
    Ok(())
}

async fn audit(config: &Config, db: Arc<Database>, project: Option<i64>, dir: Option<&Path>) -> Result<()> {
    let files = match (project, dir) {
        (_, Some(dir)) => audit_directory(dir)?,
        (Some(project), None) => {
            let (ctx, _cancel) = step_context(config, db)?;
            match run_step(StepKind::CaptionAudit, &ctx, project).await? {
                StepReport::Audited(files) => files,
                StepReport::Generated(_) => Vec::new(),
            }
        }
        (None, None) => bail!("either --project or --dir is required"),
    };
    print_audit(&files);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load(&cli.config).await?;
    let db = Arc::new(Database::open(&config.database_path)?);

    match cli.command {
        Command::Project(ProjectCommand::Add { name, voice }) => {
            let id = db.add_project(&name, voice)?;
            logok(format!("project {} created", id));
            println!("{id}");
        }
        Command::Project(ProjectCommand::SetVoice { project, voice }) => {
            if !db.set_project_voice(project, voice)? {
                bail!("project {} not found", project);
            }
            logok(format!("project {} voice set to {:?}", project, voice));
        }
        Command::Voice(VoiceCommand::Add {
            name,
            reference,
            reference_text,
            temperature,
            top_p,
            repetition_penalty,
            seed,
        }) => {
            let defaults = VoiceParams::default();
            let id = db.add_voice(&NewVoice {
                name,
                reference_audio: reference,
                reference_text,
                temperature: temperature.unwrap_or(defaults.temperature),
                top_p: top_p.unwrap_or(defaults.top_p),
                repetition_penalty,
                seed: seed.unwrap_or(defaults.seed),
            })?;
            logok(format!("voice {} created", id));
            println!("{id}");
        }
        Command::Scene(SceneCommand::Add {
            project,
            number,
            narration,
            tts,
        }) => {
            let id = db
                .add_scene(project, number, &narration, &tts)
                .with_context(|| format!("Failed to add scene {} to project {}", number, project))?;
            println!("{id}");
        }
        Command::Scene(SceneCommand::List { project }) => {
            for scene in db.scenes_for_project(project)? {
                println!(
                    "{:>3}  id={:<5} audio={:<5} {:.2}s  captions={} ({}/{} words)",
                    scene.scene_number,
                    scene.id,
                    scene.has_audio(),
                    scene.audio_duration,
                    scene.subtitle_status,
                    scene.subtitle_word_count,
                    scene.narration_word_count
                );
            }
        }
        Command::Enqueue { project, scene } => {
            let scenes: Vec<_> = db
                .scenes_for_project(project)?
                .into_iter()
                .filter(|s| scene.is_none_or(|n| s.scene_number == n))
                .collect();
            if scenes.is_empty() {
                bail!("no matching scenes in project {}", project);
            }
            for s in &scenes {
                let job = db.create_job(project, s.id)?;
                println!("job {} -> scene {}", job, s.scene_number);
            }
            logi(format!("{} job(s) queued", scenes.len()));
        }
        Command::Cancel { job } => {
            if db.mark_cancelled(job)? {
                logok(format!("job {} cancelled", job));
            } else {
                match db.get_status(job)? {
                    Some(status) => logw(format!("job {} already {}", job, status)),
                    None => bail!("job {} not found", job),
                }
            }
        }
        Command::Status { job } => {
            let Some(job) = db.get_job(job)? else {
                bail!("job {} not found", job);
            };
            println!("{:#?}", job);
        }
        Command::List { project } => {
            for job in db.list_jobs(project)? {
                println!(
                    "{:>5}  scene={:<5} {:<10} {}  {}",
                    job.id,
                    job.scene_id,
                    job.status,
                    job.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error_message.as_deref().unwrap_or("")
                );
            }
        }
        Command::Sweep { threshold } => {
            let threshold = threshold
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.stuck_threshold());
            let recovered = db.sweep_stuck(threshold)?;
            logok(format!("{} stuck job(s) returned to pending", recovered));
        }
        Command::Generate { project } => generate(&config, db, project).await?,
        Command::Audit { project, dir } => audit(&config, db, project, dir.as_deref()).await?,
    }

    Ok(())
}
