use super::{Database, UnknownVariant};
use anyhow::Result;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, params};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Caption verdict stored on a scene for downstream video composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubtitleStatus {
    #[default]
    None,
    Matched,
    Mismatch,
    Truncated,
}

impl SubtitleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtitleStatus::None => "none",
            SubtitleStatus::Matched => "matched",
            SubtitleStatus::Mismatch => "mismatch",
            SubtitleStatus::Truncated => "truncated",
        }
    }
}

impl fmt::Display for SubtitleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtitleStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubtitleStatus::None),
            "matched" => Ok(SubtitleStatus::Matched),
            "mismatch" => Ok(SubtitleStatus::Mismatch),
            "truncated" => Ok(SubtitleStatus::Truncated),
            other => Err(UnknownVariant {
                kind: "subtitle status",
                value: other.to_string(),
            }),
        }
    }
}

impl ToSql for SubtitleStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SubtitleStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub voice_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Voice {
    pub id: i64,
    pub name: String,
    pub reference_audio: Option<PathBuf>,
    pub reference_text: String,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: Option<f64>,
    pub seed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVoice {
    pub name: String,
    pub reference_audio: Option<PathBuf>,
    pub reference_text: String,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: Option<f64>,
    pub seed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub id: i64,
    pub project_id: i64,
    pub scene_number: i64,
    /// Display and caption text, numerals intact.
    pub narration: String,
    /// Same narration spelled out for the speech engine; may be empty.
    pub narration_tts: String,
    pub audio_path: Option<String>,
    pub audio_duration: f64,
    pub subtitle_path: Option<String>,
    pub subtitle_status: SubtitleStatus,
    pub subtitle_word_count: i64,
    pub narration_word_count: i64,
}

impl Scene {
    /// Text to send to the speech engine, falling back to the display narration.
    pub fn tts_text(&self) -> &str {
        if self.narration_tts.trim().is_empty() {
            &self.narration
        } else {
            &self.narration_tts
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Everything the pipeline writes back onto a scene in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneArtifacts {
    pub audio_path: String,
    pub audio_duration: f64,
    pub subtitle_path: Option<String>,
    pub subtitle_status: SubtitleStatus,
    pub subtitle_word_count: usize,
    pub narration_word_count: usize,
}

const SCENE_COLUMNS: &str = "id, project_id, scene_number, narration, narration_tts, audio_path, audio_duration, subtitle_path, subtitle_status, subtitle_word_count, narration_word_count";

fn scene_from_row(row: &Row<'_>) -> rusqlite::Result<Scene> {
    Ok(Scene {
        id: row.get(0)?,
        project_id: row.get(1)?,
        scene_number: row.get(2)?,
        narration: row.get(3)?,
        narration_tts: row.get(4)?,
        audio_path: row.get(5)?,
        audio_duration: row.get(6)?,
        subtitle_path: row.get(7)?,
        subtitle_status: row.get(8)?,
        subtitle_word_count: row.get(9)?,
        narration_word_count: row.get(10)?,
    })
}

fn voice_from_row(row: &Row<'_>) -> rusqlite::Result<Voice> {
    Ok(Voice {
        id: row.get(0)?,
        name: row.get(1)?,
        reference_audio: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        reference_text: row.get(3)?,
        temperature: row.get(4)?,
        top_p: row.get(5)?,
        repetition_penalty: row.get(6)?,
        seed: row.get(7)?,
    })
}

impl Database {
    pub fn add_voice(&self, voice: &NewVoice) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO voices (name, reference_audio, reference_text, temperature, top_p, repetition_penalty, seed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                voice.name,
                voice
                    .reference_audio
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                voice.reference_text,
                voice.temperature,
                voice.top_p,
                voice.repetition_penalty,
                voice.seed,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_voice(&self, voice_id: i64) -> Result<Option<Voice>> {
        let voice = self
            .conn()
            .query_row(
                "SELECT id, name, reference_audio, reference_text, temperature, top_p, repetition_penalty, seed
                 FROM voices WHERE id = ?1",
                [voice_id],
                voice_from_row,
            )
            .optional()?;
        Ok(voice)
    }

    pub fn add_project(&self, name: &str, voice_id: Option<i64>) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO projects (name, voice_id) VALUES (?1, ?2)",
            params![name, voice_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_project_voice(&self, project_id: i64, voice_id: Option<i64>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE projects SET voice_id = ?1 WHERE id = ?2",
            params![voice_id, project_id],
        )?;
        Ok(changed == 1)
    }

    pub fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        let project = self
            .conn()
            .query_row(
                "SELECT id, name, voice_id FROM projects WHERE id = ?1",
                [project_id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        voice_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    /// Voice configured on the scene's project, if any.
    pub fn voice_for_project(&self, project_id: i64) -> Result<Option<Voice>> {
        match self.get_project(project_id)?.and_then(|p| p.voice_id) {
            Some(voice_id) => self.get_voice(voice_id),
            None => Ok(None),
        }
    }

    pub fn add_scene(
        &self,
        project_id: i64,
        scene_number: i64,
        narration: &str,
        narration_tts: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scenes (project_id, scene_number, narration, narration_tts)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_id, scene_number, narration, narration_tts],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_scene(&self, scene_id: i64) -> Result<Option<Scene>> {
        let scene = self
            .conn()
            .query_row(
                &format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE id = ?1"),
                [scene_id],
                scene_from_row,
            )
            .optional()?;
        Ok(scene)
    }

    pub fn scenes_for_project(&self, project_id: i64) -> Result<Vec<Scene>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCENE_COLUMNS} FROM scenes WHERE project_id = ?1 ORDER BY scene_number"
        ))?;
        let rows = stmt.query_map([project_id], scene_from_row)?;
        let mut scenes = Vec::new();
        for scene in rows {
            scenes.push(scene?);
        }
        Ok(scenes)
    }

    pub fn save_artifacts(&self, scene_id: i64, artifacts: &SceneArtifacts) -> Result<()> {
        self.conn().execute(
            "UPDATE scenes SET audio_path = ?1, audio_duration = ?2, subtitle_path = ?3,
                subtitle_status = ?4, subtitle_word_count = ?5, narration_word_count = ?6
             WHERE id = ?7",
            params![
                artifacts.audio_path,
                artifacts.audio_duration,
                artifacts.subtitle_path,
                artifacts.subtitle_status,
                artifacts.subtitle_word_count as i64,
                artifacts.narration_word_count as i64,
                scene_id,
            ],
        )?;
        Ok(())
    }

    pub fn clear_artifacts(&self, scene_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE scenes SET audio_path = NULL, audio_duration = 0, subtitle_path = NULL,
                subtitle_status = 'none', subtitle_word_count = 0, narration_word_count = 0
             WHERE id = ?1",
            [scene_id],
        )?;
        Ok(())
    }
}
