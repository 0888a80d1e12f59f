use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Scene audio and caption files under a media root, addressed by root-relative paths.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn audio_rel_path(project_id: i64, scene_number: i64) -> String {
        format!("projects/{}/audio/scene_{:02}.wav", project_id, scene_number)
    }

    pub fn subtitle_rel_path(project_id: i64, scene_number: i64) -> String {
        format!("projects/{}/subtitles/scene_{:02}.srt", project_id, scene_number)
    }

    pub fn subtitle_dir(&self, project_id: i64) -> PathBuf {
        self.root.join(format!("projects/{}/subtitles", project_id))
    }

    async fn write(&self, rel: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create dir {}", parent.display()))?;
        }
        fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub async fn write_audio(&self, project_id: i64, scene_number: i64, audio: &[u8]) -> Result<String> {
        let rel = Self::audio_rel_path(project_id, scene_number);
        self.write(&rel, audio).await?;
        Ok(rel)
    }

    pub async fn write_subtitles(&self, project_id: i64, scene_number: i64, srt: &[u8]) -> Result<String> {
        let rel = Self::subtitle_rel_path(project_id, scene_number);
        self.write(&rel, srt).await?;
        Ok(rel)
    }

    /// Deletes a stored artifact; a file that is already gone is not an error.
    pub async fn remove(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Reads a file given as absolute or root-relative path.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_zero_padded_per_project() {
        assert_eq!(MediaStore::audio_rel_path(3, 7), "projects/3/audio/scene_07.wav");
        assert_eq!(
            MediaStore::subtitle_rel_path(3, 12),
            "projects/3/subtitles/scene_12.srt"
        );
    }

    #[tokio::test]
    async fn writes_reads_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let media = MediaStore::new(dir.path());
        let rel = media.write_audio(1, 2, b"RIFF").await.unwrap();
        assert_eq!(media.read(Path::new(&rel)).await.unwrap(), b"RIFF");

        media.remove(&rel).await.unwrap();
        assert!(!media.resolve(&rel).exists());
        media.remove(&rel).await.unwrap();
    }
}
