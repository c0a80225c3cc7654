use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of a single project directory.
///
/// ```text
/// <root>/project.json
/// <root>/data/<file>
/// <root>/.cache/training/           scratch, removed when a job ends
/// <root>/output/run_<timestamp>/    adapter checkpoints
/// <root>/output/ollama/             merged weights, model_v<N>.gguf, Modelfile
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn project_file(&self) -> PathBuf {
        self.root.join(crate::config::PROJECT_FILE)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    #[must_use]
    pub fn data_file(&self, filename: &str) -> PathBuf {
        self.data_dir().join(filename)
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(".cache").join("training")
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Timestamped directory for one training run's checkpoints.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.output_dir().join(format!("run_{stamp}"))
    }

    #[must_use]
    pub fn ollama_dir(&self) -> PathBuf {
        self.output_dir().join("ollama")
    }

    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.ollama_dir().join("merged_model")
    }

    #[must_use]
    pub fn modelfile_path(&self) -> PathBuf {
        self.ollama_dir().join("Modelfile")
    }

    #[must_use]
    pub fn model_file(&self, version: u32) -> PathBuf {
        self.ollama_dir().join(format!("model_v{version}.gguf"))
    }

    /// One more than the highest existing `model_v<N>.gguf`, or 1.
    pub fn next_model_version(&self) -> TrainingResult<u32> {
        let dir = self.ollama_dir();
        if !dir.exists() {
            return Ok(1);
        }

        let mut highest = 0;
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix("model_v"))
                .and_then(|n| n.strip_suffix(".gguf"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(v) = version {
                highest = highest.max(v);
            }
        }
        Ok(highest + 1)
    }

    pub fn ensure_output_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(self.ollama_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp.path().to_path_buf());

        assert!(layout.cache_dir().ends_with(".cache/training"));
        assert!(layout.data_file("a.jsonl").ends_with("data/a.jsonl"));
        assert!(layout.modelfile_path().ends_with("output/ollama/Modelfile"));
        let run = layout.run_dir();
        assert!(run.file_name().unwrap().to_string_lossy().starts_with("run_"));
    }

    #[test]
    fn test_next_model_version() {
        let temp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp.path().to_path_buf());
        assert_eq!(layout.next_model_version().unwrap(), 1);

        layout.ensure_output_dirs().unwrap();
        assert_eq!(layout.next_model_version().unwrap(), 1);

        for name in ["model_v1.gguf", "model_v4.gguf", "model_vX.gguf", "model_v9.bin"] {
            std::fs::write(layout.ollama_dir().join(name), b"").unwrap();
        }
        assert_eq!(layout.next_model_version().unwrap(), 5);
        assert!(layout.model_file(5).ends_with("model_v5.gguf"));
    }
}
