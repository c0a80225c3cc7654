//! Driver for the llama.cpp `convert_hf_to_gguf.py` format conversion tool.

use crate::config::home_dir;
use crate::error::ConvertError;
use crate::process;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONVERT_SCRIPT: &str = "convert_hf_to_gguf.py";

/// Converts merged weights into a single deployable model file.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    python: String,
    search_dirs: Vec<PathBuf>,
}

impl FormatConverter {
    /// Searches `llama_cpp_dir`, then `~/llama.cpp`, then `~/.llama.cpp`.
    #[must_use]
    pub fn new(python: impl Into<String>, llama_cpp_dir: PathBuf) -> Self {
        let home = home_dir();
        Self::with_search_dirs(python, vec![llama_cpp_dir, home.join("llama.cpp"), home.join(".llama.cpp")])
    }

    #[must_use]
    pub fn with_search_dirs(python: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        Self { python: python.into(), search_dirs }
    }

    /// Finds the conversion script in the first search directory that has it.
    pub fn locate_script(&self) -> Result<PathBuf, ConvertError> {
        for dir in &self.search_dirs {
            let candidate = dir.join(CONVERT_SCRIPT);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        let searched = self.search_dirs.iter().map(|d| d.display().to_string()).collect::<Vec<_>>();
        Err(ConvertError::ScriptMissing(searched.join(", ")))
    }

    /// Runs `<python> <script> <merged_dir> --outfile <outfile> --outtype <variant>`.
    ///
    /// Runs to completion with no timeout. Succeeds only if the process exits
    /// with status zero and `outfile` exists afterwards.
    pub async fn convert(&self, merged_dir: &Path, outfile: &Path, variant: &str) -> Result<PathBuf, ConvertError> {
        let script = self.locate_script()?;
        if let Some(parent) = outfile.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(script = %script.display(), outfile = %outfile.display(), variant, "Converting model");
        let args: Vec<OsString> = vec![
            script.into_os_string(),
            merged_dir.as_os_str().to_owned(),
            "--outfile".into(),
            outfile.as_os_str().to_owned(),
            "--outtype".into(),
            variant.into(),
        ];

        let output = match process::run(&self.python, args).await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConvertError::InterpreterMissing(self.python.clone()));
            }
            Err(e) => return Err(ConvertError::Io(e)),
        };

        if !output.status.success() {
            return Err(ConvertError::Failed(process::describe_failure(&output)));
        }
        if !outfile.exists() {
            return Err(ConvertError::OutputMissing(outfile.display().to_string()));
        }

        debug!(outfile = %outfile.display(), "Conversion finished");
        Ok(outfile.to_path_buf())
    }
}
