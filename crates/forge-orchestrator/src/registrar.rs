//! Registration of converted models with the local Ollama runtime.

use crate::error::RegistrarError;
use crate::process;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

static MODEL_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-/:\.]+$").ok());

/// Checks that `name` is safe to pass to the runtime CLI.
pub fn validate_model_name(name: &str) -> Result<(), RegistrarError> {
    match MODEL_NAME.as_ref() {
        Some(re) if re.is_match(name) => Ok(()),
        _ => Err(RegistrarError::InvalidName(name.to_string())),
    }
}

/// A model known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub size: Option<String>,
}

/// Parses the table printed by `ollama list`; the header line is skipped.
#[must_use]
pub fn parse_model_list(stdout: &str) -> Vec<RegisteredModel> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let name = (*parts.first()?).to_string();
            let size = match parts.as_slice() {
                [_, _, amount, unit, ..] => Some(format!("{amount} {unit}")),
                [_, _, amount] => Some((*amount).to_string()),
                _ => None,
            };
            Some(RegisteredModel { name, size })
        })
        .collect()
}

/// Thin driver around the `ollama` binary.
#[derive(Debug, Clone)]
pub struct OllamaRegistrar {
    binary: String,
}

impl OllamaRegistrar {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<String, RegistrarError> {
        let output = match process::run(&self.binary, args).await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistrarError::BinaryMissing(self.binary.clone()));
            }
            Err(e) => return Err(RegistrarError::Io(e)),
        };
        if !output.status.success() {
            return Err(RegistrarError::Failed(process::describe_failure(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Lists registered models.
    pub async fn list_models(&self) -> Result<Vec<RegisteredModel>, RegistrarError> {
        let stdout = self.run(vec!["list".into()]).await?;
        Ok(parse_model_list(&stdout))
    }

    /// Checks whether `name` is registered, with or without its tag.
    pub async fn model_exists(&self, name: &str) -> Result<bool, RegistrarError> {
        let latest = format!("{name}:latest");
        Ok(self.list_models().await?.iter().any(|m| {
            m.name == name || m.name == latest || m.name.split(':').next() == Some(name)
        }))
    }

    /// Runs `ollama create <name> -f <modelfile>`.
    pub async fn create(&self, name: &str, modelfile: &Path) -> Result<(), RegistrarError> {
        validate_model_name(name)?;
        info!(model = name, modelfile = %modelfile.display(), "Registering model");
        self.run(vec!["create".into(), name.into(), "-f".into(), modelfile.as_os_str().to_owned()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_model_name() {
        assert!(validate_model_name("my-model").is_ok());
        assert!(validate_model_name("user/model:v1.2").is_ok());
        assert!(validate_model_name("bad name").is_err());
        assert!(validate_model_name("x;rm -rf").is_err());
        assert!(validate_model_name("").is_err());
    }

    #[test]
    fn test_parse_model_list() {
        let stdout = "NAME                ID              SIZE      MODIFIED\n\
                      llama3:latest       365c0bd3c000    4.7 GB    2 days ago\n\
                      \n\
                      mine:v2             0123456789ab    12 MB     1 hour ago\n";
        let models = parse_model_list(stdout);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3:latest");
        assert_eq!(models[0].size.as_deref(), Some("4.7 GB"));
        assert_eq!(models[1].name, "mine:v2");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let registrar = OllamaRegistrar::new("forge-no-such-ollama");
        let err = registrar.list_models().await.unwrap_err();
        assert!(matches!(err, RegistrarError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_name_before_running() {
        let registrar = OllamaRegistrar::new("forge-no-such-ollama");
        let err = registrar.create("no spaces", Path::new("Modelfile")).await.unwrap_err();
        assert!(matches!(err, RegistrarError::InvalidName(_)));
    }
}
