//! Modelfile generation and registration with a fake `ollama` binary.

#![cfg(unix)]

mod common;

use common::{FakeBackend, Fixture, PROJECT, finish, request, rows};
use forge_orchestrator::OllamaRegistrar;
use forge_training::{ConfigOverrides, ErrorCode, JobStatus, ModelfileOverrides, StageId, StageStatus};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes an executable fake `ollama` that logs its arguments.
fn fake_ollama(dir: &Path, exit_code: i32) -> (PathBuf, PathBuf) {
    let binary = dir.join("fake-ollama");
    let log = dir.join("ollama.log");
    let script = format!(
        "#!/bin/sh\n\
         echo \"$@\" >> '{log}'\n\
         if [ \"$1\" = \"list\" ]; then\n\
         printf 'NAME ID SIZE MODIFIED\\nmine:latest 0123 1.2 GB now\\n'\n\
         fi\n\
         exit {exit_code}\n",
        log = log.display()
    );
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    (binary, log)
}

fn fixture_with_ollama(exit_code: i32) -> (Fixture, PathBuf) {
    let mut fx = Fixture::new().with_converter();
    let (binary, log) = fake_ollama(fx.temp.path(), exit_code);
    fx.config.ollama = binary.display().to_string();
    fx.write_data("train.jsonl", &rows(2));
    (fx, log)
}

#[tokio::test]
async fn test_registers_under_target_name() {
    let (fx, log) = fixture_with_ollama(0);
    let service = fx.service(Arc::new(FakeBackend::default()));

    let job = service.start_job(request(&["train.jsonl"]).with_target_name("mine")).unwrap();
    let state = finish(&job).await;
    assert_eq!(state.status, JobStatus::Completed);

    let modelfile = service.layout(PROJECT).modelfile_path();
    let calls = std::fs::read_to_string(log).unwrap();
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls[0], "list");
    assert_eq!(calls[1], format!("create mine -f {}", modelfile.display()));
}

#[tokio::test]
async fn test_modelfile_uses_effective_config() {
    let (fx, _log) = fixture_with_ollama(0);
    let service = fx.service(Arc::new(FakeBackend::default()));
    let overrides = ConfigOverrides {
        modelfile: Some(ModelfileOverrides {
            temperature: Some(0.2),
            stop: Some(vec!["</s>".to_string(), "User:".to_string()]),
            ..ModelfileOverrides::default()
        }),
        ..ConfigOverrides::default()
    };

    let job = service.start_job(request(&["train.jsonl"]).with_overrides(overrides)).unwrap();
    assert_eq!(finish(&job).await.status, JobStatus::Completed);

    let text = std::fs::read_to_string(service.layout(PROJECT).modelfile_path()).unwrap();
    assert!(text.contains("PARAMETER temperature 0.2\n"));
    assert!(text.contains("PARAMETER top_k 40\n"));
    assert!(text.contains("PARAMETER stop \"</s>\"\n"));
    assert!(text.contains("PARAMETER stop \"User:\"\n"));
}

#[tokio::test]
async fn test_registration_failures() {
    // Runtime rejects the create call
    let (fx, _log) = fixture_with_ollama(1);
    let service = fx.service(Arc::new(FakeBackend::default()));
    let job = service.start_job(request(&["train.jsonl"]).with_target_name("mine")).unwrap();
    let state = finish(&job).await;
    assert_eq!(state.error_code, Some(ErrorCode::RegistrationFailed));
    assert_eq!(state.stage(StageId::ConvertFormat).status, StageStatus::Completed);
    assert_eq!(state.stage(StageId::RegisterModel).status, StageStatus::Failed);
    assert!(service.layout(PROJECT).modelfile_path().is_file());

    // Invalid name
    let (fx, log) = fixture_with_ollama(0);
    let service = fx.service(Arc::new(FakeBackend::default()));
    let job = service.start_job(request(&["train.jsonl"]).with_target_name("bad name")).unwrap();
    assert_eq!(finish(&job).await.error_code, Some(ErrorCode::RegistrationFailed));
    assert!(!log.exists());

    // Missing binary
    let fx = Fixture::new().with_converter();
    fx.write_data("train.jsonl", &rows(1));
    let service = fx.service(Arc::new(FakeBackend::default()));
    let job = service.start_job(request(&["train.jsonl"]).with_target_name("mine")).unwrap();
    assert_eq!(finish(&job).await.error_code, Some(ErrorCode::RegistrationFailed));
}

#[tokio::test]
async fn test_without_target_name_only_writes_modelfile() {
    let fx = Fixture::new().with_converter();
    fx.write_data("train.jsonl", &rows(1));
    let service = fx.service(Arc::new(FakeBackend::default()));

    let job = service.start_job(request(&["train.jsonl"])).unwrap();
    let state = finish(&job).await;
    assert_eq!(state.status, JobStatus::Completed);
    assert!(service.layout(PROJECT).modelfile_path().is_file());
}

#[tokio::test]
async fn test_model_exists_matches_tagless_name() {
    let temp = tempfile::TempDir::new().unwrap();
    let (binary, _log) = fake_ollama(temp.path(), 0);
    let registrar = OllamaRegistrar::new(binary.display().to_string());

    let models = registrar.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].size.as_deref(), Some("1.2 GB"));
    assert!(registrar.model_exists("mine").await.unwrap());
    assert!(registrar.model_exists("mine:latest").await.unwrap());
    assert!(!registrar.model_exists("other").await.unwrap());
}
