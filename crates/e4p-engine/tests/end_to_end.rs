//! Integration test: full encrypt → download → decrypt → download flow
//!
//! Exercises the engine exactly as the request layer drives it: stage
//! uploads, submit a job, poll status to completion, fetch the container
//! through its token, decrypt it back, and verify byte equality.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use tempfile::TempDir;

use e4p_core::config::E4pConfig;
use e4p_core::error::E4pError;
use e4p_core::types::{Algorithm, TaskId, TaskStatus};
use e4p_engine::{Engine, SubmitFile};

fn test_config(root: &std::path::Path) -> E4pConfig {
    let mut config = E4pConfig::default();
    config.storage.root_dir = root.to_path_buf();
    config.tokens.secret = "integration-test-secret-0123456789abcdef".into();
    // Fast KDF params: determinism is under test, not brute-force cost
    config.kdf.memory_kib = 1024;
    config.kdf.time_cost = 1;
    config.kdf.parallelism = 1;
    config
}

fn pattern_data(len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| (i.wrapping_mul(131) ^ (i >> 7)) as u8)
        .collect()
}

async fn stage_file(dir: &TempDir, name: &str, data: &[u8]) -> SubmitFile {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    SubmitFile {
        name: name.to_string(),
        path,
        size: data.len() as u64,
    }
}

async fn wait_terminal(engine: &Engine, task_id: TaskId) -> e4p_engine::TaskReport {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let report = engine.status(task_id).await.unwrap();
            if report.status.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task did not reach a terminal state in time")
}

#[tokio::test]
async fn encrypt_download_decrypt_roundtrip() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();

    let original = pattern_data(10 * 1024 * 1024);
    let file = stage_file(&uploads, "data.bin", &original).await;

    let task_id = engine
        .submit(
            vec![file],
            SecretString::from("correct-horse"),
            Algorithm::Aes256Gcm,
        )
        .await
        .unwrap();

    let report = wait_terminal(&engine, task_id).await;
    assert_eq!(report.status, TaskStatus::Completed, "error: {:?}", report.error);
    assert_eq!(report.progress, 100.0);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].progress, 100.0);

    // Fetch the encrypted container through its token
    let token = report.files[0].download_token.clone().expect("token issued");
    let download = engine.open_download(&token).await.unwrap();
    assert_eq!(download.filename, "data.bin.e4p");
    let container = tokio::fs::read(&download.path).await.unwrap();
    assert!(container.starts_with(b"E4P1"));
    assert!(container.len() > original.len(), "framing + tags add overhead");

    // Decrypt it back through the engine
    let outcome = engine
        .decrypt(&download.path, SecretString::from("correct-horse"))
        .await
        .unwrap();
    assert_eq!(outcome.filename, "data.bin");
    assert_eq!(outcome.size, original.len() as u64);
    assert_eq!(outcome.algorithm, Algorithm::Aes256Gcm);

    let plain_download = engine.open_download(&outcome.download_token).await.unwrap();
    let restored = tokio::fs::read(&plain_download.path).await.unwrap();
    assert_eq!(restored, original, "round-trip must be byte-identical");
}

#[tokio::test]
async fn multi_file_task_xchacha() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();

    let contents: Vec<Vec<u8>> = vec![pattern_data(100), pattern_data(500_000), Vec::new()];
    let mut files = Vec::new();
    for (i, data) in contents.iter().enumerate() {
        files.push(stage_file(&uploads, &format!("f{i}.dat"), data).await);
    }

    let task_id = engine
        .submit(
            files,
            SecretString::from("hunter2-but-longer"),
            Algorithm::XChaCha20Poly1305,
        )
        .await
        .unwrap();

    let report = wait_terminal(&engine, task_id).await;
    assert_eq!(report.status, TaskStatus::Completed, "error: {:?}", report.error);

    for (i, file_report) in report.files.iter().enumerate() {
        let token = file_report.download_token.as_ref().expect("per-file token");
        let download = engine.open_download(token).await.unwrap();
        let outcome = engine
            .decrypt(&download.path, SecretString::from("hunter2-but-longer"))
            .await
            .unwrap();
        let plain = engine.open_download(&outcome.download_token).await.unwrap();
        let restored = tokio::fs::read(&plain.path).await.unwrap();
        assert_eq!(restored, contents[i], "file {i} must round-trip");
    }
}

#[tokio::test]
async fn wrong_password_yields_auth_failure_and_no_plaintext() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();

    let file = stage_file(&uploads, "secret.txt", &pattern_data(64 * 1024)).await;
    let task_id = engine
        .submit(vec![file], SecretString::from("p1"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    let report = wait_terminal(&engine, task_id).await;
    assert_eq!(report.status, TaskStatus::Completed);

    let token = report.files[0].download_token.clone().unwrap();
    let download = engine.open_download(&token).await.unwrap();

    let err = engine
        .decrypt(&download.path, SecretString::from("p2"))
        .await
        .unwrap_err();
    assert!(matches!(err, E4pError::AuthenticationFailure));

    // No partial plaintext may linger anywhere in storage
    let mut entries = tokio::fs::read_dir(storage_dir.path()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name: PathBuf = entry.file_name().into();
        assert!(
            !name.to_string_lossy().ends_with(".part"),
            "partial output left behind: {name:?}"
        );
    }
}

#[tokio::test]
async fn download_token_for_removed_artifact_is_invalid() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();

    let file = stage_file(&uploads, "gone.txt", b"ephemeral").await;
    let task_id = engine
        .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    let report = wait_terminal(&engine, task_id).await;
    let token = report.files[0].download_token.clone().unwrap();

    // Retention sweep removes everything, token outlives the artifact
    engine.storage().sweep(Duration::ZERO).await;

    let err = engine.open_download(&token).await.unwrap_err();
    assert!(matches!(err, E4pError::TokenInvalid));
}

#[tokio::test]
async fn one_time_token_single_download() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.tokens.one_time = true;
    let engine = Engine::new(config).unwrap();

    let file = stage_file(&uploads, "once.txt", b"only once").await;
    let task_id = engine
        .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    let report = wait_terminal(&engine, task_id).await;
    let token = report.files[0].download_token.clone().unwrap();

    assert!(engine.open_download(&token).await.is_ok());
    let err = engine.open_download(&token).await.unwrap_err();
    assert!(matches!(err, E4pError::TokenInvalid));
}
