//! Integration tests for admission control, the concurrency bound,
//! cancellation, and task eviction.

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
    config.tokens.secret = "orchestration-test-secret-0123456789ab".into();
    config.kdf.memory_kib = 1024;
    config.kdf.time_cost = 1;
    config.kdf.parallelism = 1;
    config
}

fn pattern_data(len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| (i.wrapping_mul(193)) as u8).collect()
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
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

async fn wait_processing(engine: &Engine, task_id: TaskId) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let report = engine.status(task_id).await.unwrap();
            if report.status != TaskStatus::Pending {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task never left pending");
}

#[tokio::test]
async fn rejects_too_many_files() {
    let storage_dir = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.limits.max_files_per_task = 2;
    let engine = Engine::new(config).unwrap();

    let files: Vec<SubmitFile> = (0..3)
        .map(|i| SubmitFile {
            name: format!("f{i}"),
            path: PathBuf::from(format!("/nonexistent/f{i}")),
            size: 10,
        })
        .collect();

    let err = engine
        .submit(files, SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap_err();
    assert!(matches!(err, E4pError::TooManyFiles { count: 3, limit: 2 }));
}

#[tokio::test]
async fn rejects_oversized_payload() {
    let storage_dir = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.limits.max_file_size_mib = 1;
    let engine = Engine::new(config).unwrap();

    let err = engine
        .submit(
            vec![SubmitFile {
                name: "big".into(),
                path: PathBuf::from("/nonexistent/big"),
                size: 2 * 1024 * 1024,
            }],
            SecretString::from("pw"),
            Algorithm::Aes256Gcm,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, E4pError::PayloadTooLarge { .. }));
}

#[tokio::test]
async fn rejects_empty_submission() {
    let storage_dir = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();
    let err = engine
        .submit(vec![], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap_err();
    assert!(matches!(err, E4pError::InvalidParameters(_)));
}

#[tokio::test]
async fn concurrency_stays_within_bound() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.limits.max_concurrency = 2;
    let engine = Engine::new(config).unwrap();

    let data = pattern_data(4 * 1024 * 1024);
    let mut task_ids = Vec::new();
    for i in 0..5 {
        let file = stage_file(&uploads, &format!("job{i}.bin"), &data).await;
        let id = engine
            .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
            .await
            .unwrap();
        task_ids.push(id);
    }

    // Sample the processing count while the queue drains
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let processing = engine.processing_count().await;
        assert!(
            processing <= 2,
            "concurrency bound violated: {processing} tasks processing"
        );

        let mut all_done = true;
        for &id in &task_ids {
            if !engine.status(id).await.unwrap().status.is_terminal() {
                all_done = false;
            }
        }
        if all_done {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for &id in &task_ids {
        let report = engine.status(id).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed, "error: {:?}", report.error);
    }
}

#[tokio::test]
async fn queue_depth_overload() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.limits.max_concurrency = 1;
    config.limits.queue_depth = 2;
    let engine = Engine::new(config).unwrap();

    let data = pattern_data(8 * 1024 * 1024);

    // First task occupies the only slot
    let blocker = stage_file(&uploads, "blocker.bin", &data).await;
    let blocker_id = engine
        .submit(vec![blocker], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    wait_processing(&engine, blocker_id).await;

    // Fill the queue
    for i in 0..2 {
        let file = stage_file(&uploads, &format!("queued{i}.bin"), &data).await;
        engine
            .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
            .await
            .unwrap();
    }

    // Queue is full: the next submission is refused before task creation
    let overflow = stage_file(&uploads, "overflow.bin", b"x").await;
    let err = engine
        .submit(vec![overflow], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap_err();
    assert!(matches!(err, E4pError::Overloaded));
}

#[tokio::test]
async fn cancelled_task_fails_with_cancelled_error() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    config.limits.max_concurrency = 1;
    let engine = Engine::new(config).unwrap();

    let data = pattern_data(8 * 1024 * 1024);
    let blocker = stage_file(&uploads, "blocker.bin", &data).await;
    let blocker_id = engine
        .submit(vec![blocker], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    wait_processing(&engine, blocker_id).await;

    let victim = stage_file(&uploads, "victim.bin", &data).await;
    let victim_id = engine
        .submit(vec![victim], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    engine.cancel_task(victim_id).await.unwrap();

    let report = wait_terminal(&engine, victim_id).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(
        report.error.as_deref().unwrap_or("").contains("cancelled"),
        "expected cancellation error, got {:?}",
        report.error
    );
    assert!(
        report.files[0].download_token.is_none(),
        "cancelled task must not expose output"
    );
}

#[tokio::test]
async fn watchdog_cancels_stuck_task() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let mut config = test_config(storage_dir.path());
    // Zero allowance: every task trips the watchdog
    config.tasks.watchdog = true;
    config.tasks.watchdog_floor_secs = 0;
    config.tasks.watchdog_secs_per_mib = 0;
    let engine = Engine::new(config).unwrap();

    let file = stage_file(&uploads, "doomed.bin", &pattern_data(16 * 1024 * 1024)).await;
    let task_id = engine
        .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();

    let report = wait_terminal(&engine, task_id).await;
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.as_deref().unwrap_or("").contains("cancelled"));
}

#[tokio::test]
async fn finished_tasks_evicted_after_ttl() {
    let storage_dir = TempDir::new().unwrap();
    let uploads = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();

    let file = stage_file(&uploads, "small.txt", b"tiny").await;
    let task_id = engine
        .submit(vec![file], SecretString::from("pw"), Algorithm::Aes256Gcm)
        .await
        .unwrap();
    let report = wait_terminal(&engine, task_id).await;
    assert_eq!(report.status, TaskStatus::Completed);

    // Not old enough yet
    assert_eq!(engine.evict_finished_tasks(Duration::from_secs(3600)).await, 0);
    assert!(engine.status(task_id).await.is_ok());

    // Past its TTL
    assert_eq!(engine.evict_finished_tasks(Duration::ZERO).await, 1);
    let err = engine.status(task_id).await.unwrap_err();
    assert!(matches!(err, E4pError::TaskNotFound));
}

#[tokio::test]
async fn status_of_unknown_task() {
    let storage_dir = TempDir::new().unwrap();
    let engine = Engine::new(test_config(storage_dir.path())).unwrap();
    let err = engine.status(TaskId::new_v4()).await.unwrap_err();
    assert!(matches!(err, E4pError::TaskNotFound));
}
