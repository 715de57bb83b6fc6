use filetime::FileTime;
use std::path::Path;
use std::sync::Arc;
use syncengine_lib::core::{
    CompareMethod, ConflictResolution, ExecutorConfig, ProgressReporter, SyncEngine, SyncMode,
    SyncOptions, TransferExecutor,
};
use syncengine_lib::db::{open_pool, RunStatus};
use syncengine_lib::pipeline::{self, AlgorithmConfig, CipherKind, CompressionKind, EncryptionOptions};

struct Env {
    _state: tempfile::TempDir,
    src: tempfile::TempDir,
    dst: tempfile::TempDir,
    engine: SyncEngine,
}

async fn env() -> Env {
    let state = tempfile::tempdir().unwrap();
    let pool = Arc::new(open_pool(&state.path().join("state.db")).await.unwrap());
    let executor = Arc::new(TransferExecutor::new(ExecutorConfig::default(), None).unwrap());
    Env {
        _state: state,
        src: tempfile::tempdir().unwrap(),
        dst: tempfile::tempdir().unwrap(),
        engine: SyncEngine::new(pool, executor),
    }
}

impl Env {
    fn options(&self, mode: SyncMode) -> SyncOptions {
        let mut options = SyncOptions::new(
            self.src.path().to_string_lossy(),
            self.dst.path().to_string_lossy(),
            mode,
        );
        options.retry_base_delay_ms = 1;
        options
    }

    async fn sync(&self, options: &SyncOptions) -> syncengine_lib::SyncReport {
        self.engine
            .run(options, ProgressReporter::disabled())
            .await
            .unwrap()
    }
}

fn write(root: &Path, path: &str, data: &[u8]) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, data).unwrap();
}

fn set_mtime(root: &Path, path: &str, unix: i64) {
    filetime::set_file_mtime(root.join(path), FileTime::from_unix_time(unix, 0)).unwrap();
}

#[tokio::test]
async fn test_one_way_creates_file() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"hello");

    let report = env.sync(&env.options(SyncMode::OneWay)).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.create_count, 1);
    assert_eq!(std::fs::read(env.dst.path().join("a.txt")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_one_way_never_deletes() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"hello");
    write(env.dst.path(), "extra.txt", b"keep me");

    let report = env.sync(&env.options(SyncMode::OneWay)).await;
    assert_eq!(report.summary.delete_count, 0);
    assert!(env.dst.path().join("extra.txt").exists());
}

#[tokio::test]
async fn test_mirror_deletes_extra_files() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"hello");
    write(env.dst.path(), "extra.txt", b"stale");
    write(env.dst.path(), "old/nested.txt", b"stale");

    let mut options = env.options(SyncMode::Mirror);
    options.use_recycle_bin = false;
    let report = env.sync(&options).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(!env.dst.path().join("extra.txt").exists());
    assert!(!env.dst.path().join("old").exists());
    assert!(env.dst.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_mirror_copies_structure() {
    let env = env().await;
    write(env.src.path(), "d/e/f.txt", b"deep");
    std::fs::create_dir_all(env.src.path().join("empty/inner")).unwrap();

    env.sync(&env.options(SyncMode::Mirror)).await;
    assert_eq!(std::fs::read(env.dst.path().join("d/e/f.txt")).unwrap(), b"deep");
    assert!(env.dst.path().join("empty/inner").is_dir());
}

#[tokio::test]
async fn test_second_run_has_no_changes() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"hello");
    write(env.src.path(), "d/b.txt", b"world");
    let options = env.options(SyncMode::Mirror);

    env.sync(&options).await;
    let second = env.sync(&options).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.statistics.changes(), 0);
    assert_eq!(second.summary.create_count + second.summary.update_count, 0);
}

#[tokio::test]
async fn test_two_way_newer_prefers_target() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"older");
    write(env.dst.path(), "a.txt", b"newer content");
    set_mtime(env.src.path(), "a.txt", 1_600_000_000);
    set_mtime(env.dst.path(), "a.txt", 1_700_000_000);

    let mut options = env.options(SyncMode::TwoWay);
    options.conflict_resolution = ConflictResolution::Newer;
    env.sync(&options).await;

    assert_eq!(std::fs::read(env.src.path().join("a.txt")).unwrap(), b"newer content");
    assert_eq!(std::fs::read(env.dst.path().join("a.txt")).unwrap(), b"newer content");
}

#[tokio::test]
async fn test_two_way_target_delete_goes_to_conflict_policy() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"A");
    write(env.src.path(), "b.txt", b"B");
    let mut options = env.options(SyncMode::TwoWay);
    env.sync(&options).await;
    assert!(env.dst.path().join("b.txt").exists());

    // 默认策略下，删除与保留冲突时保留内容
    std::fs::remove_file(env.dst.path().join("b.txt")).unwrap();
    let report = env.sync(&options).await;
    assert_eq!(report.summary.delete_count, 0);
    assert_eq!(std::fs::read(env.dst.path().join("b.txt")).unwrap(), b"B");

    // 以目标为准时删除才传播回源
    std::fs::remove_file(env.dst.path().join("b.txt")).unwrap();
    options.conflict_resolution = ConflictResolution::TargetWins;
    let report = env.sync(&options).await;
    assert_eq!(report.summary.delete_count, 1);
    assert!(!env.src.path().join("b.txt").exists());
    assert!(env.src.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_two_way_target_only_file_is_copied_back() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"A");
    let options = env.options(SyncMode::TwoWay);
    env.sync(&options).await;

    write(env.dst.path(), "new.txt", b"from target");
    let report = env.sync(&options).await;
    assert_eq!(report.summary.delete_count, 0);
    assert_eq!(std::fs::read(env.src.path().join("new.txt")).unwrap(), b"from target");
}

#[tokio::test]
async fn test_ignore_patterns_are_respected() {
    let env = env().await;
    write(env.src.path(), "a.txt", b"A");
    write(env.src.path(), "build/out.tmp", b"x");

    let mut options = env.options(SyncMode::OneWay);
    options.ignore_patterns = vec!["*.tmp".into()];
    env.sync(&options).await;
    assert!(env.dst.path().join("a.txt").exists());
    assert!(!env.dst.path().join("build/out.tmp").exists());
}

#[tokio::test]
async fn test_encrypted_one_way_round_trip() {
    let env = env().await;
    write(env.src.path(), "secret.txt", b"attack at dawn");

    let encryption = EncryptionOptions {
        compression: CompressionKind::Zstd,
        cipher: CipherKind::ChaCha20Poly1305,
        passphrase: "correct horse".into(),
        zstd_level: 3,
        encrypt_names: true,
    };
    let mut options = env.options(SyncMode::OneWay);
    options.compare_method = CompareMethod::DateTime;
    options.encryption = Some(encryption.clone());
    let report = env.sync(&options).await;
    assert_eq!(report.status, RunStatus::Completed);

    let stored: Vec<_> = std::fs::read_dir(env.dst.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(stored.len(), 1);
    assert_ne!(stored[0].file_name().unwrap(), "secret.txt");

    let encoded = std::fs::read(&stored[0]).unwrap();
    assert!(!encoded.windows(6).any(|w| w == b"attack"));
    let config = AlgorithmConfig::from_options(&encryption).unwrap();
    let mut decoded = Vec::new();
    pipeline::decode(&mut &encoded[..], &mut decoded, &config)
        .await
        .unwrap();
    assert_eq!(decoded, b"attack at dawn");

    let second = env.sync(&options).await;
    assert_eq!(second.summary.create_count + second.summary.update_count, 0);
}

#[tokio::test]
async fn test_encryption_requires_datetime_compare() {
    let env = env().await;
    let mut options = env.options(SyncMode::OneWay);
    options.encryption = Some(EncryptionOptions {
        compression: CompressionKind::None,
        cipher: CipherKind::Aes256Gcm,
        passphrase: "pw".into(),
        zstd_level: 3,
        encrypt_names: false,
    });
    assert!(env.engine.run(&options, ProgressReporter::disabled()).await.is_err());
}

#[tokio::test]
async fn test_missing_source_root_is_fatal() {
    let env = env().await;
    write(env.dst.path(), "precious.txt", b"keep");
    let missing = env.src.path().join("typo_does_not_exist");

    let mut options = env.options(SyncMode::Mirror);
    options.source_path = missing.to_string_lossy().into_owned();
    let result = env.engine.run(&options, ProgressReporter::disabled()).await;

    assert!(result.is_err());
    assert!(!missing.exists());
    assert_eq!(std::fs::read(env.dst.path().join("precious.txt")).unwrap(), b"keep");
}

#[cfg(unix)]
#[tokio::test]
async fn test_mirror_copies_symlinked_file_content() {
    let env = env().await;
    write(env.src.path(), "real.txt", b"linked bytes");
    std::os::unix::fs::symlink(env.src.path().join("real.txt"), env.src.path().join("link.txt")).unwrap();

    let report = env.sync(&env.options(SyncMode::Mirror)).await;
    assert_eq!(report.statistics.files_copied, 2);
    assert_eq!(std::fs::read(env.dst.path().join("link.txt")).unwrap(), b"linked bytes");
}
