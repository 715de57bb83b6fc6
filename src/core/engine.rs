//! 同步引擎：扫描、规划、执行、记录

use super::cache::{ListingCache, Side};
use super::comparator::CompareEngine;
use super::conflict::ConflictResolver;
use super::options::SyncOptions;
use super::planner::{finalize, summarize, ActionKind, ChangePlanner, Direction, Plan, PlanSummary, SkipReason, SyncAction};
use super::progress::{ProgressReporter, ProgressUpdate, Statistics, StatisticsSnapshot};
use super::scanner::{ScanConfig, ScanResult, TreeScanner};
use super::sync_state::{SyncPoint, SyncStateStore};
use super::transfer::{
    move_to_recycle, Codec, Collision, ContentSource, TransferExecutor, TransferRequest, TransferSettings,
};
use crate::db::{RunStatus, StorageConfig, SyncLog};
use crate::error::{SyncError, SyncResult};
use crate::pipeline::AlgorithmConfig;
use crate::storage::{open_storage, FileEntry, Storage};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub job_key: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub summary: PlanSummary,
    pub statistics: StatisticsSnapshot,
    pub errors: Vec<String>,
}

/// 规划阶段的产物
struct Prepared {
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
    plan: Plan,
    points: HashMap<String, SyncPoint>,
}

/// 单个动作执行后对同步点的影响
enum PointChange {
    Upsert(SyncPoint),
    Remove(String),
    Keep,
}

/// 一次运行内共享的状态
struct Run<'a> {
    options: &'a SyncOptions,
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
    algorithm: Option<AlgorithmConfig>,
    cancel: CancellationToken,
    stats: Arc<Statistics>,
    aborted: AtomicBool,
    errors: Mutex<Vec<String>>,
}

impl Run<'_> {
    /// (读取端, 写入端)
    fn storages(&self, direction: Direction) -> (&Arc<dyn Storage>, &Arc<dyn Storage>) {
        match direction {
            Direction::SourceToTarget => (&self.source, &self.target),
            Direction::TargetToSource => (&self.target, &self.source),
        }
    }

    /// 目标端启用文件名加密时，存储上的实际路径
    fn path_on(&self, on_target: bool, path: &str) -> SyncResult<String> {
        match (&self.algorithm, on_target) {
            (Some(alg), true) => alg.encode_path(path),
            _ => Ok(path.to_string()),
        }
    }

    fn from_path(&self, direction: Direction, path: &str) -> SyncResult<String> {
        self.path_on(direction == Direction::TargetToSource, path)
    }

    fn to_path(&self, direction: Direction, path: &str) -> SyncResult<String> {
        self.path_on(direction == Direction::SourceToTarget, path)
    }

    fn push_error(&self, path: &str, message: impl std::fmt::Display) {
        Statistics::incr(&self.stats.errors);
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}: {}", path, message));
    }

    fn record_error(&self, path: &str, err: &SyncError) {
        error!("同步失败 {}: {}", path, err);
        self.push_error(path, err);
        if !self.options.continue_on_error && !self.aborted.swap(true, Ordering::SeqCst) {
            warn!("continueOnError = false，中止剩余动作");
            self.cancel.cancel();
        }
    }
}

/// 按写入端条目的朝向生成同步点
fn oriented_point(path: &str, direction: Direction, from: &FileEntry, written: &FileEntry) -> SyncPoint {
    match direction {
        Direction::SourceToTarget => SyncPoint::from_entries(path, from, written),
        Direction::TargetToSource => SyncPoint::from_entries(path, written, from),
    }
}

/// 把目标端的加密路径还原为明文路径，无法解密的条目忽略
fn decode_scan(scan: ScanResult, alg: &AlgorithmConfig) -> ScanResult {
    let mut entries = BTreeMap::new();
    let mut ignored = 0usize;
    for (path, mut entry) in scan.entries {
        match alg.decode_path(&path) {
            Ok(plain) => {
                entry.path = plain.clone();
                entries.insert(plain, entry);
            }
            Err(e) => {
                debug!("无法解密文件名 {}: {}", path, e);
                ignored += 1;
            }
        }
    }
    if ignored > 0 {
        warn!("目标端有 {} 个条目无法解密文件名，已忽略", ignored);
    }
    let failed_dirs = scan
        .failed_dirs
        .into_iter()
        .map(|d| alg.decode_path(&d).unwrap_or(d))
        .collect();
    ScanResult {
        entries,
        errors: scan.errors,
        failed_dirs,
    }
}

/// 同步引擎
pub struct SyncEngine {
    db: Arc<SqlitePool>,
    executor: Arc<TransferExecutor>,
    points: SyncStateStore,
    cache: ListingCache,
    portable_enumeration: bool,
    current: Mutex<CancellationToken>,
}

impl SyncEngine {
    pub fn new(db: Arc<SqlitePool>, executor: Arc<TransferExecutor>) -> Self {
        Self {
            points: SyncStateStore::new(db.clone()),
            db,
            executor,
            cache: ListingCache::new(std::env::temp_dir(), Duration::ZERO),
            portable_enumeration: false,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// 云端列表缓存，ttl 为 0 时关闭
    pub fn with_listing_cache(mut self, dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        self.cache = ListingCache::new(dir, ttl);
        self
    }

    pub fn with_portable_enumeration(mut self, portable: bool) -> Self {
        self.portable_enumeration = portable;
        self
    }

    pub fn executor(&self) -> &Arc<TransferExecutor> {
        &self.executor
    }

    /// 取消正在进行的运行
    pub fn cancel(&self) {
        info!("请求取消同步");
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// 只规划不执行
    pub async fn preview(&self, options: &SyncOptions) -> SyncResult<Plan> {
        options.validate()?;
        let cancel = self.begin_run();
        let prepared = self
            .prepare(options, &ProgressReporter::disabled(), &cancel)
            .await?;
        Ok(prepared.plan)
    }

    async fn scan_side(
        &self,
        side: Side,
        storage: Arc<dyn Storage>,
        config: Option<&StorageConfig>,
        options: &SyncOptions,
        rules: Arc<super::ignore::IgnoreRules>,
        cancel: &CancellationToken,
    ) -> SyncResult<ScanResult> {
        let job_key = options.job_key();
        let fingerprint = serde_json::to_string(&config).unwrap_or_default();
        let cacheable = storage.is_remote() && self.cache.enabled();
        if cacheable {
            if let Some(cached) = self.cache.load(&job_key, side, &fingerprint).await {
                return Ok(cached);
            }
        }

        let scan = TreeScanner::new(
            storage,
            rules,
            ScanConfig {
                workers: options.scan_workers,
                follow_symlinks: options.follow_symlinks,
            },
        )
        .with_cancel(cancel.clone())
        .scan()
        .await?;

        if cacheable {
            if let Err(e) = self.cache.save(&job_key, side, &fingerprint, &scan).await {
                warn!("保存列表缓存失败: {}", e);
            }
        }
        Ok(scan)
    }

    /// 打开存储、扫描两侧并生成最终的动作序列
    async fn prepare(
        &self,
        options: &SyncOptions,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> SyncResult<Prepared> {
        let algorithm = options.algorithm()?;
        // 源根目录不可读时整次运行失败，不能当成空树
        let source = open_storage(
            &options.source_path,
            options.source_storage.as_ref(),
            self.portable_enumeration,
            false,
        )
        .await
        .map_err(|e| SyncError::Scan {
            path: options.source_path.clone(),
            message: e.to_string(),
        })?;
        let target = open_storage(
            &options.target_path,
            options.target_storage.as_ref(),
            self.portable_enumeration,
            true,
        )
        .await?;

        progress.info("正在扫描源和目标").await;
        let rules = Arc::new(options.ignore_rules()?);
        let (source_scan, target_scan) = tokio::try_join!(
            self.scan_side(
                Side::Source,
                source.clone(),
                options.source_storage.as_ref(),
                options,
                rules.clone(),
                cancel
            ),
            self.scan_side(
                Side::Target,
                target.clone(),
                options.target_storage.as_ref(),
                options,
                rules,
                cancel
            ),
        )?;
        let target_scan = match &algorithm {
            Some(alg) if alg.encrypt_names => decode_scan(target_scan, alg),
            _ => target_scan,
        };
        info!(
            "扫描完成: 源 {} 个条目, 目标 {} 个条目",
            source_scan.entries.len(),
            target_scan.entries.len()
        );

        let points = self.points.load(&options.job_key()).await?;
        let compare = CompareEngine::from_options(options);
        progress.info("正在比较文件").await;
        let actions = ChangePlanner::new(options, &compare, source.as_ref(), target.as_ref())
            .plan(&source_scan, &target_scan, &points)
            .await;
        let actions = finalize(actions, &ConflictResolver::new(options.conflict_resolution));

        let mut scan_errors = source_scan.errors;
        scan_errors.extend(target_scan.errors);
        let plan = Plan {
            summary: summarize(&actions),
            actions,
            scan_errors,
        };
        Ok(Prepared {
            source,
            target,
            plan,
            points,
        })
    }

    /// 执行一次同步
    pub async fn run(&self, options: &SyncOptions, progress: ProgressReporter) -> SyncResult<SyncReport> {
        options.validate()?;
        let cancel = self.begin_run();
        let started = Utc::now();
        let clock = Instant::now();
        let job_key = options.job_key();
        info!(
            "开始同步: {} -> {} ({:?})",
            options.source_path, options.target_path, options.sync_mode
        );

        let Prepared {
            source,
            target,
            plan,
            points,
        } = self.prepare(options, &progress, &cancel).await?;
        let run = Run {
            options,
            source,
            target,
            algorithm: options.algorithm()?,
            cancel: cancel.clone(),
            stats: Arc::new(Statistics::default()),
            aborted: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        };
        for e in &plan.scan_errors {
            run.push_error(&e.path, &e.message);
        }

        let summary = plan.summary.clone();
        let ticker_stop = CancellationToken::new();
        let ticker = progress.spawn_ticker(
            run.stats.clone(),
            summary.transfer_bytes,
            (summary.total() - summary.skip_count) as u64,
            ticker_stop.clone(),
        );

        let changes = self.execute(&run, plan.actions).await;
        ticker_stop.cancel();
        let _ = ticker.await;

        // 已完成的动作即使运行被取消也要记录
        let (upserts, removals) = changes.into_iter().fold(
            (Vec::new(), Vec::new()),
            |(mut up, mut rm), change| {
                match change {
                    PointChange::Upsert(p) if points.get(&p.path) != Some(&p) => up.push(p),
                    PointChange::Remove(path) if points.contains_key(&path) => rm.push(path),
                    _ => {}
                }
                (up, rm)
            },
        );
        if let Err(e) = self.points.apply(&job_key, &upserts, &removals).await {
            warn!("保存同步点失败: {}", e);
        }

        let statistics = run.stats.snapshot();
        if statistics.changes() > 0 {
            self.cache.clear(&job_key).await;
        }
        let errors = run.errors.into_inner().unwrap_or_else(PoisonError::into_inner);
        let status = if run.aborted.load(Ordering::SeqCst) {
            RunStatus::Failed
        } else if cancel.is_cancelled() {
            RunStatus::Canceled
        } else if statistics.errors > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let finished = Utc::now();
        let log = SyncLog {
            job_key: job_key.clone(),
            source_path: options.source_path.clone(),
            target_path: options.target_path.clone(),
            sync_mode: format!("{:?}", options.sync_mode),
            status,
            started_at: started.timestamp(),
            finished_at: finished.timestamp(),
            statistics,
            error_summary: (!errors.is_empty())
                .then(|| errors.iter().take(20).cloned().collect::<Vec<_>>().join("\n")),
        };
        if let Err(e) = log.save(&self.db).await {
            warn!("记录同步日志失败: {}", e);
        }

        info!(
            "同步结束 ({}): 复制 {}, 更新 {}, 删除 {}, 跳过 {}, 错误 {}, {} 字节",
            status,
            statistics.files_copied,
            statistics.files_updated,
            statistics.files_deleted + statistics.directories_deleted,
            statistics.files_skipped,
            statistics.errors,
            statistics.bytes_processed
        );
        progress
            .send(ProgressUpdate {
                message: format!("同步结束: {}", status),
                percent: 100.0,
                speed: 0,
                eta: 0,
            })
            .await;

        Ok(SyncReport {
            job_key,
            status,
            start_time: started.timestamp(),
            end_time: finished.timestamp(),
            duration_ms: clock.elapsed().as_millis() as u64,
            summary,
            statistics,
            errors,
        })
    }

    /// 三个阶段：目录创建（顺序）、文件（并发）、目录删除（由深到浅）
    async fn execute(&self, run: &Run<'_>, actions: Vec<SyncAction>) -> Vec<PointChange> {
        let mut dir_creates = Vec::new();
        let mut files = Vec::new();
        let mut dir_deletes = Vec::new();
        let mut changes = Vec::new();

        for action in actions {
            match action.kind {
                ActionKind::Skip | ActionKind::Conflict => {
                    Statistics::incr(&run.stats.files_skipped);
                    if let (Some(SkipReason::Unchanged), Some(src), Some(tgt)) =
                        (action.skip_reason, &action.source_entry, &action.target_entry)
                    {
                        changes.push(PointChange::Upsert(SyncPoint::from_entries(
                            &action.relative_path,
                            src,
                            tgt,
                        )));
                    }
                }
                ActionKind::Delete if action.is_dir() => dir_deletes.push(action),
                ActionKind::Create | ActionKind::Update if action.is_dir() => dir_creates.push(action),
                _ => files.push(action),
            }
        }

        for action in &dir_creates {
            changes.push(self.apply_logged(run, action).await);
        }

        let parallel = run.options.max_parallel_operations.max(1);
        let mut results = stream::iter(files.iter())
            .map(|action| self.apply_logged(run, action))
            .buffer_unordered(parallel);
        while let Some(change) = results.next().await {
            changes.push(change);
        }
        drop(results);

        for action in &dir_deletes {
            changes.push(self.apply_logged(run, action).await);
        }
        changes
    }

    async fn apply_logged(&self, run: &Run<'_>, action: &SyncAction) -> PointChange {
        if run.cancel.is_cancelled() {
            return PointChange::Keep;
        }
        match self.apply(run, action).await {
            Ok(change) => change,
            Err(SyncError::Interrupted(status)) => {
                debug!("动作被中断 ({}): {}", status, action.relative_path);
                PointChange::Keep
            }
            Err(e) => {
                run.record_error(&action.relative_path, &e);
                PointChange::Keep
            }
        }
    }

    async fn apply(&self, run: &Run<'_>, action: &SyncAction) -> SyncResult<PointChange> {
        let path = action.relative_path.as_str();
        let direction = action.direction;
        let (from, to) = run.storages(direction);
        let to_path = run.to_path(direction, path)?;

        match action.kind {
            ActionKind::Delete => {
                let is_dir = action.is_dir();
                if run.options.use_recycle_bin && !is_dir {
                    move_to_recycle(to.as_ref(), &to_path).await?;
                } else {
                    to.delete(&to_path)
                        .await
                        .map_err(|e| SyncError::transfer(path, e))?;
                }
                debug!("已删除 ({:?}): {}", direction, path);
                if is_dir {
                    Statistics::incr(&run.stats.directories_deleted);
                } else {
                    Statistics::incr(&run.stats.files_deleted);
                }
                Ok(PointChange::Remove(path.to_string()))
            }
            ActionKind::Create | ActionKind::Update => {
                let from_entry = action.from_entry().ok_or_else(|| {
                    SyncError::transfer(path, "缺少来源条目")
                })?;
                // 类型变化：先删除写入端的旧条目
                if action.kind == ActionKind::Update {
                    if let Some(existing) = action.to_entry() {
                        if existing.is_dir() != from_entry.is_dir() {
                            info!("类型变化，先删除旧条目: {}", path);
                            to.delete(&to_path)
                                .await
                                .map_err(|e| SyncError::transfer(path, e))?;
                        }
                    }
                }

                if from_entry.is_dir() {
                    to.create_dir(&to_path)
                        .await
                        .map_err(|e| SyncError::transfer(path, e))?;
                    Statistics::incr(&run.stats.directories_created);
                    let written = to
                        .stat(&to_path)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| from_entry.clone());
                    return Ok(PointChange::Upsert(oriented_point(path, direction, from_entry, &written)));
                }

                // 加密运行只有 OneWay/Mirror，写入方向总是源到目标
                let codec = match &run.algorithm {
                    Some(config) => Codec::Encode {
                        config: config.clone(),
                        name: Some(from_entry.name().to_string()),
                    },
                    None => Codec::Plain,
                };
                let request = TransferRequest {
                    source: ContentSource::Storage {
                        storage: from.clone(),
                        path: run.from_path(direction, action.read_path())?,
                    },
                    target: to.clone(),
                    target_path: to_path,
                    size: Some(from_entry.size),
                    modified: run.options.preserve_file_time.then_some(from_entry.modified_at),
                    codec,
                    collision: Collision::Replace {
                        recycle: run.options.use_recycle_bin,
                    },
                    settings: TransferSettings::from_options(run.options),
                    cancel: run.cancel.clone(),
                };
                let outcome = self.executor.transfer(request).await?;

                Statistics::add(&run.stats.bytes_processed, outcome.bytes);
                if action.kind == ActionKind::Create {
                    Statistics::incr(&run.stats.files_copied);
                } else {
                    Statistics::incr(&run.stats.files_updated);
                }
                debug!("已传输 ({:?}): {} ({} bytes)", direction, path, outcome.bytes);

                // KeepBoth 副本不记同步点，记录原路径当前的两侧状态
                if let Some(origin) = &action.origin_path {
                    return Ok(match (&action.source_entry, &action.target_entry) {
                        (Some(src), Some(tgt)) => PointChange::Upsert(SyncPoint::from_entries(origin, src, tgt)),
                        _ => PointChange::Keep,
                    });
                }
                let written = outcome.entry.unwrap_or_else(|| from_entry.clone());
                Ok(PointChange::Upsert(oriented_point(path, direction, from_entry, &written)))
            }
            ActionKind::Skip | ActionKind::Conflict => Ok(PointChange::Keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::SyncMode;
    use crate::core::transfer::ExecutorConfig;
    use std::path::Path;

    struct Fixture {
        _state: tempfile::TempDir,
        src: tempfile::TempDir,
        dst: tempfile::TempDir,
        engine: SyncEngine,
    }

    async fn fixture() -> Fixture {
        let state = tempfile::tempdir().unwrap();
        let pool = Arc::new(crate::db::open_pool(&state.path().join("state.db")).await.unwrap());
        let executor = Arc::new(TransferExecutor::new(ExecutorConfig::default(), None).unwrap());
        Fixture {
            _state: state,
            src: tempfile::tempdir().unwrap(),
            dst: tempfile::tempdir().unwrap(),
            engine: SyncEngine::new(pool, executor),
        }
    }

    fn options(f: &Fixture, mode: SyncMode) -> SyncOptions {
        let mut options = SyncOptions::new(
            f.src.path().to_string_lossy(),
            f.dst.path().to_string_lossy(),
            mode,
        );
        options.retry_base_delay_ms = 1;
        options
    }

    fn write(root: &Path, path: &str, data: &[u8]) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    #[tokio::test]
    async fn test_one_way_copies_tree() {
        let f = fixture().await;
        write(f.src.path(), "a.txt", b"A");
        write(f.src.path(), "d/e/b.txt", b"BB");

        let report = f
            .engine
            .run(&options(&f, SyncMode::OneWay), ProgressReporter::disabled())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.statistics.files_copied, 2);
        assert_eq!(report.statistics.directories_created, 2);
        assert_eq!(report.statistics.bytes_processed, 3);
        assert_eq!(std::fs::read(f.dst.path().join("d/e/b.txt")).unwrap(), b"BB");
    }

    #[tokio::test]
    async fn test_preview_does_not_write() {
        let f = fixture().await;
        write(f.src.path(), "a.txt", b"A");
        let plan = f.engine.preview(&options(&f, SyncMode::Mirror)).await.unwrap();
        assert_eq!(plan.summary.create_count, 1);
        assert!(!f.dst.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_type_change_replaces_directory() {
        let f = fixture().await;
        write(f.src.path(), "a.txt", b"A");
        // 目标端同名的是目录
        write(f.dst.path(), "a.txt/keep", b"x");
        let opts = options(&f, SyncMode::Mirror);
        let report = f.engine.run(&opts, ProgressReporter::disabled()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.statistics.files_updated, 1);
        assert_eq!(std::fs::read(f.dst.path().join("a.txt")).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_scan() {
        let f = fixture().await;
        let mut opts = options(&f, SyncMode::OneWay);
        opts.max_parallel_operations = 0;
        let err = f.engine.run(&opts, ProgressReporter::disabled()).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_canceled_before_execution() {
        let f = fixture().await;
        write(f.src.path(), "a.txt", b"A");
        let plan = f.engine.preview(&options(&f, SyncMode::OneWay)).await.unwrap();
        assert_eq!(plan.summary.create_count, 1);
        // 取消只影响当前运行，新运行重新开始
        f.engine.cancel();
        let report = f
            .engine
            .run(&options(&f, SyncMode::OneWay), ProgressReporter::disabled())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }
}
