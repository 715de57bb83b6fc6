//! 变更规划：合并两侧扫描结果，为每个路径生成一个同步动作

use super::comparator::CompareEngine;
use super::conflict::ConflictResolver;
use super::options::{SyncMode, SyncOptions};
use super::scanner::{PathError, ScanResult};
use super::sync_state::SyncPoint;
use crate::storage::{FileEntry, Storage};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Skip,
    Conflict,
}

/// 数据流向。Delete 作用在流向的目标一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    SourceToTarget,
    TargetToSource,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::SourceToTarget => Direction::TargetToSource,
            Direction::TargetToSource => Direction::SourceToTarget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// 两侧一致
    Unchanged,
    /// 单向模式下目标多出的条目
    TargetOnly,
    /// 位于扫描失败的子树下
    ScanFailed,
    Symlink,
    /// 冲突按 Skip 策略处理
    ConflictSkipped,
    /// 两侧不同，但自上次同步点以来都没有变化（例如 KeepBoth 之后）
    Diverged,
    /// 目录下还有需要保留的内容
    NotEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    pub relative_path: String,
    pub kind: ActionKind,
    pub direction: Direction,
    pub source_entry: Option<FileEntry>,
    /// KeepBoth 产生的 Create 中，这里是原路径上保留不动的目标条目
    pub target_entry: Option<FileEntry>,
    /// KeepBoth 副本的内容来源路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl SyncAction {
    pub fn new(
        path: &str,
        kind: ActionKind,
        direction: Direction,
        source: Option<&FileEntry>,
        target: Option<&FileEntry>,
    ) -> Self {
        Self {
            relative_path: path.to_string(),
            kind,
            direction,
            source_entry: source.cloned(),
            target_entry: target.cloned(),
            origin_path: None,
            skip_reason: None,
        }
    }

    pub fn skip(
        path: &str,
        reason: SkipReason,
        source: Option<&FileEntry>,
        target: Option<&FileEntry>,
    ) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::new(path, ActionKind::Skip, Direction::SourceToTarget, source, target)
        }
    }

    /// 数据来源一侧的条目
    pub fn from_entry(&self) -> Option<&FileEntry> {
        match self.direction {
            Direction::SourceToTarget => self.source_entry.as_ref(),
            Direction::TargetToSource => self.target_entry.as_ref(),
        }
    }

    /// 被写入或删除一侧的条目
    pub fn to_entry(&self) -> Option<&FileEntry> {
        match self.direction {
            Direction::SourceToTarget => self.target_entry.as_ref(),
            Direction::TargetToSource => self.source_entry.as_ref(),
        }
    }

    pub fn is_dir(&self) -> bool {
        let entry = match self.kind {
            ActionKind::Delete => self.to_entry(),
            _ => self.from_entry().or(self.to_entry()),
        };
        entry.is_some_and(|e| e.is_dir())
    }

    /// 读取内容时使用的路径
    pub fn read_path(&self) -> &str {
        self.origin_path.as_deref().unwrap_or(&self.relative_path)
    }

    /// 需要传输的字节数
    pub fn transfer_size(&self) -> u64 {
        match self.kind {
            ActionKind::Create | ActionKind::Update if !self.is_dir() => {
                self.from_entry().map(|e| e.size).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub create_count: usize,
    pub update_count: usize,
    pub delete_count: usize,
    pub skip_count: usize,
    pub conflict_count: usize,
    /// 从目标写回源的动作数
    pub reverse_count: usize,
    pub transfer_bytes: u64,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.create_count + self.update_count + self.delete_count + self.skip_count
    }

    /// 是否有需要执行的变更
    pub fn has_changes(&self) -> bool {
        self.create_count + self.update_count + self.delete_count > 0
    }
}

pub fn summarize(actions: &[SyncAction]) -> PlanSummary {
    let mut summary = PlanSummary::default();
    for action in actions {
        match action.kind {
            ActionKind::Create => summary.create_count += 1,
            ActionKind::Update => summary.update_count += 1,
            ActionKind::Delete => summary.delete_count += 1,
            ActionKind::Skip => summary.skip_count += 1,
            ActionKind::Conflict => summary.conflict_count += 1,
        }
        if matches!(action.kind, ActionKind::Create | ActionKind::Update | ActionKind::Delete)
            && action.direction == Direction::TargetToSource
        {
            summary.reverse_count += 1;
        }
        summary.transfer_bytes += action.transfer_size();
    }
    summary
}

/// 一次规划的结果（预览时原样输出）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub actions: Vec<SyncAction>,
    pub summary: PlanSummary,
    pub scan_errors: Vec<PathError>,
}

/// 创建按路径分量升序（父目录在前），删除按降序排在最后（子项在前）
pub fn order_actions(actions: &mut [SyncAction]) {
    actions.sort_by(|a, b| {
        let da = a.kind == ActionKind::Delete;
        let db = b.kind == ActionKind::Delete;
        da.cmp(&db).then_with(|| {
            let pa = a.relative_path.split('/');
            let pb = b.relative_path.split('/');
            if da {
                pb.cmp(pa)
            } else {
                pa.cmp(pb)
            }
        })
    });
}

/// 目录删除只在其下所有条目都被同向删除时成立；
/// 否则目录需要在缺失的一侧重建，或者原样保留
pub fn reconcile_directory_deletes(actions: &mut [SyncAction]) {
    let index: BTreeMap<String, usize> = actions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.relative_path.clone(), i))
        .collect();

    let mut changes = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        if action.kind != ActionKind::Delete || !action.is_dir() {
            continue;
        }
        let prefix = format!("{}/", action.relative_path);
        let mut keep_delete = true;
        let mut recreate = false;
        for (_, &j) in index
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
        {
            let child = &actions[j];
            match child.kind {
                ActionKind::Delete if child.direction == action.direction => {}
                ActionKind::Create | ActionKind::Update
                    if child.direction == action.direction.reverse() =>
                {
                    keep_delete = false;
                    recreate = true;
                }
                _ => keep_delete = false,
            }
        }
        if !keep_delete {
            changes.push((i, recreate));
        }
    }

    for (i, recreate) in changes {
        let action = &mut actions[i];
        if recreate {
            debug!("目录下有新内容，改为重建: {}", action.relative_path);
            action.kind = ActionKind::Create;
            action.direction = action.direction.reverse();
        } else {
            debug!("目录下有保留内容，跳过删除: {}", action.relative_path);
            action.kind = ActionKind::Skip;
            action.skip_reason = Some(SkipReason::NotEmpty);
        }
    }
}

/// 解决冲突、修正目录删除并排序，得到可执行的动作序列
pub fn finalize(mut actions: Vec<SyncAction>, resolver: &ConflictResolver) -> Vec<SyncAction> {
    let mut taken: BTreeSet<String> = actions
        .iter()
        .map(|a| a.relative_path.clone())
        .collect();
    for action in actions.iter_mut() {
        if action.kind == ActionKind::Conflict {
            *action = resolver.resolve(action.clone(), &mut taken);
        }
    }
    reconcile_directory_deletes(&mut actions);
    order_actions(&mut actions);
    actions
}

pub struct ChangePlanner<'a> {
    options: &'a SyncOptions,
    compare: &'a CompareEngine,
    source: &'a dyn Storage,
    target: &'a dyn Storage,
}

impl<'a> ChangePlanner<'a> {
    pub fn new(
        options: &'a SyncOptions,
        compare: &'a CompareEngine,
        source: &'a dyn Storage,
        target: &'a dyn Storage,
    ) -> Self {
        Self {
            options,
            compare,
            source,
            target,
        }
    }

    /// 生成有序的动作列表，冲突保持为 Conflict 等待解决
    pub async fn plan(
        &self,
        source: &ScanResult,
        target: &ScanResult,
        points: &HashMap<String, SyncPoint>,
    ) -> Vec<SyncAction> {
        let paths: BTreeSet<&String> = source.entries.keys().chain(target.entries.keys()).collect();

        // 元数据无法判断的文件对需要读取内容，并发比较
        let pending: Vec<(&FileEntry, &FileEntry)> = paths
            .iter()
            .filter_map(|p| Some((source.entries.get(*p)?, target.entries.get(*p)?)))
            .filter(|(s, t)| self.compare.metadata_equal(s, t).is_none())
            .collect();
        let content_results: HashMap<String, bool> = stream::iter(pending)
            .map(|(s, t)| async move {
                let equal = self
                    .compare
                    .are_equal_or_assume_different(s, self.source, t, self.target)
                    .await;
                (s.path.clone(), equal)
            })
            .buffer_unordered(self.options.max_parallel_operations.max(1))
            .collect()
            .await;

        let mut actions = Vec::with_capacity(paths.len());
        for path in paths {
            let src = source.entries.get(path);
            let tgt = target.entries.get(path);

            if source.is_under_failed_dir(path) || target.is_under_failed_dir(path) {
                actions.push(SyncAction::skip(path, SkipReason::ScanFailed, src, tgt));
                continue;
            }
            // 符号链接的文件按其指向的内容同步，链接目录只记录不展开
            let linked_dir =
                |e: Option<&FileEntry>| e.is_some_and(|e| e.attributes.is_symlink && e.is_dir());
            if !self.options.follow_symlinks && (linked_dir(src) || linked_dir(tgt)) {
                actions.push(SyncAction::skip(path, SkipReason::Symlink, src, tgt));
                continue;
            }

            let equal = match (src, tgt) {
                (Some(s), Some(t)) => self
                    .compare
                    .metadata_equal(s, t)
                    .or_else(|| content_results.get(path).copied())
                    .unwrap_or(false),
                _ => false,
            };
            actions.push(self.classify(path, src, tgt, equal, points.get(path)));
        }

        order_actions(&mut actions);
        let summary = summarize(&actions);
        info!(
            "规划完成: 创建 {}, 更新 {}, 删除 {}, 跳过 {}, 冲突 {}",
            summary.create_count,
            summary.update_count,
            summary.delete_count,
            summary.skip_count,
            summary.conflict_count
        );
        actions
    }

    fn classify(
        &self,
        path: &str,
        src: Option<&FileEntry>,
        tgt: Option<&FileEntry>,
        equal: bool,
        point: Option<&SyncPoint>,
    ) -> SyncAction {
        use ActionKind::*;
        use Direction::*;

        let mode = self.options.sync_mode;
        let threshold = self.options.date_time_threshold_seconds;

        match (src, tgt) {
            (Some(s), Some(t)) => {
                if equal {
                    return SyncAction::skip(path, SkipReason::Unchanged, src, tgt);
                }
                if mode != SyncMode::TwoWay {
                    return SyncAction::new(path, Update, SourceToTarget, src, tgt);
                }
                match point {
                    None => SyncAction::new(path, Conflict, SourceToTarget, src, tgt),
                    Some(p) => match (p.source_changed(s, threshold), p.target_changed(t, threshold)) {
                        (true, false) => SyncAction::new(path, Update, SourceToTarget, src, tgt),
                        (false, true) => SyncAction::new(path, Update, TargetToSource, src, tgt),
                        (true, true) => SyncAction::new(path, Conflict, SourceToTarget, src, tgt),
                        (false, false) => SyncAction::skip(path, SkipReason::Diverged, src, tgt),
                    },
                }
            }
            (Some(_), None) => match (mode, point) {
                // 上次同步时目标端有它，之后被删除：交给冲突解决
                (SyncMode::TwoWay, Some(_)) => SyncAction::new(path, Conflict, SourceToTarget, src, None),
                _ => SyncAction::new(path, Create, SourceToTarget, src, None),
            },
            (None, Some(_)) => match mode {
                SyncMode::OneWay => SyncAction::skip(path, SkipReason::TargetOnly, None, tgt),
                SyncMode::Mirror => SyncAction::new(path, Delete, SourceToTarget, None, tgt),
                SyncMode::TwoWay => SyncAction::new(path, Create, TargetToSource, None, tgt),
            },
            (None, None) => SyncAction::skip(path, SkipReason::Unchanged, None, None),
        }
    }
}
