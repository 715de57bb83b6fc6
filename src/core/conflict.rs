use super::options::ConflictResolution;
use super::planner::{ActionKind, Direction, SkipReason, SyncAction};
use crate::storage::FileEntry;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// 冲突解决器：把 Conflict 动作映射为一个具体动作，结果不会再是 Conflict
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    policy: ConflictResolution,
}

/// 获胜的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Source,
    Target,
}

impl ConflictResolver {
    pub fn new(policy: ConflictResolution) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictResolution {
        self.policy
    }

    /// 解决一个冲突。`taken` 是已占用的路径，KeepBoth 生成的新路径会加入其中
    pub fn resolve(&self, action: SyncAction, taken: &mut BTreeSet<String>) -> SyncAction {
        if action.kind != ActionKind::Conflict {
            return action;
        }

        let resolved = match (&action.source_entry, &action.target_entry) {
            (Some(src), Some(dst)) => self.resolve_both(action.clone(), src, dst, taken),
            (Some(_), None) => self.resolve_one_sided(action.clone(), Winner::Source),
            (None, Some(_)) => self.resolve_one_sided(action.clone(), Winner::Target),
            (None, None) => SyncAction {
                kind: ActionKind::Skip,
                skip_reason: Some(SkipReason::ConflictSkipped),
                ..action.clone()
            },
        };

        info!(
            "冲突 {} 按 {} 解决为 {:?} ({:?})",
            action.relative_path, self.policy, resolved.kind, resolved.direction
        );
        resolved
    }

    fn pick(&self, src: &FileEntry, dst: &FileEntry) -> Option<Winner> {
        let source_if = |cond: bool| if cond { Winner::Source } else { Winner::Target };
        match self.policy {
            ConflictResolution::SourceWins => Some(Winner::Source),
            ConflictResolution::TargetWins => Some(Winner::Target),
            // 相同时源端优先
            ConflictResolution::Newer => Some(source_if(src.modified_at >= dst.modified_at)),
            ConflictResolution::Older => Some(source_if(src.modified_at <= dst.modified_at)),
            ConflictResolution::Larger => Some(source_if(src.size >= dst.size)),
            ConflictResolution::KeepBoth | ConflictResolution::Skip => None,
        }
    }

    fn resolve_both(
        &self,
        mut action: SyncAction,
        src: &FileEntry,
        dst: &FileEntry,
        taken: &mut BTreeSet<String>,
    ) -> SyncAction {
        match self.policy {
            ConflictResolution::Skip => {
                action.kind = ActionKind::Skip;
                action.skip_reason = Some(SkipReason::ConflictSkipped);
                action
            }
            ConflictResolution::KeepBoth if !src.is_dir() && !dst.is_dir() => {
                // 源端内容写到目标端的新名字下，目标原文件不动
                let copy = disambiguate_name(&action.relative_path, |p| taken.contains(p));
                taken.insert(copy.clone());
                debug!("保留两者: {} -> {}", action.relative_path, copy);
                action.origin_path = Some(action.relative_path.clone());
                action.relative_path = copy;
                action.kind = ActionKind::Create;
                action.direction = Direction::SourceToTarget;
                action
            }
            _ => {
                // 目录和文件互相冲突时 KeepBoth 无法改名，按源端处理
                let winner = self.pick(src, dst).unwrap_or(Winner::Source);
                action.kind = ActionKind::Update;
                action.direction = match winner {
                    Winner::Source => Direction::SourceToTarget,
                    Winner::Target => Direction::TargetToSource,
                };
                action
            }
        }
    }

    /// 一侧修改、另一侧删除
    fn resolve_one_sided(&self, mut action: SyncAction, present: Winner) -> SyncAction {
        let toward_missing = match present {
            Winner::Source => Direction::SourceToTarget,
            Winner::Target => Direction::TargetToSource,
        };
        let (kind, direction) = match self.policy {
            ConflictResolution::Skip => {
                action.kind = ActionKind::Skip;
                action.skip_reason = Some(SkipReason::ConflictSkipped);
                return action;
            }
            ConflictResolution::SourceWins if present == Winner::Target => {
                (ActionKind::Delete, Direction::SourceToTarget)
            }
            ConflictResolution::TargetWins if present == Winner::Source => {
                (ActionKind::Delete, Direction::TargetToSource)
            }
            // 修改过的内容比删除更有价值
            _ => (ActionKind::Create, toward_missing),
        };
        action.kind = kind;
        action.direction = direction;
        action
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictResolution::default())
    }
}

/// 生成不冲突的文件名：`name (n).ext`，n 从 1 开始
pub fn disambiguate_name(path: &str, exists: impl Fn(&str) -> bool) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((d, f)) => (Some(d), f),
        None => (None, path),
    };
    // 隐藏文件（.bashrc）整体视为文件名
    let (stem, ext) = match file.rfind('.') {
        Some(pos) if pos > 0 => file.split_at(pos),
        _ => (file, ""),
    };

    let mut n = 1u32;
    loop {
        let name = format!("{} ({}){}", stem, n, ext);
        let candidate = match dir {
            Some(d) => format!("{}/{}", d, name),
            None => name,
        };
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
