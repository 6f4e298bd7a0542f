//! 安全检查
//!
//! 在任何决策执行之前检查整批决策的聚合属性。某个类别违规时，
//! 这一类决策整批不执行（不做部分执行），本轮游标也不推进。

use crate::core::decision::{Action, Decision};
use std::fmt;

/// 报告中列出的示例路径数
const EXAMPLE_LIMIT: usize = 5;

/// 安全阈值
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    pub max_delete_count: usize,
    /// 百分比
    pub max_delete_percent: f64,
    /// 跟踪条目数不超过该值时不做删除检查
    pub min_items_floor: usize,
    /// 下载完成后至少保留的本地空间（字节）
    pub min_free_space: u64,
    /// 明确允许大批量删除
    pub allow_mass_delete: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        crate::config::SyncSettings::default().safety()
    }
}

/// 被拦截的决策类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedCategory {
    /// 本地和远端删除
    Deletes,
    /// 写入本地的下载（含冲突副本）
    Downloads,
}

impl BlockedCategory {
    pub fn covers(&self, action: &Action) -> bool {
        match self {
            BlockedCategory::Deletes => action.is_delete(),
            BlockedCategory::Downloads => {
                matches!(action, Action::Download { .. } | Action::ConflictDuplicate { .. })
            }
        }
    }
}

/// 安全检查违规
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    MassDelete {
        count: usize,
        total: usize,
        percent: f64,
        max_count: usize,
        max_percent: f64,
        examples: Vec<String>,
    },
    LowDiskSpace {
        required: u64,
        available: u64,
        floor: u64,
        examples: Vec<String>,
    },
}

impl Violation {
    pub fn category(&self) -> BlockedCategory {
        match self {
            Violation::MassDelete { .. } => BlockedCategory::Deletes,
            Violation::LowDiskSpace { .. } => BlockedCategory::Downloads,
        }
    }
}

fn format_examples(f: &mut fmt::Formatter<'_>, examples: &[String]) -> fmt::Result {
    if !examples.is_empty() {
        write!(f, "; e.g. {}", examples.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MassDelete {
                count,
                total,
                percent,
                max_count,
                max_percent,
                examples,
            } => {
                write!(
                    f,
                    "refusing to delete {} of {} tracked items ({:.1}%), limits are {} items and {:.1}%",
                    count, total, percent, max_count, max_percent
                )?;
                format_examples(f, examples)
            }
            Violation::LowDiskSpace {
                required,
                available,
                floor,
                examples,
            } => {
                write!(
                    f,
                    "downloads need {} bytes plus a {} byte reserve but only {} bytes are free",
                    required, floor, available
                )?;
                format_examples(f, examples)
            }
        }
    }
}

/// 安全检查器
#[derive(Debug, Clone, Default)]
pub struct SafetyChecker {
    config: SafetyConfig,
}

impl SafetyChecker {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// 删除量检查
    ///
    /// 删除数超过上限、占比超过上限、且跟踪条目数超过下限三者同时成立时拦截。
    pub fn check(&self, decisions: &[Decision], total: usize) -> Option<Violation> {
        if self.config.allow_mass_delete {
            return None;
        }

        let deletes: Vec<&Decision> = decisions.iter().filter(|d| d.action.is_delete()).collect();
        let count = deletes.len();
        if count == 0 {
            return None;
        }

        let percent = if total == 0 {
            100.0
        } else {
            count as f64 * 100.0 / total as f64
        };

        let violated = count > self.config.max_delete_count
            && percent > self.config.max_delete_percent
            && total > self.config.min_items_floor;
        if !violated {
            return None;
        }

        Some(Violation::MassDelete {
            count,
            total,
            percent,
            max_count: self.config.max_delete_count,
            max_percent: self.config.max_delete_percent,
            examples: deletes
                .iter()
                .take(EXAMPLE_LIMIT)
                .map(|d| d.path.clone())
                .collect(),
        })
    }

    /// 下载前的本地空间检查
    pub fn check_free_space(&self, decisions: &[Decision], available: u64) -> Option<Violation> {
        let downloads: Vec<&Decision> = decisions.iter().filter(|d| d.download_bytes() > 0).collect();
        let required: u64 = downloads.iter().map(|d| d.download_bytes()).sum();
        if required == 0 || required.saturating_add(self.config.min_free_space) <= available {
            return None;
        }

        let mut largest = downloads;
        largest.sort_by_key(|d| std::cmp::Reverse(d.download_bytes()));
        Some(Violation::LowDiskSpace {
            required,
            available,
            floor: self.config.min_free_space,
            examples: largest
                .iter()
                .take(EXAMPLE_LIMIT)
                .map(|d| d.path.clone())
                .collect(),
        })
    }
}
