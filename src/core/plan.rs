//! 执行计划
//!
//! 决策进入工作池之前按依赖分成若干阶段：同一阶段内的决策互不依赖，
//! 可以并发执行；阶段之间严格串行。工作池本身不关心顺序。

use crate::core::decision::Decision;
use crate::core::path;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Plan {
    /// 要给同一路径上的放置让位的删除，按深度由深到浅，最先执行
    pub clearing: Vec<Vec<Decision>>,
    /// 放置类决策（创建、写入、移动），按目标路径深度由浅到深
    pub stages: Vec<Vec<Decision>>,
    /// 其余删除决策，按深度由深到浅，全部放置完成后执行
    pub deletes: Vec<Vec<Decision>>,
    /// 只更新状态库的决策
    pub state_only: Vec<Decision>,
}

impl Plan {
    pub fn build(decisions: Vec<Decision>) -> Self {
        let (state_only, io): (Vec<Decision>, Vec<Decision>) =
            decisions.into_iter().partition(|d| d.action.is_state_only());
        let (deletes, placements): (Vec<Decision>, Vec<Decision>) =
            io.into_iter().partition(|d| d.action.is_delete());

        // 路径被本轮放置占用（类型互换）的删除，连同其子树先执行
        let blocked: Vec<String> = deletes
            .iter()
            .filter(|d| {
                placements
                    .iter()
                    .any(|p| p.path == d.path || path::is_within(&p.path, &d.path))
            })
            .map(|d| d.path.clone())
            .collect();
        let (clearing, deletes): (Vec<Decision>, Vec<Decision>) = deletes
            .into_iter()
            .partition(|d| blocked.iter().any(|b| d.path == *b || path::is_within(&d.path, b)));

        Self {
            clearing: by_depth(clearing).into_values().rev().collect(),
            stages: by_depth(placements).into_values().collect(),
            deletes: by_depth(deletes).into_values().rev().collect(),
            state_only,
        }
    }

    /// 需要 IO 的决策数
    pub fn io_count(&self) -> usize {
        self.io_stages().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.io_count() == 0 && self.state_only.is_empty()
    }

    /// 所有 IO 阶段：让位删除、放置、其余删除
    pub fn io_stages(&self) -> impl Iterator<Item = &Vec<Decision>> {
        self.clearing.iter().chain(&self.stages).chain(&self.deletes)
    }
}

fn by_depth(decisions: Vec<Decision>) -> BTreeMap<usize, Vec<Decision>> {
    let mut grouped: BTreeMap<usize, Vec<Decision>> = BTreeMap::new();
    for decision in decisions {
        grouped
            .entry(path::depth(&decision.path))
            .or_default()
            .push(decision);
    }
    grouped
}
