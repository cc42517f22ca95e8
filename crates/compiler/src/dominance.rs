//! # Dominance
//!
//! Dominator tree of a function's CFG. Immediate dominators come from
//! petgraph's Cooper-Harvey-Kennedy implementation over a
//! [`ControlFlowGraph`] snapshot; tree levels, DFS intervals and dominance
//! frontiers are derived here.
//!
//! Only blocks reachable from the entry have a tree node. Following the
//! usual convention an unreachable block is dominated by every block and
//! dominates nothing.

use crate::cfg::{self, ControlFlowGraph};
use crate::ir::{Module, ValueId};
use petgraph::algo::dominators::simple_fast;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct DominanceInfo {
    root: Option<ValueId>,
    idom: HashMap<ValueId, ValueId>,
    children: HashMap<ValueId, Vec<ValueId>>,
    level: HashMap<ValueId, u32>,
    /// Pre/post DFS numbers over the tree for O(1) ancestor queries.
    dfs_in: HashMap<ValueId, u32>,
    dfs_out: HashMap<ValueId, u32>,
    frontiers: HashMap<ValueId, HashSet<ValueId>>,
}

impl DominanceInfo {
    pub fn new(module: &Module, func: ValueId) -> Self {
        let cfg = ControlFlowGraph::build(module, func);
        let mut info = DominanceInfo {
            root: None,
            idom: HashMap::new(),
            children: HashMap::new(),
            level: HashMap::new(),
            dfs_in: HashMap::new(),
            dfs_out: HashMap::new(),
            frontiers: HashMap::new(),
        };
        let entry = match cfg.entry {
            Some(entry) => entry,
            None => return info,
        };
        let root = cfg.block(entry);
        info.root = Some(root);

        let doms = simple_fast(&cfg.graph, entry);
        // Keep function block order for children so traversals are stable.
        for &bb in module.function_blocks(func) {
            let node = match cfg.node(bb) {
                Some(node) => node,
                None => continue,
            };
            if node == entry {
                continue;
            }
            if let Some(parent) = doms.immediate_dominator(node) {
                let parent = cfg.block(parent);
                info.idom.insert(bb, parent);
                info.children.entry(parent).or_default().push(bb);
            }
        }

        info.number_tree(root);
        info.compute_frontiers(module, func);
        log::trace!("[DOM] {} reachable blocks in {}", info.level.len(), module.function_name(func));
        info
    }

    /// Assign levels and DFS intervals with an explicit stack.
    fn number_tree(&mut self, root: ValueId) {
        let mut counter = 0u32;
        let mut stack: Vec<(ValueId, usize)> = vec![(root, 0)];
        self.level.insert(root, 0);
        self.dfs_in.insert(root, counter);
        counter += 1;
        while let Some(top) = stack.len().checked_sub(1) {
            let (node, next_child) = stack[top];
            let child = self.children.get(&node).and_then(|c| c.get(next_child)).copied();
            match child {
                Some(child) => {
                    stack[top].1 += 1;
                    let level = self.level.get(&node).copied().unwrap_or(0) + 1;
                    self.level.insert(child, level);
                    self.dfs_in.insert(child, counter);
                    counter += 1;
                    stack.push((child, 0));
                }
                None => {
                    self.dfs_out.insert(node, counter);
                    counter += 1;
                    stack.pop();
                }
            }
        }
    }

    fn compute_frontiers(&mut self, module: &Module, func: ValueId) {
        for &bb in module.function_blocks(func) {
            if !self.has_node(bb) {
                continue;
            }
            let preds: Vec<ValueId> = cfg::unique_predecessors(module, bb)
                .into_iter()
                .filter(|p| self.has_node(*p))
                .collect();
            if preds.len() < 2 {
                continue;
            }
            let stop = self.idom.get(&bb).copied();
            for pred in preds {
                let mut runner = Some(pred);
                while let Some(r) = runner {
                    if Some(r) == stop {
                        break;
                    }
                    self.frontiers.entry(r).or_default().insert(bb);
                    runner = self.idom.get(&r).copied();
                }
            }
        }
    }

    pub fn root(&self) -> Option<ValueId> {
        self.root
    }

    /// `bb` is reachable from the entry.
    pub fn has_node(&self, bb: ValueId) -> bool {
        self.level.contains_key(&bb)
    }

    pub fn idom(&self, bb: ValueId) -> Option<ValueId> {
        self.idom.get(&bb).copied()
    }

    pub fn children(&self, bb: ValueId) -> &[ValueId] {
        self.children.get(&bb).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Depth in the dominator tree, the root has level 0.
    pub fn level(&self, bb: ValueId) -> Option<u32> {
        self.level.get(&bb).copied()
    }

    pub fn frontier(&self, bb: ValueId) -> Option<&HashSet<ValueId>> {
        self.frontiers.get(&bb)
    }

    pub fn dominates(&self, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        let (b_in, b_out) = match (self.dfs_in.get(&b), self.dfs_out.get(&b)) {
            (Some(i), Some(o)) => (*i, *o),
            _ => return true,
        };
        match (self.dfs_in.get(&a), self.dfs_out.get(&a)) {
            (Some(&a_in), Some(&a_out)) => a_in <= b_in && b_out <= a_out,
            _ => false,
        }
    }

    pub fn properly_dominates(&self, a: ValueId, b: ValueId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Instruction-level dominance: across blocks delegate to the blocks,
    /// inside one block `a` must come before `b`.
    pub fn properly_dominates_inst(&self, module: &Module, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return false;
        }
        let (bb_a, bb_b) = match (module.parent_block(a), module.parent_block(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        if bb_a != bb_b {
            return self.properly_dominates(bb_a, bb_b);
        }
        let insts = module.block_insts(bb_b);
        let pos_b = match insts.iter().position(|&i| i == b) {
            Some(pos) => pos,
            None => return false,
        };
        insts[..pos_b].iter().rev().any(|&i| i == a)
    }

    pub fn dominates_inst(&self, module: &Module, a: ValueId, b: ValueId) -> bool {
        a == b || self.properly_dominates_inst(module, a, b)
    }

    /// Deepest block dominating both `a` and `b`.
    pub fn nearest_common_dominator(&self, a: ValueId, b: ValueId) -> Option<ValueId> {
        let mut x = a;
        let mut y = b;
        let mut lx = self.level(x)?;
        let mut ly = self.level(y)?;
        while lx > ly {
            x = self.idom(x)?;
            lx -= 1;
        }
        while ly > lx {
            y = self.idom(y)?;
            ly -= 1;
        }
        while x != y {
            x = self.idom(x)?;
            y = self.idom(y)?;
        }
        Some(x)
    }

    /// Reachable blocks in dominator-tree preorder.
    pub fn preorder(&self) -> Vec<ValueId> {
        let mut order = Vec::with_capacity(self.level.len());
        let mut stack: Vec<ValueId> = self.root.into_iter().collect();
        while let Some(bb) = stack.pop() {
            order.push(bb);
            for &child in self.children(bb).iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}
