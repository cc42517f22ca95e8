//! # Analysis Infrastructure
//!
//! CFG-level analyses shared by the optimization passes and the register
//! allocator:
//!
//! - [`PostOrderAnalysis`]: explicit-stack DFS order, entry block last
//! - [`FunctionScopeAnalysis`]: lexical nesting depth of functions and scopes
//! - [`block_try_depths`]: try-region nesting of each block
//! - [`FunctionAnalysis`]: bundle of dominance, post order and loops
//!
//! All analyses are snapshots; a pass that mutates the CFG recomputes them.

use crate::cfg;
use crate::dominance::DominanceInfo;
use crate::instructions::{index, InstKind};
use crate::ir::{Module, ValueId, ValueKind};
use crate::loop_analysis::LoopAnalysis;
use std::collections::{HashMap, HashSet};

/// Blocks reachable from the entry in post order.
#[derive(Debug, Clone)]
pub struct PostOrderAnalysis {
    order: Vec<ValueId>,
}

impl PostOrderAnalysis {
    pub fn new(module: &Module, func: ValueId) -> Self {
        let mut order = Vec::new();
        let entry = match module.entry_block(func) {
            Some(entry) => entry,
            None => return Self { order },
        };

        let mut visited = HashSet::new();
        visited.insert(entry);
        // (block, successors, next successor to visit)
        let mut stack: Vec<(ValueId, Vec<ValueId>, usize)> = vec![(entry, cfg::successors(module, entry), 0)];
        while let Some(top) = stack.last_mut() {
            if top.2 == top.1.len() {
                order.push(top.0);
                stack.pop();
                continue;
            }
            let next = top.1[top.2];
            top.2 += 1;
            if !visited.insert(next) {
                continue;
            }
            stack.push((next, cfg::successors(module, next), 0));
        }
        Self { order }
    }

    pub fn order(&self) -> &[ValueId] {
        &self.order
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = ValueId> + '_ {
        self.order.iter().copied()
    }

    /// Reverse post order, entry block first.
    pub fn reverse_order(&self) -> Vec<ValueId> {
        self.order.iter().rev().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Lexical nesting depth of every function and variable scope.
///
/// The top-level function has depth 0. A function whose closure is created
/// by a `CreateFunction` inside a function of depth `d` has depth `d + 1`.
/// Functions with no creating instruction fall back to their declared
/// parent; a function reachable from neither has no depth.
#[derive(Debug, Default)]
pub struct FunctionScopeAnalysis {
    depths: HashMap<ValueId, Option<i32>>,
    lexical_parent: HashMap<ValueId, Option<ValueId>>,
}

impl FunctionScopeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Function whose body creates a closure of `func`.
    pub fn lexical_parent(&mut self, module: &Module, func: ValueId) -> Option<ValueId> {
        if let Some(parent) = self.lexical_parent.get(&func) {
            return *parent;
        }
        let creator = module
            .users(func)
            .iter()
            .find(|u| {
                matches!(module.inst_kind(u.inst), Some(InstKind::CreateFunction))
                    && u.operand as usize == index::create_function::FUNCTION_CODE
            })
            .and_then(|u| module.parent_block(u.inst))
            .and_then(|bb| module.block_function(bb));
        let parent = creator.or_else(|| module.function(func).and_then(|f| f.parent));
        self.lexical_parent.insert(func, parent);
        parent
    }

    /// Memoized depth of `func`, `None` when it is part of a creation cycle.
    pub fn function_depth(&mut self, module: &Module, func: ValueId) -> Option<i32> {
        if let Some(depth) = self.depths.get(&func) {
            return *depth;
        }
        // Walk up to a memoized ancestor or the root, then fill in on the way back.
        let mut chain = vec![func];
        let mut on_chain: HashSet<ValueId> = HashSet::from([func]);
        let mut base: Option<i32> = None;
        let mut current = func;
        loop {
            match self.lexical_parent(module, current) {
                None => {
                    base = Some(-1);
                    break;
                }
                Some(parent) => {
                    if let Some(depth) = self.depths.get(&parent) {
                        base = *depth;
                        break;
                    }
                    if !on_chain.insert(parent) {
                        break;
                    }
                    chain.push(parent);
                    current = parent;
                }
            }
        }
        let mut depth = base;
        for &f in chain.iter().rev() {
            depth = depth.map(|d| d + 1);
            self.depths.insert(f, depth);
        }
        self.depths.get(&func).copied().flatten()
    }

    /// Depth of a variable scope: number of ancestors in its scope chain.
    pub fn scope_depth(&self, module: &Module, scope: ValueId) -> Option<i32> {
        let mut depth = 0;
        let mut current = scope;
        let mut seen = HashSet::new();
        while let ValueKind::VariableScope(data) = module.kind(current) {
            if !seen.insert(current) {
                return None;
            }
            match data.parent {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => return Some(depth),
            }
        }
        None
    }
}

/// Try-region nesting depth of every block with depth above zero, plus
/// the maximum depth.
///
/// A `TryStart` enters its body one level deeper; its catch target stays at
/// the outer level. Both successors of a `TryEnd` leave the region.
pub fn block_try_depths(module: &Module, func: ValueId) -> (HashMap<ValueId, u32>, u32) {
    let mut depths = HashMap::new();
    let mut max_depth = 0;
    let entry = match module.entry_block(func) {
        Some(entry) => entry,
        None => return (depths, max_depth),
    };
    let mut visited = HashSet::new();
    let mut stack = vec![(entry, 0u32)];
    while let Some((bb, depth)) = stack.pop() {
        if !visited.insert(bb) {
            continue;
        }
        if depth > 0 {
            depths.insert(bb, depth);
            max_depth = max_depth.max(depth);
        }
        let term = match module.terminator(bb) {
            Some(term) => term,
            None => continue,
        };
        match module.inst_kind(term) {
            Some(InstKind::TryStart) => {
                if let Some(catch) = module.operand(term, index::try_start::CATCH_TARGET) {
                    stack.push((catch, depth));
                }
                if let Some(body) = module.operand(term, index::try_start::TRY_BODY) {
                    stack.push((body, depth + 1));
                }
            }
            Some(InstKind::TryEnd) => {
                for succ in module.inst_successors(term) {
                    stack.push((succ, depth.saturating_sub(1)));
                }
            }
            _ => {
                for succ in module.inst_successors(term) {
                    stack.push((succ, depth));
                }
            }
        }
    }
    (depths, max_depth)
}

/// Analyses a pass usually needs together.
#[derive(Debug)]
pub struct FunctionAnalysis {
    pub dominance: DominanceInfo,
    pub post_order: PostOrderAnalysis,
    pub loops: LoopAnalysis,
}

impl FunctionAnalysis {
    pub fn compute(module: &Module, func: ValueId) -> Self {
        let dominance = DominanceInfo::new(module, func);
        let post_order = PostOrderAnalysis::new(module, func);
        let loops = LoopAnalysis::new(module, func, &dominance);
        Self { dominance, post_order, loops }
    }
}
