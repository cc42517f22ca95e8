//! # Control Flow Graph
//!
//! Successors are read from a block's terminator. Predecessors are a view
//! over the block's user list: only users that are terminators count, so
//! other references to a block (phi entries, address-of-block operands)
//! are filtered out.
//!
//! [`ControlFlowGraph`] snapshots a function into a petgraph `DiGraph` for
//! algorithms that want a conventional graph (dominators, printing).

use crate::instructions::InstKind;
use crate::ir::{Module, ValueId};
use indexmap::IndexSet;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Terminator-derived predecessors of `bb`, one entry per edge.
pub fn predecessors(module: &Module, bb: ValueId) -> Vec<ValueId> {
    module
        .users(bb)
        .iter()
        .filter(|u| is_successor_slot(module, u.inst, u.operand as usize))
        .filter_map(|u| module.parent_block(u.inst))
        .collect()
}

/// A block use counts as an edge only when it sits in a successor slot of
/// a terminator.
fn is_successor_slot(module: &Module, inst: ValueId, operand: usize) -> bool {
    match module.inst_kind(inst) {
        Some(kind) if kind.is_terminator() => {
            kind.successor_indices(module.num_operands(inst)).contains(&operand)
        }
        _ => false,
    }
}

/// Successors of `bb` in terminator order. Empty without a terminator.
pub fn successors(module: &Module, bb: ValueId) -> Vec<ValueId> {
    match module.terminator(bb) {
        Some(term) => module.inst_successors(term),
        None => Vec::new(),
    }
}

/// Predecessors with duplicates removed, in first-seen order.
pub fn unique_predecessors(module: &Module, bb: ValueId) -> Vec<ValueId> {
    predecessors(module, bb).into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

pub fn unique_successors(module: &Module, bb: ValueId) -> Vec<ValueId> {
    successors(module, bb).into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

pub fn pred_count_unique(module: &Module, bb: ValueId) -> usize {
    unique_predecessors(module, bb).len()
}

pub fn has_predecessor(module: &Module, bb: ValueId, pred: ValueId) -> bool {
    predecessors(module, bb).contains(&pred)
}

/// Blocks reachable from the entry of `func`.
pub fn reachable_blocks(module: &Module, func: ValueId) -> HashSet<ValueId> {
    let mut visited = HashSet::new();
    let entry = match module.entry_block(func) {
        Some(entry) => entry,
        None => return visited,
    };
    let mut stack = vec![entry];
    visited.insert(entry);
    while let Some(bb) = stack.pop() {
        for succ in successors(module, bb) {
            if visited.insert(succ) {
                stack.push(succ);
            }
        }
    }
    visited
}

/// Edge label in a [`ControlFlowGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgEdge {
    /// Unconditional branch
    Unconditional,
    /// True branch of a conditional
    True,
    /// False branch of a conditional
    False,
    /// Default destination of a switch
    Default,
    /// Switch case by case position
    Case(usize),
    /// Edge into a catch handler
    Exception,
    /// Normal flow of a try region or iteration step
    Normal,
}

/// petgraph snapshot of one function's CFG.
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub graph: DiGraph<ValueId, CfgEdge>,
    pub entry: Option<NodeIndex>,
    pub block_map: HashMap<ValueId, NodeIndex>,
}

impl ControlFlowGraph {
    pub fn build(module: &Module, func: ValueId) -> Self {
        let mut graph = DiGraph::new();
        let mut block_map = HashMap::new();
        for &bb in module.function_blocks(func) {
            block_map.insert(bb, graph.add_node(bb));
        }
        for &bb in module.function_blocks(func) {
            let term = match module.terminator(bb) {
                Some(term) => term,
                None => continue,
            };
            let kind = match module.inst_kind(term) {
                Some(kind) => kind.clone(),
                None => continue,
            };
            for (pos, succ) in module.inst_successors(term).into_iter().enumerate() {
                if let (Some(&from), Some(&to)) = (block_map.get(&bb), block_map.get(&succ)) {
                    graph.add_edge(from, to, Self::edge_label(&kind, pos));
                }
            }
        }
        let entry = module.entry_block(func).and_then(|bb| block_map.get(&bb).copied());
        Self { graph, entry, block_map }
    }

    fn edge_label(kind: &InstKind, pos: usize) -> CfgEdge {
        match (kind, pos) {
            (InstKind::CondBranch | InstKind::CompareBranch(_), 0) => CfgEdge::True,
            (InstKind::CondBranch | InstKind::CompareBranch(_), _) => CfgEdge::False,
            (InstKind::Switch | InstKind::SwitchImm, 0) => CfgEdge::Default,
            (InstKind::Switch | InstKind::SwitchImm, n) => CfgEdge::Case(n - 1),
            (InstKind::TryStart | InstKind::TryEnd, 0) => CfgEdge::Exception,
            (InstKind::TryStart | InstKind::TryEnd | InstKind::GetPNames | InstKind::GetNextPName, _) => {
                CfgEdge::Normal
            }
            _ => CfgEdge::Unconditional,
        }
    }

    pub fn node(&self, bb: ValueId) -> Option<NodeIndex> {
        self.block_map.get(&bb).copied()
    }

    pub fn block(&self, node: NodeIndex) -> ValueId {
        self.graph[node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::IrBuilder;

    #[test]
    fn test_phi_use_is_not_a_predecessor() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let exit = builder.create_block().unwrap();
        let cond = builder.literal_bool(true);
        builder.set_insert_point(entry);
        builder.create_cond_branch(cond, exit, exit).unwrap();
        builder.set_insert_point(exit);
        let undef = builder.literal_undefined();
        builder.create_phi(&[(undef, entry)]).unwrap();
        builder.create_return(undef).unwrap();

        assert_eq!(predecessors(&module, exit), vec![entry, entry]);
        assert_eq!(unique_predecessors(&module, exit), vec![entry]);
        // The phi's reference to `entry` does not make exit a predecessor.
        assert!(predecessors(&module, entry).is_empty());
        assert_eq!(successors(&module, entry), vec![exit, exit]);
    }

    #[test]
    fn test_petgraph_snapshot_labels() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let a = builder.create_block().unwrap();
        let b = builder.create_block().unwrap();
        let cond = builder.literal_bool(true);
        let undef = builder.literal_undefined();
        builder.set_insert_point(entry);
        builder.create_cond_branch(cond, a, b).unwrap();
        builder.set_insert_point(a);
        builder.create_return(undef).unwrap();
        builder.set_insert_point(b);
        builder.create_return(undef).unwrap();

        let cfg = ControlFlowGraph::build(&module, func);
        assert_eq!(cfg.graph.node_count(), 3);
        assert_eq!(cfg.graph.edge_count(), 2);
        let entry_node = cfg.node(entry).unwrap();
        let labels: Vec<CfgEdge> = cfg.graph.edges(entry_node).map(|e| *e.weight()).collect();
        assert!(labels.contains(&CfgEdge::True));
        assert!(labels.contains(&CfgEdge::False));
    }
}
