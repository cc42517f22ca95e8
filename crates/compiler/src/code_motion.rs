//! # Code Motion
//!
//! Moves instructions between blocks without changing the CFG:
//!
//! - **Conditional hoisting**: when both arms of a `CondBranch` start with
//!   the same computation, one copy is moved above the branch and the
//!   other is replaced by it.
//! - **Loop hoisting**: idempotent instructions without side effects whose
//!   operands are available at the preheader move into the preheader.
//! - **Sinking**: side-effect free instructions move down towards their
//!   users, never into a different loop.
//!
//! Analyses are computed once per run; none of the rewrites edit the CFG
//! so dominance and loop information stay valid throughout.

use crate::analysis::FunctionAnalysis;
use crate::cfg::predecessors;
use crate::instructions::{index, InstKind};
use crate::ir::{Module, ValueId};
use crate::side_effect::SideEffectKind;
use crate::CompilerResult;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMotionConfig {
    /// How many instructions of the other arm are searched for a match.
    pub hoist_window: usize,
    pub enable_sinking: bool,
}

impl Default for CodeMotionConfig {
    fn default() -> Self {
        Self { hoist_window: 5, enable_sinking: true }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeMotionStats {
    pub hoisted_from_branches: usize,
    pub hoisted_from_loops: usize,
    pub sunk: usize,
}

#[derive(Debug, Default)]
pub struct CodeMotion {
    config: CodeMotionConfig,
    stats: CodeMotionStats,
}

impl CodeMotion {
    pub fn new(config: CodeMotionConfig) -> Self {
        Self { config, stats: CodeMotionStats::default() }
    }

    pub fn stats(&self) -> CodeMotionStats {
        self.stats
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let analysis = FunctionAnalysis::compute(module, func);
        let mut changed = self.hoist_from_branches(module, &analysis);
        changed |= self.hoist_from_loops(module, &analysis);
        if self.config.enable_sinking {
            changed |= self.sink(module, &analysis);
        }
        log::debug!(
            "[CODEMOTION] {}: {} hoisted from branches, {} from loops, {} sunk",
            module.function_name(func),
            self.stats.hoisted_from_branches,
            self.stats.hoisted_from_loops,
            self.stats.sunk
        );
        Ok(changed)
    }

    // ========================================
    // Conditional hoisting
    // ========================================

    fn hoist_from_branches(&mut self, module: &mut Module, analysis: &FunctionAnalysis) -> bool {
        let mut changed = false;
        for bb in analysis.post_order.iter() {
            let branch = match module.terminator(bb) {
                Some(term) if matches!(module.inst_kind(term), Some(InstKind::CondBranch)) => term,
                _ => continue,
            };
            let (left, right) = match (
                module.operand(branch, index::cond_branch::TRUE_BLOCK),
                module.operand(branch, index::cond_branch::FALSE_BLOCK),
            ) {
                (Some(l), Some(r)) => (l, r),
                _ => continue,
            };
            if left == right || left == bb || right == bb {
                continue;
            }
            if predecessors(module, left).len() != 1 || predecessors(module, right).len() != 1 {
                continue;
            }
            while self.hoist_pair(module, branch, left, right) || self.hoist_pair(module, branch, right, left) {
                changed = true;
            }
        }
        changed
    }

    /// Hoist the first instruction of `from` if `other` computes the same
    /// thing within the search window.
    fn hoist_pair(&mut self, module: &mut Module, branch: ValueId, from: ValueId, other: ValueId) -> bool {
        let head = match module.block_insts(from).first() {
            Some(&head) => head,
            None => return false,
        };
        if module.is_terminator(head) || module.is_phi(head) || module.side_effect(head).first_in_block {
            return false;
        }
        let effectful = module.side_effect(head).kind() != SideEffectKind::None;
        let candidates: Vec<ValueId> =
            module.block_insts(other).iter().copied().take(self.config.hoist_window).collect();
        for cand in candidates {
            if module.is_terminator(cand) {
                break;
            }
            if is_identical(module, head, cand) {
                log::debug!("[CODEMOTION] hoisting {} above {}", head, branch);
                module.move_before(head, branch);
                module.replace_all_uses_with(cand, head);
                module.erase_from_parent(cand);
                self.stats.hoisted_from_branches += 1;
                return true;
            }
            // An effectful match may not be reordered with other effects.
            if effectful && module.side_effect(cand).kind() != SideEffectKind::None {
                break;
            }
        }
        false
    }

    // ========================================
    // Loop hoisting
    // ========================================

    fn hoist_from_loops(&mut self, module: &mut Module, analysis: &FunctionAnalysis) -> bool {
        let mut changed = false;
        for bb in analysis.post_order.reverse_order() {
            let preheader = match analysis.loops.loop_preheader(bb) {
                Some(pre) => pre,
                None => continue,
            };
            let anchor = match module.terminator(preheader) {
                Some(term) => term,
                None => continue,
            };
            for inst in module.block_insts(bb).to_vec() {
                if !is_loop_invariant_candidate(module, inst) {
                    continue;
                }
                let available = module.operands(inst).into_iter().all(|op| {
                    !module.is_instruction(op) || analysis.dominance.dominates_inst(module, op, anchor)
                });
                if !available {
                    continue;
                }
                log::debug!("[CODEMOTION] hoisting {} into preheader {}", inst, preheader);
                module.move_before(inst, anchor);
                self.stats.hoisted_from_loops += 1;
                changed = true;
            }
        }
        changed
    }

    // ========================================
    // Sinking
    // ========================================

    fn sink(&mut self, module: &mut Module, analysis: &FunctionAnalysis) -> bool {
        let mut changed = false;
        for bb in analysis.post_order.iter() {
            // Bottom-up so that operands can follow a sunk user.
            for inst in module.block_insts(bb).to_vec().into_iter().rev() {
                if module.parent_block(inst) != Some(bb) || !is_sink_candidate(module, inst) {
                    continue;
                }
                if let Some(before) = sink_destination(module, analysis, bb, inst) {
                    log::debug!("[CODEMOTION] sinking {} before {}", inst, before);
                    module.move_before(inst, before);
                    self.stats.sunk += 1;
                    changed = true;
                }
            }
        }
        changed
    }
}

fn is_identical(module: &Module, a: ValueId, b: ValueId) -> bool {
    if a == b || module.inst_kind(a) != module.inst_kind(b) {
        return false;
    }
    let ops_a = module.operand_slots(a).iter().map(|slot| slot.map(|op| op.value));
    let ops_b = module.operand_slots(b).iter().map(|slot| slot.map(|op| op.value));
    ops_a.eq(ops_b)
}

fn is_loop_invariant_candidate(module: &Module, inst: ValueId) -> bool {
    if module.is_terminator(inst) || module.is_phi(inst) || module.is_alloc_stack(inst) {
        return false;
    }
    let effect = module.side_effect(inst);
    effect.kind() == SideEffectKind::None && effect.idempotent && !effect.first_in_block
}

fn is_sink_candidate(module: &Module, inst: ValueId) -> bool {
    if module.is_terminator(inst) || module.is_phi(inst) || module.is_alloc_stack(inst) {
        return false;
    }
    if !module.has_users(inst) {
        return false;
    }
    let effect = module.side_effect(inst);
    effect.kind() == SideEffectKind::None && !effect.first_in_block
}

/// Instruction to sink `inst` in front of, if sinking is profitable and
/// legal. Phi users count as uses at the end of the incoming block.
fn sink_destination(module: &Module, analysis: &FunctionAnalysis, src: ValueId, inst: ValueId) -> Option<ValueId> {
    let mut use_blocks: IndexSet<ValueId> = IndexSet::new();
    let mut direct_users = Vec::new();
    for user in module.user_insts(inst) {
        if module.is_phi(user) {
            for (value, incoming) in module.phi_entries(user) {
                if value == inst {
                    use_blocks.insert(incoming);
                }
            }
        } else {
            use_blocks.insert(module.parent_block(user)?);
            direct_users.push(user);
        }
    }

    let dom = &analysis.dominance;
    let mut blocks = use_blocks.iter().copied();
    let first = blocks.next()?;
    let target = blocks.try_fold(first, |acc, b| dom.nearest_common_dominator(acc, b))?;
    if !dom.dominates(src, target) || !same_loop(analysis, src, target) {
        return None;
    }

    let before = direct_users
        .iter()
        .copied()
        .filter(|&user| module.parent_block(user) == Some(target))
        .min_by_key(|&user| module.inst_position(user))
        .or_else(|| module.terminator(target))?;

    if target == src {
        let from = module.inst_position(inst)?;
        let to = module.inst_position(before)?;
        if to <= from + 1 {
            return None;
        }
    }
    Some(before)
}

/// Blocks share the innermost loop. Blocks of a loop without a unique
/// header only match themselves.
fn same_loop(analysis: &FunctionAnalysis, a: ValueId, b: ValueId) -> bool {
    if a == b {
        return true;
    }
    let loops = &analysis.loops;
    match (loops.is_block_in_loop(a), loops.is_block_in_loop(b)) {
        (false, false) => true,
        (true, true) => match (loops.loop_header(a), loops.loop_header(b)) {
            (Some(ha), Some(hb)) => ha == hb,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::BinaryOp;
    use crate::ir_builder::IrBuilder;

    #[test]
    fn test_identical_arms_are_hoisted() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let left = builder.create_block().unwrap();
        let right = builder.create_block().unwrap();
        let two = builder.literal_number(2.0);
        let three = builder.literal_number(3.0);
        let cond = builder.literal_bool(true);
        builder.set_insert_point(entry);
        let branch = builder.create_cond_branch(cond, left, right).unwrap();
        builder.set_insert_point(left);
        let a = builder.create_binary_operator(BinaryOp::Multiply, two, three).unwrap();
        builder.create_return(a).unwrap();
        builder.set_insert_point(right);
        let b = builder.create_binary_operator(BinaryOp::Multiply, two, three).unwrap();
        let ret_b = builder.create_return(b).unwrap();

        let mut pass = CodeMotion::new(CodeMotionConfig::default());
        assert!(pass.run_on_function(&mut module, func).unwrap());
        assert_eq!(module.parent_block(a), Some(entry));
        assert_eq!(module.inst_position(a), module.inst_position(branch).map(|p| p - 1));
        assert!(module.is_erased(b));
        assert_eq!(module.operand(ret_b, 0), Some(a));
        assert_eq!(pass.stats().hoisted_from_branches, 1);
    }

    #[test]
    fn test_window_limits_search() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let left = builder.create_block().unwrap();
        let right = builder.create_block().unwrap();
        let two = builder.literal_number(2.0);
        let cond = builder.literal_bool(true);
        builder.set_insert_point(entry);
        builder.create_cond_branch(cond, left, right).unwrap();
        builder.set_insert_point(left);
        let a = builder.create_unary_operator(crate::instructions::UnaryOp::Minus, two).unwrap();
        builder.create_return(a).unwrap();
        builder.set_insert_point(right);
        let mut last = two;
        for _ in 0..3 {
            last = builder.create_binary_operator(BinaryOp::Add, last, two).unwrap();
        }
        let b = builder.create_unary_operator(crate::instructions::UnaryOp::Minus, two).unwrap();
        builder.create_return(b).unwrap();

        let config = CodeMotionConfig { hoist_window: 2, enable_sinking: false };
        let mut pass = CodeMotion::new(config);
        pass.run_on_function(&mut module, func).unwrap();
        assert_eq!(module.parent_block(a), Some(left));
        assert!(!module.is_erased(b));
    }
}
