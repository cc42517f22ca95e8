//! # Lowering Peepholes
//!
//! Target-facing rewrites that run after the generic optimizations:
//!
//! - [`LowerSwitchIntoJumpTables`] turns dense integer switches into
//!   `SwitchImm`.
//! - [`SwitchLowering`] expands any remaining `Switch` into a chain of
//!   strict-equality conditional branches.
//! - [`LowerCondBranch`] fuses a single-use comparison with the branch
//!   that consumes it into a `CompareBranch`.

use crate::instructions::{index, BinaryOp, InstKind};
use crate::ir::{Module, ValueId};
use crate::ir_builder::IrBuilder;
use crate::types::Type;
use crate::{CompilerError, CompilerResult};

/// Minimum case count for a jump table.
pub const MIN_JUMP_TABLE_CASES: usize = 10;
/// Maximum value range per case for a jump table.
pub const MAX_JUMP_TABLE_DENSITY: u32 = 5;

fn switches_of(module: &Module, func: ValueId, kind: &InstKind) -> Vec<ValueId> {
    module
        .function_blocks(func)
        .iter()
        .filter_map(|&bb| module.terminator(bb))
        .filter(|&term| module.inst_kind(term) == Some(kind))
        .collect()
}

// ========================================
// Switch into ifs
// ========================================

#[derive(Debug, Default)]
pub struct SwitchLowering {
    lowered: usize,
}

impl SwitchLowering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lowered(&self) -> usize {
        self.lowered
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let switches = switches_of(module, func, &InstKind::Switch);
        for &switch in &switches {
            self.lower_switch_into_ifs(module, func, switch)?;
        }
        Ok(!switches.is_empty())
    }

    /// The chain is built backwards: the last test falls through to the
    /// default destination and each new block falls through to the one
    /// created before it.
    fn lower_switch_into_ifs(&mut self, module: &mut Module, func: ValueId, switch: ValueId) -> CompilerResult<()> {
        let current = module
            .parent_block(switch)
            .ok_or_else(|| CompilerError::Lowering(format!("switch {} has no parent block", switch)))?;
        let input = module
            .operand(switch, index::switch::INPUT)
            .ok_or_else(|| CompilerError::Lowering(format!("switch {} has no input", switch)))?;
        let default = module
            .switch_default(switch)
            .ok_or_else(|| CompilerError::Lowering(format!("switch {} has no default", switch)))?;
        let cases = module.switch_cases(switch);

        let mut next = default;
        {
            let mut builder = IrBuilder::new(module);
            builder.set_function(func);
            for &(value, dest) in cases.iter().rev() {
                let if_block = builder.create_block()?;
                builder.set_insert_point(if_block);
                let pred = builder.create_binary_operator(BinaryOp::StrictlyEqual, value, input)?;
                builder.create_cond_branch(pred, dest, next)?;
                copy_phi_target(builder.module(), dest, current, if_block);
                if next == default && dest != default {
                    copy_phi_target(builder.module(), default, current, if_block);
                }
                next = if_block;
            }
        }

        if !cases.is_empty() {
            erase_phi_target(module, default, current);
            for &(_, dest) in &cases {
                erase_phi_target(module, dest, current);
            }
        }
        module.erase_from_parent(switch);
        let branch = module.create_instruction(InstKind::Branch, &[next], Type::no_type());
        module.push_back(current, branch);
        self.lowered += 1;
        log::debug!("[LOWERING] switch {} lowered into {} tests", switch, cases.len());
        Ok(())
    }
}

/// Give `new_block` the incoming value `previous` has in every phi of
/// `block`.
fn copy_phi_target(module: &mut Module, block: ValueId, previous: ValueId, new_block: ValueId) {
    for inst in module.block_insts(block).to_vec() {
        if !module.is_phi(inst) {
            break;
        }
        let entries = module.phi_entries(inst);
        if entries.iter().any(|&(_, b)| b == new_block) {
            continue;
        }
        if let Some(&(value, _)) = entries.iter().find(|&&(_, b)| b == previous) {
            module.add_phi_entry(inst, value, new_block);
        }
    }
}

fn erase_phi_target(module: &mut Module, block: ValueId, to_delete: ValueId) {
    for inst in module.block_insts(block).to_vec() {
        if !module.is_phi(inst) {
            break;
        }
        module.remove_phi_entries_for_block(inst, to_delete);
    }
}

// ========================================
// Compare and branch
// ========================================

#[derive(Debug, Default)]
pub struct LowerCondBranch {
    lowered: usize,
}

impl LowerCondBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lowered(&self) -> usize {
        self.lowered
    }

    pub fn is_operator_supported(op: BinaryOp) -> bool {
        matches!(
            op,
            BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
                | BinaryOp::StrictlyEqual
                | BinaryOp::StrictlyNotEqual
                | BinaryOp::NotEqual
                | BinaryOp::Equal
        )
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let mut changed = false;
        for bb in module.function_blocks(func).to_vec() {
            let branch = match module.terminator(bb) {
                Some(term) if matches!(module.inst_kind(term), Some(InstKind::CondBranch)) => term,
                _ => continue,
            };
            let cond = match module.operand(branch, index::cond_branch::CONDITION) {
                Some(cond) => cond,
                None => continue,
            };
            if module.num_users(cond) != 1 {
                continue;
            }
            let op = match module.inst_kind(cond) {
                Some(InstKind::BinaryOperator(op)) if Self::is_operator_supported(*op) => *op,
                _ => continue,
            };
            // An effectful comparison may only be fused with the branch
            // right after it.
            if module.side_effect(cond).has_side_effect() {
                let adjacent = module.parent_block(cond) == Some(bb)
                    && module.inst_position(cond).map(|p| p + 1) == module.inst_position(branch);
                if !adjacent {
                    continue;
                }
            }
            let (left, right, on_true, on_false) = match (
                module.operand(cond, index::binary::LEFT),
                module.operand(cond, index::binary::RIGHT),
                module.operand(branch, index::cond_branch::TRUE_BLOCK),
                module.operand(branch, index::cond_branch::FALSE_BLOCK),
            ) {
                (Some(l), Some(r), Some(t), Some(f)) => (l, r, t, f),
                _ => continue,
            };

            let compare = module.create_instruction(
                InstKind::CompareBranch(op),
                &[left, right, on_true, on_false],
                Type::no_type(),
            );
            module.insert_before(compare, branch);
            module.erase_from_parent(branch);
            module.erase_from_parent(cond);
            self.lowered += 1;
            changed = true;
            log::debug!("[LOWERING] fused '{}' into compare-branch in {}", op.as_str(), bb);
        }
        Ok(changed)
    }
}

// ========================================
// Jump tables
// ========================================

#[derive(Debug, Default)]
pub struct LowerSwitchIntoJumpTables {
    lowered: usize,
}

impl LowerSwitchIntoJumpTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lowered(&self) -> usize {
        self.lowered
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let mut changed = false;
        for switch in switches_of(module, func, &InstKind::Switch) {
            changed |= self.lower_into_jump_table(module, func, switch)?;
        }
        Ok(changed)
    }

    /// Dense table of `u32` cases: `min..=max` with at most
    /// [`MAX_JUMP_TABLE_DENSITY`] values per case.
    fn lower_into_jump_table(&mut self, module: &mut Module, func: ValueId, switch: ValueId) -> CompilerResult<bool> {
        let input = match module.operand(switch, index::switch::INPUT) {
            Some(input) => input,
            None => return Ok(false),
        };
        // A literal input is left for constant folding.
        if module.is_literal(input) {
            return Ok(false);
        }
        let default = match module.switch_default(switch) {
            Some(default) => default,
            None => return Ok(false),
        };
        let cases = module.switch_cases(switch);
        let mut values = Vec::with_capacity(cases.len());
        for &(value, _) in &cases {
            match module.literal(value).and_then(|lit| lit.as_u32()) {
                Some(n) => values.push(n),
                None => return Ok(false),
            }
        }
        let (min, max) = match (values.iter().min(), values.iter().max()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return Ok(false),
        };
        let range = max - min;
        if range == 0 || range == u32::MAX {
            return Ok(false);
        }
        if cases.len() < MIN_JUMP_TABLE_CASES || range / cases.len() as u32 > MAX_JUMP_TABLE_DENSITY {
            return Ok(false);
        }

        let mut builder = IrBuilder::new(module);
        builder.set_function(func);
        builder.set_insert_point_before(switch);
        let table = builder.create_switch_imm(input, default, min, range + 1, &cases)?;
        module.replace_all_uses_with(switch, table);
        module.erase_from_parent(switch);
        self.lowered += 1;
        log::debug!("[LOWERING] switch {} became a jump table of {} entries", table, range + 1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_operators() {
        assert!(LowerCondBranch::is_operator_supported(BinaryOp::LessThan));
        assert!(LowerCondBranch::is_operator_supported(BinaryOp::Equal));
        assert!(!LowerCondBranch::is_operator_supported(BinaryOp::Add));
        assert!(!LowerCondBranch::is_operator_supported(BinaryOp::InstanceOf));
    }

    #[test]
    fn test_literal_input_is_not_a_jump_table() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let exit = builder.create_block().unwrap();
        let input = builder.literal_number(3.0);
        let cases: Vec<(ValueId, ValueId)> =
            (0..12).map(|i| (builder.literal_number(i as f64), exit)).collect();
        builder.set_insert_point(entry);
        let switch = builder.create_switch(input, exit, &cases).unwrap();
        builder.set_insert_point(exit);
        let undef = builder.literal_undefined();
        builder.create_return(undef).unwrap();

        let mut pass = LowerSwitchIntoJumpTables::new();
        assert!(!pass.run_on_function(&mut module, func).unwrap());
        assert_eq!(module.inst_kind(switch), Some(&InstKind::Switch));
        assert_eq!(module.ty(switch), Type::no_type());
    }
}
