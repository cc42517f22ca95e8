//! # Simple Mem2Reg
//!
//! A cheaper stack promotion that only reasons about stack slots. Frame
//! variables are left alone and safety is decided from try-region depth
//! instead of dominance by exception handlers: a slot stored to inside a
//! try region cannot be promoted because a throw before the store could be
//! caught in the same function and observe the old value.
//!
//! Phis that end up with a single incoming value are folded at the end.

use crate::analysis::block_try_depths;
use crate::dominance::DominanceInfo;
use crate::instructions::{index, InstKind};
use crate::ir::{Module, ValueId};
use crate::mem2reg::{
    eliminate_store_only_locations, promote_alloc_stack, simplify_phis, stack_ptr, Mem2RegStats,
};
use crate::CompilerResult;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct SimpleMem2Reg {
    stats: Mem2RegStats,
}

impl SimpleMem2Reg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Mem2RegStats {
        self.stats
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let mut changed = false;
        let dom = DominanceInfo::new(module, func);

        let (_, unsafe_allocs) = collect_stack_allocations(module, func);
        for bb in module.function_blocks(func).to_vec() {
            changed |= promote_loads(module, bb, &mut self.stats);
            changed |= eliminate_stores(module, bb, &unsafe_allocs, &mut self.stats);
        }
        for bb in module.function_blocks(func).to_vec() {
            changed |= eliminate_store_only_locations(module, bb, &mut self.stats);
        }

        let (allocs, _) = collect_stack_allocations(module, func);
        for alloc in allocs {
            self.stats.phis_inserted += promote_alloc_stack(module, alloc, &dom);
            self.stats.allocs_promoted += 1;
            changed = true;
        }
        changed |= simplify_phis(module, func);

        log::debug!(
            "[MEM2REG] {} (simple): promoted {} allocs, {} phis",
            module.function_name(func),
            self.stats.allocs_promoted,
            self.stats.phis_inserted
        );
        Ok(changed)
    }
}

/// Unsafe: stored to inside a try region, or used by something other
/// than a load or store.
fn collect_stack_allocations(module: &Module, func: ValueId) -> (Vec<ValueId>, HashSet<ValueId>) {
    let (try_depths, _) = block_try_depths(module, func);
    let mut safe = Vec::new();
    let mut unsafe_allocs = HashSet::new();
    for &bb in module.function_blocks(func) {
        for &inst in module.block_insts(bb) {
            if !module.is_alloc_stack(inst) {
                continue;
            }
            let is_unsafe = module.users(inst).iter().any(|user| match module.inst_kind(user.inst) {
                Some(InstKind::LoadStack) => false,
                Some(InstKind::StoreStack) if user.operand as usize == index::store_stack::PTR => module
                    .parent_block(user.inst)
                    .map_or(true, |b| try_depths.contains_key(&b)),
                _ => true,
            });
            if is_unsafe {
                unsafe_allocs.insert(inst);
            } else {
                safe.push(inst);
            }
        }
    }
    (safe, unsafe_allocs)
}

fn promote_loads(module: &mut Module, bb: ValueId, stats: &mut Mem2RegStats) -> bool {
    let mut known: HashMap<ValueId, ValueId> = HashMap::new();
    let mut dead = Vec::new();
    for inst in module.block_insts(bb).to_vec() {
        match module.inst_kind(inst) {
            Some(InstKind::StoreStack) => {
                let value = module.operand(inst, index::store_stack::VALUE);
                if let (Some(value), Some(ptr)) = (value, stack_ptr(module, inst)) {
                    known.insert(ptr, value);
                }
            }
            Some(InstKind::LoadStack) => {
                let ptr = match stack_ptr(module, inst) {
                    Some(ptr) => ptr,
                    None => continue,
                };
                match known.get(&ptr).copied() {
                    Some(value) => {
                        module.replace_all_uses_with(inst, value);
                        dead.push(inst);
                    }
                    None => {
                        known.insert(ptr, inst);
                    }
                }
            }
            Some(_) if module.side_effect(inst).write_stack => {
                for op in module.operands(inst) {
                    if module.is_alloc_stack(op) {
                        known.remove(&op);
                    }
                }
            }
            _ => {}
        }
    }
    stats.loads_eliminated += dead.len();
    let changed = !dead.is_empty();
    for inst in dead {
        module.erase_from_parent(inst);
    }
    changed
}

fn eliminate_stores(
    module: &mut Module,
    bb: ValueId,
    unsafe_allocs: &HashSet<ValueId>,
    stats: &mut Mem2RegStats,
) -> bool {
    let mut prev: HashMap<ValueId, ValueId> = HashMap::new();
    let mut dead = Vec::new();
    for inst in module.block_insts(bb).to_vec() {
        if matches!(module.inst_kind(inst), Some(InstKind::StoreStack)) {
            if let Some(ptr) = stack_ptr(module, inst) {
                if let Some(previous) = prev.insert(ptr, inst) {
                    dead.push(previous);
                }
            }
            continue;
        }
        let effect = module.side_effect(inst);
        // Reading the slot makes the pending store observable.
        if effect.read_stack {
            for op in module.operands(inst) {
                if module.is_alloc_stack(op) {
                    prev.remove(&op);
                }
            }
        }
        // A caught throw could observe stores to unsafe slots.
        if effect.throw {
            for alloc in unsafe_allocs {
                prev.remove(alloc);
            }
        }
    }
    stats.stores_eliminated += dead.len();
    let changed = !dead.is_empty();
    for inst in dead {
        module.erase_from_parent(inst);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::IrBuilder;

    #[test]
    fn test_store_in_try_is_unsafe() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let body = builder.create_block().unwrap();
        let handler = builder.create_block().unwrap();
        let after = builder.create_block().unwrap();
        let one = builder.literal_number(1.0);
        builder.set_insert_point(entry);
        let slot = builder.create_alloc_stack("x").unwrap();
        builder.create_try_start(handler, body).unwrap();
        builder.set_insert_point(body);
        builder.create_store_stack(one, slot).unwrap();
        builder.create_try_end(handler, after).unwrap();
        builder.set_insert_point(handler);
        builder.create_catch().unwrap();
        builder.create_branch(after).unwrap();
        builder.set_insert_point(after);
        let v = builder.create_load_stack(slot).unwrap();
        builder.create_return(v).unwrap();

        let (safe, unsafe_allocs) = collect_stack_allocations(&module, func);
        assert!(safe.is_empty());
        assert!(unsafe_allocs.contains(&slot));

        let mut pass = SimpleMem2Reg::new();
        pass.run_on_function(&mut module, func).unwrap();
        assert!(!module.is_erased(slot), "slot stored inside a try must survive");
    }

    #[test]
    fn test_trivial_phi_folded() {
        // entry -> a | b -> join, both sides store the same literal.
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let a = builder.create_block().unwrap();
        let b = builder.create_block().unwrap();
        let join = builder.create_block().unwrap();
        let cond = builder.literal_bool(true);
        let seven = builder.literal_number(7.0);
        builder.set_insert_point(entry);
        let slot = builder.create_alloc_stack("x").unwrap();
        builder.create_cond_branch(cond, a, b).unwrap();
        builder.set_insert_point(a);
        builder.create_store_stack(seven, slot).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(b);
        builder.create_store_stack(seven, slot).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(join);
        let v = builder.create_load_stack(slot).unwrap();
        let ret = builder.create_return(v).unwrap();

        let mut pass = SimpleMem2Reg::new();
        assert!(pass.run_on_function(&mut module, func).unwrap());
        assert_eq!(module.operand(ret, 0), Some(seven));
        assert!(module.block_insts(join).iter().all(|&i| !module.is_phi(i)));
        assert_eq!(pass.stats().phis_inserted, 1);
    }
}
