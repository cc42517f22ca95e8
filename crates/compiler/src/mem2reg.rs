//! # Mem2Reg
//!
//! Promotes `AllocStack` slots into SSA values.
//!
//! The pass runs in two phases:
//!
//! 1. **Block-local cleanup** over every allocation: redundant stack and
//!    frame loads are forwarded from the last known store or load, stores
//!    overwritten before being read are deleted, and allocations that are
//!    only ever stored to are removed together with their stores.
//! 2. **SSA construction** for the allocations that only loads and stores
//!    touch and that are not reachable from an exception handler: phis are
//!    placed on the iterated dominance frontier of the store blocks, loads
//!    are rewired to the reaching definition and the slot disappears.
//!
//! After phase 1 every safe allocation has at most one store per block and
//! no load follows a store in the same block, which phase 2 relies on.

use crate::cfg;
use crate::dominance::DominanceInfo;
use crate::instructions::{index, InstKind};
use crate::ir::{Module, UserRef, ValueId};
use crate::CompilerResult;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mem2RegConfig {
    /// Known frame values are invalidated per variable while fewer than this
    /// many are tracked; above it they are dropped wholesale.
    pub frame_size_threshold: usize,
}

impl Default for Mem2RegConfig {
    fn default() -> Self {
        Self { frame_size_threshold: 128 }
    }
}

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mem2RegStats {
    pub phis_inserted: usize,
    pub allocs_promoted: usize,
    pub loads_eliminated: usize,
    pub stores_eliminated: usize,
    pub store_only_locations: usize,
    pub init_once_loads: usize,
}

impl AddAssign for Mem2RegStats {
    fn add_assign(&mut self, other: Self) {
        self.phis_inserted += other.phis_inserted;
        self.allocs_promoted += other.allocs_promoted;
        self.loads_eliminated += other.loads_eliminated;
        self.stores_eliminated += other.stores_eliminated;
        self.store_only_locations += other.store_only_locations;
        self.init_once_loads += other.init_once_loads;
    }
}

/// Precise stack promotion.
#[derive(Debug, Default)]
pub struct Mem2Reg {
    config: Mem2RegConfig,
    stats: Mem2RegStats,
}

impl Mem2Reg {
    pub fn new(config: Mem2RegConfig) -> Self {
        Self { config, stats: Mem2RegStats::default() }
    }

    pub fn stats(&self) -> Mem2RegStats {
        self.stats
    }

    pub fn run_on_function(&mut self, module: &mut Module, func: ValueId) -> CompilerResult<bool> {
        let mut changed = false;
        let dom = DominanceInfo::new(module, func);

        let (_, unsafe_allocs) = collect_stack_allocations(module, func, &dom);
        let threshold = self.config.frame_size_threshold;
        for bb in module.function_blocks(func).to_vec() {
            changed |= promote_loads(module, func, bb, threshold, &mut self.stats);
            changed |= eliminate_stores(module, func, bb, &unsafe_allocs, threshold, &mut self.stats);
        }
        for bb in module.function_blocks(func).to_vec() {
            changed |= eliminate_store_only_locations(module, bb, &mut self.stats);
        }

        let (allocs, _) = collect_stack_allocations(module, func, &dom);
        for alloc in allocs {
            self.stats.phis_inserted += promote_alloc_stack(module, alloc, &dom);
            self.stats.allocs_promoted += 1;
            changed = true;
        }

        log::debug!(
            "[MEM2REG] {}: promoted {} allocs, {} phis, {} loads / {} stores eliminated",
            module.function_name(func),
            self.stats.allocs_promoted,
            self.stats.phis_inserted,
            self.stats.loads_eliminated,
            self.stats.stores_eliminated
        );
        Ok(changed)
    }
}

// ========================================
// Shared helpers
// ========================================

/// Pointer operand of a `LoadStack`/`StoreStack`.
pub(crate) fn stack_ptr(module: &Module, inst: ValueId) -> Option<ValueId> {
    match module.inst_kind(inst)? {
        InstKind::LoadStack => module.operand(inst, index::load_stack::PTR),
        InstKind::StoreStack => module.operand(inst, index::store_stack::PTR),
        _ => None,
    }
}

/// The allocation is used by a `LoadStack` or as the pointer of a
/// `StoreStack` only.
pub(crate) fn is_load_or_store_use(module: &Module, user: UserRef) -> bool {
    match module.inst_kind(user.inst) {
        Some(InstKind::LoadStack) => true,
        Some(InstKind::StoreStack) => user.operand as usize == index::store_stack::PTR,
        _ => false,
    }
}

/// Remove allocations whose only users are stores, together with the
/// stores.
pub(crate) fn eliminate_store_only_locations(module: &mut Module, bb: ValueId, stats: &mut Mem2RegStats) -> bool {
    let mut changed = false;
    for inst in module.block_insts(bb).to_vec() {
        if !module.is_alloc_stack(inst) {
            continue;
        }
        let store_only = module.users(inst).iter().all(|u| {
            matches!(module.inst_kind(u.inst), Some(InstKind::StoreStack))
                && u.operand as usize == index::store_stack::PTR
        });
        if !store_only {
            continue;
        }
        for store in module.user_insts(inst) {
            if module.inst(store).is_some() {
                module.erase_from_parent(store);
            }
        }
        module.erase_from_parent(inst);
        stats.store_only_locations += 1;
        changed = true;
    }
    changed
}

/// Value live at the end of `start`: the nearest store or phi found
/// walking up the dominator tree.
fn live_out_value(
    module: &Module,
    dom: &DominanceInfo,
    phis: &IndexMap<ValueId, ValueId>,
    stores: &HashMap<ValueId, ValueId>,
    start: ValueId,
) -> Option<ValueId> {
    if !dom.has_node(start) {
        return None;
    }
    let mut node = Some(start);
    while let Some(bb) = node {
        if let Some(&store) = stores.get(&bb) {
            return module.operand(store, index::store_stack::VALUE);
        }
        if let Some(&phi) = phis.get(&bb) {
            return Some(phi);
        }
        node = dom.idom(bb);
    }
    None
}

/// Value reaching the top of `bb`.
fn live_in_value(
    module: &Module,
    dom: &DominanceInfo,
    phis: &IndexMap<ValueId, ValueId>,
    stores: &HashMap<ValueId, ValueId>,
    bb: ValueId,
) -> Option<ValueId> {
    if let Some(&phi) = phis.get(&bb) {
        return Some(phi);
    }
    let idom = dom.idom(bb)?;
    live_out_value(module, dom, phis, stores, idom)
}

/// Rewrite one safe allocation into SSA form. Returns the number of phis
/// created.
pub(crate) fn promote_alloc_stack(module: &mut Module, alloc: ValueId, dom: &DominanceInfo) -> usize {
    let alloc_block = match module.parent_block(alloc) {
        Some(bb) => bb,
        None => return 0,
    };

    // Store blocks, deepest first.
    let mut queue: BinaryHeap<(u32, ValueId)> = BinaryHeap::new();
    for user in module.user_insts(alloc) {
        if !matches!(module.inst_kind(user), Some(InstKind::StoreStack)) {
            continue;
        }
        if let Some(bb) = module.parent_block(user) {
            if let Some(level) = dom.level(bb) {
                queue.push((level, bb));
            }
        }
    }

    let mut visited: HashSet<ValueId> = HashSet::new();
    let mut phi_blocks: IndexSet<ValueId> = IndexSet::new();
    while let Some((root_level, root)) = queue.pop() {
        // Walk the dominator subtree of root looking for J-edges that leave it.
        let mut worklist = vec![root];
        while let Some(node) = worklist.pop() {
            for succ in cfg::successors(module, node) {
                if dom.idom(succ) == Some(node) {
                    continue;
                }
                let succ_level = match dom.level(succ) {
                    Some(level) => level,
                    None => continue,
                };
                if succ_level > root_level {
                    continue;
                }
                if !visited.insert(succ) {
                    continue;
                }
                // A phi the allocation does not dominate would be dead.
                if !dom.dominates(alloc_block, succ) {
                    continue;
                }
                if phi_blocks.insert(succ) {
                    queue.push((succ_level, succ));
                }
            }
            for &child in dom.children(node) {
                if !visited.contains(&child) {
                    worklist.push(child);
                }
            }
        }
    }

    let alloc_ty = module.ty(alloc);
    let mut phis: IndexMap<ValueId, ValueId> = IndexMap::new();
    for &bb in &phi_blocks {
        let phi = module.create_instruction(InstKind::Phi, &[], alloc_ty);
        module.insert_at(bb, 0, phi);
        phis.insert(bb, phi);
    }

    let mut stores: HashMap<ValueId, ValueId> = HashMap::new();
    let mut loads = Vec::new();
    for user in module.user_insts(alloc) {
        match module.inst_kind(user) {
            Some(InstKind::LoadStack) => loads.push(user),
            Some(InstKind::StoreStack) => {
                let bb = match module.parent_block(user) {
                    Some(bb) => bb,
                    None => continue,
                };
                // Keep the last store of the block.
                let later = match stores.get(&bb) {
                    Some(&existing) => module.inst_position(user) > module.inst_position(existing),
                    None => true,
                };
                if later {
                    stores.insert(bb, user);
                }
            }
            _ => debug_assert!(false, "unsafe use of {} during promotion", alloc),
        }
    }

    for (&bb, &phi) in &phis {
        for pred in cfg::unique_predecessors(module, bb) {
            let value = match live_out_value(module, dom, &phis, &stores, pred) {
                Some(value) => value,
                None => module.literal_undefined(),
            };
            module.add_phi_entry(phi, value, pred);
        }
        module.set_type(phi, alloc_ty);
    }

    for &load in &loads {
        let bb = module.parent_block(load);
        let replacement = bb.and_then(|bb| live_in_value(module, dom, &phis, &stores, bb));
        let replacement = match replacement {
            Some(value) => value,
            None => module.literal_undefined(),
        };
        module.replace_all_uses_with(load, replacement);
    }
    for load in loads {
        module.erase_from_parent(load);
    }
    let mut all_stores: Vec<ValueId> = module
        .user_insts(alloc)
        .into_iter()
        .filter(|&u| matches!(module.inst_kind(u), Some(InstKind::StoreStack)))
        .collect();
    all_stores.dedup();
    for store in all_stores {
        module.erase_from_parent(store);
    }
    if !module.has_users(alloc) {
        module.erase_from_parent(alloc);
    }
    log::trace!("[MEM2REG] promoted {} with {} phis", alloc, phis.len());
    phis.len()
}

/// The single value flowing into `phi` other than itself.
pub(crate) fn single_phi_value(module: &Module, phi: ValueId) -> Option<ValueId> {
    let mut single = None;
    for (value, _) in module.phi_entries(phi) {
        if value == phi {
            continue;
        }
        match single {
            None => single = Some(value),
            Some(existing) if existing == value => {}
            Some(_) => return None,
        }
    }
    single
}

/// Replace phis with a single incoming value until none is left.
pub(crate) fn simplify_phis(module: &mut Module, func: ValueId) -> bool {
    let mut changed = false;
    loop {
        let mut local = false;
        for bb in module.function_blocks(func).to_vec() {
            for inst in module.block_insts(bb).to_vec() {
                if !module.is_phi(inst) {
                    break;
                }
                if let Some(value) = single_phi_value(module, inst) {
                    module.replace_all_uses_with(inst, value);
                    module.erase_from_parent(inst);
                    local = true;
                }
            }
        }
        changed |= local;
        if !local {
            return changed;
        }
    }
}

// ========================================
// Precise variant
// ========================================

/// Split the allocations of `func` into promotable and unsafe ones.
///
/// An allocation is unsafe when something other than a load or store uses
/// it, or when one of its loads or stores sits in a block dominated by an
/// exception-handling block: a block ending in `TryStart` or starting with
/// `Catch`.
fn collect_stack_allocations(module: &Module, func: ValueId, dom: &DominanceInfo) -> (Vec<ValueId>, HashSet<ValueId>) {
    let handlers: Vec<ValueId> = module
        .function_blocks(func)
        .iter()
        .copied()
        .filter(|&bb| {
            let ends_in_try = module
                .terminator(bb)
                .map_or(false, |t| matches!(module.inst_kind(t), Some(InstKind::TryStart)));
            let starts_with_catch = module
                .block_insts(bb)
                .first()
                .map_or(false, |&i| matches!(module.inst_kind(i), Some(InstKind::Catch)));
            ends_in_try || starts_with_catch
        })
        .collect();

    let mut safe = Vec::new();
    let mut unsafe_allocs = HashSet::new();
    for &bb in module.function_blocks(func) {
        for &inst in module.block_insts(bb) {
            if !module.is_alloc_stack(inst) {
                continue;
            }
            let is_unsafe = module.users(inst).iter().any(|&user| {
                if !is_load_or_store_use(module, user) {
                    return true;
                }
                let user_block = match module.parent_block(user.inst) {
                    Some(b) => b,
                    None => return true,
                };
                handlers.iter().any(|&h| dom.dominates(h, user_block))
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

/// The variable has exactly one `StoreFrame`, located in the function that
/// owns the variable.
fn has_single_initializer(module: &Module, var: ValueId) -> bool {
    let owner = module.variable_function(var);
    let mut single = None;
    for user in module.users(var) {
        if !matches!(module.inst_kind(user.inst), Some(InstKind::StoreFrame)) {
            continue;
        }
        if single.is_some() {
            return false;
        }
        let store_func = module.parent_block(user.inst).and_then(|bb| module.block_function(bb));
        if store_func != owner {
            return false;
        }
        single = Some(user.inst);
    }
    single.is_some()
}

/// Variables of enclosing functions loaded or stored by `code` or by any
/// closure it creates.
fn collect_captured_variables(
    module: &Module,
    code: ValueId,
    loads: &mut HashSet<ValueId>,
    stores: &mut HashSet<ValueId>,
) {
    let mut worklist = vec![code];
    let mut seen = HashSet::new();
    while let Some(func) = worklist.pop() {
        if !seen.insert(func) || module.function(func).is_none() {
            continue;
        }
        for &bb in module.function_blocks(func) {
            for &inst in module.block_insts(bb) {
                match module.inst_kind(inst) {
                    Some(InstKind::CreateFunction) => {
                        if let Some(inner) = module.operand(inst, index::create_function::FUNCTION_CODE) {
                            worklist.push(inner);
                        }
                    }
                    Some(InstKind::LoadFrame) => {
                        if let Some(var) = module.operand(inst, index::load_frame::VARIABLE) {
                            if module.variable_function(var) != Some(func) {
                                loads.insert(var);
                            }
                        }
                    }
                    Some(InstKind::StoreFrame) => {
                        if let Some(var) = module.operand(inst, index::store_frame::VARIABLE) {
                            if module.variable_function(var) != Some(func) {
                                stores.insert(var);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Forward stack and frame values to later loads in the same block.
fn promote_loads(module: &mut Module, func: ValueId, bb: ValueId, threshold: usize, stats: &mut Mem2RegStats) -> bool {
    // Capture information is only precise before any control flow.
    let precise = module.entry_block(func) == Some(bb);
    let mut known_frame: HashMap<ValueId, Option<ValueId>> = HashMap::new();
    let mut const_frame: HashMap<ValueId, ValueId> = HashMap::new();
    let mut known_stack: HashMap<ValueId, ValueId> = HashMap::new();
    let mut captured_loads: HashSet<ValueId> = HashSet::new();
    let mut captured_stores: HashSet<ValueId> = HashSet::new();
    let mut dead = Vec::new();
    let mut changed = false;

    for inst in module.block_insts(bb).to_vec() {
        let kind = match module.inst_kind(inst) {
            Some(kind) => kind.clone(),
            None => continue,
        };
        match kind {
            InstKind::StoreStack => {
                let value = module.operand(inst, index::store_stack::VALUE);
                let ptr = module.operand(inst, index::store_stack::PTR);
                if let (Some(value), Some(ptr)) = (value, ptr) {
                    known_stack.insert(ptr, value);
                }
                continue;
            }
            InstKind::StoreFrame => {
                let value = module.operand(inst, index::store_frame::VALUE);
                if let Some(var) = module.operand(inst, index::store_frame::VARIABLE) {
                    known_frame.insert(var, value);
                }
                continue;
            }
            _ => {}
        }

        let effect = module.side_effect(inst);
        if effect.may_write_or_worse() {
            for op in module.operands(inst) {
                if module.is_alloc_stack(op) {
                    known_stack.remove(&op);
                }
            }
        }

        match kind {
            InstKind::LoadStack => {
                let ptr = match module.operand(inst, index::load_stack::PTR) {
                    Some(ptr) => ptr,
                    None => continue,
                };
                match known_stack.get(&ptr).copied() {
                    Some(value) => {
                        module.replace_all_uses_with(inst, value);
                        dead.push(inst);
                        stats.loads_eliminated += 1;
                        changed = true;
                    }
                    None => {
                        known_stack.insert(ptr, inst);
                    }
                }
                continue;
            }
            InstKind::LoadFrame => {
                let var = match module.operand(inst, index::load_frame::VARIABLE) {
                    Some(var) => var,
                    None => continue,
                };
                let owned_here = module.variable_function(var) == Some(func);
                if let Some(&first) = const_frame.get(&var) {
                    if !owned_here {
                        module.replace_all_uses_with(inst, first);
                        dead.push(inst);
                        stats.init_once_loads += 1;
                        changed = true;
                        continue;
                    }
                }
                if has_single_initializer(module, var) {
                    const_frame.insert(var, inst);
                }
                match known_frame.get(&var).copied().flatten() {
                    Some(value) => {
                        module.replace_all_uses_with(inst, value);
                        dead.push(inst);
                        stats.loads_eliminated += 1;
                        changed = true;
                    }
                    None => {
                        known_frame.insert(var, Some(inst));
                    }
                }
                continue;
            }
            InstKind::CreateFunction if precise => {
                if let Some(code) = module.operand(inst, index::create_function::FUNCTION_CODE) {
                    collect_captured_variables(module, code, &mut captured_loads, &mut captured_stores);
                }
            }
            _ => {}
        }

        if effect.may_write_or_worse() {
            if precise && known_frame.len() < threshold {
                // Only variables that user code can reach are clobbered.
                for (var, value) in known_frame.iter_mut() {
                    if module.variable_function(*var) != Some(func) || captured_stores.contains(var) {
                        *value = None;
                    }
                }
            } else {
                known_frame.clear();
            }
        }
    }

    for inst in dead {
        module.erase_from_parent(inst);
    }
    changed
}

/// Delete stores overwritten before anything could observe them.
fn eliminate_stores(
    module: &mut Module,
    func: ValueId,
    bb: ValueId,
    unsafe_allocs: &HashSet<ValueId>,
    threshold: usize,
    stats: &mut Mem2RegStats,
) -> bool {
    let precise = module.entry_block(func) == Some(bb);
    let mut prev_frame: HashMap<ValueId, Option<ValueId>> = HashMap::new();
    let mut prev_stack: HashMap<ValueId, Option<ValueId>> = HashMap::new();
    let mut captured: HashSet<ValueId> = HashSet::new();
    let mut dead = Vec::new();

    for inst in module.block_insts(bb).to_vec() {
        let kind = match module.inst_kind(inst) {
            Some(kind) => kind.clone(),
            None => continue,
        };
        let (table, key) = match kind {
            InstKind::StoreFrame => (&mut prev_frame, module.operand(inst, index::store_frame::VARIABLE)),
            InstKind::StoreStack => (&mut prev_stack, module.operand(inst, index::store_stack::PTR)),
            InstKind::LoadFrame => {
                if let Some(var) = module.operand(inst, index::load_frame::VARIABLE) {
                    prev_frame.insert(var, None);
                }
                continue;
            }
            InstKind::LoadStack => {
                if let Some(ptr) = module.operand(inst, index::load_stack::PTR) {
                    prev_stack.insert(ptr, None);
                }
                continue;
            }
            _ => {
                let effect = module.side_effect(inst);
                if effect.may_execute() {
                    for &alloc in unsafe_allocs {
                        prev_stack.insert(alloc, None);
                    }
                }
                if effect.may_read_or_worse() {
                    if precise && prev_frame.len() < threshold {
                        for (var, store) in prev_frame.iter_mut() {
                            if module.variable_function(*var) != Some(func) || captured.contains(var) {
                                *store = None;
                            }
                        }
                    } else {
                        prev_frame.clear();
                    }
                }
                if precise && matches!(kind, InstKind::CreateFunction) {
                    if let Some(code) = module.operand(inst, index::create_function::FUNCTION_CODE) {
                        let mut loads = HashSet::new();
                        let mut stores = HashSet::new();
                        collect_captured_variables(module, code, &mut loads, &mut stores);
                        captured.extend(loads);
                        captured.extend(stores);
                    }
                }
                continue;
            }
        };
        let key = match key {
            Some(key) => key,
            None => continue,
        };
        if let Some(Some(previous)) = table.insert(key, Some(inst)) {
            dead.push(previous);
        }
    }

    let changed = !dead.is_empty();
    stats.stores_eliminated += dead.len();
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
    fn test_store_after_store_in_block() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let bb = builder.create_block().unwrap();
        builder.set_insert_point(bb);
        let slot = builder.create_alloc_stack("x").unwrap();
        let one = builder.literal_number(1.0);
        let two = builder.literal_number(2.0);
        let first = builder.create_store_stack(one, slot).unwrap();
        builder.create_store_stack(two, slot).unwrap();
        let v = builder.create_load_stack(slot).unwrap();
        builder.create_return(v).unwrap();

        let mut stats = Mem2RegStats::default();
        assert!(eliminate_stores(&mut module, func, bb, &HashSet::new(), 128, &mut stats));
        assert!(module.is_erased(first));
        assert_eq!(stats.stores_eliminated, 1);
    }

    #[test]
    fn test_single_phi_value_ignores_self() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let header = builder.create_block().unwrap();
        let cond = builder.literal_bool(true);
        let one = builder.literal_number(1.0);
        builder.set_insert_point(entry);
        builder.create_branch(header).unwrap();
        builder.set_insert_point(header);
        let phi = builder.create_phi(&[(one, entry)]).unwrap();
        builder.create_cond_branch(cond, header, header).unwrap();
        module.add_phi_entry(phi, phi, header);

        assert_eq!(single_phi_value(&module, phi), Some(one));
    }
}
