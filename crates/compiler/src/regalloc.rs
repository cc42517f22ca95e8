//! # Register Allocation
//!
//! Assigns virtual machine registers to the instructions of one function.
//!
//! The allocator works on an explicit block order (usually reverse post
//! order) that must match the order used to emit code:
//!
//! 1. **Phi lowering**: every phi is fed by `Mov` instructions placed at the
//!    end of its predecessors, so the phi and its moves can share one
//!    register. A phi that is read across the move sequence is copied first.
//! 2. **Liveness**: per-block gen/kill/mask bit sets and a backward fixpoint.
//!    Phi edges are masked so an incoming move only flows into its own edge.
//! 3. **Intervals**: each instruction gets a union of half-open
//!    `[start, end)` segments over the instruction numbering.
//! 4. **Coalescing**: phis absorb their moves; moves absorb their sources
//!    when the intervals do not intersect.
//! 5. **Scheduling**: intervals are visited from the latest end backwards,
//!    releasing registers of live intervals that start at or after the
//!    current end and handing out the first free register.
//!
//! Small functions (below `fast_pass_threshold`) and functions whose
//! liveness sets would exceed `memory_limit` bytes take a linear fast pass
//! instead.

use crate::instructions::InstKind;
use crate::ir::{Module, ValueId};
use crate::printer::{format_instruction, Namer};
use crate::{CompilerError, CompilerResult};
use bitvec::prelude::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::fmt::Write as _;

// ========================================
// Configuration
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegAllocConfig {
    /// Functions with fewer instructions are allocated with the fast pass.
    pub fast_pass_threshold: u32,
    /// Upper bound, in bytes, of the estimated liveness memory.
    pub memory_limit: u64,
}

impl Default for RegAllocConfig {
    fn default() -> Self {
        Self { fast_pass_threshold: 0, memory_limit: u64::MAX }
    }
}

// ========================================
// Registers
// ========================================

/// A virtual machine register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Register(u32);

impl Register {
    pub fn new(index: u32) -> Self {
        Register(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }

    /// `other` directly follows this register.
    pub fn is_consecutive(self, other: Register) -> bool {
        self.0 + 1 == other.0
    }

    /// The register `count` slots after this one.
    pub fn consecutive(self, count: u32) -> Register {
        Register(self.0 + count)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reg{}", self.0)
    }
}

/// Tracks which registers are in use. The file only ever grows, so its
/// length is the number of registers the function needs.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    /// A set bit marks a free register.
    registers: BitVec,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_used(&self, reg: Register) -> bool {
        !self.is_free(reg)
    }

    pub fn is_free(&self, reg: Register) -> bool {
        self.registers.get(reg.0 as usize).map_or(false, |bit| *bit)
    }

    /// First free register, growing the file when none is free.
    pub fn allocate_register(&mut self) -> Register {
        match self.registers.first_one() {
            Some(idx) => {
                self.registers.set(idx, false);
                log::trace!("[REGALLOC] reusing free register Reg{}", idx);
                Register(idx as u32)
            }
            None => {
                let idx = self.registers.len();
                self.registers.push(false);
                log::trace!("[REGALLOC] creating register Reg{}", idx);
                Register(idx as u32)
            }
        }
    }

    /// Reserve `count` consecutive registers after the last used one and
    /// return the first.
    pub fn tail_allocate_consecutive(&mut self, count: u32) -> Register {
        debug_assert!(count > 0, "cannot reserve zero registers");
        let first = self.registers.last_zero().map_or(0, |last_used| last_used + 1);
        let end = first + count as usize;
        if self.registers.len() < end {
            self.registers.resize(end, true);
        }
        for idx in first..end {
            self.registers.set(idx, false);
        }
        Register(first as u32)
    }

    pub fn kill_register(&mut self, reg: Register) {
        debug_assert!(self.is_used(reg), "killing unused register {}", reg);
        if (reg.0 as usize) < self.registers.len() {
            self.registers.set(reg.0 as usize, true);
        }
    }

    pub fn num_live_registers(&self) -> u32 {
        (self.registers.len() - self.registers.count_ones()) as u32
    }

    pub fn max_register_usage(&self) -> u32 {
        self.registers.len() as u32
    }

    /// One digit per register, `1` when in use.
    pub fn dump(&self) -> String {
        self.registers.iter().map(|free| if *free { '0' } else { '1' }).collect()
    }
}

// ========================================
// Live ranges
// ========================================

/// Half-open range `[start, end)` of instruction numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

impl Segment {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(end >= start, "invalid segment [{}, {})", start, end);
        Segment { start, end: end.max(start) }
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, loc: usize) -> bool {
        loc >= self.start && loc < self.end
    }

    pub fn intersects(&self, other: Segment) -> bool {
        !(other.start >= self.end || self.start >= other.end)
    }

    pub fn touches(&self, other: Segment) -> bool {
        other.start == self.end || self.start == other.end
    }

    /// Join an intersecting or touching segment into this one.
    pub fn merge(&mut self, other: Segment) {
        debug_assert!(self.intersects(other) || self.touches(other), "merging disjoint segments");
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "[empty]");
        }
        write!(f, "[{}...{}) ", self.start, self.end)
    }
}

/// A union of segments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interval {
    segments: SmallVec<[Segment; 2]>,
}

impl Interval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(start: usize, end: usize) -> Self {
        let mut interval = Self::new();
        interval.add(Segment::new(start, end));
        interval
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn intersects_segment(&self, other: Segment) -> bool {
        self.segments.iter().any(|s| s.intersects(other))
    }

    /// Compares the bounding ranges of both intervals.
    pub fn intersects(&self, other: &Interval) -> bool {
        Segment::new(self.start(), self.end()).intersects(Segment::new(other.start(), other.end()))
    }

    pub fn add(&mut self, other: Segment) {
        for s in self.segments.iter_mut() {
            if s.intersects(other) || s.touches(other) {
                s.merge(other);
                return;
            }
        }
        self.segments.push(other);
    }

    pub fn add_interval(&mut self, other: &Interval) {
        for &s in &other.segments {
            self.add(s);
        }
    }

    /// Rebuilt interval with segments merged where the order of insertion
    /// left them apart.
    pub fn compress(&self) -> Interval {
        let mut out = Interval::new();
        for &s in &self.segments {
            out.add(s);
        }
        out
    }

    pub fn size(&self) -> usize {
        if self.segments.is_empty() {
            return 0;
        }
        self.end() - self.start()
    }

    pub fn start(&self) -> usize {
        self.segments.iter().map(|s| s.start).min().unwrap_or(0)
    }

    pub fn end(&self) -> usize {
        self.segments.iter().map(|s| s.end).max().unwrap_or(0)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in self.compress().segments.iter() {
            write!(f, "{}", s)?;
        }
        Ok(())
    }
}

// ========================================
// Target hooks
// ========================================

/// Instructions whose registers the target places by itself.
pub trait TargetLowering {
    fn has_target_specific_lowering(&self, _module: &Module, _inst: ValueId) -> bool {
        false
    }

    /// Called once the register of `inst` is released.
    fn handle_instruction(&mut self, _module: &Module, _inst: ValueId) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTargetLowering;

impl TargetLowering for NoTargetLowering {}

/// Records the largest outgoing argument area needed by any call.
#[derive(Debug, Clone, Default)]
pub struct CallArgumentLowering {
    /// Registers reserved after the arguments by the calling convention.
    pub extra_registers: u32,
    max_argument_registers: u32,
}

impl CallArgumentLowering {
    pub fn new(extra_registers: u32) -> Self {
        Self { extra_registers, max_argument_registers: 0 }
    }

    pub fn max_argument_registers(&self) -> u32 {
        self.max_argument_registers
    }
}

impl TargetLowering for CallArgumentLowering {
    fn has_target_specific_lowering(&self, module: &Module, inst: ValueId) -> bool {
        matches!(module.inst_kind(inst), Some(InstKind::Call))
    }

    fn handle_instruction(&mut self, module: &Module, inst: ValueId) {
        if !self.has_target_specific_lowering(module, inst) {
            return;
        }
        // `this` plus the explicit arguments.
        let args = module
            .num_operands(inst)
            .saturating_sub(crate::instructions::index::call::THIS) as u32;
        self.max_argument_registers = self.max_argument_registers.max(args + self.extra_registers);
    }
}

// ========================================
// Allocator
// ========================================

#[derive(Debug, Clone)]
struct BlockLiveness {
    /// Values used in the block.
    gen: BitVec,
    /// Values defined in the block.
    kill: BitVec,
    live_in: BitVec,
    live_out: BitVec,
    /// Values blocked from flowing into the block, used for phi edges.
    mask_in: BitVec,
}

impl BlockLiveness {
    fn new(size: usize) -> Self {
        Self {
            gen: bitvec![0; size],
            kill: bitvec![0; size],
            live_in: bitvec![0; size],
            live_out: bitvec![0; size],
            mask_in: bitvec![0; size],
        }
    }
}

fn union_with(dst: &mut BitVec, src: &BitVec) {
    for idx in src.iter_ones() {
        dst.set(idx, true);
    }
}

fn subtract(dst: &mut BitVec, src: &BitVec) {
    for idx in src.iter_ones() {
        dst.set(idx, false);
    }
}

pub struct RegisterAllocator<L: TargetLowering = NoTargetLowering> {
    func: ValueId,
    config: RegAllocConfig,
    lowering: L,
    file: RegisterFile,
    allocated: HashMap<ValueId, Register>,
    numbers: HashMap<ValueId, usize>,
    by_number: Vec<ValueId>,
    intervals: Vec<Interval>,
    liveness: HashMap<ValueId, BlockLiveness>,
    used_fast_pass: bool,
}

impl RegisterAllocator<NoTargetLowering> {
    pub fn new(func: ValueId, config: RegAllocConfig) -> Self {
        Self::with_lowering(func, config, NoTargetLowering)
    }
}

impl<L: TargetLowering> RegisterAllocator<L> {
    pub fn with_lowering(func: ValueId, config: RegAllocConfig, lowering: L) -> Self {
        Self {
            func,
            config,
            lowering,
            file: RegisterFile::new(),
            allocated: HashMap::new(),
            numbers: HashMap::new(),
            by_number: Vec::new(),
            intervals: Vec::new(),
            liveness: HashMap::new(),
            used_fast_pass: false,
        }
    }

    pub fn lowering(&self) -> &L {
        &self.lowering
    }

    pub fn used_fast_pass(&self) -> bool {
        self.used_fast_pass
    }

    // ========================================
    // Public queries
    // ========================================

    /// Register of `value`. The value must have been allocated.
    pub fn get_register(&self, value: ValueId) -> CompilerResult<Register> {
        self.allocated
            .get(&value)
            .copied()
            .ok_or_else(|| CompilerError::CodeGen(format!("{} has no register", value)))
    }

    pub fn register(&self, value: ValueId) -> Option<Register> {
        self.allocated.get(&value).copied()
    }

    pub fn update_register(&mut self, value: ValueId, reg: Register) {
        self.allocated.insert(value, reg);
    }

    pub fn is_allocated(&self, value: ValueId) -> bool {
        self.allocated.contains_key(&value)
    }

    pub fn has_instruction_number(&self, inst: ValueId) -> bool {
        self.numbers.contains_key(&inst)
    }

    pub fn instruction_number(&self, inst: ValueId) -> Option<usize> {
        self.numbers.get(&inst).copied()
    }

    pub fn instruction_interval(&self, inst: ValueId) -> Option<&Interval> {
        self.instruction_number(inst).and_then(|idx| self.intervals.get(idx))
    }

    /// Number of registers the function needs.
    pub fn max_register_usage(&self) -> u32 {
        self.file.max_register_usage()
    }

    /// Reserve `count` consecutive registers managed by the caller.
    pub fn reserve(&mut self, count: u32) -> Register {
        self.file.tail_allocate_consecutive(count)
    }

    /// Reserve one consecutive register per entry and bind the present
    /// values to them.
    pub fn reserve_values(&mut self, values: &[Option<ValueId>]) -> Register {
        let first = self.file.tail_allocate_consecutive(values.len() as u32);
        for (offset, value) in values.iter().enumerate() {
            if let Some(value) = value {
                self.allocated.insert(*value, first.consecutive(offset as u32));
            }
        }
        first
    }

    /// Release a register obtained from `reserve`.
    pub fn free(&mut self, reg: Register) {
        self.file.kill_register(reg);
    }

    fn is_manually_allocated(&self, module: &Module, inst: ValueId) -> bool {
        self.lowering.has_target_specific_lowering(module, inst)
            || module.users(inst).iter().any(|u| self.lowering.has_target_specific_lowering(module, u.inst))
    }

    fn number(&mut self, inst: ValueId) -> usize {
        if let Some(&idx) = self.numbers.get(&inst) {
            return idx;
        }
        let idx = self.by_number.len();
        self.by_number.push(inst);
        self.intervals.push(Interval::new());
        self.numbers.insert(inst, idx);
        idx
    }

    // ========================================
    // Driver
    // ========================================

    /// Allocate registers for the blocks of `order`, which must be the
    /// emission order.
    pub fn allocate(&mut self, module: &mut Module, order: &[ValueId]) -> CompilerResult<()> {
        if let Some(&bb) = order.iter().find(|&&bb| module.terminator(bb).is_none()) {
            return Err(CompilerError::CodeGen(format!("{} has no terminator", bb)));
        }

        self.lower_phis(module, order);

        let inst_count: usize = order.iter().map(|&bb| module.block_insts(bb).len()).sum();
        // Five bit sets of one bit per instruction for every block.
        let estimate = (order.len() as u64).saturating_mul(inst_count as u64).saturating_mul(5) / 8;
        if (inst_count as u64) < self.config.fast_pass_threshold as u64 || estimate > self.config.memory_limit {
            log::debug!(
                "[REGALLOC] {}: fast pass ({} instructions, ~{} bytes of liveness)",
                module.function_name(self.func),
                inst_count,
                estimate
            );
            self.allocate_fast_pass(module, order);
            self.used_fast_pass = true;
            return Ok(());
        }

        for &bb in order {
            for &inst in module.block_insts(bb) {
                self.number(inst);
            }
        }
        let size = self.by_number.len();
        for &bb in order {
            self.liveness.insert(bb, BlockLiveness::new(size));
        }
        for &bb in order {
            self.calculate_local_liveness(module, bb);
        }
        self.calculate_global_liveness(module, order);
        self.calculate_live_intervals(module, order);
        self.liveness.clear();

        let mut coalesced: IndexMap<ValueId, ValueId> = IndexMap::new();
        self.coalesce(module, &mut coalesced, order);
        self.schedule(module, &coalesced);

        log::debug!(
            "[REGALLOC] {}: {} instructions in {} registers, {} coalesced",
            module.function_name(self.func),
            size,
            self.max_register_usage(),
            coalesced.len()
        );
        Ok(())
    }

    // ========================================
    // Phi lowering
    // ========================================

    /// Replace phi inputs with moves at the end of each predecessor.
    pub fn lower_phis(&mut self, module: &mut Module, order: &[ValueId]) {
        let phis: Vec<ValueId> = order
            .iter()
            .flat_map(|&bb| module.block_insts(bb).iter().copied())
            .filter(|&inst| module.is_phi(inst))
            .collect();

        // The move sequence may clobber a phi that is still read after it.
        for &phi in &phis {
            if !phi_read_write(module, phi) {
                continue;
            }
            let bb = match module.parent_block(phi) {
                Some(bb) => bb,
                None => continue,
            };
            let term = match module.terminator(bb) {
                Some(term) => term,
                None => continue,
            };
            let copy = module.create_instruction(InstKind::Mov, &[phi], module.ty(phi));
            module.insert_before(copy, term);
            for user in module.user_insts(phi) {
                let local = module.parent_block(user) == Some(bb);
                if local && !module.is_phi(user) && !module.is_terminator(user) {
                    continue;
                }
                module.replace_first_operand_with(user, phi, copy);
            }
        }

        // Incoming value -> the move that copies it.
        let mut copied: HashMap<ValueId, ValueId> = HashMap::new();
        for &phi in &phis {
            for i in 0..module.phi_num_entries(phi) {
                let (value, pred) = match module.phi_entry(phi, i) {
                    Some(entry) => entry,
                    None => continue,
                };
                let term = match module.terminator(pred) {
                    Some(term) => term,
                    None => continue,
                };
                let mov = module.create_instruction(InstKind::Mov, &[value], module.ty(value));
                module.insert_before(mov, term);
                module.update_phi_entry(phi, i, mov, pred);
                copied.insert(value, mov);
            }
        }

        // Terminators run after the moves, so they read the copies.
        for &bb in order {
            let term = match module.terminator(bb) {
                Some(term) => term,
                None => continue,
            };
            for idx in 0..module.num_operands(term) {
                let op = match module.operand(term, idx) {
                    Some(op) if !module.is_literal(op) => op,
                    _ => continue,
                };
                if let Some(&mov) = copied.get(&op) {
                    if module.parent_block(mov) == Some(bb) {
                        module.set_operand(term, Some(mov), idx);
                        module.move_before(mov, term);
                    }
                }
            }
        }
    }

    // ========================================
    // Liveness
    // ========================================

    fn calculate_local_liveness(&mut self, module: &Module, bb: ValueId) {
        for &inst in module.block_insts(bb) {
            let idx = self.number(inst);
            if let Some(info) = self.liveness.get_mut(&bb) {
                info.kill.set(idx, true);
            }

            if module.is_phi(inst) {
                let entries: Vec<(ValueId, ValueId)> = module
                    .phi_entries(inst)
                    .into_iter()
                    .filter(|(_, pred)| self.liveness.contains_key(pred))
                    .collect();
                let incoming: Vec<usize> = entries
                    .iter()
                    .filter_map(|(value, _)| self.numbers.get(value).copied())
                    .collect();
                // Block every incoming value on every edge, then reopen the
                // edge each value actually arrives on.
                for (_, pred) in &entries {
                    if let Some(info) = self.liveness.get_mut(pred) {
                        for &num in &incoming {
                            info.mask_in.set(num, true);
                        }
                    }
                }
                for (value, pred) in &entries {
                    if let (Some(&num), Some(info)) = (self.numbers.get(value), self.liveness.get_mut(pred)) {
                        info.mask_in.set(num, false);
                    }
                }
            }

            for op in module.operands(inst) {
                let reachable = module.parent_block(op).map_or(false, |b| self.liveness.contains_key(&b));
                if !reachable {
                    continue;
                }
                if let (Some(&num), Some(info)) = (self.numbers.get(&op), self.liveness.get_mut(&bb)) {
                    info.gen.set(num, true);
                }
            }
        }
    }

    fn calculate_global_liveness(&mut self, module: &Module, order: &[ValueId]) {
        for info in self.liveness.values_mut() {
            union_with(&mut info.live_in, &info.gen);
            subtract(&mut info.live_in, &info.kill);
            subtract(&mut info.live_in, &info.mask_in);
        }

        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut changed = false;
            for &bb in order.iter().rev() {
                let mut live_out = match self.liveness.get(&bb) {
                    Some(info) => info.live_out.clone(),
                    None => continue,
                };
                for succ in crate::cfg::successors(module, bb) {
                    if let Some(succ_info) = self.liveness.get(&succ) {
                        if succ_info.live_in.iter_ones().any(|idx| !live_out[idx]) {
                            changed = true;
                        }
                        union_with(&mut live_out, &succ_info.live_in);
                    }
                }
                if let Some(info) = self.liveness.get_mut(&bb) {
                    let mut live_in = live_out.clone();
                    union_with(&mut live_in, &info.gen);
                    subtract(&mut live_in, &info.kill);
                    subtract(&mut live_in, &info.mask_in);
                    info.live_in = live_in;
                    info.live_out = live_out;
                }
            }
            if !changed {
                break;
            }
        }
        log::trace!("[REGALLOC] liveness converged in {} iterations", iterations);
    }

    fn calculate_live_intervals(&mut self, module: &Module, order: &[ValueId]) {
        // A value starts living right after its definition.
        for (idx, interval) in self.intervals.iter_mut().enumerate() {
            *interval = Interval::with_range(idx + 1, idx + 1);
        }

        for &bb in order {
            let insts = module.block_insts(bb);
            let (first, term) = match (insts.first(), module.terminator(bb)) {
                (Some(&first), Some(term)) => (first, term),
                _ => continue,
            };
            let (start_offset, end_offset) = match (self.numbers.get(&first), self.numbers.get(&term)) {
                (Some(&s), Some(&e)) => (s, e),
                _ => continue,
            };
            let info = match self.liveness.get(&bb) {
                Some(info) => info,
                None => continue,
            };

            // Values that flow through the whole block.
            for idx in info.live_out.iter_ones() {
                if info.live_in[idx] {
                    self.intervals[idx].add(Segment::new(start_offset, end_offset + 1));
                }
            }

            for &inst in insts {
                let offset = match self.numbers.get(&inst) {
                    Some(&offset) => offset,
                    None => continue,
                };
                if info.live_out[offset] {
                    debug_assert!(!info.live_in[offset], "{} is live-in and defined in {}", inst, bb);
                    self.intervals[offset].add(Segment::new(offset + 1, end_offset + 1));
                }

                // Keep operands alive up to and including this use.
                for op in module.operands(inst) {
                    if let Some(&op_idx) = self.numbers.get(&op) {
                        if op_idx + 1 < offset + 1 {
                            self.intervals[op_idx].add(Segment::new(op_idx + 1, offset + 1));
                        }
                    }
                }

                // The phi lives across each incoming terminator, and each
                // incoming value lives until that terminator.
                if module.is_phi(inst) {
                    for (value, pred) in module.phi_entries(inst) {
                        let term_idx = match module.terminator(pred).and_then(|t| self.numbers.get(&t)) {
                            Some(&t) => t,
                            None => continue,
                        };
                        self.intervals[offset].add(Segment::new(term_idx, term_idx + 1));
                        if let Some(&pred_idx) = self.numbers.get(&value) {
                            if pred_idx < term_idx {
                                self.intervals[pred_idx].add(Segment::new(pred_idx + 1, term_idx));
                            }
                        }
                    }
                }
            }
        }
    }

    // ========================================
    // Coalescing
    // ========================================

    /// Fill `map` with instructions that reuse the register of another.
    fn coalesce(&mut self, module: &mut Module, map: &mut IndexMap<ValueId, ValueId>, order: &[ValueId]) {
        // A phi and its incoming moves must share a register.
        for &bb in order {
            for inst in module.block_insts(bb).to_vec() {
                if !module.is_phi(inst) {
                    continue;
                }
                let phi_num = match self.numbers.get(&inst) {
                    Some(&num) => num,
                    None => continue,
                };
                for (mov, _) in module.phi_entries(inst) {
                    if map.contains_key(&mov) || !matches!(module.inst_kind(mov), Some(InstKind::Mov)) {
                        continue;
                    }
                    let idx = match self.numbers.get(&mov) {
                        Some(&idx) => idx,
                        None => continue,
                    };
                    let mov_interval = self.intervals[idx].clone();
                    self.intervals[phi_num].add_interval(&mov_interval);
                    map.insert(mov, inst);
                }
            }
        }

        // %1 = Mov %0; %2 = Mov %0 becomes %2 = Mov %1, ending %0 earlier.
        for &bb in order {
            let mut last_copy: HashMap<ValueId, ValueId> = HashMap::new();
            for inst in module.block_insts(bb).to_vec() {
                if !matches!(module.inst_kind(inst), Some(InstKind::Mov)) {
                    continue;
                }
                let op = match module.operand(inst, 0) {
                    Some(op) if !module.is_literal(op) => op,
                    _ => continue,
                };
                if let Some(&copy) = last_copy.get(&op) {
                    module.set_operand(inst, Some(copy), 0);
                }
                last_copy.insert(op, inst);
            }
        }

        // Let a move's source live in the move's register when they never
        // overlap.
        for &bb in order {
            for inst in module.block_insts(bb).to_vec() {
                if !matches!(module.inst_kind(inst), Some(InstKind::Mov)) {
                    continue;
                }
                let op = match module.operand(inst, 0) {
                    Some(op) if module.is_instruction(op) => op,
                    _ => continue,
                };
                if map.contains_key(&op) || self.is_allocated(op) || self.is_allocated(inst) {
                    continue;
                }
                // Target-placed registers must be released on their own.
                if self.is_manually_allocated(module, op) {
                    continue;
                }
                let mut dest = inst;
                while let Some(&next) = map.get(&dest) {
                    dest = next;
                }
                let (dest_idx, op_idx) = match (self.numbers.get(&dest), self.numbers.get(&op)) {
                    (Some(&d), Some(&o)) => (d, o),
                    _ => continue,
                };
                if self.intervals[dest_idx].intersects(&self.intervals[op_idx]) {
                    continue;
                }
                log::trace!(
                    "[REGALLOC] coalescing @{} {} -> @{} {}",
                    op_idx,
                    self.intervals[op_idx],
                    dest_idx,
                    self.intervals[dest_idx]
                );
                for target in map.values_mut() {
                    if *target == op {
                        *target = dest;
                    }
                }
                let op_interval = self.intervals[op_idx].clone();
                self.intervals[dest_idx].add_interval(&op_interval);
                map.insert(op, dest);
            }
        }
    }

    // ========================================
    // Scheduling
    // ========================================

    fn schedule(&mut self, module: &Module, coalesced: &IndexMap<ValueId, ValueId>) {
        // Latest end first; on equal ends the later start, then the later
        // instruction, so a value is visited before its operands.
        let mut pending: BinaryHeap<(usize, usize, usize)> = self
            .intervals
            .iter()
            .enumerate()
            .map(|(idx, ivl)| (ivl.end(), ivl.start(), idx))
            .collect();
        // Live intervals, latest start on top.
        let mut live: BinaryHeap<(usize, usize)> = BinaryHeap::new();

        while let Some((current, _, idx)) = pending.pop() {
            let inst = self.by_number[idx];

            while let Some(&(start, top)) = live.peek() {
                if start < current && self.intervals[top].size() > 0 {
                    break;
                }
                live.pop();
                self.release(module, top);
            }

            if coalesced.contains_key(&inst) {
                continue;
            }
            if !self.is_allocated(inst) {
                let reg = self.file.allocate_register();
                self.update_register(inst, reg);
            }
            live.push((self.intervals[idx].start(), idx));
        }

        while let Some((_, top)) = live.pop() {
            self.release(module, top);
        }

        for (&inst, &dest) in coalesced {
            debug_assert!(!self.is_allocated(inst), "coalesced {} already has a register", inst);
            if let Some(reg) = self.register(dest) {
                self.update_register(inst, reg);
            }
        }
    }

    fn release(&mut self, module: &Module, idx: usize) {
        let inst = self.by_number[idx];
        if let Some(reg) = self.register(inst) {
            log::trace!("[REGALLOC] releasing {} of {}", reg, inst);
            self.file.kill_register(reg);
        }
        self.lowering.handle_instruction(module, inst);
    }

    // ========================================
    // Fast pass
    // ========================================

    /// Sequential allocation that only reuses registers of block-local
    /// values.
    fn allocate_fast_pass(&mut self, module: &Module, order: &[ValueId]) {
        // Phis and their moves share one register.
        for &bb in order {
            for &inst in module.block_insts(bb) {
                self.lowering.handle_instruction(module, inst);
                if module.is_phi(inst) {
                    let reg = self.file.allocate_register();
                    self.update_register(inst, reg);
                    for (value, _) in module.phi_entries(inst) {
                        self.update_register(value, reg);
                    }
                }
            }
        }

        let mut block_locals: SmallVec<[Register; 16]> = SmallVec::new();
        for &bb in order {
            for &inst in module.block_insts(bb) {
                if self.is_allocated(inst) {
                    continue;
                }
                let reg = self.file.allocate_register();
                self.update_register(inst, reg);
                if !module.has_users(inst) {
                    self.file.kill_register(reg);
                } else if is_block_local(module, inst) {
                    block_locals.push(reg);
                }
            }
            for reg in block_locals.drain(..) {
                self.file.kill_register(reg);
            }
        }
    }

    // ========================================
    // Dump
    // ========================================

    /// Every instruction of `order` prefixed by `$Reg{n} @idx [s...e)`.
    pub fn dump(&self, module: &Module, order: &[ValueId]) -> String {
        let mut namer = Namer::for_function(module, self.func);
        let mut out = String::new();
        for &bb in order {
            let _ = writeln!(out, "{}:", namer.format_value(module, bb));
            for &inst in module.block_insts(bb) {
                let dest = match self.register(inst) {
                    Some(reg) => format!("${}", reg),
                    None => "$???".to_string(),
                };
                let range = match (self.instruction_number(inst), self.instruction_interval(inst)) {
                    (Some(idx), Some(ivl)) => format!("@{} {}", idx, ivl),
                    _ => String::new(),
                };
                let _ = writeln!(out, "  {} {}\t{}", dest, range, format_instruction(module, &mut namer, inst));
            }
        }
        out
    }
}

/// A phi whose value is still needed after the move sequence of its own
/// block overwrites it.
fn phi_read_write(module: &Module, phi: ValueId) -> bool {
    let parent = module.parent_block(phi);
    let mut terminator_use = false;
    let mut local_phi_use = false;
    let mut external_use = false;
    for user in module.user_insts(phi) {
        let user_block = module.parent_block(user);
        terminator_use |= module.is_terminator(user);
        local_phi_use |= module.is_phi(user) && user_block == parent && user != phi;
        external_use |= user_block != parent;
    }
    terminator_use || local_phi_use || external_use
}

fn is_block_local(module: &Module, inst: ValueId) -> bool {
    let parent = module.parent_block(inst);
    module.users(inst).iter().all(|u| module.parent_block(u.inst) == parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::UnaryOp;
    use crate::ir_builder::IrBuilder;

    #[test]
    fn test_register_file_reuses_lowest_free() {
        let mut file = RegisterFile::new();
        let r0 = file.allocate_register();
        let r1 = file.allocate_register();
        let r2 = file.allocate_register();
        assert_eq!((r0.index(), r1.index(), r2.index()), (0, 1, 2));
        file.kill_register(r1);
        file.kill_register(r0);
        assert_eq!(file.allocate_register(), r0);
        assert_eq!(file.num_live_registers(), 2);
        assert_eq!(file.max_register_usage(), 3);
        assert_eq!(file.dump(), "101");
    }

    #[test]
    fn test_tail_allocate_skips_trailing_free() {
        let mut file = RegisterFile::new();
        let r0 = file.allocate_register();
        let r1 = file.allocate_register();
        let _r2 = file.allocate_register();
        file.kill_register(r1);
        let first = file.tail_allocate_consecutive(3);
        assert_eq!(first.index(), 3);
        assert_eq!(file.max_register_usage(), 6);
        assert!(file.is_free(r1));
        assert!(file.is_used(r0));
        assert!(r0.is_consecutive(r1));
    }

    #[test]
    fn test_segment_and_interval() {
        let a = Segment::new(1, 4);
        assert!(a.intersects(Segment::new(3, 5)));
        assert!(!a.intersects(Segment::new(4, 6)));
        assert!(a.touches(Segment::new(4, 6)));
        assert!(a.contains(3) && !a.contains(4));

        let mut ivl = Interval::with_range(1, 1);
        ivl.add(Segment::new(1, 3));
        ivl.add(Segment::new(7, 9));
        assert_eq!(ivl.start(), 1);
        assert_eq!(ivl.end(), 9);
        assert_eq!(ivl.size(), 8);
        assert!(ivl.intersects_segment(Segment::new(8, 10)));
        assert!(!ivl.intersects_segment(Segment::new(4, 6)));
        assert_eq!(ivl.to_string(), "[1...3) [7...9) ");
    }

    #[test]
    fn test_operand_dying_at_use_shares_register() {
        let mut module = Module::new();
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("f", None, false);
        let entry = builder.create_block().unwrap();
        let x = builder.add_parameter("x").unwrap();
        builder.set_insert_point(entry);
        let a = builder.create_load_param(x).unwrap();
        let dead = builder.create_unary_operator(UnaryOp::Minus, a).unwrap();
        let b = builder.create_unary_operator(UnaryOp::Minus, a).unwrap();
        builder.create_return(b).unwrap();

        let mut ra = RegisterAllocator::new(func, RegAllocConfig::default());
        ra.allocate(&mut module, &[entry]).unwrap();
        assert!(!ra.used_fast_pass());
        // `a` ends where `b` starts, `dead` overlaps `a`.
        assert_eq!(ra.get_register(a).unwrap(), ra.get_register(b).unwrap());
        assert_ne!(ra.get_register(a).unwrap(), ra.get_register(dead).unwrap());
        assert_eq!(ra.max_register_usage(), 2);
        assert!(ra.get_register(x).is_err());
    }
}
