//! # IR Verifier
//!
//! Structural checks over a [`Module`]. Unlike an assertion-based verifier
//! this one keeps going after the first problem and returns every
//! diagnostic it found, so a broken pass can be diagnosed in one run.
//!
//! Instruction-level diagnostics are prefixed with the instruction kind,
//! e.g. `SwitchInst: switch values must be unique (%12)`.

use crate::cfg;
use crate::dominance::DominanceInfo;
use crate::instructions::{index, InstKind};
use crate::ir::{Module, UserRef, ValueId, ValueKind};
use crate::{CompilerError, CompilerResult};
use std::collections::{HashMap, HashSet};

/// Outcome of a verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyResult {
    pub diagnostics: Vec<String>,
    pub invalid: bool,
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    /// Whether some diagnostic contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.diagnostics.iter().any(|d| d.contains(needle))
    }

    fn merge(&mut self, other: VerifyResult) {
        self.invalid |= other.invalid;
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn into_result(self) -> CompilerResult<()> {
        if self.invalid {
            Err(CompilerError::Verification(self.diagnostics.join("\n")))
        } else {
            Ok(())
        }
    }
}

pub fn verify_module(module: &Module) -> VerifyResult {
    let mut result = VerifyResult::default();
    for &func in module.functions() {
        result.merge(verify_function(module, func));
    }
    let mut verifier = Verifier::new(module);
    verifier.visit_variable_scopes();
    result.merge(verifier.finish());
    if result.invalid {
        log::debug!("[VERIFY] module invalid: {} diagnostics", result.diagnostics.len());
    }
    result
}

pub fn verify_function(module: &Module, func: ValueId) -> VerifyResult {
    let mut verifier = Verifier::new(module);
    verifier.visit_function(func);
    let result = verifier.finish();
    if result.invalid {
        log::debug!(
            "[VERIFY] {} invalid: {} diagnostics",
            module.function_name(func),
            result.diagnostics.len()
        );
    }
    result
}

struct Verifier<'m> {
    module: &'m Module,
    diagnostics: Vec<String>,
}

impl<'m> Verifier<'m> {
    fn new(module: &'m Module) -> Self {
        Self { module, diagnostics: Vec::new() }
    }

    fn finish(self) -> VerifyResult {
        VerifyResult { invalid: !self.diagnostics.is_empty(), diagnostics: self.diagnostics }
    }

    fn fail(&mut self, msg: String) {
        log::trace!("[VERIFY] {}", msg);
        self.diagnostics.push(msg);
    }

    /// Record `msg` against `inst` unless `cond` holds. Returns `cond`.
    fn check_inst(&mut self, inst: ValueId, cond: bool, msg: &str) -> bool {
        if !cond {
            let name = self.module.inst_kind(inst).map_or("Instruction", |k| k.name());
            self.fail(format!("{}: {} ({})", name, msg, inst));
        }
        cond
    }

    fn check(&mut self, cond: bool, msg: impl FnOnce() -> String) -> bool {
        if !cond {
            let msg = msg();
            self.fail(msg);
        }
        cond
    }

    // ========================================
    // Functions and blocks
    // ========================================

    fn visit_function(&mut self, func: ValueId) {
        let module = self.module;
        if module.function(func).is_none() {
            self.fail(format!("{} is not a function", func));
            return;
        }
        let blocks = module.function_blocks(func).to_vec();
        for &bb in &blocks {
            self.check(module.block_function(bb) == Some(func), || {
                format!("{}'s parent does not match function", bb)
            });
            self.visit_block(bb);
        }

        let entry = match module.entry_block(func) {
            Some(entry) => entry,
            None => return,
        };
        self.check(cfg::predecessors(module, entry).is_empty(), || {
            "The entry block should have no predecessors".to_string()
        });

        let dom = DominanceInfo::new(module, func);
        for &bb in &blocks {
            if !self.check(dom.has_node(bb), || format!("{} unreachable from entry in the Dominance Tree", bb)) {
                continue;
            }
            self.verify_dominance(&dom, bb);
        }
        self.verify_try_structure(func, entry);
    }

    fn visit_block(&mut self, bb: ValueId) {
        let module = self.module;
        let insts = module.block_insts(bb).to_vec();
        let has_terminator = insts.last().map_or(false, |&last| module.is_terminator(last));
        self.check(has_terminator, || format!("{} must have a terminator.", bb));

        for succ in cfg::successors(module, bb) {
            self.check(cfg::has_predecessor(module, succ, bb), || {
                format!("Cannot find self {} in the predecessors of a successor {}", bb, succ)
            });
        }
        for pred in cfg::predecessors(module, bb) {
            self.check(cfg::successors(module, pred).contains(&bb), || {
                format!("Cannot find self {} in the successors of a predecessor {}", bb, pred)
            });
        }

        let mut visiting_first_in_block = true;
        for (pos, &inst) in insts.iter().enumerate() {
            self.check(module.parent_block(inst) == Some(bb), || {
                format!("Instruction {}'s parent does not match {}", inst, bb)
            });
            let first_in_block = module.side_effect(inst).first_in_block;
            visiting_first_in_block &= first_in_block;
            self.check_inst(inst, visiting_first_in_block || !first_in_block, "Unexpected FirstInBlock instruction.");

            if module.is_terminator(inst) && pos + 1 != insts.len() {
                let msg = match module.inst_kind(inst) {
                    Some(InstKind::Return) => "Return Instruction must be the last instruction of a basic block",
                    Some(InstKind::Branch) => "Branch Instruction must be the last instruction of a basic block",
                    _ => "Terminator must be the last instruction of a basic block",
                };
                self.check_inst(inst, false, msg);
            }

            self.verify_operands(inst);
            self.visit_instruction(inst);
        }
    }

    /// Checks shared by every instruction.
    fn verify_operands(&mut self, inst: ValueId) {
        let module = self.module;
        let effect = module.side_effect(inst);
        self.check_inst(inst, effect.is_well_formed(), "Ill-formed side effects");

        let kind = match module.inst_kind(inst) {
            Some(kind) => kind.clone(),
            None => return,
        };
        if !kind.has_output() {
            self.check_inst(inst, module.ty(inst).is_no_type(), "Instruction with type does not have output");
        }

        for (j, slot) in module.operand_slots(inst).iter().enumerate() {
            let op = match slot {
                Some(op) => *op,
                None => {
                    self.check_inst(inst, false, "Invalid operand");
                    continue;
                }
            };
            if !self.check_inst(inst, !module.is_erased(op.value), "Invalid operand") {
                continue;
            }
            let back = module.users(op.value).get(op.use_index as usize).copied();
            self.check_inst(
                inst,
                back == Some(UserRef { inst, operand: j as u32 }),
                "This instruction is not in the User list of the operand",
            );
            if module.is_variable(op.value) {
                self.check_inst(
                    inst,
                    matches!(kind, InstKind::LoadFrame | InstKind::StoreFrame),
                    "Variable can only be accessed in LoadFrame/StoreFrame Inst.",
                );
            }
            if module.is_alloc_stack(op.value) {
                self.check_inst(
                    inst,
                    kind.accepts_stack_operand() && (matches!(kind, InstKind::LoadStack) || effect.write_stack),
                    "Must write to stack operand.",
                );
            }
        }

        if kind.is_terminator() {
            self.check_inst(inst, !module.has_users(inst), "Terminator Inst cannot return value.");
        }
    }

    fn visit_instruction(&mut self, inst: ValueId) {
        match self.module.inst_kind(inst) {
            Some(InstKind::Phi) => self.visit_phi(inst),
            Some(InstKind::Switch) => {
                self.visit_switch_like(inst);
            }
            Some(InstKind::SwitchImm) => {
                if self.visit_switch_like(inst) {
                    self.visit_switch_imm(inst);
                }
            }
            Some(InstKind::Catch) => self.visit_catch(inst),
            _ => {}
        }
    }

    // ========================================
    // Per-kind checks
    // ========================================

    fn visit_phi(&mut self, phi: ValueId) {
        let module = self.module;
        let bb = match module.parent_block(phi) {
            Some(bb) => bb,
            None => return,
        };
        let mut entries: HashMap<ValueId, ValueId> = HashMap::new();
        for (value, block) in module.phi_entries(phi) {
            self.check_inst(phi, cfg::has_predecessor(module, bb, block), "Predecessor not covered by phi node!");
            self.check_inst(phi, cfg::successors(module, block).contains(&bb), "Phi node should be Successor!");
            match entries.get(&block) {
                Some(&previous) => {
                    self.check_inst(
                        phi,
                        previous == value,
                        "Phi node has multiple entries for the same block with different values",
                    );
                }
                None => {
                    entries.insert(block, value);
                }
            }
        }
        self.check_inst(
            phi,
            entries.len() == cfg::pred_count_unique(module, bb),
            "number of predecessors does not match phi inputs",
        );
        self.check_inst(phi, !entries.is_empty(), "Phi has no entries");
    }

    fn visit_switch_like(&mut self, inst: ValueId) -> bool {
        let module = self.module;
        let bb = module.parent_block(inst);
        let cases = module.switch_cases(inst);
        let mut ok = self.check_inst(inst, !cases.is_empty(), "SwitchInst must have some case destinations");
        ok &= self.check_inst(
            inst,
            module.switch_default(inst).map_or(false, |d| module.is_block(d)),
            "Invalid destination block",
        );
        ok &= self.check_inst(inst, module.operand(inst, index::switch::INPUT).is_some(), "Invalid input value");
        if let Some(bb) = bb {
            let succs = cfg::successors(module, bb);
            for &(_, dest) in &cases {
                ok &= self.check_inst(inst, succs.contains(&dest), "Case target must be a successor of SwitchInst block");
            }
        }

        let mut seen = HashSet::new();
        for &(value, _) in &cases {
            ok &= self.check_inst(inst, module.is_literal(value), "case value must be a literal");
            ok &= self.check_inst(inst, seen.insert(value), "switch values must be unique");
        }
        ok
    }

    fn visit_switch_imm(&mut self, inst: ValueId) {
        let module = self.module;
        let as_u32 = |idx: usize| module.operand(inst, idx).and_then(|v| module.literal(v)).and_then(|l| l.as_u32());
        let (min, size) = match (as_u32(index::switch_imm::MIN), as_u32(index::switch_imm::SIZE)) {
            (Some(min), Some(size)) => (min as u64, size as u64),
            _ => {
                self.check_inst(inst, false, "SwitchImm bounds must be uint32 literals");
                return;
            }
        };
        for (value, _) in module.switch_cases(inst) {
            match module.literal(value).and_then(|l| l.as_u32()) {
                Some(v) => {
                    let v = v as u64;
                    self.check_inst(inst, v >= min && v < min + size, "case value out of range");
                }
                None => {
                    self.check_inst(inst, false, "case value must be a uint32");
                }
            }
        }
    }

    fn visit_catch(&mut self, inst: ValueId) {
        let module = self.module;
        let bb = match module.parent_block(inst) {
            Some(bb) => bb,
            None => return,
        };
        self.check_inst(
            inst,
            module.block_insts(bb).first() == Some(&inst),
            "Catch instruction must be the first in a basic block",
        );
        let mut try_starts = 0;
        let mut normal = 0;
        for pred in cfg::unique_predecessors(module, bb) {
            let term = match module.terminator(pred) {
                Some(term) => term,
                None => continue,
            };
            match module.inst_kind(term) {
                Some(InstKind::TryStart) => {
                    try_starts += 1;
                    self.check_inst(
                        term,
                        module.operand(term, index::try_start::CATCH_TARGET) == Some(bb),
                        "CatchInst must be the catch target of its TryStartInst.",
                    );
                }
                Some(InstKind::TryEnd) => {
                    self.check_inst(
                        term,
                        module.operand(term, index::try_end::CATCH_TARGET) == Some(bb),
                        "CatchInst must be the catch target of its TryEndInst.",
                    );
                }
                _ => normal += 1,
            }
        }
        self.check_inst(inst, try_starts == 1, "CatchInst must have exactly one TryStart predecessor.");
        self.check_inst(inst, normal == 0, "CatchInst must have only TryStart and TryEnd predecessors.");
    }

    // ========================================
    // Whole-function properties
    // ========================================

    /// Operands dominate their users; phi inputs dominate the incoming edge.
    fn verify_dominance(&mut self, dom: &DominanceInfo, bb: ValueId) {
        let module = self.module;
        let mut seen: HashSet<ValueId> = HashSet::new();
        for &inst in module.block_insts(bb) {
            if module.is_phi(inst) {
                for (value, block) in module.phi_entries(inst) {
                    if !module.is_instruction(value) {
                        continue;
                    }
                    let def_block = module.parent_block(value);
                    self.check(def_block.map_or(false, |d| dom.dominates(d, block)), || {
                        format!("Incoming PHI value {} must dominate incoming {}", value, block)
                    });
                }
                seen.insert(inst);
                continue;
            }
            for op in module.operands(inst) {
                if !module.is_instruction(op) {
                    continue;
                }
                let ok = seen.contains(&op) || dom.properly_dominates_inst(module, op, inst);
                self.check(ok, || format!("Operand {} must dominate the Instruction {}", op, inst));
            }
            seen.insert(inst);
        }
    }

    /// Every block is inside at most one innermost try region, and each
    /// `TryEnd` closes the region it is in.
    fn verify_try_structure(&mut self, func: ValueId, entry: ValueId) {
        let module = self.module;
        // block -> innermost enclosing TryStart
        let mut enclosing: HashMap<ValueId, Option<ValueId>> = HashMap::new();
        let mut stack: Vec<(ValueId, Option<ValueId>)> = vec![(entry, None)];
        enclosing.insert(entry, None);

        while let Some((bb, mut current)) = stack.pop() {
            let term = match module.terminator(bb) {
                Some(term) => term,
                None => continue,
            };
            let mut try_body = None;
            match module.inst_kind(term) {
                Some(InstKind::Return) => {
                    self.check_inst(term, current.is_none(), "ReturnInst inside a try region that has not been closed.");
                }
                Some(InstKind::TryStart) => {
                    try_body = module.operand(term, index::try_start::TRY_BODY);
                    let catch_first = module
                        .operand(term, index::try_start::CATCH_TARGET)
                        .and_then(|c| module.block_insts(c).first().copied());
                    self.check_inst(
                        term,
                        catch_first.map_or(false, |i| matches!(module.inst_kind(i), Some(InstKind::Catch))),
                        "Catch target must start with a CatchInst.",
                    );
                }
                Some(InstKind::TryEnd) => match current {
                    Some(try_start) => {
                        self.check_inst(
                            term,
                            module.operand(try_start, index::try_start::CATCH_TARGET)
                                == module.operand(term, index::try_end::CATCH_TARGET),
                            "TryEndInst does not match TryStartInst.",
                        );
                        current = module
                            .parent_block(try_start)
                            .and_then(|b| enclosing.get(&b).copied())
                            .flatten();
                    }
                    None => {
                        self.check_inst(term, false, "ending a try outside of any TryStartInst context.");
                    }
                },
                _ => {}
            }

            for succ in cfg::successors(module, bb) {
                let succ_enclosing = if Some(succ) == try_body { Some(term) } else { current };
                match enclosing.get(&succ) {
                    Some(&existing) => {
                        self.check(existing == succ_enclosing, || {
                            format!("{} is reachable from multiple different TryStartInsts", succ)
                        });
                    }
                    None => {
                        enclosing.insert(succ, succ_enclosing);
                        stack.push((succ, succ_enclosing));
                    }
                }
            }
        }
        log::trace!("[VERIFY] try structure of {} checked", module.function_name(func));
    }

    /// A variable scope is created under one parent scope only.
    fn visit_variable_scopes(&mut self) {
        let module = self.module;
        for &func in module.functions() {
            let scopes = match module.function(func) {
                Some(data) => data.scopes.clone(),
                None => continue,
            };
            for scope in scopes {
                let declared_parent = module.scope(scope).and_then(|s| s.parent);
                for user in module.users(scope) {
                    if !matches!(module.inst_kind(user.inst), Some(InstKind::CreateScope))
                        || user.operand as usize != index::create_scope::VARIABLE_SCOPE
                    {
                        continue;
                    }
                    let parent = match module.operand(user.inst, index::create_scope::PARENT) {
                        Some(parent) => parent,
                        None => continue,
                    };
                    let actual = match module.inst_kind(parent) {
                        Some(InstKind::CreateScope) | Some(InstKind::ResolveScope) => {
                            module.operand(parent, index::create_scope::VARIABLE_SCOPE)
                        }
                        _ if matches!(module.kind(parent), ValueKind::Literal(_)) => None,
                        _ => continue,
                    };
                    self.check(actual == declared_parent, || {
                        "VariableScope has multiple different parents.".to_string()
                    });
                }
            }
        }
    }
}
