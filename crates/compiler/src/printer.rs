//! # IR Printer
//!
//! Textual dump of functions for debugging and tests. Names are handed out
//! by an explicit [`Namer`] so that a dump is stable across runs and does
//! not depend on arena indices: instructions are `%0, %1, ...` and blocks
//! `%BB0, %BB1, ...` in layout order.

use crate::instructions::InstKind;
use crate::ir::{Module, ValueId, ValueKind};
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Default)]
pub struct Namer {
    insts: HashMap<ValueId, usize>,
    blocks: HashMap<ValueId, usize>,
}

impl Namer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namer with every block and instruction of `func` numbered in layout
    /// order.
    pub fn for_function(module: &Module, func: ValueId) -> Self {
        let mut namer = Self::new();
        for &bb in module.function_blocks(func) {
            namer.block_number(bb);
        }
        for &bb in module.function_blocks(func) {
            for &inst in module.block_insts(bb) {
                namer.inst_number(inst);
            }
        }
        namer
    }

    pub fn inst_number(&mut self, inst: ValueId) -> usize {
        let next = self.insts.len();
        *self.insts.entry(inst).or_insert(next)
    }

    pub fn block_number(&mut self, bb: ValueId) -> usize {
        let next = self.blocks.len();
        *self.blocks.entry(bb).or_insert(next)
    }

    pub fn format_value(&mut self, module: &Module, value: ValueId) -> String {
        match module.kind(value) {
            ValueKind::Literal(lit) => lit.to_string(),
            ValueKind::Parameter(p) => format!("%{}", p.name),
            ValueKind::Variable(v) => format!("[{}]", v.name),
            ValueKind::VariableScope(_) => format!("%VS{}", value.index()),
            ValueKind::Function(f) => format!("%{}()", f.name),
            ValueKind::BasicBlock(_) => format!("%BB{}", self.block_number(value)),
            ValueKind::Instruction(_) => format!("%{}", self.inst_number(value)),
            ValueKind::Erased => "%<erased>".to_string(),
        }
    }
}

/// `%N = Kind [attributes] op, op` plus the result type for instructions
/// with an output.
pub fn format_instruction(module: &Module, namer: &mut Namer, inst: ValueId) -> String {
    let kind = match module.inst_kind(inst) {
        Some(kind) => kind,
        None => return format!("<not an instruction {}>", inst),
    };
    let mut out = format!("%{} = {}", namer.inst_number(inst), kind.name());
    match kind {
        InstKind::AllocStack { name } => {
            let _ = write!(out, " ${}", name);
        }
        InstKind::BinaryOperator(op) | InstKind::CompareBranch(op) => {
            let _ = write!(out, " '{}'", op.as_str());
        }
        InstKind::UnaryOperator(op) => {
            let _ = write!(out, " '{}'", op.as_str());
        }
        InstKind::AllocObject { size } => {
            let _ = write!(out, " #{}", size);
        }
        InstKind::CreateRegExp { pattern, flags } => {
            let _ = write!(out, " /{}/{}", pattern, flags);
        }
        _ => {}
    }
    let operands: Vec<String> = module
        .operand_slots(inst)
        .iter()
        .map(|slot| match slot {
            Some(op) => namer.format_value(module, op.value),
            None => "null".to_string(),
        })
        .collect();
    if !operands.is_empty() {
        let _ = write!(out, " {}", operands.join(", "));
    }
    if kind.has_output() {
        let _ = write!(out, " : {}", module.ty(inst));
    }
    out
}

pub fn print_function(module: &Module, func: ValueId) -> String {
    let mut namer = Namer::for_function(module, func);
    let mut out = String::new();
    let params: Vec<String> = module
        .function(func)
        .map(|f| f.params.iter().map(|&p| namer.format_value(module, p)).collect())
        .unwrap_or_default();
    let _ = writeln!(out, "function {}({})", module.function_name(func), params.join(", "));
    for &bb in module.function_blocks(func) {
        let _ = writeln!(out, "%BB{}:", namer.block_number(bb));
        for &inst in module.block_insts(bb) {
            let _ = writeln!(out, "  {}", format_instruction(module, &mut namer, inst));
        }
    }
    let _ = writeln!(out, "function_end");
    out
}

pub fn print_module(module: &Module) -> String {
    module
        .functions()
        .iter()
        .map(|&func| print_function(module, func))
        .collect::<Vec<_>>()
        .join("\n")
}
