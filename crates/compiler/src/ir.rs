//! # IR Object Model
//!
//! Every entity of the IR (literal, parameter, variable, scope, function,
//! basic block, instruction) is a value stored in one arena owned by
//! [`Module`] and addressed by a stable [`ValueId`] handle.
//!
//! ## Use lists
//!
//! An instruction's operand slot records the producer and the position of
//! this use inside the producer's user list. The user list entry records the
//! consuming instruction and the operand slot. Both sides are kept in sync by
//! every mutation in this module, so removing a use is O(1) with a
//! swap-remove followed by a back-reference fixup of the moved entry.
//!
//! ## Ownership
//!
//! A function owns its blocks (ordered `Vec`), a block owns its
//! instructions (ordered `Vec`). Instructions only reference their operands.
//! Erased values stay in the arena as `ValueKind::Erased` tombstones.

use crate::instructions::{BinaryOp, InstKind};
use crate::side_effect::SideEffect;
use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable handle of a value in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Forward edge from a consumer to a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub value: ValueId,
    /// Position of the matching entry in the producer's user list.
    pub use_index: u32,
}

/// Back edge from a producer to one operand slot of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserRef {
    pub inst: ValueId,
    pub operand: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Undefined,
    Null,
    /// TDZ marker.
    Empty,
    Uninit,
    Bool(bool),
    Number(f64),
    String(String),
    BigInt(String),
}

impl Literal {
    pub fn ty(&self) -> Type {
        match self {
            Literal::Undefined => Type::undefined(),
            Literal::Null => Type::null(),
            Literal::Empty => Type::empty(),
            Literal::Uninit => Type::uninit(),
            Literal::Bool(_) => Type::boolean(),
            Literal::Number(_) => Type::number(),
            Literal::String(_) => Type::string(),
            Literal::BigInt(_) => Type::bigint(),
        }
    }

    fn key(&self) -> LiteralKey {
        match self {
            Literal::Undefined => LiteralKey::Undefined,
            Literal::Null => LiteralKey::Null,
            Literal::Empty => LiteralKey::Empty,
            Literal::Uninit => LiteralKey::Uninit,
            Literal::Bool(b) => LiteralKey::Bool(*b),
            Literal::Number(n) => LiteralKey::Number(n.to_bits()),
            Literal::String(s) => LiteralKey::String(s.clone()),
            Literal::BigInt(s) => LiteralKey::BigInt(s.clone()),
        }
    }

    /// The number as a `u32` if it is exactly representable.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Literal::Number(n) if *n >= 0.0 && *n <= u32::MAX as f64 && n.fract() == 0.0 => {
                // -0.0 is not a valid array index.
                if *n == 0.0 && n.is_sign_negative() {
                    None
                } else {
                    Some(*n as u32)
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Undefined => write!(f, "undefined"),
            Literal::Null => write!(f, "null"),
            Literal::Empty => write!(f, "empty"),
            Literal::Uninit => write!(f, "uninit"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::BigInt(s) => write!(f, "{}n", s),
        }
    }
}

/// Hashable identity of a literal, numbers compared bitwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LiteralKey {
    Undefined,
    Null,
    Empty,
    Uninit,
    Bool(bool),
    Number(u64),
    String(String),
    BigInt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionKind {
    Es5Function,
    Es6Arrow,
    Es6Method,
    Es6Constructor,
    GeneratorInner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceVisibility {
    Default,
    ShowSource,
    HideSource,
    Sensitive,
}

#[derive(Debug, Clone)]
pub struct FunctionData {
    pub name: String,
    pub blocks: Vec<ValueId>,
    /// Parameter 0 is the implicit `this`.
    pub params: Vec<ValueId>,
    pub scopes: Vec<ValueId>,
    /// Lexically enclosing function, `None` for the top level.
    pub parent: Option<ValueId>,
    pub strict: bool,
    pub definition_kind: DefinitionKind,
    pub visibility: SourceVisibility,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub function: ValueId,
    pub insts: Vec<ValueId>,
}

#[derive(Debug, Clone)]
pub struct InstructionData {
    pub kind: InstKind,
    /// `None` marks a slot cleared during staged deletion.
    pub operands: Vec<Option<Operand>>,
    pub block: Option<ValueId>,
}

#[derive(Debug, Clone)]
pub struct ParameterData {
    pub function: ValueId,
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct VariableData {
    pub scope: ValueId,
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct ScopeData {
    pub function: ValueId,
    pub parent: Option<ValueId>,
    pub variables: Vec<ValueId>,
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Literal(Literal),
    Parameter(ParameterData),
    Variable(VariableData),
    VariableScope(ScopeData),
    Function(FunctionData),
    BasicBlock(BlockData),
    Instruction(InstructionData),
    Erased,
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub kind: ValueKind,
    pub ty: Type,
    users: Vec<UserRef>,
}

impl ValueData {
    fn new(kind: ValueKind, ty: Type) -> Self {
        Self { kind, ty, users: Vec::new() }
    }
}

/// Arena of every value of a compilation unit.
#[derive(Debug, Default)]
pub struct Module {
    values: Vec<ValueData>,
    functions: Vec<ValueId>,
    literal_cache: HashMap<LiteralKey, ValueId>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, kind: ValueKind, ty: Type) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::new(kind, ty));
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn kind(&self, id: ValueId) -> &ValueKind {
        &self.values[id.index()].kind
    }

    pub fn ty(&self, id: ValueId) -> Type {
        self.values[id.index()].ty
    }

    pub fn set_type(&mut self, id: ValueId, ty: Type) {
        self.values[id.index()].ty = ty;
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn functions(&self) -> &[ValueId] {
        &self.functions
    }

    // ========================================
    // Kind queries
    // ========================================

    pub fn is_instruction(&self, id: ValueId) -> bool {
        matches!(self.kind(id), ValueKind::Instruction(_))
    }

    pub fn is_block(&self, id: ValueId) -> bool {
        matches!(self.kind(id), ValueKind::BasicBlock(_))
    }

    pub fn is_literal(&self, id: ValueId) -> bool {
        matches!(self.kind(id), ValueKind::Literal(_))
    }

    pub fn is_variable(&self, id: ValueId) -> bool {
        matches!(self.kind(id), ValueKind::Variable(_))
    }

    pub fn is_erased(&self, id: ValueId) -> bool {
        matches!(self.kind(id), ValueKind::Erased)
    }

    pub fn literal(&self, id: ValueId) -> Option<&Literal> {
        match self.kind(id) {
            ValueKind::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    pub fn inst(&self, id: ValueId) -> Option<&InstructionData> {
        match self.kind(id) {
            ValueKind::Instruction(data) => Some(data),
            _ => None,
        }
    }

    fn inst_mut(&mut self, id: ValueId) -> Option<&mut InstructionData> {
        match &mut self.values[id.index()].kind {
            ValueKind::Instruction(data) => Some(data),
            _ => None,
        }
    }

    pub fn inst_kind(&self, id: ValueId) -> Option<&InstKind> {
        self.inst(id).map(|data| &data.kind)
    }

    /// Replace the attributes of an instruction, keeping its operands.
    pub fn set_inst_kind(&mut self, id: ValueId, kind: InstKind) {
        if let Some(data) = self.inst_mut(id) {
            data.kind = kind;
        }
    }

    pub fn is_phi(&self, id: ValueId) -> bool {
        matches!(self.inst_kind(id), Some(InstKind::Phi))
    }

    pub fn is_alloc_stack(&self, id: ValueId) -> bool {
        matches!(self.inst_kind(id), Some(InstKind::AllocStack { .. }))
    }

    pub fn is_terminator(&self, id: ValueId) -> bool {
        self.inst_kind(id).map_or(false, InstKind::is_terminator)
    }

    pub fn block(&self, id: ValueId) -> Option<&BlockData> {
        match self.kind(id) {
            ValueKind::BasicBlock(data) => Some(data),
            _ => None,
        }
    }

    pub fn function(&self, id: ValueId) -> Option<&FunctionData> {
        match self.kind(id) {
            ValueKind::Function(data) => Some(data),
            _ => None,
        }
    }

    pub fn function_mut(&mut self, id: ValueId) -> Option<&mut FunctionData> {
        match &mut self.values[id.index()].kind {
            ValueKind::Function(data) => Some(data),
            _ => None,
        }
    }

    pub fn variable(&self, id: ValueId) -> Option<&VariableData> {
        match self.kind(id) {
            ValueKind::Variable(data) => Some(data),
            _ => None,
        }
    }

    pub fn scope(&self, id: ValueId) -> Option<&ScopeData> {
        match self.kind(id) {
            ValueKind::VariableScope(data) => Some(data),
            _ => None,
        }
    }

    pub fn parameter(&self, id: ValueId) -> Option<&ParameterData> {
        match self.kind(id) {
            ValueKind::Parameter(data) => Some(data),
            _ => None,
        }
    }

    // ========================================
    // Literals
    // ========================================

    /// Return the unique value for `lit`.
    pub fn literal_value(&mut self, lit: Literal) -> ValueId {
        let key = lit.key();
        if let Some(&id) = self.literal_cache.get(&key) {
            return id;
        }
        let ty = lit.ty();
        let id = self.alloc(ValueKind::Literal(lit), ty);
        self.literal_cache.insert(key, id);
        id
    }

    pub fn literal_undefined(&mut self) -> ValueId {
        self.literal_value(Literal::Undefined)
    }

    pub fn literal_null(&mut self) -> ValueId {
        self.literal_value(Literal::Null)
    }

    pub fn literal_empty(&mut self) -> ValueId {
        self.literal_value(Literal::Empty)
    }

    pub fn literal_uninit(&mut self) -> ValueId {
        self.literal_value(Literal::Uninit)
    }

    pub fn literal_bool(&mut self, value: bool) -> ValueId {
        self.literal_value(Literal::Bool(value))
    }

    pub fn literal_number(&mut self, value: f64) -> ValueId {
        self.literal_value(Literal::Number(value))
    }

    pub fn literal_string(&mut self, value: &str) -> ValueId {
        self.literal_value(Literal::String(value.to_string()))
    }

    pub fn literal_bigint(&mut self, digits: &str) -> ValueId {
        self.literal_value(Literal::BigInt(digits.to_string()))
    }

    // ========================================
    // Functions, scopes, variables, parameters
    // ========================================

    /// Create a function with its implicit `this` parameter.
    pub fn create_function(&mut self, name: &str, parent: Option<ValueId>, strict: bool) -> ValueId {
        let func = self.alloc(
            ValueKind::Function(FunctionData {
                name: name.to_string(),
                blocks: Vec::new(),
                params: Vec::new(),
                scopes: Vec::new(),
                parent,
                strict,
                definition_kind: DefinitionKind::Es5Function,
                visibility: SourceVisibility::Default,
            }),
            Type::function_code(),
        );
        self.functions.push(func);
        self.add_parameter(func, "this");
        func
    }

    pub fn add_parameter(&mut self, func: ValueId, name: &str) -> ValueId {
        let index = self.function(func).map_or(0, |f| f.params.len() as u32);
        let param = self.alloc(
            ValueKind::Parameter(ParameterData { function: func, name: name.to_string(), index }),
            Type::any(),
        );
        if let Some(data) = self.function_mut(func) {
            data.params.push(param);
        }
        param
    }

    pub fn create_variable_scope(&mut self, func: ValueId, parent: Option<ValueId>) -> ValueId {
        let scope = self.alloc(
            ValueKind::VariableScope(ScopeData { function: func, parent, variables: Vec::new() }),
            Type::environment(),
        );
        if let Some(data) = self.function_mut(func) {
            data.scopes.push(scope);
        }
        scope
    }

    pub fn add_variable(&mut self, scope: ValueId, name: &str) -> ValueId {
        let index = self.scope(scope).map_or(0, |s| s.variables.len() as u32);
        let var = self.alloc(
            ValueKind::Variable(VariableData { scope, name: name.to_string(), index }),
            Type::any_empty_uninit(),
        );
        if let ValueKind::VariableScope(data) = &mut self.values[scope.index()].kind {
            data.variables.push(var);
        }
        var
    }

    /// Function owning the scope of `var`.
    pub fn variable_function(&self, var: ValueId) -> Option<ValueId> {
        let scope = self.variable(var)?.scope;
        self.scope(scope).map(|s| s.function)
    }

    pub fn function_blocks(&self, func: ValueId) -> &[ValueId] {
        self.function(func).map(|f| f.blocks.as_slice()).unwrap_or(&[])
    }

    pub fn entry_block(&self, func: ValueId) -> Option<ValueId> {
        self.function_blocks(func).first().copied()
    }

    pub fn function_name(&self, func: ValueId) -> &str {
        self.function(func).map_or("", |f| f.name.as_str())
    }

    /// Number of instructions over all blocks of `func`.
    pub fn instruction_count(&self, func: ValueId) -> usize {
        self.function_blocks(func).iter().map(|&bb| self.block_insts(bb).len()).sum()
    }

    // ========================================
    // Basic blocks
    // ========================================

    pub fn create_block(&mut self, func: ValueId) -> ValueId {
        let bb = self.alloc(ValueKind::BasicBlock(BlockData { function: func, insts: Vec::new() }), Type::no_type());
        if let Some(data) = self.function_mut(func) {
            data.blocks.push(bb);
        }
        bb
    }

    pub fn block_insts(&self, bb: ValueId) -> &[ValueId] {
        self.block(bb).map(|b| b.insts.as_slice()).unwrap_or(&[])
    }

    fn block_insts_mut(&mut self, bb: ValueId) -> Option<&mut Vec<ValueId>> {
        match &mut self.values[bb.index()].kind {
            ValueKind::BasicBlock(data) => Some(&mut data.insts),
            _ => None,
        }
    }

    pub fn block_function(&self, bb: ValueId) -> Option<ValueId> {
        self.block(bb).map(|b| b.function)
    }

    /// Last instruction of `bb` if it is a terminator.
    pub fn terminator(&self, bb: ValueId) -> Option<ValueId> {
        let last = *self.block_insts(bb).last()?;
        if self.is_terminator(last) {
            Some(last)
        } else {
            None
        }
    }

    /// Block containing `inst`.
    pub fn parent_block(&self, inst: ValueId) -> Option<ValueId> {
        self.inst(inst).and_then(|data| data.block)
    }

    /// Position of `inst` within its block.
    pub fn inst_position(&self, inst: ValueId) -> Option<usize> {
        let bb = self.parent_block(inst)?;
        self.block_insts(bb).iter().position(|&i| i == inst)
    }

    /// Erase a block and every instruction in it. Operands of all its
    /// instructions are cleared first, so intra-block references are legal.
    pub fn erase_block(&mut self, bb: ValueId) {
        let insts = self.block_insts(bb).to_vec();
        for &inst in &insts {
            self.clear_operands(inst);
        }
        for &inst in insts.iter().rev() {
            self.remove_all_uses(inst);
            self.detach(inst);
            self.values[inst.index()].kind = ValueKind::Erased;
        }
        self.remove_all_uses(bb);
        if let Some(func) = self.block_function(bb) {
            if let Some(data) = self.function_mut(func) {
                data.blocks.retain(|&b| b != bb);
            }
        }
        self.values[bb.index()].kind = ValueKind::Erased;
    }

    // ========================================
    // Use lists
    // ========================================

    pub fn users(&self, id: ValueId) -> &[UserRef] {
        &self.values[id.index()].users
    }

    pub fn has_users(&self, id: ValueId) -> bool {
        !self.users(id).is_empty()
    }

    pub fn num_users(&self, id: ValueId) -> usize {
        self.users(id).len()
    }

    /// Snapshot of the consuming instructions, one entry per use.
    pub fn user_insts(&self, id: ValueId) -> Vec<ValueId> {
        self.users(id).iter().map(|u| u.inst).collect()
    }

    /// `user` has at least one operand referencing `id`.
    pub fn has_user(&self, id: ValueId, user: ValueId) -> bool {
        self.users(id).iter().any(|u| u.inst == user)
    }

    pub fn operand_slots(&self, inst: ValueId) -> &[Option<Operand>] {
        self.inst(inst).map(|data| data.operands.as_slice()).unwrap_or(&[])
    }

    pub fn num_operands(&self, inst: ValueId) -> usize {
        self.operand_slots(inst).len()
    }

    pub fn operand(&self, inst: ValueId, idx: usize) -> Option<ValueId> {
        self.operand_slots(inst).get(idx).copied().flatten().map(|op| op.value)
    }

    /// Snapshot of operand values; cleared slots are skipped.
    pub fn operands(&self, inst: ValueId) -> Vec<ValueId> {
        self.operand_slots(inst).iter().filter_map(|op| op.map(|o| o.value)).collect()
    }

    fn add_user(&mut self, value: ValueId, inst: ValueId, operand: usize) -> u32 {
        let users = &mut self.values[value.index()].users;
        users.push(UserRef { inst, operand: operand as u32 });
        (users.len() - 1) as u32
    }

    /// Swap-remove entry `use_index` from `value`'s user list and fix up the
    /// operand slot of the entry that moved into its place.
    fn remove_use(&mut self, value: ValueId, use_index: u32) {
        let idx = use_index as usize;
        let moved = {
            let users = &mut self.values[value.index()].users;
            if idx >= users.len() {
                debug_assert!(false, "use index out of range");
                return;
            }
            users.swap_remove(idx);
            users.get(idx).copied()
        };
        if let Some(moved) = moved {
            if let Some(data) = self.inst_mut(moved.inst) {
                if let Some(Some(slot)) = data.operands.get_mut(moved.operand as usize) {
                    debug_assert_eq!(slot.value, value);
                    slot.use_index = use_index;
                }
            }
        }
    }

    /// Append an operand to `inst`, registering the use. Returns the
    /// operand index.
    pub fn push_operand(&mut self, inst: ValueId, value: Option<ValueId>) -> usize {
        let idx = self.num_operands(inst);
        let slot = value.map(|v| Operand { value: v, use_index: self.add_user(v, inst, idx) });
        if let Some(data) = self.inst_mut(inst) {
            data.operands.push(slot);
        }
        idx
    }

    /// Replace operand `idx` of `inst`. `None` clears the slot.
    pub fn set_operand(&mut self, inst: ValueId, value: Option<ValueId>, idx: usize) {
        let old = match self.inst(inst).and_then(|data| data.operands.get(idx)) {
            Some(slot) => *slot,
            None => {
                debug_assert!(false, "operand index out of range");
                return;
            }
        };
        if old.map(|o| o.value) == value {
            return;
        }
        if let Some(old) = old {
            self.remove_use(old.value, old.use_index);
        }
        let slot = value.map(|v| Operand { value: v, use_index: self.add_user(v, inst, idx) });
        if let Some(data) = self.inst_mut(inst) {
            data.operands[idx] = slot;
        }
    }

    /// Remove operand `idx`, shifting later operands down.
    pub fn remove_operand(&mut self, inst: ValueId, idx: usize) {
        if idx >= self.num_operands(inst) {
            return;
        }
        self.set_operand(inst, None, idx);
        let shifted: Vec<(usize, Operand)> = match self.inst_mut(inst) {
            Some(data) => {
                data.operands.remove(idx);
                data.operands
                    .iter()
                    .enumerate()
                    .skip(idx)
                    .filter_map(|(j, op)| op.map(|o| (j, o)))
                    .collect()
            }
            None => return,
        };
        for (j, op) in shifted {
            self.values[op.value.index()].users[op.use_index as usize].operand = j as u32;
        }
    }

    /// Replace the first operand of `inst` equal to `old` with `new`.
    pub fn replace_first_operand_with(&mut self, inst: ValueId, old: ValueId, new: ValueId) {
        let pos = self.operand_slots(inst).iter().position(|op| op.map(|o| o.value) == Some(old));
        if let Some(idx) = pos {
            self.set_operand(inst, Some(new), idx);
        }
    }

    /// Point every use of `value` at `other`.
    pub fn replace_all_uses_with(&mut self, value: ValueId, other: ValueId) {
        if value == other {
            return;
        }
        while let Some(last) = self.users(value).last().copied() {
            self.replace_first_operand_with(last.inst, value, other);
        }
    }

    /// Erase every operand slot that references `value`.
    pub fn remove_all_uses(&mut self, value: ValueId) {
        while let Some(last) = self.users(value).last().copied() {
            self.remove_operand(last.inst, last.operand as usize);
        }
    }

    /// Clear every operand slot of `inst`, unregistering all its uses.
    pub fn clear_operands(&mut self, inst: ValueId) {
        for idx in 0..self.num_operands(inst) {
            self.set_operand(inst, None, idx);
        }
    }

    // ========================================
    // Instruction creation and placement
    // ========================================

    /// Create an instruction not yet placed in any block.
    pub fn create_instruction(&mut self, kind: InstKind, operands: &[ValueId], ty: Type) -> ValueId {
        let inst = self.alloc(
            ValueKind::Instruction(InstructionData { kind, operands: Vec::with_capacity(operands.len()), block: None }),
            ty,
        );
        for &op in operands {
            self.push_operand(inst, Some(op));
        }
        inst
    }

    fn set_parent(&mut self, inst: ValueId, block: Option<ValueId>) {
        if let Some(data) = self.inst_mut(inst) {
            data.block = block;
        }
    }

    pub fn push_back(&mut self, bb: ValueId, inst: ValueId) {
        if let Some(insts) = self.block_insts_mut(bb) {
            insts.push(inst);
        }
        self.set_parent(inst, Some(bb));
    }

    pub fn insert_at(&mut self, bb: ValueId, pos: usize, inst: ValueId) {
        if let Some(insts) = self.block_insts_mut(bb) {
            let pos = pos.min(insts.len());
            insts.insert(pos, inst);
        }
        self.set_parent(inst, Some(bb));
    }

    /// Place an unparented `inst` right before `before`.
    pub fn insert_before(&mut self, inst: ValueId, before: ValueId) {
        if let (Some(bb), Some(pos)) = (self.parent_block(before), self.inst_position(before)) {
            self.insert_at(bb, pos, inst);
        }
    }

    /// Place an unparented `inst` right after `after`.
    pub fn insert_after(&mut self, inst: ValueId, after: ValueId) {
        if let (Some(bb), Some(pos)) = (self.parent_block(after), self.inst_position(after)) {
            self.insert_at(bb, pos + 1, inst);
        }
    }

    /// Unlink `inst` from its block without touching its operands.
    pub fn detach(&mut self, inst: ValueId) {
        if let Some(bb) = self.parent_block(inst) {
            if let Some(insts) = self.block_insts_mut(bb) {
                if let Some(pos) = insts.iter().position(|&i| i == inst) {
                    insts.remove(pos);
                }
            }
        }
        self.set_parent(inst, None);
    }

    pub fn move_before(&mut self, inst: ValueId, before: ValueId) {
        if inst == before {
            return;
        }
        self.detach(inst);
        self.insert_before(inst, before);
    }

    /// Move `inst` to the end of `bb`, before its terminator if it has one.
    pub fn move_to_block_end(&mut self, inst: ValueId, bb: ValueId) {
        self.detach(inst);
        match self.terminator(bb) {
            Some(term) => self.insert_before(inst, term),
            None => self.push_back(bb, inst),
        }
    }

    /// Destroy `inst`: clear its operands, unlink it and tombstone it.
    /// The instruction must have no users left.
    pub fn erase_from_parent(&mut self, inst: ValueId) {
        debug_assert!(!self.has_users(inst), "erasing {} which still has users", inst);
        self.clear_operands(inst);
        self.detach(inst);
        self.values[inst.index()].kind = ValueKind::Erased;
    }

    // ========================================
    // Side effects
    // ========================================

    /// Side effect of `inst`, refined from operand types where the kind
    /// depends on them.
    pub fn side_effect(&self, inst: ValueId) -> SideEffect {
        let data = match self.inst(inst) {
            Some(data) => data,
            None => return SideEffect::none(),
        };
        let ty_of = |idx: usize| self.operand(inst, idx).map_or(Type::any(), |v| self.ty(v));
        match &data.kind {
            InstKind::BinaryOperator(op) | InstKind::CompareBranch(op) => op.side_effect(ty_of(0), ty_of(1)),
            InstKind::UnaryOperator(op) => op.side_effect(ty_of(0)),
            kind => kind.static_side_effect(),
        }
    }

    /// Binary operator of a `BinaryOperator` or `CompareBranch`.
    pub fn binary_op(&self, inst: ValueId) -> Option<BinaryOp> {
        match self.inst_kind(inst)? {
            InstKind::BinaryOperator(op) | InstKind::CompareBranch(op) => Some(*op),
            _ => None,
        }
    }

    /// Operand slots of `inst` that it writes to.
    pub fn changed_operands(&self, inst: ValueId) -> Vec<ValueId> {
        match self.inst_kind(inst) {
            Some(kind) => kind
                .changed_operands()
                .into_iter()
                .filter_map(|idx| self.operand(inst, idx))
                .collect(),
            None => Vec::new(),
        }
    }

    // ========================================
    // Successors
    // ========================================

    /// Successor blocks declared by terminator `inst`.
    pub fn inst_successors(&self, inst: ValueId) -> Vec<ValueId> {
        match self.inst_kind(inst) {
            Some(kind) => kind
                .successor_indices(self.num_operands(inst))
                .into_iter()
                .filter_map(|idx| self.operand(inst, idx))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Replace successor `succ_idx` of terminator `inst`.
    pub fn set_successor(&mut self, inst: ValueId, succ_idx: usize, bb: ValueId) {
        let indices = match self.inst_kind(inst) {
            Some(kind) => kind.successor_indices(self.num_operands(inst)),
            None => return,
        };
        if let Some(&idx) = indices.get(succ_idx) {
            self.set_operand(inst, Some(bb), idx);
        }
    }

    // ========================================
    // Phi entries
    // ========================================

    pub fn phi_num_entries(&self, phi: ValueId) -> usize {
        self.num_operands(phi) / 2
    }

    /// `(value, block)` pairs; entries with a cleared slot are skipped.
    pub fn phi_entries(&self, phi: ValueId) -> Vec<(ValueId, ValueId)> {
        (0..self.phi_num_entries(phi)).filter_map(|i| self.phi_entry(phi, i)).collect()
    }

    pub fn phi_entry(&self, phi: ValueId, i: usize) -> Option<(ValueId, ValueId)> {
        Some((self.operand(phi, 2 * i)?, self.operand(phi, 2 * i + 1)?))
    }

    pub fn add_phi_entry(&mut self, phi: ValueId, value: ValueId, block: ValueId) {
        self.push_operand(phi, Some(value));
        self.push_operand(phi, Some(block));
        self.recompute_phi_type(phi);
    }

    pub fn update_phi_entry(&mut self, phi: ValueId, i: usize, value: ValueId, block: ValueId) {
        self.set_operand(phi, Some(value), 2 * i);
        self.set_operand(phi, Some(block), 2 * i + 1);
        self.recompute_phi_type(phi);
    }

    pub fn remove_phi_entry(&mut self, phi: ValueId, i: usize) {
        self.remove_operand(phi, 2 * i + 1);
        self.remove_operand(phi, 2 * i);
        self.recompute_phi_type(phi);
    }

    /// Drop every entry coming from `block`.
    pub fn remove_phi_entries_for_block(&mut self, phi: ValueId, block: ValueId) {
        let mut i = self.phi_num_entries(phi);
        while i > 0 {
            i -= 1;
            if self.operand(phi, 2 * i + 1) == Some(block) {
                self.remove_operand(phi, 2 * i + 1);
                self.remove_operand(phi, 2 * i);
            }
        }
        self.recompute_phi_type(phi);
    }

    /// Union of the incoming value types, ignoring self references.
    pub fn recompute_phi_type(&mut self, phi: ValueId) {
        let mut ty = Type::no_type();
        for (value, _) in self.phi_entries(phi) {
            if value != phi {
                ty = ty.union(self.ty(value));
            }
        }
        self.set_type(phi, ty);
    }

    // ========================================
    // Switch cases
    // ========================================

    fn first_case_index(&self, inst: ValueId) -> Option<usize> {
        match self.inst_kind(inst)? {
            InstKind::Switch => Some(crate::instructions::index::switch::FIRST_CASE),
            InstKind::SwitchImm => Some(crate::instructions::index::switch_imm::FIRST_CASE),
            _ => None,
        }
    }

    /// `(case literal, destination)` pairs of a switch.
    pub fn switch_cases(&self, inst: ValueId) -> Vec<(ValueId, ValueId)> {
        let first = match self.first_case_index(inst) {
            Some(first) => first,
            None => return Vec::new(),
        };
        let mut cases = Vec::new();
        let mut idx = first;
        while idx + 1 < self.num_operands(inst) {
            if let (Some(value), Some(dest)) = (self.operand(inst, idx), self.operand(inst, idx + 1)) {
                cases.push((value, dest));
            }
            idx += 2;
        }
        cases
    }

    pub fn switch_default(&self, inst: ValueId) -> Option<ValueId> {
        self.operand(inst, crate::instructions::index::switch::DEFAULT)
    }
}
