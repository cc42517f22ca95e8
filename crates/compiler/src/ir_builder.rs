//! # IR Builder API
//!
//! Stateful builder over a [`Module`] that tracks a current function and an
//! insertion point, in the style of LLVM's IRBuilder. Every factory method
//! creates one instruction, links it at the insertion point and returns its
//! handle.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use jsir_compiler::ir::Module;
//! use jsir_compiler::ir_builder::IrBuilder;
//!
//! let mut module = Module::new();
//! let mut builder = IrBuilder::new(&mut module);
//! let func = builder.create_function("main", None, true);
//! let entry = builder.create_block()?;
//! builder.set_insert_point(entry);
//!
//! let slot = builder.create_alloc_stack("a")?;
//! let five = builder.literal_number(5.0);
//! builder.create_store_stack(five, slot)?;
//! let loaded = builder.create_load_stack(slot)?;
//! builder.create_return(loaded)?;
//! ```

use crate::instructions::{BinaryOp, InstKind, UnaryOp};
use crate::ir::{Module, ValueId};
use crate::types::Type;
use crate::{CompilerError, CompilerResult};

/// Where the next instruction goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPoint {
    /// Append at the end of the block.
    End(ValueId),
    /// Insert right before the instruction.
    Before(ValueId),
}

pub struct IrBuilder<'m> {
    module: &'m mut Module,
    function: Option<ValueId>,
    insert_point: Option<InsertPoint>,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self { module, function: None, insert_point: None }
    }

    pub fn module(&mut self) -> &mut Module {
        &mut *self.module
    }

    // ========================================
    // Functions and blocks
    // ========================================

    /// Create a function and make it current.
    pub fn create_function(&mut self, name: &str, parent: Option<ValueId>, strict: bool) -> ValueId {
        let func = self.module.create_function(name, parent, strict);
        self.function = Some(func);
        self.insert_point = None;
        func
    }

    pub fn set_function(&mut self, func: ValueId) {
        self.function = Some(func);
        self.insert_point = None;
    }

    pub fn current_function(&self) -> Option<ValueId> {
        self.function
    }

    pub fn create_block(&mut self) -> CompilerResult<ValueId> {
        let func = self
            .function
            .ok_or_else(|| CompilerError::Lowering("create_block without a current function".into()))?;
        Ok(self.module.create_block(func))
    }

    pub fn add_parameter(&mut self, name: &str) -> CompilerResult<ValueId> {
        let func = self
            .function
            .ok_or_else(|| CompilerError::Lowering("add_parameter without a current function".into()))?;
        Ok(self.module.add_parameter(func, name))
    }

    /// Append subsequent instructions to the end of `block`.
    pub fn set_insert_point(&mut self, block: ValueId) {
        self.insert_point = Some(InsertPoint::End(block));
    }

    /// Insert subsequent instructions right before `inst`.
    pub fn set_insert_point_before(&mut self, inst: ValueId) {
        self.insert_point = Some(InsertPoint::Before(inst));
    }

    pub fn insertion_block(&self) -> Option<ValueId> {
        match self.insert_point? {
            InsertPoint::End(bb) => Some(bb),
            InsertPoint::Before(inst) => self.module.parent_block(inst),
        }
    }

    // ========================================
    // Literals
    // ========================================

    pub fn literal_undefined(&mut self) -> ValueId {
        self.module.literal_undefined()
    }

    pub fn literal_null(&mut self) -> ValueId {
        self.module.literal_null()
    }

    pub fn literal_empty(&mut self) -> ValueId {
        self.module.literal_empty()
    }

    pub fn literal_bool(&mut self, value: bool) -> ValueId {
        self.module.literal_bool(value)
    }

    pub fn literal_number(&mut self, value: f64) -> ValueId {
        self.module.literal_number(value)
    }

    pub fn literal_string(&mut self, value: &str) -> ValueId {
        self.module.literal_string(value)
    }

    pub fn literal_bigint(&mut self, digits: &str) -> ValueId {
        self.module.literal_bigint(digits)
    }

    fn insert(&mut self, kind: InstKind, operands: &[ValueId], ty: Type) -> CompilerResult<ValueId> {
        let point = self
            .insert_point
            .ok_or_else(|| CompilerError::Lowering(format!("no insertion point for {}", kind.name())))?;
        let inst = self.module.create_instruction(kind, operands, ty);
        match point {
            InsertPoint::End(bb) => self.module.push_back(bb, inst),
            InsertPoint::Before(before) => self.module.insert_before(inst, before),
        }
        Ok(inst)
    }

    // ========================================
    // Terminators
    // ========================================

    pub fn create_branch(&mut self, dest: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::Branch, &[dest], Type::no_type())
    }

    pub fn create_cond_branch(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::CondBranch, &[cond, on_true, on_false], Type::no_type())
    }

    pub fn create_return(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::Return, &[value], Type::no_type())
    }

    pub fn create_throw(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::Throw, &[value], Type::no_type())
    }

    pub fn create_unreachable(&mut self) -> CompilerResult<ValueId> {
        self.insert(InstKind::Unreachable, &[], Type::no_type())
    }

    /// `cases` are `(literal, destination)` pairs.
    pub fn create_switch(
        &mut self,
        input: ValueId,
        default: ValueId,
        cases: &[(ValueId, ValueId)],
    ) -> CompilerResult<ValueId> {
        let mut operands = vec![input, default];
        for &(value, dest) in cases {
            operands.push(value);
            operands.push(dest);
        }
        self.insert(InstKind::Switch, &operands, Type::no_type())
    }

    pub fn create_switch_imm(
        &mut self,
        input: ValueId,
        default: ValueId,
        min: u32,
        size: u32,
        cases: &[(ValueId, ValueId)],
    ) -> CompilerResult<ValueId> {
        let min = self.module.literal_number(min as f64);
        let size = self.module.literal_number(size as f64);
        let mut operands = vec![input, default, min, size];
        for &(value, dest) in cases {
            operands.push(value);
            operands.push(dest);
        }
        self.insert(InstKind::SwitchImm, &operands, Type::no_type())
    }

    pub fn create_try_start(&mut self, catch_target: ValueId, try_body: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::TryStart, &[catch_target, try_body], Type::no_type())
    }

    pub fn create_try_end(&mut self, catch_target: ValueId, branch_dest: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::TryEnd, &[catch_target, branch_dest], Type::no_type())
    }

    pub fn create_compare_branch(
        &mut self,
        op: BinaryOp,
        left: ValueId,
        right: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> CompilerResult<ValueId> {
        self.insert(InstKind::CompareBranch(op), &[left, right, on_true, on_false], Type::no_type())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_get_pnames(
        &mut self,
        iterator: ValueId,
        base: ValueId,
        index: ValueId,
        size: ValueId,
        on_empty: ValueId,
        on_some: ValueId,
    ) -> CompilerResult<ValueId> {
        self.insert(InstKind::GetPNames, &[iterator, base, index, size, on_empty, on_some], Type::no_type())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_get_next_pname(
        &mut self,
        property: ValueId,
        base: ValueId,
        index: ValueId,
        size: ValueId,
        iterator: ValueId,
        on_last: ValueId,
        on_some: ValueId,
    ) -> CompilerResult<ValueId> {
        self.insert(
            InstKind::GetNextPName,
            &[property, base, index, size, iterator, on_last, on_some],
            Type::no_type(),
        )
    }

    pub fn create_save_and_yield(&mut self, result: ValueId, is_delegated: bool, next: ValueId) -> CompilerResult<ValueId> {
        let delegated = self.module.literal_bool(is_delegated);
        self.insert(InstKind::SaveAndYield, &[result, delegated, next], Type::no_type())
    }

    // ========================================
    // Stack and frame memory
    // ========================================

    pub fn create_alloc_stack(&mut self, name: &str) -> CompilerResult<ValueId> {
        self.insert(InstKind::AllocStack { name: name.to_string() }, &[], Type::any())
    }

    pub fn create_load_stack(&mut self, ptr: ValueId) -> CompilerResult<ValueId> {
        let ty = self.module.ty(ptr);
        self.insert(InstKind::LoadStack, &[ptr], ty)
    }

    pub fn create_store_stack(&mut self, value: ValueId, ptr: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::StoreStack, &[value, ptr], Type::no_type())
    }

    pub fn create_load_frame(&mut self, variable: ValueId, scope: ValueId) -> CompilerResult<ValueId> {
        let ty = self.module.ty(variable);
        self.insert(InstKind::LoadFrame, &[variable, scope], ty)
    }

    pub fn create_store_frame(&mut self, value: ValueId, variable: ValueId, scope: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::StoreFrame, &[value, variable, scope], Type::no_type())
    }

    /// Create the runtime environment of `variable_scope`. `parent` is the
    /// enclosing environment, or the empty literal at the top level.
    pub fn create_create_scope(&mut self, variable_scope: ValueId, parent: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::CreateScope, &[variable_scope, parent], Type::environment())
    }

    pub fn create_resolve_scope(&mut self, variable_scope: ValueId, start: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::ResolveScope, &[variable_scope, start], Type::environment())
    }

    // ========================================
    // SSA plumbing
    // ========================================

    /// `entries` are `(value, predecessor block)` pairs.
    pub fn create_phi(&mut self, entries: &[(ValueId, ValueId)]) -> CompilerResult<ValueId> {
        let phi = self.insert(InstKind::Phi, &[], Type::no_type())?;
        for &(value, block) in entries {
            self.module.add_phi_entry(phi, value, block);
        }
        Ok(phi)
    }

    pub fn create_mov(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        let ty = self.module.ty(value);
        self.insert(InstKind::Mov, &[value], ty)
    }

    pub fn create_implicit_mov(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::ImplicitMov, &[value], Type::no_type())
    }

    pub fn create_load_param(&mut self, param: ValueId) -> CompilerResult<ValueId> {
        let ty = self.module.ty(param);
        self.insert(InstKind::LoadParam, &[param], ty)
    }

    pub fn create_catch(&mut self) -> CompilerResult<ValueId> {
        self.insert(InstKind::Catch, &[], Type::any())
    }

    // ========================================
    // Arithmetic and conversions
    // ========================================

    pub fn create_binary_operator(&mut self, op: BinaryOp, left: ValueId, right: ValueId) -> CompilerResult<ValueId> {
        let ty = op.result_type(self.module.ty(left), self.module.ty(right));
        self.insert(InstKind::BinaryOperator(op), &[left, right], ty)
    }

    pub fn create_unary_operator(&mut self, op: UnaryOp, operand: ValueId) -> CompilerResult<ValueId> {
        let ty = op.result_type(self.module.ty(operand));
        self.insert(InstKind::UnaryOperator(op), &[operand], ty)
    }

    pub fn create_as_number(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::AsNumber, &[value], Type::number())
    }

    pub fn create_add_empty_string(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::AddEmptyString, &[value], Type::string())
    }

    pub fn create_to_property_key(&mut self, value: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::ToPropertyKey, &[value], Type::string().union(Type::number()))
    }

    // ========================================
    // Objects and calls
    // ========================================

    pub fn create_load_property(&mut self, object: ValueId, property: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::LoadProperty, &[object, property], Type::any())
    }

    pub fn create_store_property(&mut self, value: ValueId, object: ValueId, property: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::StoreProperty, &[value, object, property], Type::no_type())
    }

    pub fn create_delete_property(&mut self, object: ValueId, property: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::DeleteProperty, &[object, property], Type::boolean())
    }

    pub fn create_alloc_object(&mut self, size: u32) -> CompilerResult<ValueId> {
        self.insert(InstKind::AllocObject { size }, &[], Type::object())
    }

    pub fn create_alloc_array(&mut self, elements: &[ValueId]) -> CompilerResult<ValueId> {
        self.insert(InstKind::AllocArray, elements, Type::object())
    }

    pub fn create_create_arguments(&mut self) -> CompilerResult<ValueId> {
        self.insert(InstKind::CreateArguments, &[], Type::object())
    }

    pub fn create_create_regexp(&mut self, pattern: &str, flags: &str) -> CompilerResult<ValueId> {
        self.insert(
            InstKind::CreateRegExp { pattern: pattern.to_string(), flags: flags.to_string() },
            &[],
            Type::object(),
        )
    }

    /// Create a closure of `code` capturing the environment `scope`.
    pub fn create_create_function(&mut self, code: ValueId, scope: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::CreateFunction, &[code, scope], Type::object())
    }

    pub fn create_call(&mut self, callee: ValueId, this: ValueId, args: &[ValueId]) -> CompilerResult<ValueId> {
        let mut operands = vec![callee, this];
        operands.extend_from_slice(args);
        self.insert(InstKind::Call, &operands, Type::any())
    }

    pub fn create_get_new_target(&mut self) -> CompilerResult<ValueId> {
        self.insert(InstKind::GetNewTarget, &[], Type::object().union(Type::undefined()))
    }

    pub fn create_direct_eval(&mut self, argument: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::DirectEval, &[argument], Type::any())
    }

    pub fn create_declare_global_var(&mut self, name: &str) -> CompilerResult<ValueId> {
        let name = self.module.literal_string(name);
        self.insert(InstKind::DeclareGlobalVar, &[name], Type::no_type())
    }

    pub fn create_debugger(&mut self) -> CompilerResult<ValueId> {
        self.insert(InstKind::Debugger, &[], Type::no_type())
    }

    // ========================================
    // Iteration and generators
    // ========================================

    pub fn create_iterator_begin(&mut self, source_or_next: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::IteratorBegin, &[source_or_next], Type::any())
    }

    pub fn create_iterator_next(&mut self, iterator: ValueId, source_or_next: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::IteratorNext, &[iterator, source_or_next], Type::any())
    }

    pub fn create_iterator_close(&mut self, iterator: ValueId, ignore_inner_exception: bool) -> CompilerResult<ValueId> {
        let ignore = self.module.literal_bool(ignore_inner_exception);
        self.insert(InstKind::IteratorClose, &[iterator, ignore], Type::no_type())
    }

    pub fn create_resume_generator(&mut self, is_return: ValueId) -> CompilerResult<ValueId> {
        self.insert(InstKind::ResumeGenerator, &[is_return], Type::any())
    }
}
