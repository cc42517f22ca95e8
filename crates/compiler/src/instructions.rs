//! # Instruction Catalog
//!
//! The closed set of instruction kinds. Operands live uniformly in the
//! instruction's operand vector (see `ir::InstructionData`); the payload of
//! each `InstKind` variant only carries non-value attributes such as the
//! operator of a binary instruction or the name of a stack slot.
//!
//! Named operand positions for each kind are in the [`index`] module.
//! Per-kind queries (`is_terminator`, `has_output`, successor positions,
//! changed operands, static side effect) dispatch over the discriminant.

use crate::side_effect::SideEffect;
use crate::types::Type;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

/// Binary operators of `BinaryOperator` and `CompareBranch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    StrictlyEqual,
    StrictlyNotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LeftShift,
    RightShift,
    UnsignedRightShift,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponentiation,
    Or,
    Xor,
    And,
    In,
    InstanceOf,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::StrictlyEqual => "===",
            BinaryOp::StrictlyNotEqual => "!==",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::LeftShift => "<<",
            BinaryOp::RightShift => ">>",
            BinaryOp::UnsignedRightShift => ">>>",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Exponentiation => "**",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::And => "&",
            BinaryOp::In => "in",
            BinaryOp::InstanceOf => "instanceof",
        }
    }

    /// Operators that `CompareBranch` can fuse with a conditional branch.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::StrictlyEqual
                | BinaryOp::StrictlyNotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    /// Side effect of applying `self` to operands of the given types.
    ///
    /// Strict equality never has an effect. `in` and `instanceof` may run
    /// arbitrary code. Division-like operators on primitives are idempotent
    /// unless a BigInt is possible, in which case they may throw (mixing
    /// BigInt and Number, division by zero, negative exponent). Other
    /// arithmetic on primitives throws only when BigInt may meet a
    /// non-BigInt; comparisons accept the mix.
    pub fn side_effect(self, left: Type, right: Type) -> SideEffect {
        match self {
            BinaryOp::StrictlyEqual | BinaryOp::StrictlyNotEqual => SideEffect::idempotent(),
            BinaryOp::In | BinaryOp::InstanceOf => SideEffect::execute(),
            BinaryOp::Divide
            | BinaryOp::Modulo
            | BinaryOp::LeftShift
            | BinaryOp::RightShift
            | BinaryOp::UnsignedRightShift
            | BinaryOp::Exponentiation => {
                if !(left.is_primitive() && right.is_primitive()) {
                    SideEffect::execute()
                } else if left.can_be_bigint() || right.can_be_bigint() {
                    SideEffect::throws()
                } else {
                    SideEffect::idempotent()
                }
            }
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Or
            | BinaryOp::Xor
            | BinaryOp::And => {
                let both_bigint = left == Type::bigint() && right == Type::bigint();
                if !(left.is_primitive() && right.is_primitive()) {
                    SideEffect::execute()
                } else if (left.can_be_bigint() || right.can_be_bigint()) && !both_bigint {
                    SideEffect::throws()
                } else {
                    SideEffect::idempotent()
                }
            }
            _ => {
                if left.is_primitive() && right.is_primitive() {
                    SideEffect::idempotent()
                } else {
                    SideEffect::execute()
                }
            }
        }
    }

    /// Result type for operands of the given types.
    pub fn result_type(self, left: Type, right: Type) -> Type {
        match self {
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::StrictlyEqual
            | BinaryOp::StrictlyNotEqual
            | BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual
            | BinaryOp::In
            | BinaryOp::InstanceOf => Type::boolean(),
            BinaryOp::UnsignedRightShift => Type::number(),
            BinaryOp::Add => {
                if left.is(crate::types::TypeKind::Number) && right.is(crate::types::TypeKind::Number) {
                    Type::number()
                } else if left.is(crate::types::TypeKind::String) || right.is(crate::types::TypeKind::String) {
                    Type::string()
                } else {
                    Type::number().union(Type::bigint()).union(Type::string())
                }
            }
            _ => {
                if left.can_be_bigint() || right.can_be_bigint() || !left.is_primitive() || !right.is_primitive() {
                    Type::numeric()
                } else {
                    Type::number()
                }
            }
        }
    }
}

/// Unary operators of `UnaryOperator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Void,
    TypeOf,
    Minus,
    Tilde,
    Bang,
    Inc,
    Dec,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Void => "void",
            UnaryOp::TypeOf => "typeof",
            UnaryOp::Minus => "-",
            UnaryOp::Tilde => "~",
            UnaryOp::Bang => "!",
            UnaryOp::Inc => "++",
            UnaryOp::Dec => "--",
        }
    }

    pub fn side_effect(self, operand: Type) -> SideEffect {
        match self {
            UnaryOp::Void | UnaryOp::TypeOf | UnaryOp::Bang => SideEffect::idempotent(),
            _ => {
                if !operand.is_primitive() {
                    SideEffect::execute()
                } else if operand.can_be_bigint() {
                    SideEffect::throws()
                } else {
                    SideEffect::idempotent()
                }
            }
        }
    }

    pub fn result_type(self, operand: Type) -> Type {
        match self {
            UnaryOp::Void => Type::undefined(),
            UnaryOp::TypeOf => Type::string(),
            UnaryOp::Bang => Type::boolean(),
            _ => {
                if operand.is_primitive() && !operand.can_be_bigint() {
                    Type::number()
                } else {
                    Type::numeric()
                }
            }
        }
    }
}

/// Discriminant and attributes of an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    // Terminators
    Branch,
    CondBranch,
    Return,
    Throw,
    Switch,
    SwitchImm,
    TryStart,
    TryEnd,
    Unreachable,
    CompareBranch(BinaryOp),
    GetPNames,
    GetNextPName,
    SaveAndYield,

    // Stack and frame memory
    AllocStack { name: String },
    LoadStack,
    StoreStack,
    LoadFrame,
    StoreFrame,
    CreateScope,
    ResolveScope,

    // SSA plumbing
    Phi,
    Mov,
    ImplicitMov,
    LoadParam,
    Catch,

    // Arithmetic and conversions
    BinaryOperator(BinaryOp),
    UnaryOperator(UnaryOp),
    AsNumber,
    AddEmptyString,
    ToPropertyKey,

    // Objects and calls
    LoadProperty,
    StoreProperty,
    DeleteProperty,
    AllocObject { size: u32 },
    AllocArray,
    CreateArguments,
    CreateRegExp { pattern: String, flags: String },
    CreateFunction,
    Call,
    GetNewTarget,
    DirectEval,
    DeclareGlobalVar,
    Debugger,

    // Iteration and generators
    IteratorBegin,
    IteratorNext,
    IteratorClose,
    ResumeGenerator,
}

/// Named operand positions.
pub mod index {
    pub mod branch {
        pub const DEST: usize = 0;
    }
    pub mod cond_branch {
        pub const CONDITION: usize = 0;
        pub const TRUE_BLOCK: usize = 1;
        pub const FALSE_BLOCK: usize = 2;
    }
    pub mod ret {
        pub const VALUE: usize = 0;
    }
    pub mod throw {
        pub const VALUE: usize = 0;
    }
    /// Cases follow as `(literal, block)` pairs starting at `FIRST_CASE`.
    pub mod switch {
        pub const INPUT: usize = 0;
        pub const DEFAULT: usize = 1;
        pub const FIRST_CASE: usize = 2;
    }
    pub mod switch_imm {
        pub const INPUT: usize = 0;
        pub const DEFAULT: usize = 1;
        pub const MIN: usize = 2;
        pub const SIZE: usize = 3;
        pub const FIRST_CASE: usize = 4;
    }
    pub mod try_start {
        pub const CATCH_TARGET: usize = 0;
        pub const TRY_BODY: usize = 1;
    }
    pub mod try_end {
        pub const CATCH_TARGET: usize = 0;
        pub const BRANCH_DEST: usize = 1;
    }
    pub mod compare_branch {
        pub const LEFT: usize = 0;
        pub const RIGHT: usize = 1;
        pub const TRUE_BLOCK: usize = 2;
        pub const FALSE_BLOCK: usize = 3;
    }
    pub mod get_pnames {
        pub const ITERATOR: usize = 0;
        pub const BASE: usize = 1;
        pub const INDEX: usize = 2;
        pub const SIZE: usize = 3;
        pub const ON_EMPTY: usize = 4;
        pub const ON_SOME: usize = 5;
    }
    pub mod get_next_pname {
        pub const PROPERTY: usize = 0;
        pub const BASE: usize = 1;
        pub const INDEX: usize = 2;
        pub const SIZE: usize = 3;
        pub const ITERATOR: usize = 4;
        pub const ON_LAST: usize = 5;
        pub const ON_SOME: usize = 6;
    }
    pub mod save_and_yield {
        pub const RESULT: usize = 0;
        pub const IS_DELEGATED: usize = 1;
        pub const NEXT_BLOCK: usize = 2;
    }
    pub mod load_stack {
        pub const PTR: usize = 0;
    }
    pub mod store_stack {
        pub const VALUE: usize = 0;
        pub const PTR: usize = 1;
    }
    pub mod load_frame {
        pub const VARIABLE: usize = 0;
        pub const SCOPE: usize = 1;
    }
    pub mod store_frame {
        pub const VALUE: usize = 0;
        pub const VARIABLE: usize = 1;
        pub const SCOPE: usize = 2;
    }
    pub mod create_scope {
        pub const VARIABLE_SCOPE: usize = 0;
        pub const PARENT: usize = 1;
    }
    pub mod resolve_scope {
        pub const VARIABLE_SCOPE: usize = 0;
        pub const START: usize = 1;
    }
    pub mod binary {
        pub const LEFT: usize = 0;
        pub const RIGHT: usize = 1;
    }
    pub mod single {
        pub const OPERAND: usize = 0;
    }
    pub mod load_property {
        pub const OBJECT: usize = 0;
        pub const PROPERTY: usize = 1;
    }
    pub mod store_property {
        pub const VALUE: usize = 0;
        pub const OBJECT: usize = 1;
        pub const PROPERTY: usize = 2;
    }
    pub mod create_function {
        pub const FUNCTION_CODE: usize = 0;
        pub const SCOPE: usize = 1;
    }
    pub mod call {
        pub const CALLEE: usize = 0;
        pub const THIS: usize = 1;
        pub const FIRST_ARG: usize = 2;
    }
    pub mod iterator_begin {
        pub const SOURCE_OR_NEXT: usize = 0;
    }
    pub mod iterator_next {
        pub const ITERATOR: usize = 0;
        pub const SOURCE_OR_NEXT: usize = 1;
    }
    pub mod iterator_close {
        pub const ITERATOR: usize = 0;
        pub const IGNORE_INNER_EXCEPTION: usize = 1;
    }
    pub mod resume_generator {
        pub const IS_RETURN: usize = 0;
    }
}

pub type OperandIndices = SmallVec<[usize; 4]>;

impl InstKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstKind::Branch => "BranchInst",
            InstKind::CondBranch => "CondBranchInst",
            InstKind::Return => "ReturnInst",
            InstKind::Throw => "ThrowInst",
            InstKind::Switch => "SwitchInst",
            InstKind::SwitchImm => "SwitchImmInst",
            InstKind::TryStart => "TryStartInst",
            InstKind::TryEnd => "TryEndInst",
            InstKind::Unreachable => "UnreachableInst",
            InstKind::CompareBranch(_) => "CompareBranchInst",
            InstKind::GetPNames => "GetPNamesInst",
            InstKind::GetNextPName => "GetNextPNameInst",
            InstKind::SaveAndYield => "SaveAndYieldInst",
            InstKind::AllocStack { .. } => "AllocStackInst",
            InstKind::LoadStack => "LoadStackInst",
            InstKind::StoreStack => "StoreStackInst",
            InstKind::LoadFrame => "LoadFrameInst",
            InstKind::StoreFrame => "StoreFrameInst",
            InstKind::CreateScope => "CreateScopeInst",
            InstKind::ResolveScope => "ResolveScopeInst",
            InstKind::Phi => "PhiInst",
            InstKind::Mov => "MovInst",
            InstKind::ImplicitMov => "ImplicitMovInst",
            InstKind::LoadParam => "LoadParamInst",
            InstKind::Catch => "CatchInst",
            InstKind::BinaryOperator(_) => "BinaryOperatorInst",
            InstKind::UnaryOperator(_) => "UnaryOperatorInst",
            InstKind::AsNumber => "AsNumberInst",
            InstKind::AddEmptyString => "AddEmptyStringInst",
            InstKind::ToPropertyKey => "ToPropertyKeyInst",
            InstKind::LoadProperty => "LoadPropertyInst",
            InstKind::StoreProperty => "StorePropertyInst",
            InstKind::DeleteProperty => "DeletePropertyInst",
            InstKind::AllocObject { .. } => "AllocObjectInst",
            InstKind::AllocArray => "AllocArrayInst",
            InstKind::CreateArguments => "CreateArgumentsInst",
            InstKind::CreateRegExp { .. } => "CreateRegExpInst",
            InstKind::CreateFunction => "CreateFunctionInst",
            InstKind::Call => "CallInst",
            InstKind::GetNewTarget => "GetNewTargetInst",
            InstKind::DirectEval => "DirectEvalInst",
            InstKind::DeclareGlobalVar => "DeclareGlobalVarInst",
            InstKind::Debugger => "DebuggerInst",
            InstKind::IteratorBegin => "IteratorBeginInst",
            InstKind::IteratorNext => "IteratorNextInst",
            InstKind::IteratorClose => "IteratorCloseInst",
            InstKind::ResumeGenerator => "ResumeGeneratorInst",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Branch
                | InstKind::CondBranch
                | InstKind::Return
                | InstKind::Throw
                | InstKind::Switch
                | InstKind::SwitchImm
                | InstKind::TryStart
                | InstKind::TryEnd
                | InstKind::Unreachable
                | InstKind::CompareBranch(_)
                | InstKind::GetPNames
                | InstKind::GetNextPName
                | InstKind::SaveAndYield
        )
    }

    /// Whether the instruction defines a value usable as an operand.
    pub fn has_output(&self) -> bool {
        !self.is_terminator()
            && !matches!(
                self,
                InstKind::StoreStack
                    | InstKind::StoreFrame
                    | InstKind::StoreProperty
                    | InstKind::DeclareGlobalVar
                    | InstKind::Debugger
                    | InstKind::IteratorClose
            )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi)
    }

    pub fn is_mov(&self) -> bool {
        matches!(self, InstKind::Mov | InstKind::ImplicitMov)
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, InstKind::Switch | InstKind::SwitchImm)
    }

    /// Operand positions holding successor blocks, in successor order.
    /// The default destination of a switch is successor 0.
    pub fn successor_indices(&self, num_operands: usize) -> OperandIndices {
        match self {
            InstKind::Branch => smallvec![index::branch::DEST],
            InstKind::CondBranch => smallvec![index::cond_branch::TRUE_BLOCK, index::cond_branch::FALSE_BLOCK],
            InstKind::Switch => Self::case_successors(index::switch::DEFAULT, index::switch::FIRST_CASE, num_operands),
            InstKind::SwitchImm => {
                Self::case_successors(index::switch_imm::DEFAULT, index::switch_imm::FIRST_CASE, num_operands)
            }
            InstKind::TryStart => smallvec![index::try_start::CATCH_TARGET, index::try_start::TRY_BODY],
            InstKind::TryEnd => smallvec![index::try_end::CATCH_TARGET, index::try_end::BRANCH_DEST],
            InstKind::CompareBranch(_) => {
                smallvec![index::compare_branch::TRUE_BLOCK, index::compare_branch::FALSE_BLOCK]
            }
            InstKind::GetPNames => smallvec![index::get_pnames::ON_EMPTY, index::get_pnames::ON_SOME],
            InstKind::GetNextPName => smallvec![index::get_next_pname::ON_LAST, index::get_next_pname::ON_SOME],
            InstKind::SaveAndYield => smallvec![index::save_and_yield::NEXT_BLOCK],
            _ => SmallVec::new(),
        }
    }

    fn case_successors(default: usize, first_case: usize, num_operands: usize) -> OperandIndices {
        let mut result: OperandIndices = smallvec![default];
        let mut idx = first_case + 1;
        while idx < num_operands {
            result.push(idx);
            idx += 2;
        }
        result
    }

    /// Operand positions the instruction writes to (all are stack slots).
    pub fn changed_operands(&self) -> OperandIndices {
        match self {
            InstKind::StoreStack => smallvec![index::store_stack::PTR],
            InstKind::GetPNames => smallvec![
                index::get_pnames::ITERATOR,
                index::get_pnames::BASE,
                index::get_pnames::INDEX,
                index::get_pnames::SIZE
            ],
            InstKind::GetNextPName => smallvec![index::get_next_pname::PROPERTY, index::get_next_pname::INDEX],
            InstKind::IteratorBegin => smallvec![index::iterator_begin::SOURCE_OR_NEXT],
            InstKind::IteratorNext => smallvec![index::iterator_next::ITERATOR],
            InstKind::ResumeGenerator => smallvec![index::resume_generator::IS_RETURN],
            _ => SmallVec::new(),
        }
    }

    /// Side effect independent of operand types. Operator instructions
    /// refine this from their operand types in `Module::side_effect`.
    pub fn static_side_effect(&self) -> SideEffect {
        match self {
            InstKind::Branch
            | InstKind::CondBranch
            | InstKind::Return
            | InstKind::AllocStack { .. }
            | InstKind::Switch
            | InstKind::SwitchImm
            | InstKind::CreateScope
            | InstKind::CreateFunction
            | InstKind::AllocObject { .. }
            | InstKind::AllocArray
            | InstKind::CreateArguments
            | InstKind::CreateRegExp { .. }
            | InstKind::ImplicitMov
            | InstKind::LoadParam => SideEffect::none(),
            InstKind::LoadStack => SideEffect::idempotent().with_read_stack(),
            InstKind::StoreStack => SideEffect::idempotent().with_write_stack(),
            InstKind::LoadFrame => SideEffect::idempotent().with_read_frame(),
            InstKind::StoreFrame => SideEffect::idempotent().with_write_frame(),
            InstKind::ResolveScope | InstKind::GetNewTarget | InstKind::Mov => SideEffect::idempotent(),
            InstKind::Call
            | InstKind::LoadProperty
            | InstKind::StoreProperty
            | InstKind::DeleteProperty
            | InstKind::AsNumber
            | InstKind::AddEmptyString
            | InstKind::ToPropertyKey
            | InstKind::IteratorClose
            | InstKind::DirectEval
            | InstKind::DeclareGlobalVar
            | InstKind::Unreachable
            | InstKind::SaveAndYield => SideEffect::execute(),
            InstKind::Catch => SideEffect::unknown().with_first_in_block(),
            InstKind::Throw => SideEffect::throws(),
            InstKind::GetPNames | InstKind::GetNextPName | InstKind::IteratorBegin | InstKind::IteratorNext => {
                SideEffect::execute().with_read_stack().with_write_stack()
            }
            InstKind::TryStart | InstKind::TryEnd | InstKind::Debugger => SideEffect::unknown(),
            InstKind::Phi => SideEffect::first_in_block(),
            InstKind::ResumeGenerator => SideEffect::unknown().with_write_stack(),
            // Refined from operand types.
            InstKind::BinaryOperator(_) | InstKind::CompareBranch(_) | InstKind::UnaryOperator(_) => {
                SideEffect::execute()
            }
        }
    }

    /// Kinds that may legitimately take an `AllocStack` operand.
    pub fn accepts_stack_operand(&self) -> bool {
        matches!(
            self,
            InstKind::LoadStack
                | InstKind::StoreStack
                | InstKind::GetPNames
                | InstKind::GetNextPName
                | InstKind::IteratorBegin
                | InstKind::IteratorNext
                | InstKind::ResumeGenerator
        )
    }
}
