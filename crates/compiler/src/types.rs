//! # Value Types
//!
//! A `Type` is a bitmask over the JavaScript type lattice. Each bit means
//! "the value may be of this kind". Union and intersection are bitwise, so
//! type inference for phis and promoted stack slots is cheap.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Individual type categories, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    /// A TDZ variable before its declaration.
    Empty = 0,
    /// Declared but not yet initialized. Maps to undefined at runtime.
    Uninit,
    Undefined,
    Null,
    Boolean,
    String,
    Number,
    BigInt,
    Environment,
    /// Function code, not a closure.
    FunctionCode,
    Object,
}

impl TypeKind {
    const ALL: [TypeKind; 11] = [
        TypeKind::Empty,
        TypeKind::Uninit,
        TypeKind::Undefined,
        TypeKind::Null,
        TypeKind::Boolean,
        TypeKind::String,
        TypeKind::Number,
        TypeKind::BigInt,
        TypeKind::Environment,
        TypeKind::FunctionCode,
        TypeKind::Object,
    ];

    fn name(self) -> &'static str {
        match self {
            TypeKind::Empty => "empty",
            TypeKind::Uninit => "uninit",
            TypeKind::Undefined => "undefined",
            TypeKind::Null => "null",
            TypeKind::Boolean => "boolean",
            TypeKind::String => "string",
            TypeKind::Number => "number",
            TypeKind::BigInt => "bigint",
            TypeKind::Environment => "environment",
            TypeKind::FunctionCode => "functionCode",
            TypeKind::Object => "object",
        }
    }

    const fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

/// Bitmask type of an IR value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type {
    bits: u16,
}

const ANY_EMPTY_UNINIT_MASK: u16 = ((1u16 << 11) - 1)
    & !TypeKind::Environment.bit()
    & !TypeKind::FunctionCode.bit();
const ANY_MASK: u16 = ANY_EMPTY_UNINIT_MASK & !TypeKind::Empty.bit() & !TypeKind::Uninit.bit();
const PRIMITIVE_BITS: u16 = TypeKind::Number.bit()
    | TypeKind::String.bit()
    | TypeKind::BigInt.bit()
    | TypeKind::Null.bit()
    | TypeKind::Undefined.bit()
    | TypeKind::Boolean.bit();
const NONPTR_BITS: u16 = TypeKind::Number.bit()
    | TypeKind::Boolean.bit()
    | TypeKind::Null.bit()
    | TypeKind::Undefined.bit();

impl Type {
    pub const fn from_kind(kind: TypeKind) -> Self {
        Self { bits: kind.bit() }
    }

    pub const fn no_type() -> Self {
        Self { bits: 0 }
    }

    pub const fn any() -> Self {
        Self { bits: ANY_MASK }
    }

    pub const fn any_empty_uninit() -> Self {
        Self { bits: ANY_EMPTY_UNINIT_MASK }
    }

    pub const fn undefined() -> Self {
        Self::from_kind(TypeKind::Undefined)
    }

    pub const fn null() -> Self {
        Self::from_kind(TypeKind::Null)
    }

    pub const fn boolean() -> Self {
        Self::from_kind(TypeKind::Boolean)
    }

    pub const fn string() -> Self {
        Self::from_kind(TypeKind::String)
    }

    pub const fn number() -> Self {
        Self::from_kind(TypeKind::Number)
    }

    pub const fn bigint() -> Self {
        Self::from_kind(TypeKind::BigInt)
    }

    pub const fn object() -> Self {
        Self::from_kind(TypeKind::Object)
    }

    pub const fn empty() -> Self {
        Self::from_kind(TypeKind::Empty)
    }

    pub const fn uninit() -> Self {
        Self::from_kind(TypeKind::Uninit)
    }

    pub const fn environment() -> Self {
        Self::from_kind(TypeKind::Environment)
    }

    pub const fn function_code() -> Self {
        Self::from_kind(TypeKind::FunctionCode)
    }

    /// Number or BigInt.
    pub const fn numeric() -> Self {
        Self { bits: TypeKind::Number.bit() | TypeKind::BigInt.bit() }
    }

    pub const fn union(self, other: Type) -> Type {
        Type { bits: self.bits | other.bits }
    }

    /// Sound but not complete; only used for disjointness checks.
    pub const fn intersect(self, other: Type) -> Type {
        Type { bits: self.bits & other.bits }
    }

    pub const fn subtract(self, other: Type) -> Type {
        Type { bits: self.bits & !other.bits }
    }

    pub const fn bits(self) -> u16 {
        self.bits
    }

    pub const fn is_no_type(self) -> bool {
        self.bits == 0
    }

    pub const fn is_any_type(self) -> bool {
        self.bits == ANY_MASK
    }

    pub const fn can_be(self, kind: TypeKind) -> bool {
        self.bits & kind.bit() != 0
    }

    pub const fn is(self, kind: TypeKind) -> bool {
        self.bits == kind.bit()
    }

    /// Every possible runtime value is a primitive.
    pub const fn is_primitive(self) -> bool {
        self.bits != 0 && self.bits & !PRIMITIVE_BITS == 0
    }

    /// Every possible runtime value is stored without a heap pointer.
    pub const fn is_non_ptr(self) -> bool {
        self.bits != 0 && self.bits & !NONPTR_BITS == 0
    }

    pub const fn can_be_bigint(self) -> bool {
        self.can_be(TypeKind::BigInt)
    }

    pub const fn can_be_object(self) -> bool {
        self.can_be(TypeKind::Object)
    }

    /// `self` is a subset of `other`.
    pub const fn is_subset_of(self, other: Type) -> bool {
        self.bits & !other.bits == 0
    }
}

impl Default for Type {
    fn default() -> Self {
        Type::any()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any_type() {
            return write!(f, "any");
        }
        if self.is_no_type() {
            return write!(f, "notype");
        }
        let mut first = true;
        for kind in TypeKind::ALL {
            if self.can_be(kind) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", kind.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self)
    }
}
