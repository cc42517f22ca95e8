//! # Side Effect Classification
//!
//! Every instruction kind reports a `SideEffect` flag set. Optimizations
//! consult it to decide whether an instruction may be reordered, hoisted,
//! sunk or deleted.
//!
//! ## Flags
//!
//! - `read_stack` / `write_stack`: touches an `AllocStack` operand
//! - `read_frame` / `write_frame`: touches a frame `Variable`
//! - `read_heap` / `write_heap`: touches JS objects
//! - `throw`: may throw an exception
//! - `execute_js`: may run arbitrary user code (getters, valueOf, calls)
//! - `first_in_block`: must precede every non-FirstInBlock instruction
//! - `idempotent`: re-executing with the same operands yields the same result

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification used by code motion and DCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SideEffectKind {
    None,
    MayRead,
    MayWrite,
    Unknown,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SideEffect {
    pub read_stack: bool,
    pub write_stack: bool,
    pub read_frame: bool,
    pub write_frame: bool,
    pub read_heap: bool,
    pub write_heap: bool,
    pub throw: bool,
    pub execute_js: bool,
    pub first_in_block: bool,
    pub idempotent: bool,
}

impl SideEffect {
    /// No observable effect at all.
    pub const fn none() -> Self {
        SideEffect {
            read_stack: false,
            write_stack: false,
            read_frame: false,
            write_frame: false,
            read_heap: false,
            write_heap: false,
            throw: false,
            execute_js: false,
            first_in_block: false,
            idempotent: false,
        }
    }

    /// May execute arbitrary JS.
    pub const fn execute() -> Self {
        SideEffect {
            read_frame: true,
            write_frame: true,
            read_heap: true,
            write_heap: true,
            execute_js: true,
            throw: true,
            ..SideEffect::none()
        }
    }

    /// Nothing is known about the instruction.
    pub const fn unknown() -> Self {
        Self::execute()
    }

    pub const fn idempotent() -> Self {
        SideEffect { idempotent: true, ..SideEffect::none() }
    }

    pub const fn throws() -> Self {
        SideEffect { throw: true, ..SideEffect::none() }
    }

    pub const fn first_in_block() -> Self {
        SideEffect { first_in_block: true, ..SideEffect::none() }
    }

    pub const fn with_read_stack(mut self) -> Self {
        self.read_stack = true;
        self
    }

    pub const fn with_write_stack(mut self) -> Self {
        self.write_stack = true;
        self
    }

    pub const fn with_read_frame(mut self) -> Self {
        self.read_frame = true;
        self
    }

    pub const fn with_write_frame(mut self) -> Self {
        self.write_frame = true;
        self
    }

    pub const fn with_first_in_block(mut self) -> Self {
        self.first_in_block = true;
        self
    }

    pub const fn with_idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub const fn reads_memory(&self) -> bool {
        self.read_stack || self.read_frame || self.read_heap
    }

    pub const fn writes_memory(&self) -> bool {
        self.write_stack || self.write_frame || self.write_heap
    }

    /// Effects that make the instruction unremovable even when unused.
    pub const fn has_side_effect(&self) -> bool {
        self.write_stack || self.write_heap || self.write_frame || self.throw
    }

    pub const fn may_execute(&self) -> bool {
        self.throw || self.execute_js
    }

    pub const fn may_write_or_worse(&self) -> bool {
        self.writes_memory() || self.may_execute()
    }

    pub const fn may_read_or_worse(&self) -> bool {
        self.reads_memory() || self.may_write_or_worse()
    }

    /// Deterministic and free of observable effects.
    pub const fn is_pure(&self) -> bool {
        !self.has_side_effect() && !self.reads_memory() && self.idempotent
    }

    pub fn is_well_formed(&self) -> bool {
        if self.execute_js {
            if self.idempotent {
                return false;
            }
            if !(self.read_frame && self.write_frame && self.read_heap && self.write_heap && self.throw) {
                return false;
            }
        }
        true
    }

    pub fn kind(&self) -> SideEffectKind {
        if self.may_execute() {
            SideEffectKind::Unknown
        } else if self.writes_memory() {
            SideEffectKind::MayWrite
        } else if self.reads_memory() {
            SideEffectKind::MayRead
        } else {
            SideEffectKind::None
        }
    }
}

impl fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.read_stack, "ReadStack"),
            (self.write_stack, "WriteStack"),
            (self.read_frame, "ReadFrame"),
            (self.write_frame, "WriteFrame"),
            (self.read_heap, "ReadHeap"),
            (self.write_heap, "WriteHeap"),
            (self.throw, "Throw"),
            (self.execute_js, "ExecuteJS"),
            (self.first_in_block, "FirstInBlock"),
            (self.idempotent, "Idempotent"),
        ];
        let names: Vec<&str> = flags.iter().filter(|(set, _)| *set).map(|(_, n)| *n).collect();
        write!(f, "SideEffect[{}]", names.join("|"))
    }
}
