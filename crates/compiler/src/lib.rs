//! # JS IR Compiler Infrastructure
//!
//! SSA intermediate representation for a JavaScript bytecode compiler and
//! the middle-end passes that run on it before bytecode emission.
//!
//! ## Architecture
//!
//! - **IR**: an arena [`ir::Module`] of values addressed by [`ir::ValueId`],
//!   with a bidirectional use list kept in sync by every mutation
//! - **Analyses**: CFG queries, dominance, post order, loops, lexical
//!   function depth and try-region depth
//! - **Transforms**: stack promotion (precise and simple), dead code
//!   elimination, code motion and target lowering peepholes
//! - **Register allocation**: linear scan over live intervals with MOV
//!   coalescing and a fast fallback for huge functions
//!
//! ## Design Principles
//!
//! - Handles instead of pointers; erased values become tombstones
//! - The verifier runs between passes when requested
//! - Every pass reports whether it changed the module

pub mod types;
pub mod side_effect;
pub mod instructions;
pub mod ir;
pub mod ir_builder;
pub mod cfg;
pub mod dominance;
pub mod analysis;
pub mod loop_analysis;
pub mod verifier;
pub mod mem2reg;
pub mod simple_mem2reg;
pub mod regalloc;
pub mod code_motion;
pub mod lowering;
pub mod optimization;
pub mod printer;

// Re-export key types
pub use analysis::{FunctionAnalysis, FunctionScopeAnalysis, PostOrderAnalysis};
pub use code_motion::{CodeMotion, CodeMotionConfig};
pub use dominance::DominanceInfo;
pub use instructions::{BinaryOp, InstKind, UnaryOp};
pub use ir::{Literal, Module, ValueId, ValueKind};
pub use ir_builder::IrBuilder;
pub use loop_analysis::LoopAnalysis;
pub use mem2reg::{Mem2Reg, Mem2RegConfig, Mem2RegStats};
pub use optimization::{OptLevel, OptimizationPass, OptimizationPipeline};
pub use regalloc::{Interval, RegAllocConfig, Register, RegisterAllocator, RegisterFile, Segment};
pub use side_effect::{SideEffect, SideEffectKind};
pub use simple_mem2reg::SimpleMem2Reg;
pub use types::Type;
pub use verifier::{verify_function, verify_module, VerifyResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("Lowering error: {0}")]
    Lowering(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Code generation error: {0}")]
    CodeGen(String),

    #[error("Verification error: {0}")]
    Verification(String),
}

pub type CompilerResult<T> = Result<T, CompilerError>;

/// Compilation pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationConfig {
    pub opt_level: OptLevel,
    /// Run the verifier after every pass
    pub verify_each_pass: bool,
    /// Use the try-depth based stack promotion instead of the precise one
    pub use_simple_mem2reg: bool,
    pub mem2reg: Mem2RegConfig,
    pub code_motion: CodeMotionConfig,
    pub regalloc: RegAllocConfig,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Default,
            verify_each_pass: cfg!(debug_assertions),
            use_simple_mem2reg: false,
            mem2reg: Mem2RegConfig::default(),
            code_motion: CodeMotionConfig::default(),
            regalloc: RegAllocConfig::default(),
        }
    }
}

/// Main middle-end pipeline: optimizations for the configured level, then
/// the lowering peepholes.
pub fn run_pipeline(module: &mut Module, config: &CompilationConfig) -> CompilerResult<()> {
    if config.verify_each_pass {
        verify_module(module).into_result()?;
    }

    let mut opt_pipeline = OptimizationPipeline::from_config(config);
    log::debug!("[PIPELINE] level {:?}: {:?}", opt_pipeline.level(), opt_pipeline.pass_names());
    opt_pipeline.run(module)?;

    let mut lowering = OptimizationPipeline::lowering(config.verify_each_pass);
    lowering.run(module)?;
    Ok(())
}

/// Allocate registers for `func`, visiting blocks in reverse post order.
pub fn allocate_registers(
    module: &mut Module,
    func: ValueId,
    config: &RegAllocConfig,
) -> CompilerResult<RegisterAllocator> {
    if module.function(func).is_none() {
        return Err(CompilerError::CodeGen(format!("{} is not a function", func)));
    }
    let order = PostOrderAnalysis::new(module, func).reverse_order();
    let mut allocator = RegisterAllocator::new(func, config.clone());
    allocator.allocate(module, &order)?;
    log::debug!(
        "[REGALLOC] {}: {} registers",
        module.function_name(func),
        allocator.max_register_usage()
    );
    Ok(allocator)
}
