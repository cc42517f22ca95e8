//! # Optimization Infrastructure
//!
//! Passes over a whole [`Module`] and the pipeline that runs them to a
//! fixpoint. Each pass computes the per-function analyses it needs itself;
//! `required_analyses` documents which ones.

use crate::code_motion::{CodeMotion, CodeMotionConfig};
use crate::ir::Module;
use crate::lowering::{LowerCondBranch, LowerSwitchIntoJumpTables, SwitchLowering};
use crate::mem2reg::{Mem2Reg, Mem2RegConfig};
use crate::simple_mem2reg::SimpleMem2Reg;
use crate::verifier::verify_module;
use crate::CompilerResult;
use serde::{Deserialize, Serialize};

/// Optimization pass trait
pub trait OptimizationPass: Send + Sync {
    /// Name of this optimization
    fn name(&self) -> &'static str;

    /// Required analyses
    fn required_analyses(&self) -> &[&'static str];

    /// Run the optimization, returning whether anything changed.
    fn run(&mut self, module: &mut Module) -> CompilerResult<bool>;
}

/// Optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptLevel {
    None,    // -O0
    Less,    // -O1
    Default, // -O2
    More,    // -O3
}

impl Default for OptLevel {
    fn default() -> Self {
        OptLevel::Default
    }
}

/// Optimization pipeline
pub struct OptimizationPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
    level: OptLevel,
    verify_each_pass: bool,
    max_iterations: usize,
}

impl OptimizationPipeline {
    pub fn new(level: OptLevel) -> Self {
        Self::with_options(level, false, Mem2RegConfig::default(), CodeMotionConfig::default())
    }

    /// Pipeline from a [`crate::CompilationConfig`].
    pub fn from_config(config: &crate::CompilationConfig) -> Self {
        let mut pipeline = Self {
            passes: Vec::new(),
            level: config.opt_level,
            verify_each_pass: config.verify_each_pass,
            max_iterations: 10,
        };
        pipeline.add_default_passes(config.use_simple_mem2reg, config.mem2reg, config.code_motion.clone());
        pipeline
    }

    fn with_options(level: OptLevel, simple: bool, mem2reg: Mem2RegConfig, code_motion: CodeMotionConfig) -> Self {
        let mut pipeline = Self { passes: Vec::new(), level, verify_each_pass: false, max_iterations: 10 };
        pipeline.add_default_passes(simple, mem2reg, code_motion);
        pipeline
    }

    /// Target lowering peepholes, run once each in order.
    pub fn lowering(verify_each_pass: bool) -> Self {
        use self::passes::*;

        Self {
            passes: vec![
                Box::new(LowerSwitchIntoJumpTablesPass::new()),
                Box::new(SwitchLoweringPass::new()),
                Box::new(LowerCondBranchPass::new()),
            ],
            level: OptLevel::None,
            verify_each_pass,
            max_iterations: 1,
        }
    }

    /// Add default optimization passes
    fn add_default_passes(&mut self, simple: bool, mem2reg: Mem2RegConfig, code_motion: CodeMotionConfig) {
        use self::passes::*;

        match self.level {
            OptLevel::None => {
                // No optimizations
            }
            OptLevel::Less => {
                self.passes.push(Box::new(SimpleMem2RegPass::new()));
                self.passes.push(Box::new(DeadCodeElimination::new()));
            }
            OptLevel::Default | OptLevel::More => {
                if simple {
                    self.passes.push(Box::new(SimpleMem2RegPass::new()));
                } else {
                    self.passes.push(Box::new(Mem2RegPass::new(mem2reg)));
                }
                self.passes.push(Box::new(DeadCodeElimination::new()));
                if self.level == OptLevel::More {
                    self.passes.push(Box::new(CodeMotionPass::new(code_motion)));
                    self.passes.push(Box::new(DeadCodeElimination::new()));
                }
            }
        }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn level(&self) -> OptLevel {
        self.level
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run all optimization passes
    pub fn run(&mut self, module: &mut Module) -> CompilerResult<()> {
        let mut changed = true;
        let mut iteration = 0;

        // Fixed-point iteration
        while changed && iteration < self.max_iterations {
            changed = false;

            for pass in &mut self.passes {
                let pass_changed = pass.run(module)?;
                log::debug!("[PIPELINE] {} (iteration {}): changed={}", pass.name(), iteration, pass_changed);
                if self.verify_each_pass {
                    verify_module(module).into_result()?;
                }
                changed |= pass_changed;
            }

            iteration += 1;
        }

        Ok(())
    }
}

/// Standard optimization passes
pub mod passes {
    use super::*;
    use crate::ir::ValueId;

    /// Dead code elimination
    #[derive(Debug, Default)]
    pub struct DeadCodeElimination {
        removed_instructions: usize,
    }

    impl DeadCodeElimination {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn removed_instructions(&self) -> usize {
            self.removed_instructions
        }

        fn is_removable(module: &Module, inst: ValueId) -> bool {
            if module.is_terminator(inst) || module.has_users(inst) {
                return false;
            }
            if module.is_phi(inst) {
                return true;
            }
            let effect = module.side_effect(inst);
            !effect.has_side_effect() && (effect.is_pure() || (effect.idempotent && !effect.writes_memory()))
        }

        fn eliminate_dead_code(&mut self, module: &mut Module, func: ValueId) -> bool {
            let mut changed = false;
            loop {
                let mut dead = Vec::new();
                for &bb in module.function_blocks(func) {
                    for &inst in module.block_insts(bb).iter().rev() {
                        if Self::is_removable(module, inst) {
                            dead.push(inst);
                        }
                    }
                }
                if dead.is_empty() {
                    break;
                }
                for inst in dead {
                    module.erase_from_parent(inst);
                    self.removed_instructions += 1;
                }
                changed = true;
            }
            changed
        }
    }

    impl OptimizationPass for DeadCodeElimination {
        fn name(&self) -> &'static str {
            "dead-code-elimination"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &[]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.eliminate_dead_code(module, func);
            }
            log::debug!("[DCE] removed {} instructions", self.removed_instructions);
            Ok(changed)
        }
    }

    /// Precise stack promotion.
    pub struct Mem2RegPass {
        inner: Mem2Reg,
    }

    impl Mem2RegPass {
        pub fn new(config: Mem2RegConfig) -> Self {
            Self { inner: Mem2Reg::new(config) }
        }
    }

    impl OptimizationPass for Mem2RegPass {
        fn name(&self) -> &'static str {
            "mem2reg"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &["dominance"]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }

    #[derive(Default)]
    pub struct SimpleMem2RegPass {
        inner: SimpleMem2Reg,
    }

    impl SimpleMem2RegPass {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl OptimizationPass for SimpleMem2RegPass {
        fn name(&self) -> &'static str {
            "simple-mem2reg"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &["dominance", "try-depth"]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }

    pub struct CodeMotionPass {
        inner: CodeMotion,
    }

    impl CodeMotionPass {
        pub fn new(config: CodeMotionConfig) -> Self {
            Self { inner: CodeMotion::new(config) }
        }
    }

    impl OptimizationPass for CodeMotionPass {
        fn name(&self) -> &'static str {
            "code-motion"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &["dominance", "post-order", "loops"]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }

    #[derive(Default)]
    pub struct SwitchLoweringPass {
        inner: SwitchLowering,
    }

    impl SwitchLoweringPass {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl OptimizationPass for SwitchLoweringPass {
        fn name(&self) -> &'static str {
            "switch-lowering"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &[]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }

    #[derive(Default)]
    pub struct LowerCondBranchPass {
        inner: LowerCondBranch,
    }

    impl LowerCondBranchPass {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl OptimizationPass for LowerCondBranchPass {
        fn name(&self) -> &'static str {
            "lower-cond-branch"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &[]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }

    #[derive(Default)]
    pub struct LowerSwitchIntoJumpTablesPass {
        inner: LowerSwitchIntoJumpTables,
    }

    impl LowerSwitchIntoJumpTablesPass {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl OptimizationPass for LowerSwitchIntoJumpTablesPass {
        fn name(&self) -> &'static str {
            "lower-switch-into-jump-tables"
        }

        fn required_analyses(&self) -> &[&'static str] {
            &[]
        }

        fn run(&mut self, module: &mut Module) -> CompilerResult<bool> {
            let mut changed = false;
            for func in module.functions().to_vec() {
                changed |= self.inner.run_on_function(module, func)?;
            }
            Ok(changed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_sets_per_level() {
        assert!(OptimizationPipeline::new(OptLevel::None).pass_names().is_empty());
        assert_eq!(
            OptimizationPipeline::new(OptLevel::Less).pass_names(),
            vec!["simple-mem2reg", "dead-code-elimination"]
        );
        assert_eq!(
            OptimizationPipeline::new(OptLevel::Default).pass_names(),
            vec!["mem2reg", "dead-code-elimination"]
        );
        assert!(OptimizationPipeline::new(OptLevel::More).pass_names().contains(&"code-motion"));
        assert_eq!(
            OptimizationPipeline::lowering(false).pass_names(),
            vec!["lower-switch-into-jump-tables", "switch-lowering", "lower-cond-branch"]
        );
    }
}
