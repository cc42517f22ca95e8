//! Transformation Pass Tests
//! These tests run single passes on hand-built functions and check:
//! 1. Switches become chains of strict-equality branches with phis rewired
//! 2. Dense integer switches become jump tables
//! 3. Single-use comparisons fuse into compare-branches
//! 4. Loop-invariant computations move into the preheader
//! 5. Computations sink into the only arm that uses them
//! 6. Dead code elimination keeps effectful instructions, including
//!    arithmetic that mixes BigInt and Number

use jsir_compiler::code_motion::{CodeMotion, CodeMotionConfig};
use jsir_compiler::instructions::{index, BinaryOp, InstKind};
use jsir_compiler::ir_builder::IrBuilder;
use jsir_compiler::lowering::{LowerCondBranch, LowerSwitchIntoJumpTables, SwitchLowering};
use jsir_compiler::optimization::passes::DeadCodeElimination;
use jsir_compiler::{verify_function, Module, OptimizationPass};

/// Test 1: A switch becomes an if chain and phis follow the new edges
#[test]
fn test_switch_lowered_into_ifs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("sw", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let case_a = builder.create_block().unwrap();
    let join = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);
    let ten = builder.literal_number(10.0);
    let twenty = builder.literal_number(20.0);

    builder.set_insert_point(entry);
    let input = builder.create_load_param(p).unwrap();
    builder.create_switch(input, join, &[(one, case_a)]).unwrap();
    builder.set_insert_point(case_a);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(join);
    let phi = builder.create_phi(&[(ten, entry), (twenty, case_a)]).unwrap();
    builder.create_return(phi).unwrap();

    let mut pass = SwitchLowering::new();
    assert!(pass.run_on_function(&mut module, func).unwrap());
    assert_eq!(pass.lowered(), 1);

    let jump = module.terminator(entry).unwrap();
    assert_eq!(module.inst_kind(jump), Some(&InstKind::Branch));
    let test_block = module.operand(jump, 0).unwrap();
    let cond_branch = module.terminator(test_block).unwrap();
    assert_eq!(module.inst_kind(cond_branch), Some(&InstKind::CondBranch));
    assert_eq!(module.operand(cond_branch, index::cond_branch::TRUE_BLOCK), Some(case_a));
    assert_eq!(module.operand(cond_branch, index::cond_branch::FALSE_BLOCK), Some(join));

    let compare = module.operand(cond_branch, index::cond_branch::CONDITION).unwrap();
    assert_eq!(module.binary_op(compare), Some(BinaryOp::StrictlyEqual));
    assert_eq!(module.operand(compare, index::binary::LEFT), Some(one));
    assert_eq!(module.operand(compare, index::binary::RIGHT), Some(input));

    let entries = module.phi_entries(phi);
    assert!(entries.contains(&(ten, test_block)), "default edge now comes from the test block");
    assert!(entries.contains(&(twenty, case_a)));
    assert!(entries.iter().all(|&(_, bb)| bb != entry), "the old switch edge is gone");
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Switch lowered into an if chain");
}

/// Test 2: Twelve consecutive cases become a `SwitchImm`
#[test]
fn test_dense_switch_becomes_jump_table() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("table", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let hit = builder.create_block().unwrap();
    let miss = builder.create_block().unwrap();
    let undef = builder.literal_undefined();
    let cases: Vec<_> = (3..15).map(|i| (builder.literal_number(i as f64), hit)).collect();

    builder.set_insert_point(entry);
    let input = builder.create_load_param(p).unwrap();
    builder.create_switch(input, miss, &cases).unwrap();
    for bb in [hit, miss] {
        builder.set_insert_point(bb);
        builder.create_return(undef).unwrap();
    }

    let mut pass = LowerSwitchIntoJumpTables::new();
    assert!(pass.run_on_function(&mut module, func).unwrap());

    let table = module.terminator(entry).unwrap();
    assert_eq!(module.inst_kind(table), Some(&InstKind::SwitchImm));
    assert_eq!(module.operand(table, index::switch_imm::INPUT), Some(input));
    assert_eq!(module.operand(table, index::switch_imm::DEFAULT), Some(miss));
    let literal_u32 = |idx| module.operand(table, idx).and_then(|v| module.literal(v)).and_then(|l| l.as_u32());
    assert_eq!(literal_u32(index::switch_imm::MIN), Some(3));
    assert_eq!(literal_u32(index::switch_imm::SIZE), Some(12));
    assert_eq!(module.block_insts(entry).len(), 2, "the old switch was erased");

    println!("✅ Dense switch lowered into a jump table");
}

/// Test 3: A sparse switch is left alone
#[test]
fn test_sparse_switch_is_kept() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("sparse", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let hit = builder.create_block().unwrap();
    let miss = builder.create_block().unwrap();
    let undef = builder.literal_undefined();
    let cases: Vec<_> = (0..12).map(|i| (builder.literal_number((i * 100) as f64), hit)).collect();

    builder.set_insert_point(entry);
    let input = builder.create_load_param(p).unwrap();
    let switch = builder.create_switch(input, miss, &cases).unwrap();
    for bb in [hit, miss] {
        builder.set_insert_point(bb);
        builder.create_return(undef).unwrap();
    }

    let mut pass = LowerSwitchIntoJumpTables::new();
    assert!(!pass.run_on_function(&mut module, func).unwrap());
    assert_eq!(module.terminator(entry), Some(switch));

    println!("✅ Sparse switch kept");
}

/// Test 4: `if (a < b)` becomes a single compare-branch
#[test]
fn test_compare_fused_into_branch() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("less", None, true);
    let a = builder.add_parameter("a").unwrap();
    let b = builder.add_parameter("b").unwrap();
    let entry = builder.create_block().unwrap();
    let on_true = builder.create_block().unwrap();
    let on_false = builder.create_block().unwrap();

    builder.set_insert_point(entry);
    let la = builder.create_load_param(a).unwrap();
    let lb = builder.create_load_param(b).unwrap();
    let less = builder.create_binary_operator(BinaryOp::LessThan, la, lb).unwrap();
    builder.create_cond_branch(less, on_true, on_false).unwrap();
    builder.set_insert_point(on_true);
    builder.create_return(la).unwrap();
    builder.set_insert_point(on_false);
    builder.create_return(lb).unwrap();

    let mut pass = LowerCondBranch::new();
    assert!(pass.run_on_function(&mut module, func).unwrap());

    let fused = module.terminator(entry).unwrap();
    assert_eq!(module.inst_kind(fused), Some(&InstKind::CompareBranch(BinaryOp::LessThan)));
    assert_eq!(module.operands(fused), vec![la, lb, on_true, on_false]);
    assert!(module.is_erased(less), "the comparison is folded into the branch");
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Comparison fused with its branch");
}

/// Test 5: A comparison with a second user is not fused
#[test]
fn test_shared_compare_not_fused() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("shared", None, true);
    let a = builder.add_parameter("a").unwrap();
    let entry = builder.create_block().unwrap();
    let on_true = builder.create_block().unwrap();
    let on_false = builder.create_block().unwrap();
    let zero = builder.literal_number(0.0);

    builder.set_insert_point(entry);
    let la = builder.create_load_param(a).unwrap();
    let less = builder.create_binary_operator(BinaryOp::LessThan, la, zero).unwrap();
    let branch = builder.create_cond_branch(less, on_true, on_false).unwrap();
    builder.set_insert_point(on_true);
    builder.create_return(less).unwrap();
    builder.set_insert_point(on_false);
    builder.create_return(zero).unwrap();

    let mut pass = LowerCondBranch::new();
    assert!(!pass.run_on_function(&mut module, func).unwrap());
    assert_eq!(module.terminator(entry), Some(branch));

    println!("✅ Shared comparison kept");
}

/// Test 6: A pure computation inside a loop moves to the preheader
#[test]
fn test_loop_invariant_hoisted() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("invariant", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let body = builder.create_block().unwrap();
    let exit = builder.create_block().unwrap();
    let two = builder.literal_number(2.0);
    let three = builder.literal_number(3.0);

    builder.set_insert_point(entry);
    let cond = builder.create_load_param(p).unwrap();
    let enter = builder.create_branch(body).unwrap();
    builder.set_insert_point(body);
    let product = builder.create_binary_operator(BinaryOp::Multiply, two, three).unwrap();
    builder.create_cond_branch(cond, body, exit).unwrap();
    builder.set_insert_point(exit);
    builder.create_return(product).unwrap();

    let config = CodeMotionConfig { enable_sinking: false, ..Default::default() };
    let mut pass = CodeMotion::new(config);
    assert!(pass.run_on_function(&mut module, func).unwrap());

    assert_eq!(module.parent_block(product), Some(entry), "hoisted into the preheader");
    assert_eq!(module.inst_position(product).map(|p| p + 1), module.inst_position(enter));
    assert_eq!(pass.stats().hoisted_from_loops, 1);
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Loop invariant hoisted into the preheader");
}

/// Test 7: A value used on one arm only is computed on that arm
#[test]
fn test_sink_into_single_user_arm() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("sink", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let left = builder.create_block().unwrap();
    let right = builder.create_block().unwrap();
    let two = builder.literal_number(2.0);
    let three = builder.literal_number(3.0);
    let undef = builder.literal_undefined();

    builder.set_insert_point(entry);
    let cond = builder.create_load_param(p).unwrap();
    let product = builder.create_binary_operator(BinaryOp::Multiply, two, three).unwrap();
    builder.create_cond_branch(cond, left, right).unwrap();
    builder.set_insert_point(left);
    let ret = builder.create_return(product).unwrap();
    builder.set_insert_point(right);
    builder.create_return(undef).unwrap();

    let mut pass = CodeMotion::new(CodeMotionConfig::default());
    assert!(pass.run_on_function(&mut module, func).unwrap());

    assert_eq!(module.parent_block(product), Some(left));
    assert_eq!(module.inst_position(product), Some(0));
    assert_eq!(module.inst_position(ret), Some(1));
    assert_eq!(module.parent_block(cond), Some(entry), "the branch condition stays put");
    assert_eq!(pass.stats().sunk, 1);
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Computation sunk into its only user");
}

/// Test 8: Unused pure instructions go, unused calls stay
#[test]
fn test_dead_code_elimination() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("dce", None, true);
    let f = builder.add_parameter("f").unwrap();
    let entry = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);
    let two = builder.literal_number(2.0);
    let undef = builder.literal_undefined();

    builder.set_insert_point(entry);
    let callee = builder.create_load_param(f).unwrap();
    let dead_sum = builder.create_binary_operator(BinaryOp::Add, one, two).unwrap();
    let dead_copy = builder.create_binary_operator(BinaryOp::Multiply, dead_sum, two).unwrap();
    let call = builder.create_call(callee, undef, &[]).unwrap();
    builder.create_return(undef).unwrap();

    let mut dce = DeadCodeElimination::new();
    assert!(dce.run(&mut module).unwrap());

    assert!(module.is_erased(dead_sum));
    assert!(module.is_erased(dead_copy));
    assert!(!module.is_erased(call), "calls may have side effects");
    assert_eq!(module.parent_block(call), Some(entry));
    assert_eq!(dce.removed_instructions(), 2);
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Dead code removed, effects preserved");
}

/// Test 9: `1 + 1n` throws, so it survives while `1 + 2` is removed
#[test]
fn test_dce_keeps_mixed_bigint_arithmetic() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("mixed", None, true);
    let entry = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);
    let two = builder.literal_number(2.0);
    let big_one = builder.literal_bigint("1");
    let undef = builder.literal_undefined();

    builder.set_insert_point(entry);
    let mixed = builder.create_binary_operator(BinaryOp::Add, one, big_one).unwrap();
    let plain = builder.create_binary_operator(BinaryOp::Add, one, two).unwrap();
    let bigs = builder.create_binary_operator(BinaryOp::Multiply, big_one, big_one).unwrap();
    builder.create_return(undef).unwrap();

    assert!(module.side_effect(mixed).throw, "mixing BigInt and Number throws");

    let mut dce = DeadCodeElimination::new();
    assert!(dce.run(&mut module).unwrap());

    assert!(!module.is_erased(mixed), "a throwing addition must be kept");
    assert_eq!(module.parent_block(mixed), Some(entry));
    assert!(module.is_erased(plain));
    assert!(module.is_erased(bigs), "BigInt with BigInt cannot throw");
    assert_eq!(dce.removed_instructions(), 2);
    assert!(verify_function(&module, func).is_valid());

    println!("✅ Throwing BigInt arithmetic kept");
}
