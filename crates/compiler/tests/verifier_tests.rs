//! Verifier Tests
//! Each test builds a function with one specific defect and checks that
//! the verifier reports it:
//! 1. Well-formed functions pass
//! 2. Duplicate switch cases
//! 3. Phis that do not cover every predecessor
//! 4. Operands that do not dominate their users
//! 5. Unreachable blocks
//! 6. Variables used outside frame instructions
//! 7. Stack slots used by instructions that cannot take them

use jsir_compiler::instructions::BinaryOp;
use jsir_compiler::ir_builder::IrBuilder;
use jsir_compiler::{verify_function, verify_module, CompilerError, Module};

/// Test 1: A straight-line function verifies
#[test]
fn test_valid_function() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("ok", None, true);
    let a = builder.add_parameter("a").unwrap();
    let entry = builder.create_block().unwrap();
    builder.set_insert_point(entry);
    let la = builder.create_load_param(a).unwrap();
    let one = builder.literal_number(1.0);
    let sum = builder.create_binary_operator(BinaryOp::Add, la, one).unwrap();
    builder.create_return(sum).unwrap();

    let result = verify_function(&module, func);
    assert!(result.is_valid(), "unexpected diagnostics: {:?}", result.diagnostics);
    assert!(verify_module(&module).into_result().is_ok());

    println!("✅ Well-formed function accepted");
}

/// Test 2: Two cases with the same literal are rejected
#[test]
fn test_duplicate_switch_case() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("dup", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let a = builder.create_block().unwrap();
    let b = builder.create_block().unwrap();
    let exit = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);
    let undef = builder.literal_undefined();

    builder.set_insert_point(entry);
    let input = builder.create_load_param(p).unwrap();
    builder.create_switch(input, exit, &[(one, a), (one, b)]).unwrap();
    for bb in [a, b, exit] {
        builder.set_insert_point(bb);
        builder.create_return(undef).unwrap();
    }

    let result = verify_function(&module, func);
    assert!(!result.is_valid());
    assert!(result.mentions("switch values must be unique"), "diagnostics: {:?}", result.diagnostics);

    println!("✅ Duplicate switch case rejected");
}

/// Test 3: A phi missing one predecessor is rejected
#[test]
fn test_phi_missing_predecessor() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("phi", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let left = builder.create_block().unwrap();
    let right = builder.create_block().unwrap();
    let join = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);

    builder.set_insert_point(entry);
    let cond = builder.create_load_param(p).unwrap();
    builder.create_cond_branch(cond, left, right).unwrap();
    builder.set_insert_point(left);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(right);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(join);
    let phi = builder.create_phi(&[(one, left)]).unwrap();
    builder.create_return(phi).unwrap();

    let result = verify_function(&module, func);
    assert!(
        result.mentions("number of predecessors does not match phi inputs"),
        "diagnostics: {:?}",
        result.diagnostics
    );

    println!("✅ Incomplete phi rejected");
}

/// Test 4: A value used on a path where it was never computed is rejected
#[test]
fn test_operand_must_dominate() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("dom", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let left = builder.create_block().unwrap();
    let right = builder.create_block().unwrap();
    let join = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);

    builder.set_insert_point(entry);
    let cond = builder.create_load_param(p).unwrap();
    builder.create_cond_branch(cond, left, right).unwrap();
    builder.set_insert_point(left);
    let only_left = builder.create_binary_operator(BinaryOp::Add, cond, one).unwrap();
    builder.create_branch(join).unwrap();
    builder.set_insert_point(right);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(join);
    builder.create_return(only_left).unwrap();

    let result = verify_function(&module, func);
    assert!(result.mentions("must dominate the Instruction"), "diagnostics: {:?}", result.diagnostics);

    println!("✅ Non-dominating operand rejected");
}

/// Test 5: Blocks must be reachable from the entry
#[test]
fn test_unreachable_block() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("dead", None, true);
    let entry = builder.create_block().unwrap();
    let orphan = builder.create_block().unwrap();
    let undef = builder.literal_undefined();
    builder.set_insert_point(entry);
    builder.create_return(undef).unwrap();
    builder.set_insert_point(orphan);
    builder.create_return(undef).unwrap();

    let result = verify_function(&module, func);
    assert!(result.mentions("unreachable from entry"), "diagnostics: {:?}", result.diagnostics);

    println!("✅ Unreachable block reported");
}

/// Test 6: Variables are only touched by frame loads and stores
#[test]
fn test_variable_outside_frame_access() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("frame", None, true);
    let entry = builder.create_block().unwrap();
    let scope = builder.module().create_variable_scope(func, None);
    let var = builder.module().add_variable(scope, "v");
    builder.set_insert_point(entry);
    let copy = builder.create_mov(var).unwrap();
    builder.create_return(copy).unwrap();

    let result = verify_module(&module);
    assert!(
        result.mentions("Variable can only be accessed in LoadFrame/StoreFrame Inst."),
        "diagnostics: {:?}",
        result.diagnostics
    );
    match result.into_result() {
        Err(CompilerError::Verification(msg)) => assert!(msg.contains("LoadFrame/StoreFrame")),
        other => panic!("expected a verification error, got {:?}", other),
    }

    println!("✅ Variable misuse reported");
}

/// Test 7: Only loads and stack-writing instructions may take a stack slot
#[test]
fn test_stack_slot_misuse() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("slot", None, true);
    let entry = builder.create_block().unwrap();
    let five = builder.literal_number(5.0);
    builder.set_insert_point(entry);
    let slot = builder.create_alloc_stack("x").unwrap();
    builder.create_store_stack(five, slot).unwrap();
    let loaded = builder.create_load_stack(slot).unwrap();
    let copy = builder.create_mov(slot).unwrap();
    let sum = builder.create_binary_operator(BinaryOp::Add, loaded, copy).unwrap();
    builder.create_return(sum).unwrap();

    let result = verify_function(&module, func);
    assert!(result.mentions("Must write to stack operand."), "diagnostics: {:?}", result.diagnostics);
    assert_eq!(
        result.diagnostics.iter().filter(|d| d.contains("Must write to stack operand.")).count(),
        1,
        "the load and the store are accepted"
    );

    println!("✅ Stack slot misuse reported");
}
