//! Register Allocation Tests
//! These tests allocate registers for small functions and validate:
//! 1. Values whose live intervals overlap never share a register
//! 2. Move chains are coalesced into one register
//! 3. A phi and its incoming moves share a register
//! 4. The fast pass is taken below the configured threshold
//! 5. Malformed input is rejected
//! 6. Loops with phis keep overlapping values apart

use jsir_compiler::instructions::{BinaryOp, InstKind};
use jsir_compiler::ir_builder::IrBuilder;
use jsir_compiler::{allocate_registers, CompilerError, Module, RegAllocConfig, RegisterAllocator, ValueId};

/// `function f(a, b) { var s = a + b, d = a - b; return s * d + a; }`
fn build_arithmetic(module: &mut Module) -> (ValueId, Vec<ValueId>) {
    let mut builder = IrBuilder::new(module);
    let func = builder.create_function("arith", None, true);
    let a = builder.add_parameter("a").unwrap();
    let b = builder.add_parameter("b").unwrap();
    let entry = builder.create_block().unwrap();
    builder.set_insert_point(entry);
    let la = builder.create_load_param(a).unwrap();
    let lb = builder.create_load_param(b).unwrap();
    let s = builder.create_binary_operator(BinaryOp::Add, la, lb).unwrap();
    let d = builder.create_binary_operator(BinaryOp::Subtract, la, lb).unwrap();
    let m = builder.create_binary_operator(BinaryOp::Multiply, s, d).unwrap();
    let n = builder.create_binary_operator(BinaryOp::Add, m, la).unwrap();
    builder.create_return(n).unwrap();
    (func, vec![la, lb, s, d, m, n])
}

struct PhiDiamond {
    func: ValueId,
    phi: ValueId,
}

/// `return p ? 1 : 2;` written with an explicit phi.
fn build_phi_diamond(module: &mut Module) -> PhiDiamond {
    let mut builder = IrBuilder::new(module);
    let func = builder.create_function("select", None, true);
    let p = builder.add_parameter("p").unwrap();
    let entry = builder.create_block().unwrap();
    let left = builder.create_block().unwrap();
    let right = builder.create_block().unwrap();
    let join = builder.create_block().unwrap();
    let one = builder.literal_number(1.0);
    let two = builder.literal_number(2.0);

    builder.set_insert_point(entry);
    let cond = builder.create_load_param(p).unwrap();
    builder.create_cond_branch(cond, left, right).unwrap();
    builder.set_insert_point(left);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(right);
    builder.create_branch(join).unwrap();
    builder.set_insert_point(join);
    let phi = builder.create_phi(&[(one, left), (two, right)]).unwrap();
    builder.create_return(phi).unwrap();
    PhiDiamond { func, phi }
}

/// Every pair of live, used values with intersecting intervals must be in
/// different registers, except pairs the allocator merged on purpose.
fn assert_no_interference(
    module: &Module,
    ra: &RegisterAllocator,
    values: &[ValueId],
    merged: impl Fn(ValueId, ValueId) -> bool,
) {
    for (i, &x) in values.iter().enumerate() {
        for &y in &values[i + 1..] {
            if !module.has_users(x) || !module.has_users(y) || merged(x, y) {
                continue;
            }
            let (ix, iy) = match (ra.instruction_interval(x), ra.instruction_interval(y)) {
                (Some(ix), Some(iy)) => (ix, iy),
                _ => continue,
            };
            if ix.intersects(iy) {
                assert_ne!(
                    ra.get_register(x).unwrap(),
                    ra.get_register(y).unwrap(),
                    "{} {} and {} {} overlap but share a register",
                    x,
                    ix,
                    y,
                    iy
                );
            }
        }
    }
}

/// Test 1: Overlapping values get distinct registers
#[test]
fn test_non_interference() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut module = Module::new();
    let (func, values) = build_arithmetic(&mut module);

    let ra = allocate_registers(&mut module, func, &RegAllocConfig::default()).unwrap();

    assert!(!ra.used_fast_pass(), "the default config never takes the fast pass");
    for &v in &values {
        assert!(ra.is_allocated(v), "{} should have a register", v);
        assert!(ra.has_instruction_number(v));
    }
    assert_no_interference(&module, &ra, &values, |_, _| false);
    // a, s and d are live together when d is defined.
    assert_eq!(ra.max_register_usage(), 3, "three registers suffice");

    println!("✅ No overlapping values share a register");
}

/// Test 2: A move and its source end up in the same register
#[test]
fn test_mov_chain_coalesced() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("copy", None, true);
    let a = builder.add_parameter("a").unwrap();
    let entry = builder.create_block().unwrap();
    builder.set_insert_point(entry);
    let la = builder.create_load_param(a).unwrap();
    let copy = builder.create_mov(la).unwrap();
    builder.create_return(copy).unwrap();

    let ra = allocate_registers(&mut module, func, &RegAllocConfig::default()).unwrap();

    assert_eq!(
        ra.get_register(la).unwrap(),
        ra.get_register(copy).unwrap(),
        "the move should be coalesced with its source"
    );
    assert_eq!(ra.max_register_usage(), 1);

    println!("✅ Move coalesced with its source");
}

/// Test 3: Phi lowering places moves in the predecessors that share the phi register
#[test]
fn test_phi_shares_register_with_moves() {
    let mut module = Module::new();
    let d = build_phi_diamond(&mut module);

    let ra = allocate_registers(&mut module, d.func, &RegAllocConfig::default()).unwrap();

    let phi_reg = ra.get_register(d.phi).unwrap();
    let entries = module.phi_entries(d.phi);
    assert_eq!(entries.len(), 2);
    for (mov, pred) in entries {
        assert!(matches!(module.inst_kind(mov), Some(InstKind::Mov)), "phi inputs become moves");
        assert_eq!(module.parent_block(mov), Some(pred), "the move sits in the predecessor");
        assert_eq!(ra.get_register(mov).unwrap(), phi_reg, "incoming move shares the phi register");
    }

    println!("✅ Phi and incoming moves share a register");
}

/// Test 4: Functions below the threshold use the fast pass
#[test]
fn test_fast_pass_threshold() {
    let mut module = Module::new();
    let d = build_phi_diamond(&mut module);

    let config = RegAllocConfig { fast_pass_threshold: 1000, ..Default::default() };
    let ra = allocate_registers(&mut module, d.func, &config).unwrap();

    assert!(ra.used_fast_pass(), "small functions below the threshold take the fast pass");
    let phi_reg = ra.get_register(d.phi).unwrap();
    for (mov, _) in module.phi_entries(d.phi) {
        assert_eq!(ra.get_register(mov).unwrap(), phi_reg);
    }

    println!("✅ Fast pass used below the threshold");
}

/// Test 5: A memory limit of zero also forces the fast pass
#[test]
fn test_memory_limit_forces_fast_pass() {
    let mut module = Module::new();
    let (func, values) = build_arithmetic(&mut module);

    let config = RegAllocConfig { memory_limit: 0, ..Default::default() };
    let ra = allocate_registers(&mut module, func, &config).unwrap();

    assert!(ra.used_fast_pass());
    for &v in &values {
        assert!(ra.is_allocated(v));
    }

    println!("✅ Memory limit triggers the fast pass");
}

/// Test 6: Missing terminators and unallocated queries are errors
#[test]
fn test_errors() {
    let mut module = Module::new();
    let mut builder = IrBuilder::new(&mut module);
    let func = builder.create_function("broken", None, true);
    let a = builder.add_parameter("a").unwrap();
    let entry = builder.create_block().unwrap();
    builder.set_insert_point(entry);
    builder.create_load_param(a).unwrap();

    let result = allocate_registers(&mut module, func, &RegAllocConfig::default());
    assert!(matches!(result, Err(CompilerError::CodeGen(_))), "a block without terminator is rejected");

    let ra = RegisterAllocator::new(func, RegAllocConfig::default());
    assert!(ra.get_register(a).is_err(), "parameters never get registers");

    println!("✅ Malformed input rejected");
}

/// Test 7: Reserved registers are bound to the given values
#[test]
fn test_reserve_values() {
    let mut module = Module::new();
    let (func, values) = build_arithmetic(&mut module);

    let mut ra = RegisterAllocator::new(func, RegAllocConfig::default());
    let first = ra.reserve_values(&[Some(values[0]), None, Some(values[1])]);

    assert_eq!(first.index(), 0);
    assert_eq!(ra.register(values[0]).map(|r| r.index()), Some(0));
    assert_eq!(ra.register(values[1]).map(|r| r.index()), Some(2));
    assert_eq!(ra.max_register_usage(), 3);

    let more = ra.reserve(2);
    assert_eq!(more.index(), 3, "reservations go after the last used register");
    ra.free(more);

    println!("✅ Reservations bind values");
}

/// A phi and the moves feeding it live in one register by construction.
fn same_phi_group(module: &Module, phis: &[ValueId], x: ValueId, y: ValueId) -> bool {
    phis.iter().any(|&phi| {
        let members: Vec<ValueId> = std::iter::once(phi)
            .chain(module.phi_entries(phi).into_iter().map(|(value, _)| value))
            .collect();
        members.contains(&x) && members.contains(&y)
    })
}

/// `var i = 0; while (i < n) i = i + 1; return i;` with the phi written out.
fn build_counting_loop(module: &mut Module) -> (ValueId, ValueId) {
    let mut builder = IrBuilder::new(module);
    let func = builder.create_function("count", None, true);
    let n = builder.add_parameter("n").unwrap();
    let entry = builder.create_block().unwrap();
    let header = builder.create_block().unwrap();
    let body = builder.create_block().unwrap();
    let exit = builder.create_block().unwrap();
    let zero = builder.literal_number(0.0);
    let one = builder.literal_number(1.0);

    builder.set_insert_point(entry);
    let limit = builder.create_load_param(n).unwrap();
    builder.create_branch(header).unwrap();

    builder.set_insert_point(body);
    let placeholder = builder.literal_undefined();
    let next_slot = builder.create_branch(header).unwrap();

    builder.set_insert_point(header);
    let i = builder.create_phi(&[(zero, entry), (placeholder, body)]).unwrap();
    let cond = builder.create_binary_operator(BinaryOp::LessThan, i, limit).unwrap();
    builder.create_cond_branch(cond, body, exit).unwrap();

    builder.set_insert_point_before(next_slot);
    let next = builder.create_binary_operator(BinaryOp::Add, i, one).unwrap();
    builder.module().update_phi_entry(i, 1, next, body);

    builder.set_insert_point(exit);
    builder.create_return(i).unwrap();
    (func, i)
}

/// Test 8: Values live across the back edge never share a register
#[test]
fn test_loop_non_interference() {
    let mut module = Module::new();
    let (func, phi) = build_counting_loop(&mut module);

    let ra = allocate_registers(&mut module, func, &RegAllocConfig::default()).unwrap();
    assert!(!ra.used_fast_pass());

    let values: Vec<ValueId> = module
        .function_blocks(func)
        .iter()
        .flat_map(|&bb| module.block_insts(bb).iter().copied())
        .filter(|&inst| ra.has_instruction_number(inst))
        .collect();
    let phis: Vec<ValueId> = values.iter().copied().filter(|&v| module.is_phi(v)).collect();
    assert_eq!(phis, vec![phi]);

    let phi_reg = ra.get_register(phi).unwrap();
    for (mov, _) in module.phi_entries(phi) {
        assert!(matches!(module.inst_kind(mov), Some(InstKind::Mov)));
        assert_eq!(ra.get_register(mov).unwrap(), phi_reg, "incoming moves use the phi register");
    }
    assert_no_interference(&module, &ra, &values, |x, y| same_phi_group(&module, &phis, x, y));
    assert!(ra.max_register_usage() >= 2, "the limit and the counter are live together");

    println!("✅ Loop values kept apart");
}
