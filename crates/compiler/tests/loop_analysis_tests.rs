//! Loop Analysis Tests
//! Each test builds a CFG from an edge list and checks, per block:
//! 1. Whether it is inside a loop
//! 2. The innermost analyzable loop header
//! 3. The preheader of that loop
//!
//! Irreducible regions report blocks as in a loop without a header.

use jsir_compiler::dominance::DominanceInfo;
use jsir_compiler::ir_builder::IrBuilder;
use jsir_compiler::loop_analysis::LoopAnalysis;
use jsir_compiler::{Module, ValueId};
use std::collections::HashMap;

struct LoopCfg {
    blocks: HashMap<&'static str, ValueId>,
    loops: LoopAnalysis,
}

impl LoopCfg {
    fn block(&self, name: &str) -> ValueId {
        self.blocks[name]
    }

    fn header(&self, name: &str) -> Option<ValueId> {
        self.loops.loop_header(self.block(name))
    }

    fn preheader(&self, name: &str) -> Option<ValueId> {
        self.loops.loop_preheader(self.block(name))
    }

    /// Asserts `(in loop, header, preheader)` for `name`.
    fn expect(&self, name: &str, header: Option<&str>, preheader: Option<&str>) {
        let in_loop = self.loops.is_block_in_loop(self.block(name));
        assert!(in_loop, "{} should be inside a loop", name);
        assert_eq!(self.header(name), header.map(|h| self.block(h)), "wrong header for {}", name);
        assert_eq!(self.preheader(name), preheader.map(|p| self.block(p)), "wrong preheader for {}", name);
    }

    fn expect_not_in_loop(&self, name: &str) {
        assert!(!self.loops.is_block_in_loop(self.block(name)), "{} should not be in a loop", name);
        assert_eq!(self.header(name), None, "{} should have no header", name);
        assert_eq!(self.preheader(name), None, "{} should have no preheader", name);
    }
}

/// Builds a function whose first listed block is the entry. Blocks with
/// two successors end in a conditional branch, one in a branch, none in a
/// return.
fn build_cfg(edges: &[(&'static str, &[&'static str])]) -> LoopCfg {
    let mut module = Module::new();
    let mut blocks = HashMap::new();
    let func = {
        let mut builder = IrBuilder::new(&mut module);
        let func = builder.create_function("loops", None, false);
        for &(name, _) in edges {
            blocks.insert(name, builder.create_block().unwrap());
        }
        let cond = builder.literal_bool(true);
        let undef = builder.literal_undefined();
        for &(name, succs) in edges {
            builder.set_insert_point(blocks[name]);
            match succs {
                [] => {
                    builder.create_return(undef).unwrap();
                }
                [only] => {
                    builder.create_branch(blocks[only]).unwrap();
                }
                [a, b] => {
                    builder.create_cond_branch(cond, blocks[a], blocks[b]).unwrap();
                }
                _ => panic!("at most two successors per block"),
            }
        }
        func
    };
    let dom = DominanceInfo::new(&module, func);
    let loops = LoopAnalysis::new(&module, func, &dom);
    LoopCfg { blocks, loops }
}

/// Test 1: A self loop
#[test]
fn test_simple_loop() {
    let cfg = build_cfg(&[("M", &["L"]), ("L", &["L", "R"]), ("R", &[])]);

    cfg.expect_not_in_loop("M");
    cfg.expect("L", Some("L"), Some("M"));
    cfg.expect_not_in_loop("R");

    println!("✅ Self loop detected with its preheader");
}

/// Test 2: A loop whose body contains a diamond
#[test]
fn test_loop_with_branch() {
    let cfg = build_cfg(&[
        ("M", &["T", "F"]),
        ("T", &["B"]),
        ("F", &["Ret"]),
        ("B", &["ST", "SF"]),
        ("ST", &["E"]),
        ("SF", &["E"]),
        ("E", &["B", "Ret"]),
        ("Ret", &[]),
    ]);

    for name in ["B", "E", "ST", "SF"] {
        cfg.expect(name, Some("B"), Some("T"));
    }
    for name in ["M", "T", "F", "Ret"] {
        cfg.expect_not_in_loop(name);
    }

    println!("✅ Diamond inside a loop shares the loop header");
}

/// Test 3: Nested loops
#[test]
fn test_inner_loops() {
    let cfg = build_cfg(&[
        ("M", &["L1"]),
        ("L1", &["L1", "I"]),
        ("I", &["L2"]),
        ("L2", &["L2", "L1"]),
    ]);

    cfg.expect("L1", Some("L1"), Some("M"));
    cfg.expect("I", Some("L1"), Some("M"));
    cfg.expect("L2", Some("L2"), Some("I"));
    cfg.expect_not_in_loop("M");

    println!("✅ Inner loop reported as innermost");
}

/// Test 4: Every block of the loop reaches every other one
#[test]
fn test_complete_graph() {
    let cfg = build_cfg(&[("M", &["1"]), ("1", &["2", "3"]), ("2", &["1", "3"]), ("3", &["1", "2"])]);

    for name in ["1", "2", "3"] {
        cfg.expect(name, Some("1"), Some("M"));
    }
    cfg.expect_not_in_loop("M");

    println!("✅ Complete graph collapses to the dominating header");
}

/// Test 5: Two loops one after another, the second nested in the first
#[test]
fn test_two_in_a_row() {
    let cfg = build_cfg(&[
        ("M", &["L1"]),
        ("L1", &["I1"]),
        ("I1", &["L2"]),
        ("L2", &["L1", "I2"]),
        ("I2", &["X"]),
        ("X", &["L2", "R"]),
        ("R", &[]),
    ]);

    cfg.expect("L1", Some("L1"), Some("M"));
    cfg.expect("I1", Some("L1"), Some("M"));
    for name in ["L2", "I2", "X"] {
        cfg.expect(name, Some("L2"), Some("I1"));
    }
    cfg.expect_not_in_loop("R");

    println!("✅ Consecutive loops resolved");
}

/// Test 6: Back edges that interleave
#[test]
fn test_interleaving() {
    let cfg = build_cfg(&[
        ("M", &["1"]),
        ("1", &["2"]),
        ("2", &["3"]),
        ("3", &["1", "4"]),
        ("4", &["2", "R"]),
        ("R", &[]),
    ]);

    cfg.expect("1", Some("1"), Some("M"));
    for name in ["2", "3", "4"] {
        cfg.expect(name, Some("2"), Some("1"));
    }
    cfg.expect_not_in_loop("R");

    println!("✅ Interleaved back edges nest correctly");
}

/// Test 7: The loop exits from its header
#[test]
fn test_exit_from_header() {
    let cfg = build_cfg(&[("M", &["H", "R"]), ("H", &["L", "R"]), ("L", &["H"]), ("R", &[])]);

    cfg.expect("H", Some("H"), Some("M"));
    cfg.expect("L", Some("H"), Some("M"));
    cfg.expect_not_in_loop("R");

    println!("✅ Header exit handled");
}

/// Test 8: The loop can be entered at two blocks
#[test]
fn test_no_unique_header() {
    let cfg = build_cfg(&[("M", &["1", "2"]), ("1", &["3"]), ("3", &["R", "1"]), ("2", &["3"]), ("R", &[])]);

    cfg.expect("1", None, None);
    cfg.expect("3", None, None);
    cfg.expect_not_in_loop("2");
    cfg.expect_not_in_loop("R");

    println!("✅ Irreducible loop reports no header");
}

/// Test 9: The header has two predecessors outside the loop
#[test]
fn test_no_unique_preheader() {
    let cfg = build_cfg(&[("M", &["1", "2"]), ("1", &["3"]), ("2", &["3"]), ("3", &["4"]), ("4", &["3"])]);

    cfg.expect("3", Some("3"), None);
    cfg.expect("4", Some("3"), None);
    cfg.expect_not_in_loop("1");
    cfg.expect_not_in_loop("2");

    println!("✅ Header without a unique preheader");
}

/// Test 10: DFS finishing order must not fabricate loops
#[test]
fn test_finishing_time() {
    let cfg = build_cfg(&[("M", &["2", "3"]), ("1", &["4"]), ("2", &["1", "3"]), ("3", &["4"]), ("4", &["1", "4"])]);

    cfg.expect("1", None, None);
    cfg.expect("4", None, None);
    cfg.expect_not_in_loop("2");
    cfg.expect_not_in_loop("3");

    println!("✅ Cross edges into a finished loop ignored");
}

/// Test 11: An edge straight into the inner loop makes everything irreducible
#[test]
fn test_directly_into_inner() {
    let cfg = build_cfg(&[("M", &["1", "2"]), ("1", &["2"]), ("2", &["3"]), ("3", &["2", "1"])]);

    for name in ["1", "2", "3"] {
        cfg.expect(name, None, None);
    }
    cfg.expect_not_in_loop("M");

    println!("✅ Entry into an inner loop disqualifies the nest");
}
