//! Whole-image properties: layout, determinism, call-graph shape, and the
//! structural validity of every generated method.

use std::collections::{HashMap, HashSet};

use gigue::config::{GeneratorConfig, IsolationMode};
use gigue::constants::DATA_REG;
use gigue::data::DataStrategy;
use gigue::generator::{Generator, JitElement};
use gigue::instr::Format;
use gigue::method::Method;
use gigue::opcodes::{OP_LOAD, OP_STORE};

fn minimal_config() -> GeneratorConfig {
    GeneratorConfig {
        interpreter_start_address: 0x1000,
        jit_start_address: 0x2000,
        jit_size: 0x400,
        jit_nb_methods: 4,
        method_variation_mean: 0.0,
        method_variation_stdev: 0.0,
        call_depth_mean: 0,
        call_occupation_mean: 0.0,
        call_occupation_stdev: 0.0,
        pics_ratio: 0.0,
        pics_mean_case_nb: 1,
        data_size: 0x400,
        data_strategy: DataStrategy::Zeroes,
        seed: 1,
        ..Default::default()
    }
}

fn busy_config(seed: u64) -> GeneratorConfig {
    GeneratorConfig {
        interpreter_start_address: 0x1000,
        jit_start_address: 0x4000,
        jit_size: 0x8000,
        jit_nb_methods: 10,
        method_variation_mean: 0.2,
        method_variation_stdev: 0.1,
        call_depth_mean: 3,
        call_occupation_mean: 0.5,
        call_occupation_stdev: 0.2,
        pics_ratio: 0.3,
        pics_mean_case_nb: 2,
        data_size: 0x400,
        data_strategy: DataStrategy::Random,
        seed,
        ..Default::default()
    }
}

fn all_methods(generator: &Generator) -> Vec<&Method> {
    let mut methods = Vec::new();
    for element in generator.elements() {
        match element {
            JitElement::Method(method) => methods.push(method),
            JitElement::Pic(pic) => methods.extend(pic.methods()),
        }
    }
    methods
}

#[test]
fn minimal_configuration_produces_leaf_methods_in_budget() {
    let mut generator = Generator::new(minimal_config()).unwrap();
    let image = generator.generate().unwrap();
    assert_eq!(generator.method_count(), 4);
    assert_eq!(generator.pic_count(), 0);
    for element in generator.elements() {
        match element {
            JitElement::Method(method) => {
                assert_eq!(method.call_number(), 0);
                assert_eq!(method.call_depth(), 0);
                assert!(method.callees().is_empty());
            }
            JitElement::Pic(_) => panic!("pics_ratio 0 must not produce pics"),
        }
    }
    assert!(image.jit.len() <= 0x400);
}

#[test]
fn layout_equality_holds() {
    let mut generator = Generator::new(busy_config(5)).unwrap();
    let image = generator.generate().unwrap();
    let config = generator.config();
    assert_eq!(
        (image.interpreter.len() + image.padding.len()) as u64,
        config.jit_start_address - config.interpreter_start_address
    );
    assert_eq!(image.unified().len() % 4, 0);
}

#[test]
fn same_seed_same_bytes() {
    let mut first = Generator::new(busy_config(123)).unwrap();
    let mut second = Generator::new(busy_config(123)).unwrap();
    let image_a = first.generate().unwrap();
    let image_b = second.generate().unwrap();
    assert_eq!(image_a.unified(), image_b.unified());
    assert_eq!(image_a.data, image_b.data);
    assert_eq!(image_a.shadow_stack, image_b.shadow_stack);
}

#[test]
fn different_seeds_diverge() {
    let mut first = Generator::new(busy_config(1)).unwrap();
    let mut second = Generator::new(busy_config(2)).unwrap();
    assert_ne!(
        first.generate().unwrap().unified(),
        second.generate().unwrap().unified()
    );
}

#[test]
fn call_graph_is_acyclic_over_many_seeds() {
    for seed in 0..20 {
        let mut generator = Generator::new(busy_config(seed)).unwrap();
        generator.generate().unwrap();
        let methods = all_methods(&generator);
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
        let depth_of: HashMap<usize, u64> =
            methods.iter().map(|m| (m.id(), m.call_depth())).collect();
        for method in &methods {
            for callee in method.callees() {
                // depth strictly decreases along every edge
                assert!(
                    callee.call_depth < method.call_depth(),
                    "seed {seed}: callee depth {} not below caller depth {}",
                    callee.call_depth,
                    method.call_depth()
                );
                assert_eq!(depth_of[&callee.id], callee.call_depth);
                edges.entry(method.id()).or_default().push(callee.id);
            }
        }
        // no method reaches itself transitively
        for method in &methods {
            let mut stack = vec![method.id()];
            let mut seen = HashSet::new();
            while let Some(id) = stack.pop() {
                for callee in edges.get(&id).into_iter().flatten() {
                    assert_ne!(*callee, method.id(), "seed {seed}: cycle detected");
                    if seen.insert(*callee) {
                        stack.push(*callee);
                    }
                }
            }
        }
    }
}

#[test]
fn branches_and_jumps_stay_inside_their_method() {
    let mut generator = Generator::new(busy_config(9)).unwrap();
    generator.generate().unwrap();
    for method in all_methods(&generator) {
        let span = (method.total_size() * 4) as i64;
        for (index, instr) in method.instructions().iter().enumerate() {
            if matches!(instr.format, Format::B | Format::J) {
                let target = (index * 4) as i64 + instr.imm as i64;
                assert!(
                    (0..span).contains(&target),
                    "target {target:#x} escapes method span {span:#x}"
                );
            }
        }
    }
}

#[test]
fn memory_accesses_use_data_register_within_bounds() {
    let mut generator = Generator::new(busy_config(11)).unwrap();
    generator.generate().unwrap();
    let data_size = generator.config().data_size;
    let bound = data_size.min(0x7ff) as i32;
    for method in all_methods(&generator) {
        for instr in method.body_instructions() {
            if instr.opcode == OP_STORE || instr.opcode == OP_LOAD {
                assert_eq!(instr.rs1, DATA_REG, "memory access off the data register");
                assert!((0..=bound).contains(&instr.imm));
                let width = 1i32 << (instr.funct3 & 0b11);
                assert_eq!(instr.imm % width, 0, "unaligned access");
            }
        }
    }
}

#[test]
fn call_sites_reserve_three_slots_without_trampolines() {
    let mut generator = Generator::new(busy_config(13)).unwrap();
    generator.generate().unwrap();
    for method in all_methods(&generator) {
        assert_eq!(method.call_size(), 3);
        for pair in method.call_site_indices().windows(2) {
            assert!(pair[1] - pair[0] >= 3);
        }
    }
}

#[test]
fn call_sites_reserve_six_slots_with_trampolines() {
    let config = GeneratorConfig {
        isolation: IsolationMode::Trampolines,
        ..busy_config(13)
    };
    let mut generator = Generator::new(config).unwrap();
    generator.generate().unwrap();
    let mut saw_patched_site = false;
    for method in all_methods(&generator) {
        assert_eq!(method.call_size(), 6);
        for slot in method.call_site_indices() {
            // four call instructions, two trailing nops
            saw_patched_site = true;
            let instrs = method.instructions();
            assert_eq!(instrs[slot + 4], gigue::instr::Instr::nop());
            assert_eq!(instrs[slot + 5], gigue::instr::Instr::nop());
        }
    }
    assert!(saw_patched_site, "expected at least one patched call site");
}

#[test]
fn trampoline_mode_returns_through_ret_trampoline() {
    let config = GeneratorConfig {
        isolation: IsolationMode::Trampolines,
        ..busy_config(21)
    };
    let mut generator = Generator::new(config).unwrap();
    generator.generate().unwrap();
    let ret_trampoline = generator
        .trampolines()
        .iter()
        .find(|t| t.kind == gigue::trampoline::TrampolineKind::RetFromJitElt)
        .map(|t| t.address)
        .unwrap();
    for method in all_methods(&generator) {
        let last_index = method.total_size() - 1;
        let last = method.instructions()[last_index];
        assert_eq!(last.format, Format::J);
        assert_eq!(last.rd, 0);
        let jump_address = method.address() as i64 + (last_index * 4) as i64;
        assert_eq!(jump_address + last.imm as i64, ret_trampoline as i64);
    }
}

#[test]
fn rimi_mode_sizes_shadow_stack_and_excludes_pointer() {
    let config = GeneratorConfig {
        isolation: IsolationMode::RimiShadowStack,
        shadow_stack_size: 0x200,
        ..busy_config(31)
    };
    let mut generator = Generator::new(config).unwrap();
    let image = generator.generate().unwrap();
    assert_eq!(image.shadow_stack.len(), 0x200);
    assert!(image.shadow_stack.iter().all(|byte| *byte == 0));
    let ssp = generator.config().rimi_ssp_reg;
    for method in all_methods(&generator) {
        for instr in method.body_instructions() {
            assert_ne!(instr.rd, ssp, "random body writes the shadow-stack pointer");
        }
    }
    // base mode keeps the minimal placeholder file
    let mut base = Generator::new(busy_config(31)).unwrap();
    assert_eq!(base.generate().unwrap().shadow_stack.len(), 8);
}

#[test]
fn data_strategy_controls_data_binary() {
    let config = GeneratorConfig {
        data_strategy: DataStrategy::Iterative32,
        ..minimal_config()
    };
    let mut generator = Generator::new(config).unwrap();
    let image = generator.generate().unwrap();
    assert_eq!(image.data.len(), 0x400);
    assert_eq!(&image.data[0..8], &[0, 0, 0, 0, 1, 0, 0, 0]);
}

#[test]
fn padding_is_nop_words() {
    let mut generator = Generator::new(minimal_config()).unwrap();
    let image = generator.generate().unwrap();
    assert_eq!(image.padding.len() % 4, 0);
    for word in image.padding.chunks(4) {
        assert_eq!(word, [0x13, 0x00, 0x00, 0x00]);
    }
}
