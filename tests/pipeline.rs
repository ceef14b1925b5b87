//! End-to-end pipeline tests: scheduled graph through generation, stack
//! allocation, a scripted register assignment (register allocation proper
//! is the host's concern), and emission down to exact byte sequences.

use gantry_codegen::context::CancelToken;
use gantry_codegen::ir::{
    BinaryOp, Condition, Constant, Graph, Kind, NodeData, Value,
};
use gantry_codegen::isa::amd64::regs::{self, Reg, RegisterConfig};
use gantry_codegen::lir::emit::emit_code;
use gantry_codegen::lir::generator::generate_lir;
use gantry_codegen::lir::stackalloc::allocate_stack_slots;
use gantry_codegen::lir::{FrameMap, Lir};
use gantry_codegen::result::CodegenResult;
use gantry_codegen::runtime::{
    Barriers, CompiledCode, ForeignCallDescriptor, ForeignCallTarget, RuntimeCaps,
};
use gantry_codegen::settings::CoreConfig;
use gantry_codegen::ir::state::{DeoptAction, DeoptReason};

struct HostStub {
    config: RegisterConfig,
}

impl Default for HostStub {
    fn default() -> Self {
        HostStub {
            config: RegisterConfig::base(),
        }
    }
}

impl RuntimeCaps for HostStub {
    fn lookup_foreign_call(
        &self,
        _descriptor: &ForeignCallDescriptor,
    ) -> CodegenResult<ForeignCallTarget> {
        Ok(ForeignCallTarget {
            address: 0x7100_0000,
            max_target_offset: 0x1000_0000,
            kills_caller_saves: true,
        })
    }

    fn encode_deopt_action_and_reason(&self, action: DeoptAction, reason: DeoptReason) -> u64 {
        ((action as u64) << 8) | reason as u64
    }

    fn needs_data_patch(&self, constant: &Constant) -> bool {
        matches!(constant, Constant::Object(_))
    }

    fn register_config(&self) -> &RegisterConfig {
        &self.config
    }

    fn barriers(&self, required: Barriers) -> Barriers {
        if required.contains(Barriers::STORE_LOAD) {
            Barriers::STORE_LOAD
        } else {
            Barriers::default()
        }
    }

    fn install_code(&self, _code: &CompiledCode) -> CodegenResult<()> {
        Ok(())
    }
}

/// Scripted register assignment standing in for the external register
/// allocator: variable index → physical register.
fn assign_registers(lir: &mut Lir, map: &[Reg]) {
    fn rewrite(v: &mut Value, map: &[Reg]) {
        match v {
            Value::Variable(var) => {
                *v = Value::reg(map[var.index as usize], var.kind);
            }
            Value::Address(addr) => {
                rewrite(&mut addr.base, map);
                rewrite(&mut addr.index, map);
            }
            _ => {}
        }
    }
    for block in &mut lir.blocks {
        for inst in &mut block.insts {
            inst.visit_values(&mut |v, _, _| rewrite(v, map));
        }
    }
    for state in lir.states.iter_mut() {
        state.visit_values_mut(&mut |v| rewrite(v, map));
    }
}

fn compile(graph: &Graph, regmap: &[Reg]) -> CompiledCode {
    let caps = HostStub::default();
    let config = CoreConfig::default();
    let cancel = CancelToken::default();
    let mut frame = FrameMap::new(8);
    let mut lir = generate_lir(graph, &mut frame, &caps, &config, &cancel).unwrap();
    allocate_stack_slots(&mut lir, &mut frame, &cancel).unwrap();
    assign_registers(&mut lir, regmap);
    frame.freeze();
    emit_code(&lir, &frame, &caps, &config, &cancel).unwrap()
}

fn hex(code: &CompiledCode) -> String {
    code.code.iter().map(|b| format!("{:02X}", b)).collect()
}

#[test]
fn int_add_with_inline_immediate() {
    let mut g = Graph::new();
    g.param_kinds = vec![Kind::Int];
    let b0 = g.create_block();
    let p = g.append(
        b0,
        NodeData::Param {
            index: 0,
            kind: Kind::Int,
        },
    );
    let c = g.append(
        b0,
        NodeData::Constant {
            value: Constant::Int(42),
        },
    );
    let sum = g.append(
        b0,
        NodeData::Binary {
            op: BinaryOp::Add,
            kind: Kind::Int,
            x: p,
            y: c,
            set_flags: false,
        },
    );
    g.append(b0, NodeData::Return { value: Some(sum) });

    let code = compile(&g, &[regs::rcx(), regs::rax()]);
    // mov ecx, edi; mov eax, ecx; add eax, 42 (imm8 form, field = 42).
    assert_eq!(hex(&code), "55488BEC8BCF8BC183C02A488BE55DC3");
}

#[test]
fn long_add_with_wide_immediate_is_two_instructions() {
    let mut g = Graph::new();
    g.param_kinds = vec![Kind::Long];
    let b0 = g.create_block();
    let p = g.append(
        b0,
        NodeData::Param {
            index: 0,
            kind: Kind::Long,
        },
    );
    let c = g.append(
        b0,
        NodeData::Constant {
            value: Constant::Long(0x1_0000_0000),
        },
    );
    let sum = g.append(
        b0,
        NodeData::Binary {
            op: BinaryOp::Add,
            kind: Kind::Long,
            x: p,
            y: c,
            set_flags: false,
        },
    );
    g.append(b0, NodeData::Return { value: Some(sum) });

    let code = compile(&g, &[regs::rcx(), regs::rdx(), regs::rax()]);
    let s = hex(&code);
    // The constant materializes via movabs; the add is register-register.
    assert!(s.contains("48BA0000000001000000"), "movabs missing in {}", s);
    assert!(s.contains("4801D0"), "add rax, rdx missing in {}", s);
    assert_eq!(
        s,
        "55488BEC488BCF48BA0000000001000000488BC14801D0488BE55DC3"
    );
}

#[test]
fn mirrored_compare_feeds_a_greater_than_cmov() {
    let mut g = Graph::new();
    g.param_kinds = vec![Kind::Int];
    let b0 = g.create_block();
    let p = g.append(
        b0,
        NodeData::Param {
            index: 0,
            kind: Kind::Int,
        },
    );
    let c5 = g.append(
        b0,
        NodeData::Constant {
            value: Constant::Int(5),
        },
    );
    let one = g.append(
        b0,
        NodeData::Constant {
            value: Constant::Int(1),
        },
    );
    let zero = g.append(
        b0,
        NodeData::Constant {
            value: Constant::Int(0),
        },
    );
    // `5 < p` with the constant on the left mirrors to `p > 5`.
    let cmp = g.append(
        b0,
        NodeData::Compare {
            cond: Condition::Lt,
            x: c5,
            y: p,
            unordered_is_true: false,
        },
    );
    let sel = g.append(
        b0,
        NodeData::Conditional {
            kind: Kind::Int,
            compare: cmp,
            true_value: one,
            false_value: zero,
        },
    );
    g.append(b0, NodeData::Return { value: Some(sel) });

    let code = compile(&g, &[regs::rcx(), regs::rax()]);
    let s = hex(&code);
    // cmp ecx, 5 — mirrored, immediate on the right.
    assert!(s.contains("83F905"), "mirrored compare missing in {}", s);
    // The select keeps greater-than polarity: the inverted cmov (LE)
    // overwrites the preloaded true value with the false value.
    assert!(s.contains("410F4EC2"), "cmovle missing in {}", s);
}

#[test]
fn safepoint_records_pc_and_rewritten_state() {
    use gantry_codegen::ir::InputState;
    let mut g = Graph::new();
    g.param_kinds = vec![Kind::Int];
    let b0 = g.create_block();
    let p = g.append(
        b0,
        NodeData::Param {
            index: 0,
            kind: Kind::Int,
        },
    );
    let state = g.add_state(InputState {
        bci: 21,
        locals: vec![Some(p)],
        ..Default::default()
    });
    g.append(b0, NodeData::Safepoint { state });
    g.append(b0, NodeData::Return { value: None });

    let code = compile(&g, &[regs::rcx()]);
    assert_eq!(code.safepoints.len(), 1);
    // Prologue is 4 bytes, the parameter move 2 — the safepoint sits
    // right after.
    assert_eq!(code.safepoints[0].offset, 6);
}
