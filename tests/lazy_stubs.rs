use bbjit::bbv::{BlockId, BranchRef, BranchShape, Context};
use bbjit::codegen::JitCore;
use bbjit::core::options::{JitOptions, TargetArch};
use bbjit::host::{ExecutionContext, Iseq};
use bbjit::jit::Jit;
use bbjit::test_iseq::{TestFrame, TestIseq};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};
use std::sync::Arc;

const DIAMOND: &str = "\
iseq 7 diamond
  putnil
  branchunless else
  putobject 3
  leave
else:
  putobject 5
  leave
";

fn setup() -> (Arc<Jit>, Arc<dyn Iseq>, BranchRef) {
    let _ = env_logger::builder().is_test(true).try_init();

    let jit = Jit::simulated(
        TargetArch::X86_64,
        JitOptions {
            exec_mem_size: 64 * 4096,
            ..JitOptions::default()
        },
    )
    .unwrap();
    let iseq: Arc<dyn Iseq> = Arc::new(TestIseq::parse(DIAMOND).unwrap());
    jit.register_iseq(iseq.clone());
    jit.resolve(BlockId::new(iseq.id(), 0), &Context::new(), None)
        .unwrap();

    let branch = {
        let core = jit.lock();
        let block = core.versions().versions(BlockId::new(iseq.id(), 0))[0];
        core.graph().block(block).outgoing[0]
    };
    (jit, iseq, branch)
}

fn branch_insns(core: &JitCore, branch: BranchRef) -> Vec<Instruction> {
    let br = core.graph().branch(branch);
    let start = br.start_addr.unwrap();
    let pos = core.cb().ptr_to_pos(start).unwrap();
    let bytes = core.cb().read_bytes(pos, br.code_size());
    Decoder::with_ip(64, &bytes, start.as_u64(), DecoderOptions::NONE)
        .iter()
        .collect()
}

fn hit(jit: &Jit, iseq: &Arc<dyn Iseq>, branch: BranchRef, target_idx: u32) -> u64 {
    let mut frame = TestFrame::new(iseq.clone());
    let dst = jit.branch_stub_hit(branch.as_raw(), target_idx, &mut frame);
    assert_eq!(frame.sp(), 0);
    dst.as_u64()
}

#[test]
fn targets_start_as_stubs() {
    let (jit, _, branch) = setup();
    let core = jit.lock();
    let br = core.graph().branch(branch);

    assert_eq!(core.stats().compiled_block_count, 1);
    for dst in br.dst_addrs {
        assert!(core.ocb().contains(dst.unwrap()));
    }

    let insns = branch_insns(&core, branch);
    assert_eq!(insns.len(), 2);
    assert_eq!(insns[0].mnemonic(), Mnemonic::Je);
    assert_eq!(insns[0].near_branch_target(), br.dst_addrs[0].unwrap().as_u64());
    assert_eq!(insns[1].mnemonic(), Mnemonic::Jmp);
    assert_eq!(insns[1].near_branch_target(), br.dst_addrs[1].unwrap().as_u64());
}

#[test]
fn first_hit_compiles_then_jumps_are_direct() {
    let (jit, iseq, branch) = setup();

    // The branch ends the inline code, so the target is placed right behind it
    let taken = hit(&jit, &iseq, branch, 0);
    {
        let core = jit.lock();
        let br = core.graph().branch(branch);
        assert_eq!(br.shape, BranchShape::Next0);
        assert_eq!(Some(taken), br.end_addr.map(|a| a.as_u64()));
        assert_eq!(core.stats().compiled_block_count, 2);
    }

    // The other side is patched in place
    let fallthrough = hit(&jit, &iseq, branch, 1);
    {
        let core = jit.lock();
        let br = core.graph().branch(branch);
        assert!(core.cb().contains(br.dst_addrs[1].unwrap()));
        assert_eq!(br.dst_addrs[1].unwrap().as_u64(), fallthrough);

        let insns = branch_insns(&core, branch);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].mnemonic(), Mnemonic::Jne);
        assert_eq!(insns[0].near_branch_target(), fallthrough);
        assert_eq!(core.stats().compiled_block_count, 3);
    }

    // Later hits (other threads racing the patch) compile nothing
    for _ in 0..10 {
        assert_eq!(hit(&jit, &iseq, branch, 0), taken);
        assert_eq!(hit(&jit, &iseq, branch, 1), fallthrough);
    }

    let stats = jit.stats();
    assert_eq!(stats.compiled_block_count, 3);
    assert_eq!(stats.branch_stub_hits, 22);
}

#[test]
fn stub_hit_moves_the_frame_to_the_target() {
    let (jit, iseq, branch) = setup();

    let mut frame = TestFrame::new(iseq.clone());
    jit.branch_stub_hit(branch.as_raw(), 0, &mut frame);

    // putnil, branchunless and its offset, putobject and its operand, leave
    assert_eq!(frame.current_pc(), iseq.pc_at(6));
}
