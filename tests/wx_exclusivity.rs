use bbjit::asm::memory::{ExecMemory, Protection, SimulatedMemory};
use bbjit::asm::CodeBuffer;
use bbjit::bbv::{BlockId, Context};
use bbjit::codegen::backend_for;
use bbjit::codegen::JitCore;
use bbjit::core::options::{JitOptions, TargetArch};
use bbjit::host::{ExecutionContext, Iseq, NoBarrier};
use bbjit::jit::Jit;
use bbjit::test_iseq::{TestFrame, TestIseq};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const PAGES: usize = 8;

fn all_executable(sim: &SimulatedMemory) -> bool {
    (0..sim.size() / SimulatedMemory::PAGE_SIZE)
        .all(|page| sim.page_protection(page) == Protection::ReadExec)
}

#[test]
fn random_buffer_traffic_never_writes_executable_pages() {
    let mut rng = StdRng::seed_from_u64(42);
    let sim = Arc::new(SimulatedMemory::new(PAGES * SimulatedMemory::PAGE_SIZE));
    let (mut cb, mut ocb) = CodeBuffer::new_split(sim.clone(), 0x1E, 8, false).unwrap();

    for _ in 0..2000 {
        let buf = if rng.gen_bool(0.5) { &mut cb } else { &mut ocb };
        match rng.gen_range(0..4) {
            0 => {
                let len = rng.gen_range(1..64);
                buf.write_bytes(&vec![0x90; len]);
            }
            1 => buf.mark_all_executable(),
            2 => {
                let pos = rng.gen_range(0..buf.get_mem_size());
                buf.set_pos(pos.min(buf.get_write_pos()));
            }
            _ => buf.write_int(rng.gen(), 32),
        }
    }

    cb.mark_all_executable();
    ocb.mark_all_executable();

    assert!(sim.violations().is_empty());
    assert!(all_executable(&sim));
}

#[test]
fn writes_after_marking_executable_reprotect_first() {
    let sim = Arc::new(SimulatedMemory::new(4 * SimulatedMemory::PAGE_SIZE));
    let (mut cb, _ocb) = CodeBuffer::new_split(sim.clone(), 0x1E, 8, false).unwrap();

    cb.write_byte(0x90);
    cb.mark_all_executable();
    assert_eq!(sim.page_protection(0), Protection::ReadExec);

    let calls = sim.protect_calls();
    cb.write_byte(0xC3);
    assert_eq!(sim.page_protection(0), Protection::ReadWrite);
    assert_eq!(sim.protect_calls(), calls + 1);

    // Same page again does not ask for another protection change
    cb.write_byte(0xC3);
    assert_eq!(sim.protect_calls(), calls + 1);
    assert!(sim.violations().is_empty());
}

#[test]
fn simulated_memory_reports_stray_writes() {
    let sim = SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE);
    sim.write_byte(SimulatedMemory::PAGE_SIZE + 3, 0xCC);

    let violations = sim.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].page, 1);
    assert_eq!(violations[0].protection, Protection::ReadExec);
    assert_ne!(sim.read_byte(SimulatedMemory::PAGE_SIZE + 3), 0xCC);
}

#[test]
fn jit_operations_leave_every_page_executable() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sim = Arc::new(SimulatedMemory::new(32 * SimulatedMemory::PAGE_SIZE));
    let jit = Jit::with_memory(
        sim.clone(),
        TargetArch::X86_64,
        JitOptions::default(),
        Arc::new(NoBarrier),
    )
    .unwrap();
    assert!(all_executable(&sim));

    let iseq: Arc<dyn Iseq> = Arc::new(
        TestIseq::parse(
            "iseq 1 m\n  putnil\n  branchunless else\n  putobject 3\n  leave\nelse:\n  putobject 5\n  leave\n",
        )
        .unwrap(),
    );

    let frame = TestFrame::new(iseq.clone());
    jit.gen_entry_point(&iseq, 0, Some(&frame as &dyn ExecutionContext))
        .unwrap();
    assert!(all_executable(&sim));

    let branch = {
        let core = jit.lock();
        let block = core.versions().versions(BlockId::new(iseq.id(), 0))[0];
        core.graph().block(block).outgoing[0]
    };
    for target_idx in [1, 0] {
        let mut frame = TestFrame::new(iseq.clone());
        jit.branch_stub_hit(branch.as_raw(), target_idx, &mut frame);
        assert!(all_executable(&sim));
    }

    jit.invalidate_all().unwrap();
    assert!(all_executable(&sim));

    jit.resolve(BlockId::new(iseq.id(), 0), &Context::new(), None)
        .unwrap();
    assert!(all_executable(&sim));
    assert!(sim.violations().is_empty());
}

#[test]
fn core_setup_leaves_region_executable() {
    let sim = Arc::new(SimulatedMemory::new(8 * SimulatedMemory::PAGE_SIZE));
    let core = JitCore::new(
        sim.clone(),
        JitOptions::default(),
        backend_for(TargetArch::Arm64),
    )
    .unwrap();

    assert!(core.ocb().get_write_pos() > 0);
    assert!(all_executable(&sim));
    assert!(sim.violations().is_empty());
}
