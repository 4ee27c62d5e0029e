use bbjit::bbv::{BlockId, Context};
use bbjit::core::options::{JitOptions, TargetArch};
use bbjit::dump;
use bbjit::host::{Iseq, IseqId};
use bbjit::jit::Jit;
use bbjit::test_iseq::TestIseq;
use object::{Object, ObjectSection, ObjectSymbol};
use std::sync::Arc;

const LOOP: &str = "\
iseq 4 count
  putnil
  pop
  jump check
body:
  putobject 1
  pop
check:
  putnil
  branchif body
  putnil
  leave
";

fn compiled(arch: TargetArch) -> Arc<Jit> {
    let _ = env_logger::builder().is_test(true).try_init();

    let jit = Jit::simulated(
        arch,
        JitOptions {
            exec_mem_size: 64 * 4096,
            ..JitOptions::default()
        },
    )
    .unwrap();
    let iseq: Arc<dyn Iseq> = Arc::new(TestIseq::parse(LOOP).unwrap());
    jit.register_iseq(iseq.clone());
    jit.resolve(BlockId::new(iseq.id(), 0), &Context::new(), None)
        .unwrap();
    jit
}

#[test]
fn object_holds_every_live_block_and_the_shared_exits() {
    let jit = compiled(TargetArch::X86_64);
    let core = jit.lock();
    let bytes = dump::write_object(&core).unwrap();

    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.architecture(), object::Architecture::X86_64);

    let names: Vec<String> = file
        .symbols()
        .filter_map(|sym| sym.name().ok().map(str::to_string))
        .collect();
    assert!(names.iter().any(|n| n == "bbjit_leave_exit"));
    assert!(names.iter().any(|n| n == "bbjit_exit_from_stub"));
    assert!(names.iter().any(|n| n == "bbjit_4_0_0"));
    let block_symbols = names.iter().filter(|n| n.starts_with("bbjit_4_")).count();
    assert_eq!(block_symbols, core.graph().live_blocks().count());

    // Inline code comes first in .text
    let text = file.section_by_name(".text").unwrap();
    let data = text.data().unwrap();
    let inline_len = core.cb().get_write_pos();
    assert_eq!(&data[..inline_len], &core.cb().read_bytes(0, inline_len)[..]);
}

#[test]
fn symbols_point_at_block_code() {
    let jit = compiled(TargetArch::X86_64);
    let core = jit.lock();
    let bytes = dump::write_object(&core).unwrap();
    let file = object::File::parse(&*bytes).unwrap();

    let entry = file
        .symbols()
        .find(|sym| sym.name().ok() == Some("bbjit_4_0_0"))
        .unwrap();
    let block = core.versions().versions(BlockId::new(IseqId(4), 0))[0];
    let b = core.graph().block(block);
    let start = core.cb().ptr_to_pos(b.start_addr.unwrap()).unwrap();
    let end = core.cb().ptr_to_pos(b.end_addr.unwrap()).unwrap();

    assert_eq!(entry.address(), start as u64);
    assert_eq!(entry.size(), (end - start) as u64);
}

#[test]
fn arm64_objects_are_tagged_aarch64() {
    let jit = compiled(TargetArch::Arm64);
    let core = jit.lock();
    let bytes = dump::write_object(&core).unwrap();

    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.architecture(), object::Architecture::Aarch64);
    assert!(file
        .symbols()
        .any(|sym| sym.name().ok() == Some("bbjit_exit_from_stub")));
}

#[test]
fn disassembly_lists_block_instructions() {
    let jit = compiled(TargetArch::X86_64);
    let core = jit.lock();

    let block = core.graph().live_blocks().next().unwrap();
    let text = dump::disasm_block(&core, block);
    assert!(text.lines().count() > 1);
    assert!(text.contains("mov"));
}
