use bbjit::bbv::{BlockId, Context, InsnOpnd, Type, TypeDiff};
use bbjit::core::options::{JitOptions, TargetArch};
use bbjit::host::Iseq;
use bbjit::jit::Jit;
use bbjit::test_iseq::TestIseq;
use std::sync::Arc;

const SELF_TYPES: [Type; 9] = [
    Type::Nil,
    Type::True,
    Type::False,
    Type::Fixnum,
    Type::Flonum,
    Type::ImmSymbol,
    Type::Array,
    Type::Hash,
    Type::String,
];

fn setup(options: JitOptions) -> (Arc<Jit>, Arc<dyn Iseq>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let jit = Jit::simulated(
        TargetArch::X86_64,
        JitOptions {
            exec_mem_size: 64 * 4096,
            ..options
        },
    )
    .unwrap();
    let iseq: Arc<dyn Iseq> =
        Arc::new(TestIseq::parse("iseq 1 m\n  putself\n  leave\n").unwrap());
    jit.register_iseq(iseq.clone());
    (jit, iseq)
}

fn self_typed(t: Type) -> Context {
    let mut ctx = Context::new();
    ctx.upgrade_opnd_type(InsnOpnd::SelfOpnd, t);
    ctx
}

#[test]
fn versions_per_block_are_bounded() {
    let (jit, iseq) = setup(JitOptions::default());
    let blockid = BlockId::new(iseq.id(), 0);

    for t in SELF_TYPES {
        jit.resolve(blockid, &self_typed(t), None).unwrap();
        assert!(jit.lock().versions().get_num_versions(blockid) <= 4);
    }

    let core = jit.lock();
    let versions = core.versions().versions(blockid);
    assert_eq!(versions.len(), 4);
    assert_eq!(core.stats().version_limit_hits, 1);

    // The last version is the generic one every later request lands on
    let last = core.graph().block(versions[3]);
    assert_eq!(last.ctx, Context::new().generic());
    for t in &SELF_TYPES[4..] {
        assert!(matches!(self_typed(*t).diff(&last.ctx), TypeDiff::Compatible(_)));
    }
}

#[test]
fn earlier_versions_are_found_before_the_generic_one() {
    let (jit, iseq) = setup(JitOptions::default());
    let blockid = BlockId::new(iseq.id(), 0);

    let addrs: Vec<_> = SELF_TYPES
        .iter()
        .map(|&t| jit.resolve(blockid, &self_typed(t), None).unwrap())
        .collect();

    // Specialized versions stay reachable, later types share the generic one
    assert_eq!(jit.resolve(blockid, &self_typed(Type::Nil), None).unwrap(), addrs[0]);
    assert_eq!(jit.resolve(blockid, &self_typed(Type::False), None).unwrap(), addrs[2]);
    assert_eq!(addrs[3], addrs[8]);
    assert_eq!(jit.stats().compiled_block_count, 4);
}

#[test]
fn lookup_takes_the_first_compatible_version() {
    let (jit, iseq) = setup(JitOptions::default());
    let blockid = BlockId::new(iseq.id(), 0);

    let imm_self = self_typed(Type::UnknownImm);
    let mut fixnum_local = Context::new();
    fixnum_local.set_local_type(0, Type::Fixnum);

    let first = jit.resolve(blockid, &imm_self, None).unwrap();
    let second = jit.resolve(blockid, &fixnum_local, None).unwrap();
    assert_ne!(first, second);

    // Both versions accept this context, and the second is the closer one
    let mut want = self_typed(Type::Fixnum);
    want.set_local_type(0, Type::Fixnum);
    assert_eq!(want.diff(&imm_self), TypeDiff::Compatible(2));
    assert_eq!(want.diff(&fixnum_local), TypeDiff::Compatible(1));

    assert_eq!(jit.resolve(blockid, &want, None).unwrap(), first);
    assert_eq!(jit.stats().compiled_block_count, 2);
}

#[test]
fn chained_contexts_reuse_their_version() {
    let (jit, iseq) = setup(JitOptions::default());
    let blockid = BlockId::new(iseq.id(), 0);

    let mut chained = self_typed(Type::Fixnum);
    chained.increment_chain_depth();

    let first = jit.resolve(blockid, &chained, None).unwrap();
    for _ in 0..9 {
        assert_eq!(jit.resolve(blockid, &chained, None).unwrap(), first);
    }
    assert_eq!(jit.lock().versions().get_num_versions(blockid), 1);
}

#[test]
fn chained_contexts_count_against_the_limit() {
    let (jit, iseq) = setup(JitOptions::default());
    let blockid = BlockId::new(iseq.id(), 0);

    for t in SELF_TYPES {
        let mut chained = self_typed(t);
        chained.increment_chain_depth();
        jit.resolve(blockid, &chained, None).unwrap();
        assert!(jit.lock().versions().get_num_versions(blockid) <= 4);
    }

    // The widened version stays at the same depth of the chain
    let core = jit.lock();
    let versions = core.versions().versions(blockid);
    assert_eq!(versions.len(), 4);
    let last = core.graph().block(versions[3]);
    assert_eq!(last.ctx.get_chain_depth(), 1);
    assert_eq!(core.stats().version_limit_hits, 1);
}

#[test]
fn single_version_limit_compiles_generic_immediately() {
    let (jit, iseq) = setup(JitOptions {
        max_versions: 1,
        ..JitOptions::default()
    });
    let blockid = BlockId::new(iseq.id(), 0);

    let first = jit.resolve(blockid, &self_typed(Type::Fixnum), None).unwrap();
    let second = jit.resolve(blockid, &self_typed(Type::String), None).unwrap();

    assert_eq!(first, second);
    assert_eq!(jit.lock().versions().get_num_versions(blockid), 1);
    assert_eq!(jit.stats().version_limit_hits, 1);
}

#[test]
fn greedy_versioning_prefers_new_exact_versions() {
    let blockid_of = |iseq: &Arc<dyn Iseq>| BlockId::new(iseq.id(), 0);

    let (lazy, iseq) = setup(JitOptions::default());
    lazy.resolve(blockid_of(&iseq), &Context::new(), None).unwrap();
    lazy.resolve(blockid_of(&iseq), &self_typed(Type::Nil), None).unwrap();
    assert_eq!(lazy.lock().versions().get_num_versions(blockid_of(&iseq)), 1);

    let (greedy, iseq) = setup(JitOptions {
        greedy_versioning: true,
        ..JitOptions::default()
    });
    greedy.resolve(blockid_of(&iseq), &Context::new(), None).unwrap();
    greedy.resolve(blockid_of(&iseq), &self_typed(Type::Nil), None).unwrap();
    assert_eq!(greedy.lock().versions().get_num_versions(blockid_of(&iseq)), 2);
}
