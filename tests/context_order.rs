use bbjit::bbv::context::{InsnOpnd, TypeDiff, MAX_LOCAL_TYPES, MAX_TEMP_TYPES};
use bbjit::bbv::{Context, Type};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const TYPES: [Type; 13] = [
    Type::Unknown,
    Type::UnknownImm,
    Type::UnknownHeap,
    Type::Nil,
    Type::True,
    Type::False,
    Type::Fixnum,
    Type::Flonum,
    Type::ImmSymbol,
    Type::Array,
    Type::Hash,
    Type::HeapSymbol,
    Type::String,
];

/// Where a stack slot's value comes from.
#[derive(Clone, Copy, Debug)]
enum Slot {
    SelfVal,
    Local(usize),
    Temp(Type),
}

/// Description of a context, built bottom of the stack first.
#[derive(Clone, Debug)]
struct Shape {
    self_type: Type,
    locals: [Type; MAX_LOCAL_TYPES],
    stack: Vec<Slot>,
}

impl Shape {
    fn random(rng: &mut StdRng) -> Self {
        let mut locals = [Type::Unknown; MAX_LOCAL_TYPES];
        for local in locals.iter_mut() {
            *local = *TYPES.choose(rng).unwrap();
        }
        let depth = rng.gen_range(0..=MAX_TEMP_TYPES + 2);
        let stack = (0..depth)
            .map(|_| match rng.gen_range(0..4) {
                0 => Slot::SelfVal,
                1 => Slot::Local(rng.gen_range(0..MAX_LOCAL_TYPES)),
                _ => Slot::Temp(*TYPES.choose(rng).unwrap()),
            })
            .collect();
        Self {
            self_type: *TYPES.choose(rng).unwrap(),
            locals,
            stack,
        }
    }

    fn build(&self) -> Context {
        let mut ctx = Context::new();
        for (idx, &local_type) in self.locals.iter().enumerate() {
            ctx.set_local_type(idx, local_type);
        }
        if self.self_type != Type::Unknown {
            ctx.upgrade_opnd_type(InsnOpnd::SelfOpnd, self.self_type);
        }
        for slot in &self.stack {
            match *slot {
                Slot::SelfVal => ctx.stack_push_self(),
                Slot::Local(idx) => ctx.stack_push_local(idx),
                Slot::Temp(t) => ctx.stack_push(t),
            };
        }
        ctx
    }

    /// A shape any context built from `self` may flow into: some types widened, some
    /// temporaries forgetting their origin.
    fn widen(&self, rng: &mut StdRng) -> Self {
        let mut wider = self.clone();
        if rng.gen_bool(0.5) {
            wider.self_type = widen_type(wider.self_type);
        }
        for local in wider.locals.iter_mut() {
            if rng.gen_bool(0.3) {
                *local = widen_type(*local);
            }
        }
        for slot in wider.stack.iter_mut() {
            *slot = match *slot {
                Slot::Temp(t) if rng.gen_bool(0.5) => Slot::Temp(widen_type(t)),
                Slot::SelfVal | Slot::Local(_) if rng.gen_bool(0.3) => Slot::Temp(Type::Unknown),
                other => other,
            };
        }
        wider
    }
}

fn widen_type(t: Type) -> Type {
    match t {
        Type::Unknown | Type::UnknownImm | Type::UnknownHeap => Type::Unknown,
        t if t.is_imm() => Type::UnknownImm,
        _ => Type::UnknownHeap,
    }
}

#[test]
fn diff_is_reflexive() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let mut ctx = Shape::random(&mut rng).build();
        for _ in 0..rng.gen_range(0..3) {
            ctx.increment_chain_depth();
        }
        assert_eq!(ctx.diff(&ctx), TypeDiff::Compatible(0), "{ctx:?}");
    }
}

#[test]
fn widened_contexts_accept_their_source() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        let shape = Shape::random(&mut rng);
        let wider = shape.widen(&mut rng);
        let (ctx, wider_ctx) = (shape.build(), wider.build());
        assert!(ctx.diff(&wider_ctx).is_compatible(), "{shape:?} -> {wider:?}");
        assert!(ctx.diff(&ctx.generic()).is_compatible());
    }
}

#[test]
fn diff_is_transitive() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..500 {
        let a = Shape::random(&mut rng);
        let b = a.widen(&mut rng);
        let c = b.widen(&mut rng);
        let (a, b, c) = (a.build(), b.build(), c.build());

        assert!(a.diff(&b).is_compatible());
        assert!(b.diff(&c).is_compatible());
        assert!(a.diff(&c).is_compatible(), "{a:?} -> {c:?}");
    }

    // Unrelated contexts: whenever both steps are compatible, so is the composition
    let pool: Vec<Context> = (0..60)
        .map(|_| {
            let shape = Shape {
                stack: Vec::new(),
                ..Shape::random(&mut rng)
            };
            shape.build()
        })
        .collect();
    for a in &pool {
        for b in &pool {
            if !a.diff(b).is_compatible() {
                continue;
            }
            for c in &pool {
                if b.diff(c).is_compatible() {
                    assert!(a.diff(c).is_compatible());
                }
            }
        }
    }
}

#[test]
fn stack_shapes_and_chain_depths_are_never_bridged() {
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..200 {
        let ctx = Shape::random(&mut rng).build();

        let mut deeper = ctx;
        deeper.stack_push(Type::Unknown);
        assert_eq!(ctx.diff(&deeper), TypeDiff::Incompatible);
        assert_eq!(deeper.diff(&ctx), TypeDiff::Incompatible);

        let mut chained = ctx;
        chained.increment_chain_depth();
        assert_eq!(ctx.diff(&chained), TypeDiff::Incompatible);
        assert_eq!(chained.diff(&ctx), TypeDiff::Incompatible);

        // Within one depth the usual widening applies
        assert!(chained.diff(&chained.generic()).is_compatible());
    }
}
