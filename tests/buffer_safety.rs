use bbjit::asm::memory::{ExecMemory, SimulatedMemory};
use bbjit::asm::CodeBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const FILL: u8 = 0x1E;

fn split(pages: usize) -> (Arc<SimulatedMemory>, CodeBuffer, CodeBuffer) {
    let sim = Arc::new(SimulatedMemory::new(pages * SimulatedMemory::PAGE_SIZE));
    let (cb, ocb) = CodeBuffer::new_split(sim.clone(), FILL, 16, false).unwrap();
    (sim, cb, ocb)
}

#[test]
fn random_writes_never_pass_capacity() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20 {
        let (sim, mut cb, ocb) = split(2);
        let capacity = cb.get_mem_size();
        let mut requested = 0usize;

        while requested < capacity + 512 {
            if rng.gen_bool(0.5) {
                let len = rng.gen_range(1..300);
                let byte: u8 = rng.gen_range(0..0x1E);
                cb.write_bytes(&vec![byte; len]);
                requested += len;
            } else {
                let width = [8u8, 16, 32, 64][rng.gen_range(0..4)];
                cb.write_int(rng.gen(), width);
                requested += width as usize / 8;
            }

            assert!(cb.get_write_pos() <= capacity);
            assert_eq!(cb.has_dropped_bytes(), requested > capacity);
        }

        assert_eq!(cb.get_write_pos(), capacity);

        // The outlined half right after the inline buffer was never touched
        assert!(ocb.read_bytes(0, ocb.get_mem_size()).iter().all(|&b| b == FILL));
        assert_eq!(ocb.get_write_pos(), 0);
        assert!(sim.violations().is_empty());
        assert_eq!(sim.size(), 2 * SimulatedMemory::PAGE_SIZE);
    }
}

#[test]
fn dropped_flag_is_sticky() {
    let (_, mut cb, _) = split(2);
    let capacity = cb.get_mem_size();

    cb.write_bytes(&vec![0x90; capacity]);
    assert!(!cb.has_dropped_bytes());
    assert!(!cb.has_capacity(1));

    cb.write_byte(0x90);
    assert!(cb.has_dropped_bytes());

    // Rewinding does not clear the failure
    cb.set_pos(0);
    cb.write_byte(0xC3);
    assert!(cb.has_dropped_bytes());
}

#[test]
fn unresolvable_labels_fail_without_writing() {
    let (_, mut cb, _) = split(2);
    let never_bound = cb.new_label("never_bound");
    cb.write_bytes(&[0xE9, 0, 0, 0, 0]);
    cb.label_ref(never_bound, 4);
    cb.link_labels();

    assert!(cb.has_dropped_bytes());
    assert_eq!(cb.read_bytes(1, 4), vec![0; 4]);
    assert_eq!(cb.get_write_pos(), 5);
}

#[test]
fn label_displacement_must_fit_its_field() {
    let (_, mut cb, _) = split(2);
    let far = cb.new_label("far");
    cb.write_bytes(&[0xEB, 0]);
    cb.label_ref(far, 1);
    cb.write_bytes(&[0x90; 200]);
    cb.write_label(far);
    cb.link_labels();

    assert!(cb.has_dropped_bytes());
    assert_eq!(cb.read_byte(1), 0);
}
