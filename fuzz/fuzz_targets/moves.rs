/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use std::collections::{HashMap, HashSet};
use tracealloc::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use tracealloc::fuzzing::fuzz_target;
use tracealloc::fuzzing::moves::{ParallelMoves, ScratchResolver};
use tracealloc::{Allocation, PReg, RegClass, SpillSlot};

fn location(u: &mut Unstructured) -> Result<Allocation> {
    Ok(if bool::arbitrary(u)? {
        let reg = u.int_in_range(0..=29)?;
        Allocation::reg(PReg::new(reg, RegClass::Int))
    } else {
        let slot = u.int_in_range(0..=31)?;
        Allocation::stack(SpillSlot::new(slot))
    })
}

#[derive(Clone, Debug)]
struct TestCase {
    moves: Vec<(Allocation, Allocation)>,
    free_regs: Vec<PReg>,
    dedicated_scratch: bool,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        let mut ret = TestCase {
            moves: vec![],
            free_regs: vec![],
            dedicated_scratch: bool::arbitrary(u)?,
        };
        let mut written = HashSet::new();
        // Moves between registers 0 to 29 and slots 0 to 31.
        while bool::arbitrary(u)? {
            let src = location(u)?;
            let dst = location(u)?;

            // Each location may only be written once in a parallel
            // move set.
            if written.contains(&dst) {
                break;
            }
            written.insert(dst);

            ret.moves.push((src, dst));
        }

        // Registers 30 and 31 may be free for scratch use; 32 is the
        // dedicated scratch register.
        for i in 0..u.int_in_range(0..=2)? {
            ret.free_regs.push(PReg::new(30 + i, RegClass::Int));
        }
        Ok(ret)
    }
}

fuzz_target!(|testcase: TestCase| {
    let _ = env_logger::try_init();
    let mut par = ParallelMoves::new();
    for &(src, dst) in &testcase.moves {
        par.add(src, dst, ());
    }

    let resolved = par.resolve();
    log::trace!("raw resolved moves: {:?}", resolved.moves);

    let dedicated = if testcase.dedicated_scratch {
        Some(PReg::new(32, RegClass::Int))
    } else {
        None
    };
    let victim = Some(PReg::new(0, RegClass::Int));
    let get_stackslot = |n: usize| Allocation::stack(SpillSlot::new(32 + n));
    let moves = ScratchResolver::new(&testcase.free_regs, dedicated, victim, false, get_stackslot)
        .compute(resolved)
        .expect("a victim register is always available");
    log::trace!("resolved moves: {:?}", moves);

    // The final source for each destination of the parallel move.
    let mut final_src_per_dest: HashMap<Allocation, Allocation> = HashMap::new();
    for &(src, dst) in &testcase.moves {
        final_src_per_dest.insert(dst, src);
    }
    log::trace!("expected final state: {:?}", final_src_per_dest);

    // Simulate the sequence of moves.
    let mut locations: HashMap<Allocation, Allocation> = HashMap::new();
    for (src, dst, _) in moves {
        if src.is_stack() && dst.is_stack() {
            panic!("Stack-to-stack move!");
        }

        let data = locations.get(&src).cloned().unwrap_or(src);
        locations.insert(dst, data);
    }
    log::trace!("simulated final state: {:?}", locations);

    for (loc, data) in locations {
        if let Some(&expected_data) = final_src_per_dest.get(&loc) {
            assert_eq!(expected_data, data);
        } else if data != loc {
            // Overwritten without being a destination: must be a
            // scratch register or a spare slot.
            assert!(
                dedicated.map(Allocation::reg) == Some(loc)
                    || testcase.free_regs.iter().any(|&r| Allocation::reg(r) == loc)
                    || loc.as_stack().map_or(false, |s| s.index() >= 32)
            );
        }
    }
});
