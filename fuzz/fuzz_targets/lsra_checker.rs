/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use tracealloc::checker::Checker;
use tracealloc::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use tracealloc::fuzzing::func::{Func, Options};
use tracealloc::fuzzing::fuzz_target;
use tracealloc::trace::{TraceBuilderKind, TraceBuilderResult};
use tracealloc::{AllocationContext, EditMoveFactory, RegallocOptions};

#[derive(Clone, Debug)]
struct TestCase {
    func: Func,
    single_block_traces: bool,
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<TestCase> {
        Ok(TestCase {
            func: Func::arbitrary_with_options(
                u,
                &Options {
                    fixed_regs: true,
                    clobbers: true,
                    control_flow: true,
                    block_params: true,
                    stack_uses: true,
                    late_operands: true,
                    float_values: true,
                },
            )?,
            single_block_traces: bool::arbitrary(u)?,
        })
    }
}

fuzz_target!(|testcase: TestCase| {
    let func = testcase.func;
    let _ = env_logger::try_init();
    log::trace!("func:\n{:?}", func);
    let env = tracealloc::fuzzing::func::machine_env();

    let kind = if testcase.single_block_traces {
        TraceBuilderKind::SingleBlock
    } else {
        TraceBuilderKind::UniDirectional
    };
    let traces = TraceBuilderResult::build(&func, kind).expect("trace building failed");
    let ctx = AllocationContext::new(&EditMoveFactory, &env, &traces);
    let options = RegallocOptions {
        verbose_log: false,
        validate_ssa: true,
    };
    let output = tracealloc::run(&func, &ctx, &options).expect("regalloc did not succeed");

    let mut checker = Checker::new(&func);
    checker.prepare(&output);
    checker.run().expect("checker failed");
});
