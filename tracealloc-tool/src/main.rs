use std::path::PathBuf;

use clap::Parser;
use tracealloc::{
    checker::Checker, serialize::SerializableFunction, AllocationContext, Block, Edit,
    EditMoveFactory, Function, Inst, InstOrEdit, Output, RegallocOptions,
};

/// Replays a recorded allocation problem and checks the result.
#[derive(Parser)]
struct Args {
    /// Dump the recorded function and the allocated listing.
    #[clap(short = 'v')]
    verbose: bool,

    /// Allocate without validating SSA form first.
    #[clap(long)]
    no_validate: bool,

    /// A bincode-encoded `SerializableFunction`.
    input: PathBuf,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let bytes = std::fs::read(&args.input)
        .unwrap_or_else(|e| panic!("reading {}: {e}", args.input.display()));
    let function: SerializableFunction = bincode::deserialize(&bytes)
        .unwrap_or_else(|e| panic!("decoding {}: {e}", args.input.display()));
    if args.verbose {
        println!("{function:?}");
    }

    let traces = function
        .traces()
        .unwrap_or_else(|e| panic!("recorded traces do not fit the function: {e:?}"));
    let ctx = AllocationContext::new(&EditMoveFactory, function.machine_env(), &traces);
    let options = RegallocOptions {
        verbose_log: true,
        validate_ssa: !args.no_validate,
    };
    let output = tracealloc::run(&function, &ctx, &options)
        .unwrap_or_else(|e| panic!("allocation failed: {e:?}"));
    if args.verbose {
        print_listing(&function, &output);
    }

    let mut checker = Checker::new(&function);
    checker.prepare(&output);
    if let Err(errors) = checker.run() {
        panic!("checker rejected the allocation: {errors:#?}");
    }
    log::info!("{:?}", output.stats);
}

fn describe_inst(func: &SerializableFunction, output: &Output, inst: Inst) -> String {
    let kind = if func.is_ret(inst) {
        "ret"
    } else if func.is_branch(inst) {
        "branch"
    } else {
        "op"
    };
    let operands: Vec<String> = func
        .inst_operands(inst)
        .iter()
        .zip(output.inst_allocs(inst))
        .map(|(op, alloc)| format!("{op}@{alloc}"))
        .collect();
    format!("inst{} {kind} {}", inst.index(), operands.join(", "))
}

/// The function with allocations filled in and edits interleaved,
/// followed by the edges that needed moves.
fn print_listing(func: &SerializableFunction, output: &Output) {
    for block in (0..func.num_blocks()).map(Block::new) {
        println!("block{}:", block.index());
        for item in output.block_insts_and_edits(func, block) {
            match item {
                InstOrEdit::Inst(inst) => println!("  {}", describe_inst(func, output, inst)),
                InstOrEdit::Edit(Edit::Move { from, to, class }) => {
                    println!("  move.{class:?} {from} -> {to}")
                }
            }
        }
    }
    for edge in output.edges.iter() {
        if edge.moves.is_empty() {
            continue;
        }
        let moves: Vec<String> = edge
            .moves
            .iter()
            .map(|(from, to, vreg)| format!("{vreg}: {from} -> {to}"))
            .collect();
        println!(
            "edge block{} -> block{} @ {:?}: {}",
            edge.from.index(),
            edge.to.index(),
            edge.point,
            moves.join("; ")
        );
    }
}
