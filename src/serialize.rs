/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A self-contained, serializable allocation problem: a function, the
//! machine environment and the trace partition to allocate it with.

use core::fmt;

use alloc::{format, string::String, vec::Vec};
use serde::{Deserialize, Serialize};

use crate::trace::TraceBuilderResult;
use crate::{
    Block, Function, Inst, InstRange, MachineEnv, Operand, PRegSet, RegAllocError, RegClass, VReg,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum InstKind {
    Op,
    Ret,
    Branch,
}

impl InstKind {
    fn of(func: &impl Function, inst: Inst) -> Self {
        if func.is_ret(inst) {
            InstKind::Ret
        } else if func.is_branch(inst) {
            InstKind::Branch
        } else {
            InstKind::Op
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            InstKind::Op => "op",
            InstKind::Ret => "ret",
            InstKind::Branch => "branch",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RecordedInst {
    kind: InstKind,
    operands: Vec<Operand>,
    clobbers: PRegSet,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RecordedBlock {
    insts: InstRange,
    preds: Vec<Block>,
    succs: Vec<Block>,
    params: Vec<VReg>,
    /// Arguments passed to each successor, in successor order.
    branch_args: Vec<Vec<VReg>>,
}

/// A snapshot of everything one allocation run reads, detached from
/// the client that produced it.
///
/// Used to replay a failing allocation outside of its compiler. The
/// encoding follows the field layout of this crate version and is not
/// meant to be read by any other version.
#[derive(Serialize, Deserialize)]
pub struct SerializableFunction {
    machine_env: MachineEnv,
    entry: Block,
    insts: Vec<RecordedInst>,
    blocks: Vec<RecordedBlock>,
    num_vregs: usize,
    /// Slot size of each register class, indexed by class.
    slot_sizes: [usize; 3],
    slots_named_by_last: bool,
    /// Blocks of each trace, in allocation order.
    traces: Vec<Vec<Block>>,
}

impl SerializableFunction {
    /// Record `func` together with the environment and traces it is
    /// allocated with.
    pub fn new(func: &impl Function, machine_env: MachineEnv, traces: &TraceBuilderResult) -> Self {
        let insts = (0..func.num_insts())
            .map(Inst::new)
            .map(|inst| RecordedInst {
                kind: InstKind::of(func, inst),
                operands: func.inst_operands(inst).to_vec(),
                clobbers: func.inst_clobbers(inst),
            })
            .collect();

        let blocks = (0..func.num_blocks())
            .map(Block::new)
            .map(|block| {
                let insts = func.block_insns(block);
                let succs = func.block_succs(block).to_vec();
                let branch_args = (0..succs.len())
                    .map(|i| func.branch_blockparams(block, insts.last(), i).to_vec())
                    .collect();
                RecordedBlock {
                    insts,
                    preds: func.block_preds(block).to_vec(),
                    succs,
                    params: func.block_params(block).to_vec(),
                    branch_args,
                }
            })
            .collect();

        Self {
            machine_env,
            entry: func.entry_block(),
            insts,
            blocks,
            num_vregs: func.num_vregs(),
            slot_sizes: RegClass::ALL.map(|class| func.spillslot_size(class)),
            slots_named_by_last: func.multi_spillslot_named_by_last_slot(),
            traces: traces.traces().iter().map(|t| t.blocks().to_vec()).collect(),
        }
    }

    pub fn machine_env(&self) -> &MachineEnv {
        &self.machine_env
    }

    /// Rebuild the recorded trace partition. Fails if it no longer
    /// covers the function's blocks.
    pub fn traces(&self) -> Result<TraceBuilderResult, RegAllocError> {
        TraceBuilderResult::new(self, self.traces.clone())
    }
}

impl Function for SerializableFunction {
    fn num_insts(&self) -> usize {
        self.insts.len()
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn entry_block(&self) -> Block {
        self.entry
    }

    fn block_insns(&self, block: Block) -> InstRange {
        self.blocks[block.index()].insts
    }

    fn block_succs(&self, block: Block) -> &[Block] {
        &self.blocks[block.index()].succs
    }

    fn block_preds(&self, block: Block) -> &[Block] {
        &self.blocks[block.index()].preds
    }

    fn block_params(&self, block: Block) -> &[VReg] {
        &self.blocks[block.index()].params
    }

    fn is_ret(&self, insn: Inst) -> bool {
        self.insts[insn.index()].kind == InstKind::Ret
    }

    fn is_branch(&self, insn: Inst) -> bool {
        self.insts[insn.index()].kind == InstKind::Branch
    }

    fn branch_blockparams(&self, block: Block, _: Inst, succ: usize) -> &[VReg] {
        &self.blocks[block.index()].branch_args[succ]
    }

    fn inst_operands(&self, insn: Inst) -> &[Operand] {
        &self.insts[insn.index()].operands
    }

    fn inst_clobbers(&self, insn: Inst) -> PRegSet {
        self.insts[insn.index()].clobbers
    }

    fn num_vregs(&self) -> usize {
        self.num_vregs
    }

    fn spillslot_size(&self, regclass: RegClass) -> usize {
        self.slot_sizes[regclass.index()]
    }

    fn multi_spillslot_named_by_last_slot(&self) -> bool {
        self.slots_named_by_last
    }
}

fn vreg_list(vregs: &[VReg]) -> String {
    vregs
        .iter()
        .map(|v| format!("{}", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn block_list(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|b| format!("block{}", b.index()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prints the function as a listing, one line per instruction, with
/// the environment and traces as a header.
impl fmt::Debug for SerializableFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "env {:#?}", self.machine_env)?;
        for class in RegClass::ALL {
            writeln!(f, "slot size {:?} = {}", class, self.slot_sizes[class.index()])?;
        }
        if self.slots_named_by_last {
            writeln!(f, "multi-slot values named by their last slot")?;
        }
        for (i, trace) in self.traces.iter().enumerate() {
            writeln!(f, "trace{}: {}", i, block_list(trace))?;
        }

        for (i, block) in self.blocks.iter().enumerate() {
            let entry = if Block::new(i) == self.entry { " entry" } else { "" };
            writeln!(
                f,
                "block{}({}){} preds [{}] succs [{}]",
                i,
                vreg_list(&block.params),
                entry,
                block_list(&block.preds),
                block_list(&block.succs),
            )?;
            for inst in block.insts.iter() {
                let data = &self.insts[inst.index()];
                write!(f, "  inst{} {}", inst.index(), data.kind.mnemonic())?;
                for (k, op) in data.operands.iter().enumerate() {
                    write!(f, "{}{}", if k == 0 { " " } else { ", " }, op)?;
                }
                if data.clobbers != PRegSet::empty() {
                    let clobbers: Vec<_> = data.clobbers.into_iter().map(|r| format!("{}", r)).collect();
                    write!(f, " clobbers {{{}}}", clobbers.join(" "))?;
                }
                writeln!(f)?;
            }
            for (succ, args) in block.succs.iter().zip(block.branch_args.iter()) {
                if !args.is_empty() {
                    writeln!(f, "  -> block{}({})", succ.index(), vreg_list(args))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SerializableFunction;
    use crate::fuzzing::func::{machine_env, FuncBuilder};
    use crate::trace::TraceBuilderResult;
    use crate::{
        AllocationContext, Block, EditMoveFactory, Function, Operand, RegClass, RegallocOptions,
        VReg,
    };
    use alloc::format;
    use alloc::vec;

    #[test]
    fn snapshot_allocates_like_the_original() {
        let v = |n| VReg::new(n, RegClass::Int);
        let mut b = FuncBuilder::new();
        let b0 = b.add_block();
        let b1 = b.add_block();
        b.add_edge(b0, b1);
        b.set_block_params(b1, &[v(1)]);
        b.push_inst(b0, &[Operand::reg_def(v(0))]);
        b.push_branch(b0, &[], &[vec![v(0)]]);
        b.push_ret(b1, &[Operand::reg_use(v(1))]);
        let f = b.finish();

        let env = machine_env();
        let traces = TraceBuilderResult::single_block(&f).unwrap();
        let snapshot = SerializableFunction::new(&f, env.clone(), &traces);

        assert_eq!(snapshot.num_blocks(), f.num_blocks());
        assert_eq!(snapshot.num_vregs(), f.num_vregs());
        assert_eq!(snapshot.block_params(b1), &[v(1)]);
        assert_eq!(snapshot.branch_blockparams(b0, f.block_insns(b0).last(), 0), &[v(0)]);
        assert_eq!(snapshot.block_preds(Block::new(1)), &[b0]);

        let replayed = snapshot.traces().unwrap();
        assert_eq!(replayed.num_traces(), traces.num_traces());

        let options = RegallocOptions::default();
        let expected = crate::run(&f, &AllocationContext::new(&EditMoveFactory, &env, &traces), &options)
            .unwrap();
        let got = crate::run(
            &snapshot,
            &AllocationContext::new(&EditMoveFactory, snapshot.machine_env(), &replayed),
            &options,
        )
        .unwrap();
        assert_eq!(got.allocs, expected.allocs);
        assert_eq!(got.edits, expected.edits);

        let listing = format!("{:?}", snapshot);
        assert!(listing.contains("block1(v1)"), "{}", listing);
        assert!(listing.contains("-> block1(v0)"), "{}", listing);
    }
}
