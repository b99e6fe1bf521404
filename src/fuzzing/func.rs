/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A simple `Function` implementation for tests and fuzzing, with a
//! builder for hand-assembled functions and (feature `fuzzing`) an
//! `Arbitrary` generator of valid SSA programs.

use crate::{
    Block, Function, Inst, InstRange, MachineEnv, Operand, OperandConstraint, OperandKind,
    OperandPos, PReg, PRegSet, RegClass, VReg,
};
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstOpcode {
    Op,
    Ret,
    Branch,
}

#[derive(Clone, Debug)]
pub struct InstData {
    op: InstOpcode,
    operands: Vec<Operand>,
    clobbers: PRegSet,
    /// Block-parameter arguments per successor, for branches.
    args: Vec<Vec<VReg>>,
}

#[derive(Clone, Default)]
pub struct Func {
    insts: Vec<InstData>,
    blocks: Vec<InstRange>,
    block_preds: Vec<Vec<Block>>,
    block_succs: Vec<Vec<Block>>,
    block_params: Vec<Vec<VReg>>,
    pub(crate) num_vregs: usize,
}

impl Function for Func {
    fn num_insts(&self) -> usize {
        self.insts.len()
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn entry_block(&self) -> Block {
        debug_assert!(!self.blocks.is_empty());
        Block::new(0)
    }

    fn block_insns(&self, block: Block) -> InstRange {
        self.blocks[block.index()]
    }

    fn block_succs(&self, block: Block) -> &[Block] {
        &self.block_succs[block.index()][..]
    }

    fn block_preds(&self, block: Block) -> &[Block] {
        &self.block_preds[block.index()][..]
    }

    fn block_params(&self, block: Block) -> &[VReg] {
        &self.block_params[block.index()][..]
    }

    fn is_ret(&self, insn: Inst) -> bool {
        self.insts[insn.index()].op == InstOpcode::Ret
    }

    fn is_branch(&self, insn: Inst) -> bool {
        self.insts[insn.index()].op == InstOpcode::Branch
    }

    fn branch_blockparams(&self, _: Block, insn: Inst, succ_idx: usize) -> &[VReg] {
        &self.insts[insn.index()].args[succ_idx][..]
    }

    fn inst_operands(&self, insn: Inst) -> &[Operand] {
        &self.insts[insn.index()].operands[..]
    }

    fn inst_clobbers(&self, insn: Inst) -> PRegSet {
        self.insts[insn.index()].clobbers
    }

    fn num_vregs(&self) -> usize {
        self.num_vregs
    }

    fn spillslot_size(&self, regclass: RegClass) -> usize {
        match regclass {
            RegClass::Int => 1,
            RegClass::Float => 2,
            RegClass::Vector => 4,
        }
    }
}

/// Assembles a `Func` block by block. Blocks are laid out in creation
/// order; edges are recorded in the order they are added.
pub struct FuncBuilder {
    f: Func,
    insts_per_block: Vec<Vec<InstData>>,
}

impl FuncBuilder {
    pub fn new() -> Self {
        FuncBuilder {
            f: Func::default(),
            insts_per_block: vec![],
        }
    }

    pub fn add_block(&mut self) -> Block {
        let b = Block::new(self.f.blocks.len());
        self.f
            .blocks
            .push(InstRange::new(Inst::new(0), Inst::new(0)));
        self.f.block_preds.push(vec![]);
        self.f.block_succs.push(vec![]);
        self.f.block_params.push(vec![]);
        self.insts_per_block.push(vec![]);
        b
    }

    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.f.block_succs[from.index()].push(to);
        self.f.block_preds[to.index()].push(from);
    }

    pub fn set_block_params(&mut self, block: Block, params: &[VReg]) {
        self.f.block_params[block.index()] = params.to_vec();
    }

    fn push(&mut self, block: Block, op: InstOpcode, operands: &[Operand], clobbers: PRegSet, args: Vec<Vec<VReg>>) {
        self.insts_per_block[block.index()].push(InstData {
            op,
            operands: operands.to_vec(),
            clobbers,
            args,
        });
    }

    pub fn push_inst(&mut self, block: Block, operands: &[Operand]) {
        self.push(block, InstOpcode::Op, operands, PRegSet::empty(), vec![]);
    }

    /// An instruction that also overwrites `clobbers`, like a call.
    pub fn push_call(&mut self, block: Block, operands: &[Operand], clobbers: PRegSet) {
        self.push(block, InstOpcode::Op, operands, clobbers, vec![]);
    }

    /// The branch ending `block`, with one argument list per successor
    /// in edge order.
    pub fn push_branch(&mut self, block: Block, operands: &[Operand], args: &[Vec<VReg>]) {
        self.push(block, InstOpcode::Branch, operands, PRegSet::empty(), args.to_vec());
    }

    pub fn push_ret(&mut self, block: Block, operands: &[Operand]) {
        self.push(block, InstOpcode::Ret, operands, PRegSet::empty(), vec![]);
    }

    pub fn finish(mut self) -> Func {
        let mut num_vregs = 0;
        let mut note = |v: VReg| num_vregs = core::cmp::max(num_vregs, v.vreg() + 1);
        for (block, insts) in self.insts_per_block.into_iter().enumerate() {
            let begin = self.f.insts.len();
            for inst in insts {
                inst.operands.iter().for_each(|op| note(op.vreg()));
                inst.args.iter().flatten().for_each(|&v| note(v));
                self.f.insts.push(inst);
            }
            let end = self.f.insts.len();
            self.f.blocks[block] = InstRange::new(Inst::new(begin), Inst::new(end));
            self.f.block_params[block].iter().for_each(|&v| note(v));
        }
        self.f.num_vregs = num_vregs;
        self.f
    }
}

impl core::fmt::Debug for Func {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(f, "{{")?;
        for (i, blockrange) in self.blocks.iter().enumerate() {
            let succs = self.block_succs[i]
                .iter()
                .map(|b| b.index())
                .collect::<Vec<_>>();
            let preds = self.block_preds[i]
                .iter()
                .map(|b| b.index())
                .collect::<Vec<_>>();
            let params = self.block_params[i]
                .iter()
                .map(|v| format!("v{}", v.vreg()))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  block{}({}): # succs:{:?} preds:{:?}",
                i, params, succs, preds
            )?;
            for inst in blockrange.iter() {
                let data = &self.insts[inst.index()];
                let mut line = format!("    inst{}: {:?} ops:{:?}", inst.index(), data.op, data.operands);
                if !data.clobbers.is_empty() {
                    line += &format!(" clobbers:{:?}", data.clobbers.into_iter().collect::<Vec<_>>());
                }
                if !data.args.is_empty() {
                    line += &format!(" args:{:?}", data.args);
                }
                writeln!(f, "{}", line)?;
            }
        }
        writeln!(f, "}}")
    }
}

/// Registers of the test machine: eight preferred and four
/// non-preferred integer registers, six float registers, and no
/// vector registers. `p15i` is reserved and never allocated.
pub fn machine_env() -> MachineEnv {
    fn regs(r: core::ops::Range<usize>, class: RegClass) -> Vec<PReg> {
        r.map(|i| PReg::new(i, class)).collect()
    }
    MachineEnv {
        preferred_regs_by_class: [
            regs(0..8, RegClass::Int),
            regs(0..4, RegClass::Float),
            vec![],
        ],
        non_preferred_regs_by_class: [
            regs(8..12, RegClass::Int),
            regs(4..6, RegClass::Float),
            vec![],
        ],
        scratch_by_class: [None, None, None],
    }
}

#[cfg(feature = "fuzzing")]
mod generate {
    use super::*;
    use crate::fuzzing::domtree;
    use libfuzzer_sys::arbitrary::{Arbitrary, Result, Unstructured};

    /// Shape of the generated programs.
    #[derive(Clone, Copy, Debug)]
    pub struct Options {
        pub fixed_regs: bool,
        pub clobbers: bool,
        pub control_flow: bool,
        pub block_params: bool,
        pub stack_uses: bool,
        pub late_operands: bool,
        pub float_values: bool,
    }

    impl Default for Options {
        fn default() -> Self {
            Options {
                fixed_regs: false,
                clobbers: false,
                control_flow: true,
                block_params: true,
                stack_uses: false,
                late_operands: false,
                float_values: false,
            }
        }
    }

    impl<'a> Arbitrary<'a> for Func {
        fn arbitrary(u: &mut Unstructured<'a>) -> Result<Func> {
            Func::arbitrary_with_options(u, &Options::default())
        }
    }

    fn choose_dominating_block(idom: &[Block], mut block: Block, u: &mut Unstructured) -> Result<Block> {
        loop {
            block = idom[block.index()];
            if block.is_invalid() || bool::arbitrary(u)? {
                return Ok(block);
            }
        }
    }

    fn constraint(u: &mut Unstructured, stack: bool) -> Result<OperandConstraint> {
        let choices: &[OperandConstraint] = if stack {
            &[OperandConstraint::Reg, OperandConstraint::Any, OperandConstraint::Stack]
        } else {
            &[OperandConstraint::Reg, OperandConstraint::Any]
        };
        Ok(*u.choose(choices)?)
    }

    impl Func {
        pub fn arbitrary_with_options(u: &mut Unstructured, opts: &Options) -> Result<Func> {
            // 1. An arbitrary CFG without critical edges.
            // 2. A list of values per block, some of them block params.
            // 3. Instructions defining the rest, whose uses are values
            //    of the same block defined earlier or values of a
            //    dominating block.
            let mut builder = FuncBuilder::new();
            let num_blocks = u.int_in_range(1..=24)?;
            for _ in 0..num_blocks {
                builder.add_block();
            }

            // A spine of single blocks or forks; the right arm of a
            // fork is an edge block that jumps back or forward to some
            // spine block.
            let mut from = 0;
            let mut out_blocks = vec![];
            let mut in_blocks = vec![];
            while from < num_blocks {
                if from > 0 {
                    in_blocks.push(from);
                }
                if opts.control_flow && num_blocks > 3 && from < num_blocks - 3 && bool::arbitrary(u)? {
                    builder.add_edge(Block::new(from), Block::new(from + 1));
                    builder.add_edge(Block::new(from), Block::new(from + 2));
                    builder.add_edge(Block::new(from + 2), Block::new(from + 3));
                    out_blocks.push(from + 1);
                    from += 2;
                } else if from < num_blocks - 1 {
                    builder.add_edge(Block::new(from), Block::new(from + 1));
                }
                from += 1;
            }
            for pred in out_blocks {
                if !in_blocks.is_empty() && bool::arbitrary(u)? {
                    let succ = *u.choose(&in_blocks[..])?;
                    builder.add_edge(Block::new(pred), Block::new(succ));
                }
            }

            let postorder = domtree::postorder(num_blocks, Block::new(0), &builder.f.block_succs);
            let idom = domtree::calculate(num_blocks, &builder.f.block_preds, &postorder, Block::new(0));

            let mut vregs_by_block = vec![];
            let mut to_define = vec![];
            let mut num_vregs = 0;
            for block in 0..num_blocks {
                let mut vregs = vec![];
                let mut params = vec![];
                let mut defs = vec![];
                let mut max_params = u.int_in_range(0..=3)?;
                for _ in 0..u.int_in_range(2..=10)? {
                    let class = if opts.float_values && u.ratio(1, 4)? {
                        RegClass::Float
                    } else {
                        RegClass::Int
                    };
                    let vreg = VReg::new(num_vregs, class);
                    num_vregs += 1;
                    vregs.push(vreg);
                    if block > 0 && opts.block_params && max_params > 0 && bool::arbitrary(u)? {
                        params.push(vreg);
                        max_params -= 1;
                    } else {
                        defs.push(vreg);
                    }
                }
                builder.set_block_params(Block::new(block), &params);
                vregs_by_block.push(vregs);
                to_define.push(defs);
            }

            let env = machine_env();
            for block in 0..num_blocks {
                let mut avail = builder.f.block_params[block].clone();
                for &vreg in to_define[block].iter() {
                    let def_pos = if opts.late_operands && bool::arbitrary(u)? {
                        OperandPos::Early
                    } else {
                        OperandPos::Late
                    };
                    let mut operands = vec![Operand::new(
                        vreg,
                        constraint(u, false)?,
                        OperandKind::Def,
                        def_pos,
                    )];
                    for _ in 0..u.int_in_range(0..=3)? {
                        let used = if !avail.is_empty() && bool::arbitrary(u)? {
                            *u.choose(&avail[..])?
                        } else {
                            let dom = choose_dominating_block(&idom, Block::new(block), u)?;
                            if dom.is_invalid() {
                                break;
                            }
                            *u.choose(&vregs_by_block[dom.index()][..])?
                        };
                        if operands.iter().any(|op| op.vreg() == used) {
                            continue;
                        }
                        let pos = if opts.late_operands && u.ratio(1, 4)? {
                            OperandPos::Late
                        } else {
                            OperandPos::Early
                        };
                        operands.push(Operand::new(
                            used,
                            constraint(u, opts.stack_uses)?,
                            OperandKind::Use,
                            pos,
                        ));
                    }

                    // Fixed registers are distinct within one instruction
                    // and never clobbered by it.
                    let mut taken = PRegSet::empty();
                    if opts.fixed_regs && bool::arbitrary(u)? {
                        for i in 0..operands.len() {
                            if !u.ratio(1, 2)? {
                                continue;
                            }
                            let op = operands[i];
                            let regs = &env.preferred_regs_by_class[op.class().index()];
                            if regs.is_empty() {
                                continue;
                            }
                            let preg = *u.choose(&regs[..])?;
                            if taken.contains(preg) {
                                continue;
                            }
                            taken.add(preg);
                            operands[i] = Operand::new(
                                op.vreg(),
                                OperandConstraint::FixedReg(preg),
                                op.kind(),
                                op.pos(),
                            );
                        }
                    }

                    let mut clobbers = PRegSet::empty();
                    if opts.clobbers && u.ratio(1, 4)? {
                        for _ in 0..u.int_in_range(1..=4)? {
                            let preg = PReg::new(u.int_in_range(0..=11)?, RegClass::Int);
                            if !taken.contains(preg) {
                                clobbers.add(preg);
                            }
                        }
                    }
                    builder.push_call(Block::new(block), &operands, clobbers);
                    avail.push(vreg);
                }

                let succs = builder.f.block_succs[block].clone();
                if succs.is_empty() {
                    let mut operands = vec![];
                    if let Some(&v) = avail.last() {
                        operands.push(Operand::reg_use(v));
                    }
                    builder.push_ret(Block::new(block), &operands);
                    continue;
                }
                let mut args = vec![];
                for succ in succs {
                    let mut succ_args = vec![];
                    for param in builder.f.block_params[succ.index()].clone() {
                        let dom = choose_dominating_block(&idom, Block::new(block), u)?;
                        let candidates: Vec<VReg> = if dom.is_valid() && bool::arbitrary(u)? {
                            vregs_by_block[dom.index()].clone()
                        } else {
                            avail.clone()
                        };
                        let candidates: Vec<VReg> = candidates
                            .into_iter()
                            .filter(|v| v.class() == param.class())
                            .collect();
                        match candidates.first() {
                            Some(_) => succ_args.push(*u.choose(&candidates[..])?),
                            None => {
                                let vreg = VReg::new(num_vregs, param.class());
                                num_vregs += 1;
                                builder.push_inst(Block::new(block), &[Operand::reg_def(vreg)]);
                                succ_args.push(vreg);
                            }
                        }
                    }
                    args.push(succ_args);
                }
                builder.push_branch(Block::new(block), &[], &args);
            }

            Ok(builder.finish())
        }
    }
}

#[cfg(feature = "fuzzing")]
pub use generate::Options;

#[cfg(all(test, feature = "fuzzing"))]
mod tests {
    use super::*;
    use crate::checker::Checker;
    use crate::trace::{TraceBuilderKind, TraceBuilderResult};
    use crate::{AllocationContext, EditMoveFactory, RegallocOptions};
    use libfuzzer_sys::arbitrary::Unstructured;

    /// Deterministic filler bytes for the generator.
    fn bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn generated_functions_allocate_and_check() {
        let opts = Options {
            fixed_regs: true,
            clobbers: true,
            control_flow: true,
            block_params: true,
            stack_uses: true,
            late_operands: true,
            float_values: true,
        };
        let env = machine_env();
        for seed in 0..64 {
            let data = bytes(seed, 16 * 1024);
            let mut u = Unstructured::new(&data);
            let f = Func::arbitrary_with_options(&mut u, &opts).unwrap();
            for kind in [TraceBuilderKind::UniDirectional, TraceBuilderKind::SingleBlock] {
                let traces = TraceBuilderResult::build(&f, kind).unwrap();
                let ctx = AllocationContext::new(&EditMoveFactory, &env, &traces);
                let options = RegallocOptions {
                    verbose_log: false,
                    validate_ssa: true,
                };
                let out = crate::run(&f, &ctx, &options).unwrap();
                let mut checker = Checker::new(&f);
                checker.prepare(&out);
                if let Err(e) = checker.run() {
                    panic!("seed {}: {:?}\n{:?}", seed, e, f);
                }
            }
        }
    }
}
