/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The read-only collaborators of one allocation run.

use crate::trace::TraceBuilderResult;
use crate::{Allocation, Edit, MachineEnv, RegClass};

/// Synthesizes move instructions between two storage locations.
///
/// The allocator itself only records moves as `Edit`s; a client turns
/// them into its own instructions through `Output::emit_moves`.
pub trait MoveFactory {
    /// The client's move instruction.
    type Move;

    /// Build a move of a `class` value from `from` to `to`.
    fn create_move(&self, from: Allocation, to: Allocation, class: RegClass) -> Self::Move;

    /// Can the target copy a `class` value directly between two stack
    /// slots? If not, such moves are routed through a register.
    fn allows_stack_to_stack(&self, _class: RegClass) -> bool {
        false
    }
}

/// A move factory that hands back the allocator's own `Edit`s.
#[derive(Clone, Copy, Debug, Default)]
pub struct EditMoveFactory;

impl MoveFactory for EditMoveFactory {
    type Move = Edit;

    fn create_move(&self, from: Allocation, to: Allocation, class: RegClass) -> Edit {
        Edit::Move { from, to, class }
    }
}

/// Everything an allocation run reads besides the function itself.
///
/// The context only borrows its parts, so one `MachineEnv` and one
/// move factory can serve many concurrent runs.
pub struct AllocationContext<'a, M: MoveFactory> {
    pub move_factory: &'a M,
    pub env: &'a MachineEnv,
    pub traces: &'a TraceBuilderResult,
}

impl<'a, M: MoveFactory> AllocationContext<'a, M> {
    pub fn new(move_factory: &'a M, env: &'a MachineEnv, traces: &'a TraceBuilderResult) -> Self {
        Self {
            move_factory,
            env,
            traces,
        }
    }
}

impl<'a, M: MoveFactory> Clone for AllocationContext<'a, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, M: MoveFactory> Copy for AllocationContext<'a, M> {}
