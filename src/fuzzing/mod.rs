/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Test and fuzzing support: a simple function representation and,
//! with the `fuzzing` feature, the internals the fuzz targets drive.

pub mod domtree;
pub mod func;

#[cfg(feature = "fuzzing")]
pub use libfuzzer_sys::{arbitrary, fuzz_target};

#[cfg(feature = "fuzzing")]
pub mod moves {
    pub use crate::moves::{MoveVec, ParallelMoves, ResolvedMoves, ScratchResolver};
}
