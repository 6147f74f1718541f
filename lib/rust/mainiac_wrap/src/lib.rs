// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]

//! Numbering of immune-receptor amino-acid sequences with MAFFT and the
//! MAINIAC post-processors, one sample at a time or as a batch dispatched
//! to an LSF queue.

pub mod dispatch;
pub mod env;
pub mod pipeline;
pub mod queue;
pub mod queue_args;
pub mod sample;
pub mod tool;
pub mod utils;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
