//! The glint intermediate representation.
//!
//! This crate is the kernel of the compiler: an arena-allocated, hash-consed
//! universe of IR nodes for a structured, SPIR-V-like shader language,
//! together with the machinery every pass is built from. Nodes are created
//! with the constructors in [`node`], inside an arena obtained from
//! [`arena::use_arena`]; the [`builder`] module assembles instruction
//! sequences into bodies, [`rewrite`] maps whole modules between arenas, and
//! [`analysis`] derives control-flow structure from the result.

#![deny(clippy::correctness, clippy::perf, clippy::suspicious)]
#![allow(
    clippy::match_same_arms,
    clippy::min_ident_chars,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_arguments,
    clippy::wildcard_enum_match_arm
)]
#![cfg_attr(
    test,
    allow(
        clippy::too_many_lines,
        clippy::unwrap_used,
        clippy::wildcard_imports,
    )
)]

pub mod analysis;
pub mod arena;
pub mod builder;
mod fold;
pub mod module;
pub mod node;
pub mod print;
pub mod rewrite;
pub mod type_checker;
pub mod visit;
