//! Derived structures: control-flow graphs, dominator trees, loop trees, use
//! maps, instruction scheduling and free-variable computation. Analyses never
//! mutate nodes; they are rebuilt from scratch whenever a pass needs them.

pub mod cfg;
pub mod free;
pub mod looptree;
pub mod schedule;
pub mod uses;
