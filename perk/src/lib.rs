//! The perk runtime: a JIT-compiled dynamic language core on cooperative
//! fibers with a two-tier garbage-collected heap.
//!
//! `.prk` sources are compiled (by the bootstrap compiler module) into
//! `.pck` AST files; the runtime loads them, lazily compiles each function
//! into native stubs that call back into the helper surface in [`exec`],
//! and schedules fibers over a worker pool.

pub mod ast;
pub mod builtins;
pub mod exec;
pub mod fiber;
pub mod frame;
pub mod jit;
pub mod objects;
pub mod pack;
pub mod runtime;
pub mod scheduler;
pub mod stack;

pub use runtime::Runtime;
