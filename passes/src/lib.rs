//! The transformation passes and the thin driver surface that runs them.
//!
//! A pass is a function from a source module to a destination module,
//! threaded through a [`CompilerConfig`]. Passes are rewriters: they embed
//! the memoized traversal from [`ir::rewrite`] and override it for the nodes
//! they transform.

#![deny(clippy::correctness, clippy::perf, clippy::suspicious)]
#![allow(
    clippy::match_same_arms,
    clippy::min_ident_chars,
    clippy::module_name_repetitions,
    clippy::wildcard_enum_match_arm
)]

pub mod cleanup;
pub mod lcssa;
pub mod lift_globals;

use ir::arena::IrArena;
use ir::module::Module;
use log::{debug, info};

/// Version of the SPIR-V target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpirvVersion {
    pub major: u8,
    pub minor: u8,
}

/// Which polyfills the lowering passes apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoweringToggles {
    pub emulate_subgroup_ops: bool,
    pub emulate_subgroup_ops_extended_types: bool,
    pub simt_to_explicit_simd: bool,
    pub int64: bool,
}

/// Workarounds for driver quirks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hacks {
    pub spv_shuffle_instead_of_broadcast_first: bool,
}

/// Instrumentation inserted into the generated shaders.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceToggles {
    pub memory_accesses: bool,
    pub stack_accesses: bool,
    pub god_function: bool,
    pub stack_size: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ShaderDiagnostics {
    pub max_top_iterations: u32,
}

/// What the module dumps between passes leave out.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingConfig {
    pub skip_generated: bool,
    pub skip_builtin: bool,
}

/// Configuration threaded through every pass.
#[derive(Clone, Copy, Debug)]
pub struct CompilerConfig {
    pub allow_frontend_syntax: bool,
    pub dynamic_scheduling: bool,
    pub per_thread_stack_size: u32,
    pub per_subgroup_stack_size: u32,
    pub subgroup_size: u32,
    pub target_spirv_version: SpirvVersion,
    pub lower: LoweringToggles,
    pub hacks: Hacks,
    pub printf_trace: TraceToggles,
    pub shader_diagnostics: ShaderDiagnostics,
    pub logging: LoggingConfig,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            allow_frontend_syntax: false,
            dynamic_scheduling: true,
            per_thread_stack_size: 4096,
            per_subgroup_stack_size: 1024,
            subgroup_size: 32,
            target_spirv_version: SpirvVersion { major: 1, minor: 4 },
            lower: LoweringToggles::default(),
            hacks: Hacks::default(),
            printf_trace: TraceToggles::default(),
            shader_diagnostics: ShaderDiagnostics { max_top_iterations: 10 },
            logging: LoggingConfig::default(),
        }
    }
}

/// Dumps a module at debug level, honouring the logging skip flags.
pub fn log_module(config: &CompilerConfig, module: &Module) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    for decl in module.declarations() {
        if config.logging.skip_generated && decl.lookup_annotation("Generated").is_some() {
            continue;
        }
        if config.logging.skip_builtin && decl.lookup_annotation("Builtin").is_some() {
            continue;
        }
        let mut out = String::new();
        let mut printer = ir::print::Printer::default();
        let _ = printer.print_declaration(&mut out, *decl);
        debug!("{}", out.trim_end());
    }
}

/// Runs the standard mid-end pipeline over a module, within one arena.
pub fn run_default_pipeline<'a>(
    config: &CompilerConfig,
    a: &mut IrArena<'a>,
    module: Module<'a>,
) -> Module<'a> {
    info!("pass: cleanup");
    let module = cleanup::cleanup(config, a, module);
    log_module(config, &module);

    info!("pass: lcssa");
    let module = lcssa::lcssa(config, a, &module);
    log_module(config, &module);

    info!("pass: lift_globals");
    let module = lift_globals::lift_globals(config, a, &module);
    log_module(config, &module);

    module
}
