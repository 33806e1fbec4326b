//! The glint driver.
//!
//! There is no front-end here: the driver builds a small demonstration
//! compute module through the public builder API, runs the mid-end pipeline
//! over it, and dumps the result in the requested forms. It exists to
//! exercise the whole tower end to end and to give the CFG dump a home.

use std::fs::File;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use colored::Colorize;
use ir::analysis::cfg::dump_cfg;
use ir::arena::{use_arena, ArenaConfig, IrArena};
use ir::builder::BodyBuilder;
use ir::module::Module;
use ir::node::{AddressSpace, Node, Op};
use ir::print::print_module_into_string;
use passes::{run_default_pipeline, CompilerConfig};

/// Command line arguments, interpreted with `clap`.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// print the module after the pipeline
    #[arg(long)]
    dump_ir: bool,
    /// write a DOT dump of every function's CFG to this path
    #[arg(long)]
    dump_cfg: Option<PathBuf>,
    /// increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A little compute kernel: reads a lifted global, conditionally clears the
/// output, and accumulates over a block of memory.
///
/// ```text
/// var Global u32 @len = 16;
/// fn @accumulate(data: ptr<Global, [u32]>, out: ptr<Global, u32>) {
///   n = load @len
///   v = load out
///   if (v != 0) { store out, 0 }
///   jump loop(0, 0)
/// loop(i, acc):
///   if (i < n) { jump body() } else { jump done() }
///   unreachable
/// body():
///   x = load lea(data, 0, [i])
///   jump loop(i + 1, acc + x)
/// done():
///   store out, acc
///   return ()
/// }
/// ```
fn build_demo_module<'a>(a: &mut IrArena<'a>) -> Module<'a> {
    let mut module = Module::new("demo");
    let empty = a.nodes(&[]);
    let u32_t = Node::uint32_type(a);
    let uniform_u32 = Node::qualified_type(true, u32_t, a);

    let len = Node::global_var(&mut module, empty, u32_t, "len", AddressSpace::Global, a);
    let sixteen = Node::uint32_literal(16, a);
    len.set_global_init(sixteen);

    let arr_t = Node::arr_type(u32_t, None, a);
    let data_ptr_t = Node::ptr_type(AddressSpace::Global, arr_t, a);
    let data_qptr = Node::qualified_type(true, data_ptr_t, a);
    let data = Node::param(Some(data_qptr), Some("data"), a);
    let out_ptr_t = Node::ptr_type(AddressSpace::Global, u32_t, a);
    let out_qptr = Node::qualified_type(true, out_ptr_t, a);
    let out = Node::param(Some(out_qptr), Some("out"), a);
    let params = a.nodes(&[data, out]);
    let fun = Node::function(&mut module, params, "accumulate", empty, empty, a);
    let fun_mem = fun.abstraction_mem(a);

    let zero = Node::uint32_literal(0, a);
    let one = Node::uint32_literal(1, a);

    // loop header and its continuations
    let i = Node::param(Some(uniform_u32), Some("i"), a);
    let acc = Node::param(Some(uniform_u32), Some("acc"), a);
    let header_params = a.nodes(&[i, acc]);
    let header = Node::basic_block(header_params, "loop", a);
    let body = Node::basic_block(empty, "body", a);
    let done = Node::basic_block(empty, "done", a);

    // entry: read the global length, clear a dirty output, enter the loop
    let mut eb = BodyBuilder::begin_body_with_mem(fun_mem);
    let len_ref = Node::ref_decl(len, a);
    let n = eb.gen_load(a, len_ref);
    let v = eb.gen_load(a, out);
    let dirty_ops = a.nodes(&[v, zero]);
    let dirty = eb.gen_primop_e(a, Op::Neq, empty, dirty_ops);
    let clear_case = Node::case(empty, a);
    let clear_mem = clear_case.abstraction_mem(a);
    let mut cb = BodyBuilder::begin_body_with_mem(clear_mem);
    cb.gen_store(a, out, zero);
    clear_case.set_abstraction_body(cb.finish_body_with_selection_merge(a, empty));
    let _ = eb.gen_if(a, empty, dirty, clear_case, None);
    let init = a.nodes(&[zero, zero]);
    let enter = Node::jump(header, init, eb.mem(), a);
    fun.set_abstraction_body(eb.finish_body(a, enter));

    // loop: test the counter, jump into the body or out
    let header_mem = header.abstraction_mem(a);
    let mut hb = BodyBuilder::begin_body_with_mem(header_mem);
    let cmp_ops = a.nodes(&[i, n]);
    let cond = hb.gen_primop_e(a, Op::Lt, empty, cmp_ops);
    let into_body = Node::case(empty, a);
    let into_body_mem = into_body.abstraction_mem(a);
    into_body.set_abstraction_body(Node::jump(body, empty, into_body_mem, a));
    let into_done = Node::case(empty, a);
    let into_done_mem = into_done.abstraction_mem(a);
    into_done.set_abstraction_body(Node::jump(done, empty, into_done_mem, a));
    let _ = hb.gen_if(a, empty, cond, into_body, Some(into_done));
    let unreachable = Node::unreachable(hb.mem(), a);
    header.set_abstraction_body(hb.finish_body(a, unreachable));

    // body: accumulate one element, continue
    let body_mem = body.abstraction_mem(a);
    let mut bb = BodyBuilder::begin_body_with_mem(body_mem);
    let indices = a.nodes(&[i]);
    let slot = bb.gen_lea(a, data, zero, indices);
    let x = bb.gen_load(a, slot);
    let next_i_ops = a.nodes(&[i, one]);
    let next_i = bb.gen_primop_e(a, Op::Add, empty, next_i_ops);
    let next_acc_ops = a.nodes(&[acc, x]);
    let next_acc = bb.gen_primop_e(a, Op::Add, empty, next_acc_ops);
    let again = a.nodes(&[next_i, next_acc]);
    let continue_ = Node::jump(header, again, bb.mem(), a);
    body.set_abstraction_body(bb.finish_body(a, continue_));

    // done: write the result back
    let done_mem = done.abstraction_mem(a);
    let mut db = BodyBuilder::begin_body_with_mem(done_mem);
    db.gen_store(a, out, acc);
    let ret = Node::fn_ret(empty, db.mem(), a);
    done.set_abstraction_body(db.finish_body(a, ret));

    module
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let config = CompilerConfig::default();
    use_arena(ArenaConfig::default(), |arena| {
        let module = build_demo_module(arena);
        let module = run_default_pipeline(&config, arena, module);

        if args.dump_ir {
            print!("{}", print_module_into_string(&module));
        }
        if let Some(path) = &args.dump_cfg {
            let mut file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            dump_cfg(&mut file, &module).context("cannot write the CFG dump")?;
            println!("{} wrote {}", "\u{2713}".green(), path.display());
        }

        println!(
            "{} compiled module '{}' ({} declarations)",
            "\u{2713}".green(),
            module.name(),
            module.declarations().len()
        );
        Ok(())
    })
}
