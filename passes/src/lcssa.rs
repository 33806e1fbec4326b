//! Loop-closed SSA form.
//!
//! After this pass, a value defined inside a loop is only used outside of it
//! through a dedicated parameter of the block it escapes to: jumps into such
//! blocks pass the value explicitly, and the block rebinds it. Loop-closing
//! transforms (and anything else that moves loop bodies around) rely on this
//! to keep every use locally satisfied.
//!
//! The pass walks each function along its dominator tree. Before an
//! abstraction's body is rewritten, every named block it immediately
//! dominates is recreated as a shell, with one extra phi parameter per value
//! that leaks out of a loop into it; jumps into such blocks then grow the
//! matching argument. Each block's own body is rewritten under a scoped
//! overlay of the memo table, so the leaked values resolve to the phi
//! parameters inside the block and to their ordinary images outside.

use std::collections::HashMap;

use ir::analysis::cfg::Cfg;
use ir::analysis::free::free_variables;
use ir::analysis::looptree::LoopTree;
use ir::analysis::schedule::Scheduler;
use ir::analysis::uses::UsesMap;
use ir::arena::IrArena;
use ir::module::Module;
use ir::node::{Node, Payload};
use ir::rewrite::{
    recreate_decl_header_identity, recreate_node_identity, recreate_params, rewrite_module,
    rewrite_nodes, rw, Rewrite, Rewriter,
};
use ir::visit::ClassMask;
use log::debug;

use crate::CompilerConfig;

struct FnAnalyses<'s> {
    cfg: Cfg<'s>,
    uses: UsesMap<'s>,
    loop_tree: LoopTree,
}

struct Context<'s, 'd> {
    rewriter: Rewriter<'s, 'd>,
    analyses: Option<FnAnalyses<'s>>,
    /// Extra arguments appended to every jump into a lifted block.
    lifted_args: HashMap<Node<'s>, Vec<Node<'d>>>,
}

impl<'s, 'd> Context<'s, 'd> {
    /// The variables used under `block` whose defining loop does not enclose
    /// the block's own loop.
    fn find_liftable_loop_values(&self, block: Node<'s>) -> Vec<Node<'s>> {
        let analyses = self.analyses.as_ref().expect("no function context");
        let block_idx = analyses.cfg.lookup(block).expect("block not in this CFG");
        let block_loop =
            analyses.loop_tree.enclosing_loop(analyses.loop_tree.lookup(block_idx));

        let mut scheduler = Scheduler::build(&analyses.cfg, &analyses.uses);
        let fvs = free_variables(&mut scheduler, &analyses.cfg, block);

        let mut lifted = Vec::new();
        for fv in fvs {
            let Some(def_home) = scheduler.schedule_instruction(fv) else { continue };
            let def_loop =
                analyses.loop_tree.enclosing_loop(analyses.loop_tree.lookup(def_home));
            if !analyses.loop_tree.is_within(def_loop, block_loop) {
                debug!("lcssa: {fv} is used outside of the loop that defines it");
                lifted.push(fv);
            }
        }
        lifted
    }

    /// Recreates the named blocks `abs` immediately dominates, runs
    /// `rewrite_inner`, then fills in the blocks' bodies under scoped
    /// overlays mapping the leaked values to their phi parameters.
    fn process_abstraction(
        &mut self,
        a: &mut IrArena<'d>,
        m: &mut Module<'d>,
        abs: Node<'s>,
        rewrite_inner: Box<dyn FnOnce(&mut Self, &mut IrArena<'d>, &mut Module<'d>) -> Node<'d> + '_>,
    ) -> Node<'d> {
        let children: Vec<Node<'s>> = match self.analyses.as_ref() {
            Some(analyses) => match analyses.cfg.lookup(abs) {
                Some(n) => analyses
                    .cfg
                    .node(n)
                    .dominates
                    .iter()
                    .filter_map(|&c| {
                        let child = analyses.cfg.node(c).node;
                        (child.is_basic_block() && !child.is_case()).then_some(child)
                    })
                    .collect(),
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        let mut pending: Vec<(Node<'s>, Node<'d>, Vec<Node<'s>>, Vec<Node<'d>>)> = Vec::new();
        for child in children {
            let lifted = self.find_liftable_loop_values(child);
            let mut phi_params = Vec::new();
            let mut extra_args = Vec::new();
            for fv in &lifted {
                let narg = rw(self, a, m, *fv);
                let phi = Node::param(narg.ty(), Some("lcssa_phi"), a);
                extra_args.push(narg);
                phi_params.push(phi);
            }

            let base_params = recreate_params(self, a, m, child.abstraction_params());
            let mut all_params: Vec<Node<'d>> = base_params.as_slice().to_vec();
            all_params.extend_from_slice(&phi_params);
            let all_params = a.nodes(&all_params);
            let name = child.abstraction_name().expect("named block");
            let new_child = Node::basic_block(all_params, name, a);
            self.rewriter.register_processed(child, new_child);
            self.rewriter.register_processed_list(child.abstraction_params(), base_params);
            self.lifted_args.insert(child, extra_args);
            pending.push((child, new_child, lifted, phi_params));
        }

        let result = rewrite_inner(self, a, m);

        for (child, new_child, lifted, phi_params) in pending {
            let saved = self.rewriter.save();
            for (fv, phi) in lifted.iter().zip(phi_params.iter()) {
                self.rewriter.forget(*fv);
                self.rewriter.register_processed(*fv, *phi);
            }
            let child_body = child.abstraction_body().expect("block without a body");
            let new_child_body =
                self.process_abstraction(a, m, child, Box::new(|s, a, m| rw(s, a, m, child_body)));
            new_child.set_abstraction_body(new_child_body);
            self.rewriter.restore(saved);
        }

        result
    }
}

impl<'s, 'd> Rewrite<'s, 'd> for Context<'s, 'd> {
    fn rewriter(&mut self) -> &mut Rewriter<'s, 'd> {
        &mut self.rewriter
    }

    fn rewrite_node(
        &mut self,
        a: &mut IrArena<'d>,
        m: &mut Module<'d>,
        node: Node<'s>,
    ) -> Option<Node<'d>> {
        match *node {
            Payload::Function(_) => {
                let cfg = Cfg::build(node);
                let uses = UsesMap::build(&[node], ClassMask::EMPTY);
                let loop_tree = LoopTree::build(&cfg);
                let outer = self.analyses.replace(FnAnalyses { cfg, uses, loop_tree });

                let new = recreate_decl_header_identity(self, a, m, node);
                if let Some(body) = node.abstraction_body() {
                    let new_body =
                        self.process_abstraction(a, m, node, Box::new(|s, a, m| rw(s, a, m, body)));
                    new.set_abstraction_body(new_body);
                }

                self.analyses = outer;
                Some(new)
            },
            // let tails and cases are dominator-tree nodes of their own and
            // may immediately dominate blocks
            Payload::AnonLambda { .. } if self.analyses.is_some() => {
                let new = self.process_abstraction(a, m, node, Box::new(|s, a, m| {
                    recreate_node_identity(s, a, m, node)
                }));
                Some(new)
            },
            Payload::BasicBlock(bb) if bb.name.is_none() && self.analyses.is_some() => {
                let new = self.process_abstraction(a, m, node, Box::new(|s, a, m| {
                    recreate_node_identity(s, a, m, node)
                }));
                Some(new)
            },
            Payload::Jump { target, args, mem } => {
                let mut nargs: Vec<Node<'d>> =
                    rewrite_nodes(self, a, m, args).as_slice().to_vec();
                if let Some(extra) = self.lifted_args.get(&target) {
                    nargs.extend_from_slice(extra);
                }
                let nargs = a.nodes(&nargs);
                let ntarget = rw(self, a, m, target);
                let nmem = rw(self, a, m, mem);
                Some(Node::jump(ntarget, nargs, nmem, a))
            },
            Payload::BasicBlock(bb) if bb.name.is_some() => {
                panic!("named blocks are recreated by their dominating abstraction")
            },
            _ => Some(recreate_node_identity(self, a, m, node)),
        }
    }
}

/// Rewrites a module into loop-closed SSA form.
pub fn lcssa<'s, 'd>(
    _config: &CompilerConfig,
    a: &mut IrArena<'d>,
    src: &Module<'s>,
) -> Module<'d> {
    let mut dst = Module::new(src.name());
    let mut ctx = Context {
        rewriter: Rewriter::new(),
        analyses: None,
        lifted_args: HashMap::new(),
    };
    rewrite_module(&mut ctx, a, &mut dst, src);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::arena::{use_arena, ArenaConfig};
    use ir::builder::BodyBuilder;
    use ir::node::Op;

    /// A loop whose running value is used after the loop exits. The loop is
    /// closed and left through jumps inside the cases of a structured if:
    ///
    /// ```text
    /// f():
    ///   jump header(10)
    /// header(i):
    ///   n = i - 1
    ///   if (n > 0) { jump header(n) } else { jump exit() }
    ///   unreachable
    /// exit():
    ///   return (n)        // n leaks out of the loop
    /// ```
    fn build_leaky_loop<'a>(a: &mut IrArena<'a>) -> Module<'a> {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let empty = a.nodes(&[]);
        let returns = a.nodes(&[uniform_u32]);
        let fun = Node::function(&mut module, empty, "f", empty, returns, a);
        let fun_mem = fun.abstraction_mem(a);

        let i = Node::param(Some(uniform_u32), Some("i"), a);
        let header_params = a.nodes(&[i]);
        let header = Node::basic_block(header_params, "header", a);
        let exit = Node::basic_block(empty, "exit", a);

        let header_mem = header.abstraction_mem(a);
        let mut hb = BodyBuilder::begin_body_with_mem(header_mem);
        let one = Node::uint32_literal(1, a);
        let sub_ops = a.nodes(&[i, one]);
        let n = hb.gen_primop_e(a, Op::Sub, empty, sub_ops);
        let zero = Node::uint32_literal(0, a);
        let cmp_ops = a.nodes(&[n, zero]);
        let cond = hb.gen_primop_e(a, Op::Gt, empty, cmp_ops);

        let again = Node::case(empty, a);
        let again_mem = again.abstraction_mem(a);
        let back_args = a.nodes(&[n]);
        again.set_abstraction_body(Node::jump(header, back_args, again_mem, a));

        let leave = Node::case(empty, a);
        let leave_mem = leave.abstraction_mem(a);
        leave.set_abstraction_body(Node::jump(exit, empty, leave_mem, a));

        let _ = hb.gen_if(a, empty, cond, again, Some(leave));
        let terminator = Node::unreachable(hb.mem(), a);
        header.set_abstraction_body(hb.finish_body(a, terminator));

        let exit_mem = exit.abstraction_mem(a);
        let rets = a.nodes(&[n]);
        exit.set_abstraction_body(Node::fn_ret(rets, exit_mem, a));

        let bb = BodyBuilder::begin_body_with_mem(fun_mem);
        let ten = Node::uint32_literal(10, a);
        let init = a.nodes(&[ten]);
        let jump = Node::jump(header, init, bb.mem(), a);
        fun.set_abstraction_body(bb.finish_body(a, jump));
        module
    }

    #[test]
    fn leaking_values_get_phi_parameters() {
        use_arena(ArenaConfig::default(), |arena| {
            let module = build_leaky_loop(arena);
            let config = CompilerConfig::default();
            let out = lcssa(&config, arena, &module);

            let fun = out.find_declaration("f").unwrap();
            let cfg = Cfg::build(fun);
            let exit = (0..cfg.len())
                .find(|&idx| cfg.node(idx).node.abstraction_name() == Some("exit"))
                .map(|idx| cfg.node(idx).node)
                .unwrap();

            // the exit block gained a phi for the leaked value and returns it
            let params = exit.abstraction_params();
            assert_eq!(params.len(), 1);
            let Payload::Return { args, .. } = *exit.abstraction_body().unwrap() else {
                panic!("expected a return");
            };
            assert_eq!(args.as_slice(), params.as_slice());

            // the loop itself is unchanged: the back edge still passes one
            // argument and the header kept its single parameter
            let header = (0..cfg.len())
                .find(|&idx| cfg.node(idx).node.abstraction_name() == Some("header"))
                .map(|idx| cfg.node(idx).node)
                .unwrap();
            assert_eq!(header.abstraction_params().len(), 1);
        });
    }

    #[test]
    fn loop_free_functions_are_untouched() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = Module::new("m");
            let empty = arena.nodes(&[]);
            let fun = Node::function(&mut module, empty, "nop", empty, empty, arena);
            let mem = fun.abstraction_mem(arena);
            fun.set_abstraction_body(Node::fn_ret(empty, mem, arena));

            let config = CompilerConfig::default();
            let out = lcssa(&config, arena, &module);
            let printed_src = ir::print::print_module_into_string(&module);
            let printed_out = ir::print::print_module_into_string(&out);
            assert_eq!(printed_src, printed_out);
        });
    }
}
