//! Cleanup: basic-block inlining and dead-block removal, run to a fixpoint.
//!
//! A block that is the target of at most one plain jump is erased; the jump
//! that pointed at it steals its body, substituting the jump arguments for
//! the block's parameters and splicing the memory chains together. Blocks
//! used by anything other than plain jumps are left alone.

use ir::arena::IrArena;
use ir::module::Module;
use ir::node::{Node, Payload};
use ir::rewrite::{
    recreate_node_identity, rewrite_module, rewrite_node, rewrite_nodes, rw, Rewrite, Rewriter,
};
use ir::analysis::uses::UsesMap;
use ir::visit::OperandClass;
use log::debug;

use crate::CompilerConfig;

struct Context<'a> {
    rewriter: Rewriter<'a, 'a>,
    uses: Option<UsesMap<'a>>,
    todo: bool,
}

impl<'a> Rewrite<'a, 'a> for Context<'a> {
    fn rewriter(&mut self) -> &mut Rewriter<'a, 'a> {
        &mut self.rewriter
    }

    fn rewrite_node(
        &mut self,
        a: &mut IrArena<'a>,
        m: &mut Module<'a>,
        node: Node<'a>,
    ) -> Option<Node<'a>> {
        match *node {
            // use counts are scoped per top-level declaration
            Payload::Function(_) | Payload::Constant(_) => {
                let exclude = OperandClass::Type.mask().union(OperandClass::Declaration.mask());
                let outer = self.uses.replace(UsesMap::build(&[node], exclude));
                let new = recreate_node_identity(self, a, m, node);
                self.uses = outer;
                Some(new)
            },
            Payload::BasicBlock(_) => {
                let uses = self.uses.as_ref().expect("basic block outside a declaration");
                match uses.count_block_calls(node) {
                    Some(count) if count <= 1 => {
                        debug!(
                            "eliminating basic block '{}', used {count} times",
                            node.abstraction_name().unwrap_or("<case>")
                        );
                        self.todo = true;
                        None
                    },
                    _ => Some(recreate_node_identity(self, a, m, node)),
                }
            },
            Payload::Jump { target, args, mem } => {
                match rewrite_node(self, a, m, target) {
                    Some(_) => Some(recreate_node_identity(self, a, m, node)),
                    // the target was inlined away: steal its body
                    None => {
                        let nargs = rewrite_nodes(self, a, m, args);
                        self.rewriter.register_processed_list(
                            target.abstraction_params(),
                            nargs,
                        );
                        let target_mem = target.abstraction_mem(a);
                        let nmem = rw(self, a, m, mem);
                        self.rewriter.register_processed(target_mem, nmem);
                        let body = target.abstraction_body().expect("inlining a block without a body");
                        Some(rw(self, a, m, body))
                    },
                }
            },
            _ => Some(recreate_node_identity(self, a, m, node)),
        }
    }
}

/// One simplification round. Returns the new module and whether anything
/// changed.
pub fn simplify<'a>(
    _config: &CompilerConfig,
    a: &mut IrArena<'a>,
    src: &Module<'a>,
) -> (Module<'a>, bool) {
    let mut dst = Module::new(src.name());
    let mut ctx = Context { rewriter: Rewriter::new(), uses: None, todo: false };
    rewrite_module(&mut ctx, a, &mut dst, src);
    (dst, ctx.todo)
}

/// Runs simplification rounds until nothing changes.
pub fn cleanup<'a>(
    config: &CompilerConfig,
    a: &mut IrArena<'a>,
    src: Module<'a>,
) -> Module<'a> {
    let mut module = src;
    let mut round = 0usize;
    loop {
        debug!("cleanup round {round}");
        let (next, todo) = simplify(config, a, &module);
        module = next;
        round += 1;
        if !todo {
            return module;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::arena::{use_arena, ArenaConfig};
    use ir::builder::BodyBuilder;
    use ir::node::final_terminator;

    /// entry jumps to a once-used block, which returns.
    fn build_jumpy_module<'a>(a: &mut IrArena<'a>) -> Module<'a> {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let empty = a.nodes(&[]);
        let returns = a.nodes(&[uniform_u32]);
        let fun = Node::function(&mut module, empty, "f", empty, returns, a);
        let fun_mem = fun.abstraction_mem(a);

        let value = Node::param(Some(uniform_u32), Some("v"), a);
        let bb_params = a.nodes(&[value]);
        let middle = Node::basic_block(bb_params, "middle", a);
        let middle_mem = middle.abstraction_mem(a);
        let rets = a.nodes(&[value]);
        middle.set_abstraction_body(Node::fn_ret(rets, middle_mem, a));

        let bb = BodyBuilder::begin_body_with_mem(fun_mem);
        let forty_two = Node::uint32_literal(42, a);
        let args = a.nodes(&[forty_two]);
        let jump = Node::jump(middle, args, fun_mem, a);
        fun.set_abstraction_body(bb.finish_body(a, jump));
        module
    }

    #[test]
    fn single_use_blocks_are_inlined() {
        use_arena(ArenaConfig::default(), |arena| {
            let module = build_jumpy_module(arena);
            let config = CompilerConfig::default();
            let cleaned = cleanup(&config, arena, module);

            let fun = cleaned.find_declaration("f").unwrap();
            let body = fun.abstraction_body().unwrap();
            // the jump is gone; the function returns the literal directly
            let leaf = final_terminator(body);
            let Payload::Return { args, .. } = *leaf else {
                panic!("expected the inlined return, got {leaf}");
            };
            let forty_two = Node::uint32_literal(42, arena);
            assert_eq!(args.as_slice(), &[forty_two]);
        });
    }

    #[test]
    fn multiply_used_blocks_survive() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = Module::new("m");
            let empty = arena.nodes(&[]);
            let bool_t = Node::bool_type(arena);
            let varying_bool = Node::qualified_type(false, bool_t, arena);
            let cond = Node::param(Some(varying_bool), Some("c"), arena);
            let params = arena.nodes(&[cond]);
            let fun = Node::function(&mut module, params, "g", empty, empty, arena);
            let fun_mem = fun.abstraction_mem(arena);

            let shared = Node::basic_block(empty, "shared", arena);
            let shared_mem = shared.abstraction_mem(arena);
            shared.set_abstraction_body(Node::fn_ret(empty, shared_mem, arena));

            let left = Node::basic_block(empty, "left", arena);
            let left_mem = left.abstraction_mem(arena);
            left.set_abstraction_body(Node::jump(shared, empty, left_mem, arena));

            let right = Node::basic_block(empty, "right", arena);
            let right_mem = right.abstraction_mem(arena);
            right.set_abstraction_body(Node::jump(shared, empty, right_mem, arena));

            let branch = Node::branch(cond, left, right, empty, fun_mem, arena);
            fun.set_abstraction_body(branch);

            let config = CompilerConfig::default();
            let cleaned = cleanup(&config, arena, module);
            let fun = cleaned.find_declaration("g").unwrap();
            let body = fun.abstraction_body().unwrap();
            // branch targets and the doubly-used block all survive
            let Payload::Branch { true_target, false_target, .. } = *body else {
                panic!("expected a branch");
            };
            assert!(matches!(*true_target.abstraction_body().unwrap(), Payload::Jump { .. }));
            assert!(matches!(*false_target.abstraction_body().unwrap(), Payload::Jump { .. }));
        });
    }
}
