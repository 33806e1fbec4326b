//! Free-frontier and free-variable computation.
//!
//! Starting from an abstraction, walk everything reachable through value and
//! instruction operands. A node whose scheduled home is dominated by the
//! start belongs to the region and gets recursed into; a node living outside
//! escapes and lands in the frontier. Free variables are the same walk,
//! restricted to parameters.

use std::collections::HashSet;

use crate::analysis::cfg::Cfg;
use crate::analysis::schedule::Scheduler;
use crate::node::{Node, Payload};
use crate::visit::{visit_operands, OperandClass};

struct FreeFrontierVisitor<'a, 'b, 'arena> {
    scheduler: &'a mut Scheduler<'b, 'arena>,
    cfg: &'a Cfg<'arena>,
    start: usize,
    seen: HashSet<Node<'arena>>,
    frontier: HashSet<Node<'arena>>,
}

impl<'arena> FreeFrontierVisitor<'_, '_, 'arena> {
    fn visit(&mut self, node: Node<'arena>) {
        if !self.seen.insert(node) {
            return;
        }
        let Some(home) = self.scheduler.schedule_instruction(node) else {
            // floating constants are never free
            return;
        };
        if self.cfg.is_dominated(home, self.start) {
            visit_operands(node, |class, operand| {
                // declarations, types and whole abstractions don't escape
                if !matches!(
                    class,
                    OperandClass::Abstraction | OperandClass::Declaration | OperandClass::Type
                ) {
                    self.visit(operand);
                }
            });
        } else {
            self.frontier.insert(node);
        }
    }
}

/// The set of nodes used under `abs` but living outside its dominance
/// region.
#[must_use]
pub fn free_frontier<'arena>(
    scheduler: &mut Scheduler<'_, 'arena>,
    cfg: &Cfg<'arena>,
    abs: Node<'arena>,
) -> HashSet<Node<'arena>> {
    let start = cfg.lookup(abs).expect("abstraction not in this CFG");
    let mut visitor = FreeFrontierVisitor {
        scheduler,
        cfg,
        start,
        seen: HashSet::new(),
        frontier: HashSet::new(),
    };
    if let Some(body) = abs.abstraction_body() {
        visitor.visit(body);
    }
    visitor.frontier
}

/// The parameters used under `abs` but bound outside it, in a stable order.
#[must_use]
pub fn free_variables<'arena>(
    scheduler: &mut Scheduler<'_, 'arena>,
    cfg: &Cfg<'arena>,
    abs: Node<'arena>,
) -> Vec<Node<'arena>> {
    let mut free: Vec<Node<'arena>> = free_frontier(scheduler, cfg, abs)
        .into_iter()
        .filter(|n| matches!(**n, Payload::Param { .. }))
        .collect();
    free.sort_by_key(|n| n.id().0);
    free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::uses::UsesMap;
    use crate::arena::{use_arena, ArenaConfig, IrArena};
    use crate::builder::BodyBuilder;
    use crate::module::Module;
    use crate::node::Op;
    use crate::visit::ClassMask;

    /// A function whose exit block uses a value defined in the entry.
    fn build_escaping_value<'arena>(
        a: &mut IrArena<'arena>,
    ) -> (Node<'arena>, Node<'arena>, Node<'arena>) {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let empty = a.nodes(&[]);
        let returns = a.nodes(&[uniform_u32]);
        let fun = Node::function(&mut module, empty, "f", empty, returns, a);
        let fun_mem = fun.abstraction_mem(a);

        let exit = Node::basic_block(empty, "exit", a);

        let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);
        let twenty_one = Node::uint32_literal(21, a);
        // bind an opaque computation so the value is pinned to the entry
        let ops = a.nodes(&[twenty_one]);
        let product = bb.gen_primop_e(a, Op::SubgroupBroadcastFirst, empty, ops);
        let jump = Node::jump(exit, empty, bb.mem(), a);
        fun.set_abstraction_body(bb.finish_body(a, jump));

        let exit_mem = exit.abstraction_mem(a);
        let eb = BodyBuilder::begin_body_with_mem(exit_mem);
        let rets = a.nodes(&[product]);
        let ret = Node::fn_ret(rets, exit_mem, a);
        exit.set_abstraction_body(eb.finish_body(a, ret));

        (fun, exit, product)
    }

    #[test]
    fn values_escaping_a_block_are_free_in_it() {
        use_arena(ArenaConfig::default(), |arena| {
            let (fun, exit, product) = build_escaping_value(arena);
            let cfg = Cfg::build(fun);
            let uses = UsesMap::build(&[fun], ClassMask::EMPTY);
            let mut sched = Scheduler::build(&cfg, &uses);

            let free = free_variables(&mut sched, &cfg, exit);
            assert_eq!(free, vec![product]);

            // nothing is free at the function entry itself
            let free_at_entry = free_variables(&mut sched, &cfg, fun);
            assert!(free_at_entry.is_empty());
        });
    }
}
