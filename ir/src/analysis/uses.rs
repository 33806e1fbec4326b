//! The use map: for every node reachable from a set of roots, who uses it
//! and in what role.

use std::collections::HashMap;

use crate::node::Node;
use crate::visit::{visit_operands, ClassMask, OperandClass};

/// One use of a node.
#[derive(Clone, Copy, Debug)]
pub struct Use<'arena> {
    pub user: Node<'arena>,
    pub class: OperandClass,
}

/// Maps nodes to their uses. Uses are recorded for every edge of the
/// reachable graph; traversal does not descend through operands whose class
/// is in the exclusion mask.
pub struct UsesMap<'arena> {
    map: HashMap<Node<'arena>, Vec<Use<'arena>>>,
}

impl<'arena> UsesMap<'arena> {
    #[must_use]
    pub fn build(roots: &[Node<'arena>], exclude: ClassMask) -> Self {
        let mut map: HashMap<Node<'arena>, Vec<Use<'arena>>> = HashMap::new();
        let mut seen: std::collections::HashSet<Node<'arena>> =
            roots.iter().copied().collect();
        let mut worklist: Vec<Node<'arena>> = roots.to_vec();
        while let Some(user) = worklist.pop() {
            visit_operands(user, |class, operand| {
                map.entry(operand).or_default().push(Use { user, class });
                if !exclude.contains(class) && seen.insert(operand) {
                    worklist.push(operand);
                }
            });
        }
        UsesMap { map }
    }

    /// All recorded uses of `node`, in discovery order.
    #[must_use]
    pub fn uses_of(&self, node: Node<'arena>) -> &[Use<'arena>] {
        self.map.get(&node).map_or(&[], Vec::as_slice)
    }

    /// How many times a basic block is called, or `None` when it is used for
    /// anything other than plain jumps (such blocks can never be inlined).
    #[must_use]
    pub fn count_block_calls(&self, bb: Node<'arena>) -> Option<usize> {
        let mut count = 0;
        for use_ in self.uses_of(bb) {
            match *use_.user {
                crate::node::Payload::Jump { .. } => count += 1,
                // the block's own memory sentinel is not a call
                crate::node::Payload::AbsMem { .. } => {},
                // targets of conditional transfers and structured constructs
                // cannot be folded into their single caller
                _ => return None,
            }
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::builder::BodyBuilder;
    use crate::module::Module;
    use crate::node::{Node, Op};

    #[test]
    fn jump_targets_are_counted() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = Module::new("m");
            let empty = arena.nodes(&[]);
            let fun = Node::function(&mut module, empty, "f", empty, empty, arena);
            let fun_mem = fun.abstraction_mem(arena);

            let exit = Node::basic_block(empty, "exit", arena);
            let exit_mem = exit.abstraction_mem(arena);
            let ret = Node::fn_ret(empty, exit_mem, arena);
            exit.set_abstraction_body(ret);

            let bb = BodyBuilder::begin_body_with_mem(fun_mem);
            let jump = Node::jump(exit, empty, fun_mem, arena);
            fun.set_abstraction_body(bb.finish_body(arena, jump));

            let uses = UsesMap::build(&[fun], ClassMask::EMPTY);
            assert_eq!(uses.count_block_calls(exit), Some(1));
        });
    }

    #[test]
    fn operand_uses_are_recorded() {
        use_arena(ArenaConfig::default(), |arena| {
            let u32_t = Node::uint32_type(arena);
            let varying = Node::qualified_type(false, u32_t, arena);
            let p = Node::param(Some(varying), Some("x"), arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[p, p]);
            let sum = Node::prim_op(Op::Add, empty, operands, arena);
            let uses = UsesMap::build(&[sum], ClassMask::EMPTY);
            assert_eq!(uses.uses_of(p).len(), 2);
            assert!(uses.uses_of(p).iter().all(|u| u.user == sum));
        });
    }
}
