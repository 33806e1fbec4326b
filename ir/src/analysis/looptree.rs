//! Loop trees: a hierarchical decomposition of a CFG into strongly-connected
//! regions.
//!
//! A `Head` node stands for a loop: its `cf_nodes` are the headers of the
//! strongly-connected region (the nodes entered from outside), and its
//! children cover the region with nested heads and leaves. Every CFG node
//! belongs to exactly one `Leaf`; walking `parent` links finds the enclosing
//! loops.

use std::collections::{HashMap, HashSet};

use crate::analysis::cfg::Cfg;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    Head,
    Leaf,
}

pub struct LtNode {
    pub kind: LoopKind,
    pub parent: Option<usize>,
    /// For heads: the headers of the region. For leaves: the single CFG node.
    pub cf_nodes: Vec<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
}

pub struct LoopTree {
    nodes: Vec<LtNode>,
    pub root: usize,
    leaf_of: HashMap<usize, usize>,
}

impl LoopTree {
    /// Builds the loop tree of a CFG.
    #[must_use]
    pub fn build(cfg: &Cfg) -> Self {
        let mut tree =
            LoopTree { nodes: Vec::new(), root: 0, leaf_of: HashMap::new() };
        let root = tree.add(LoopKind::Head, None, Vec::new());
        tree.root = root;
        let all: Vec<usize> = (0..cfg.len()).collect();
        let no_masked = HashSet::new();
        tree.decompose(cfg, &all, &no_masked, root);
        tree
    }

    fn add(&mut self, kind: LoopKind, parent: Option<usize>, cf_nodes: Vec<usize>) -> usize {
        let depth = parent.map_or(0, |p| self.nodes[p].depth + 1);
        let idx = self.nodes.len();
        self.nodes.push(LtNode { kind, parent, cf_nodes, children: Vec::new(), depth });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(idx);
        }
        idx
    }

    /// Recursively decomposes `region` into SCCs, ignoring edges into
    /// `masked_headers` (the back edges of the enclosing loop).
    fn decompose(
        &mut self,
        cfg: &Cfg,
        region: &[usize],
        masked_headers: &HashSet<usize>,
        parent: usize,
    ) {
        let in_region: HashSet<usize> = region.iter().copied().collect();
        let sccs = strongly_connected_components(cfg, region, &in_region, masked_headers);

        for scc in sccs {
            let is_loop = scc.len() > 1 || {
                let node = scc[0];
                cfg.node(node)
                    .succ_edges
                    .iter()
                    .any(|e| e.dst == node && !masked_headers.contains(&node))
            };
            if !is_loop {
                let leaf = self.add(LoopKind::Leaf, Some(parent), scc.clone());
                self.leaf_of.insert(scc[0], leaf);
                continue;
            }

            let scc_set: HashSet<usize> = scc.iter().copied().collect();
            let mut headers: Vec<usize> = scc
                .iter()
                .copied()
                .filter(|&n| {
                    n == cfg.entry
                        || cfg.node(n).pred_edges.iter().any(|e| !scc_set.contains(&e.src))
                })
                .collect();
            if headers.is_empty() {
                // unreachable-from-outside region, pick a canonical entry
                headers.push(scc[0]);
            }
            let head = self.add(LoopKind::Head, Some(parent), headers.clone());
            let masked: HashSet<usize> = headers.into_iter().collect();
            self.decompose(cfg, &scc, &masked, head);
        }
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> &LtNode {
        &self.nodes[idx]
    }

    /// The leaf holding a CFG node.
    #[must_use]
    pub fn lookup(&self, cfg_node: usize) -> usize {
        *self.leaf_of.get(&cfg_node).expect("node not covered by the loop tree")
    }

    /// The innermost loop head enclosing a tree node, if any.
    #[must_use]
    pub fn enclosing_loop(&self, idx: usize) -> Option<usize> {
        let parent = self.nodes[idx].parent?;
        (self.nodes[parent].kind == LoopKind::Head && parent != self.root).then_some(parent)
    }

    /// Whether `child` is within the subtree rooted at `maybe_ancestor`.
    #[must_use]
    pub fn is_within(&self, maybe_ancestor: Option<usize>, child: Option<usize>) -> bool {
        let Some(ancestor) = maybe_ancestor else {
            // everything is inside the implicit top level
            return true;
        };
        let mut current = child;
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.nodes[n].parent;
        }
        false
    }
}

/// Tarjan's algorithm, iterative, restricted to `in_region` and skipping
/// edges into `masked_headers`. Returns SCCs in dependency order.
fn strongly_connected_components(
    cfg: &Cfg,
    region: &[usize],
    in_region: &HashSet<usize>,
    masked_headers: &HashSet<usize>,
) -> Vec<Vec<usize>> {
    #[derive(Clone, Copy)]
    struct NodeState {
        index: usize,
        lowlink: usize,
        on_stack: bool,
    }

    let mut states: HashMap<usize, NodeState> = HashMap::new();
    let mut next_index = 0;
    let mut stack: Vec<usize> = Vec::new();
    let mut sccs: Vec<Vec<usize>> = Vec::new();

    // explicit DFS frames: (node, next successor position)
    for &start in region {
        if states.contains_key(&start) {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        states.insert(start, NodeState { index: next_index, lowlink: next_index, on_stack: true });
        next_index += 1;
        stack.push(start);

        while let Some(&(node, pos)) = frames.last() {
            let succs = &cfg.node(node).succ_edges;
            let mut pushed = false;
            let mut pos = pos;
            while pos < succs.len() {
                let dst = succs[pos].dst;
                pos += 1;
                if !in_region.contains(&dst) || masked_headers.contains(&dst) {
                    continue;
                }
                match states.get(&dst).copied() {
                    None => {
                        frames.last_mut().expect("frame").1 = pos;
                        states.insert(
                            dst,
                            NodeState { index: next_index, lowlink: next_index, on_stack: true },
                        );
                        next_index += 1;
                        stack.push(dst);
                        frames.push((dst, 0));
                        pushed = true;
                        break;
                    },
                    Some(state) if state.on_stack => {
                        let other = state.index;
                        let entry = states.get_mut(&node).expect("state");
                        entry.lowlink = entry.lowlink.min(other);
                    },
                    Some(_) => {},
                }
            }
            if pushed {
                continue;
            }
            frames.pop();
            let state = states[&node];
            if let Some(&(parent, _)) = frames.last() {
                let lowlink = state.lowlink;
                let parent_state = states.get_mut(&parent).expect("state");
                parent_state.lowlink = parent_state.lowlink.min(lowlink);
            }
            if state.lowlink == state.index {
                let mut scc = Vec::new();
                loop {
                    let member = stack.pop().expect("scc stack");
                    states.get_mut(&member).expect("state").on_stack = false;
                    scc.push(member);
                    if member == node {
                        break;
                    }
                }
                sccs.push(scc);
            }
        }
    }

    sccs.reverse();
    sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::builder::BodyBuilder;
    use crate::module::Module;
    use crate::node::{Node, Op};

    /// A function with an explicit back edge: entry jumps to a header block
    /// that conditionally jumps back to itself.
    fn build_looping_function<'arena>(
        a: &mut crate::arena::IrArena<'arena>,
    ) -> Node<'arena> {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let empty = a.nodes(&[]);
        let fun = Node::function(&mut module, empty, "spin", empty, empty, a);
        let fun_mem = fun.abstraction_mem(a);

        let counter = Node::param(Some(uniform_u32), Some("i"), a);
        let header_params = a.nodes(&[counter]);
        let header = Node::basic_block(header_params, "header", a);
        let leftover = Node::param(Some(uniform_u32), Some("i"), a);
        let exit_params = a.nodes(&[leftover]);
        let exit = Node::basic_block(exit_params, "exit", a);

        let exit_mem = exit.abstraction_mem(a);
        exit.set_abstraction_body(Node::fn_ret(empty, exit_mem, a));

        let header_mem = header.abstraction_mem(a);
        let mut hb = BodyBuilder::begin_body_with_mem(header_mem);
        let one = Node::uint32_literal(1, a);
        let operands = a.nodes(&[counter, one]);
        let next = hb.gen_primop_e(a, Op::Sub, empty, operands);
        let zero = Node::uint32_literal(0, a);
        let cmp = a.nodes(&[next, zero]);
        let cond = hb.gen_primop_e(a, Op::Gt, empty, cmp);
        let again_args = a.nodes(&[next]);
        let branch = Node::branch(cond, header, exit, again_args, hb.mem(), a);
        let body = hb.finish_body(a, branch);
        header.set_abstraction_body(body);

        let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);
        let ten = Node::uint32_literal(10, a);
        let init = a.nodes(&[ten]);
        let jump = Node::jump(header, init, bb.mem(), a);
        fun.set_abstraction_body(bb.finish_body(a, jump));
        fun
    }

    #[test]
    fn back_edges_make_a_loop_head() {
        use_arena(ArenaConfig::default(), |arena| {
            let fun = build_looping_function(arena);
            let cfg = Cfg::build(fun);
            let tree = LoopTree::build(&cfg);

            let header_idx = (0..cfg.len())
                .find(|&i| cfg.node(i).node.abstraction_name() == Some("header"))
                .unwrap();
            let leaf = tree.lookup(header_idx);
            let enclosing = tree.enclosing_loop(leaf);
            assert!(enclosing.is_some());
            let head = tree.node(enclosing.unwrap());
            assert_eq!(head.kind, LoopKind::Head);
            assert!(head.cf_nodes.contains(&header_idx));
        });
    }

    #[test]
    fn straight_line_code_has_no_loops() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = Module::new("m");
            let empty = arena.nodes(&[]);
            let fun = Node::function(&mut module, empty, "f", empty, empty, arena);
            let mem = fun.abstraction_mem(arena);
            fun.set_abstraction_body(Node::fn_ret(empty, mem, arena));

            let cfg = Cfg::build(fun);
            let tree = LoopTree::build(&cfg);
            let leaf = tree.lookup(cfg.entry);
            assert_eq!(tree.enclosing_loop(leaf), None);
        });
    }
}
