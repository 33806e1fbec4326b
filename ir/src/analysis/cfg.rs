//! Control-flow graphs and dominator trees.
//!
//! A CFG is built per function. Its node set is every abstraction reachable
//! from the entry: jump and branch targets, the cases of structured
//! constructs, and the continuation lambda of every let. Edges carry the kind
//! of transfer that created them, which the structured dominator and the DOT
//! dump both care about.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::module::Module;
use crate::node::{Node, Payload};
use crate::print::Printer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Jump,
    Branch,
    Switch,
    /// From a node to the continuation lambda of one of its lets.
    LetTail,
    StructuredEnterBody,
    StructuredLeaveBody,
    StructuredPseudoExit,
}

#[derive(Clone, Copy, Debug)]
pub struct CfgEdge {
    pub kind: EdgeKind,
    pub src: usize,
    pub dst: usize,
}

pub struct CfgNode<'arena> {
    pub node: Node<'arena>,
    pub pred_edges: Vec<CfgEdge>,
    pub succ_edges: Vec<CfgEdge>,
    /// Immediate dominator; `None` for the entry.
    pub idom: Option<usize>,
    /// A stricter dominator that refuses to cross structured-region exits.
    pub structured_idom: Option<usize>,
    /// Children in the dominator tree.
    pub dominates: Vec<usize>,
    /// Depth in the dominator tree.
    pub depth: usize,
}

pub struct Cfg<'arena> {
    pub entry: usize,
    nodes: Vec<CfgNode<'arena>>,
    index: HashMap<Node<'arena>, usize>,
}

/// Structured context threaded through a body scan: where the various merge
/// terminators land.
#[derive(Clone, Default)]
struct StructCtx<'arena> {
    selection_merge: Option<usize>,
    loop_continue: Option<usize>,
    loop_break: Option<usize>,
    joins: Vec<(Node<'arena>, usize)>,
}

struct CfgBuilder<'arena> {
    nodes: Vec<CfgNode<'arena>>,
    index: HashMap<Node<'arena>, usize>,
    queue: Vec<(Node<'arena>, StructCtx<'arena>)>,
    scanned: Vec<bool>,
}

impl<'arena> CfgBuilder<'arena> {
    fn get_or_add(&mut self, node: Node<'arena>) -> usize {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(CfgNode {
            node,
            pred_edges: Vec::new(),
            succ_edges: Vec::new(),
            idom: None,
            structured_idom: None,
            dominates: Vec::new(),
            depth: 0,
        });
        self.index.insert(node, idx);
        self.scanned.push(false);
        idx
    }

    fn edge(&mut self, kind: EdgeKind, src: usize, dst: usize) {
        let edge = CfgEdge { kind, src, dst };
        self.nodes[src].succ_edges.push(edge);
        self.nodes[dst].pred_edges.push(edge);
    }

    fn scan_case(&mut self, case: Node<'arena>, from: usize, ctx: &StructCtx<'arena>) {
        let idx = self.get_or_add(case);
        self.edge(EdgeKind::StructuredEnterBody, from, idx);
        if self.scanned[idx] {
            return;
        }
        self.scanned[idx] = true;
        if let Some(body) = case.abstraction_body() {
            self.scan_body(idx, body, ctx);
        }
    }

    fn scan_body(&mut self, at: usize, body: Node<'arena>, ctx: &StructCtx<'arena>) {
        match *body {
            Payload::Let { instruction, tail } => {
                let t = self.get_or_add(tail);
                self.edge(EdgeKind::LetTail, at, t);
                match *instruction {
                    Payload::If { true_case, false_case, .. } => {
                        let mut inner = ctx.clone();
                        inner.selection_merge = Some(t);
                        self.scan_case(true_case, at, &inner);
                        match false_case {
                            Some(false_case) => self.scan_case(false_case, at, &inner),
                            None => self.edge(EdgeKind::StructuredPseudoExit, at, t),
                        }
                    },
                    Payload::Loop { body: loop_body, .. } => {
                        let body_idx = self.get_or_add(loop_body);
                        let inner = StructCtx {
                            selection_merge: None,
                            loop_continue: Some(body_idx),
                            loop_break: Some(t),
                            joins: ctx.joins.clone(),
                        };
                        self.scan_case(loop_body, at, &inner);
                    },
                    Payload::Match { cases, default_case, .. } => {
                        let mut inner = ctx.clone();
                        inner.selection_merge = Some(t);
                        for case in cases.iter() {
                            self.scan_case(*case, at, &inner);
                        }
                        self.scan_case(default_case, at, &inner);
                    },
                    Payload::Control { inside, .. } => {
                        let jp = inside.abstraction_params().first();
                        let mut inner = ctx.clone();
                        inner.joins.push((jp, t));
                        self.scan_case(inside, at, &inner);
                    },
                    _ => {},
                }
                let Payload::AnonLambda { body: tail_body, .. } = *tail else {
                    panic!("let tail must be an anonymous lambda");
                };
                if !self.scanned[t] {
                    self.scanned[t] = true;
                    self.scan_body(t, tail_body, ctx);
                }
            },
            Payload::Jump { target, .. } => {
                let d = self.get_or_add(target);
                self.edge(EdgeKind::Jump, at, d);
                self.queue.push((target, ctx.clone()));
            },
            Payload::Branch { true_target, false_target, .. } => {
                for target in [true_target, false_target] {
                    let d = self.get_or_add(target);
                    self.edge(EdgeKind::Branch, at, d);
                    self.queue.push((target, ctx.clone()));
                }
            },
            Payload::Switch { targets, default_target, .. } => {
                for target in targets.iter().chain(core::iter::once(&default_target)) {
                    let d = self.get_or_add(*target);
                    self.edge(EdgeKind::Switch, at, d);
                    self.queue.push((*target, ctx.clone()));
                }
            },
            Payload::MergeSelection { .. } => {
                let exit = ctx.selection_merge.expect("merge_selection outside a selection");
                self.edge(EdgeKind::StructuredLeaveBody, at, exit);
            },
            Payload::MergeContinue { .. } => {
                let header = ctx.loop_continue.expect("merge_continue outside a loop");
                self.edge(EdgeKind::StructuredLeaveBody, at, header);
            },
            Payload::MergeBreak { .. } => {
                let exit = ctx.loop_break.expect("merge_break outside a loop");
                self.edge(EdgeKind::StructuredLeaveBody, at, exit);
            },
            Payload::Join { join_point, .. } => {
                // a join to a lexically visible join point leaves its region;
                // anything else escapes the whole scope
                if let Some(&(_, exit)) =
                    ctx.joins.iter().rev().find(|(jp, _)| *jp == join_point)
                {
                    self.edge(EdgeKind::StructuredLeaveBody, at, exit);
                }
            },
            Payload::Return { .. } | Payload::TailCall { .. } | Payload::Unreachable { .. } => {},
            _ => panic!("not a terminator: {body:?}"),
        }
    }
}

impl<'arena> Cfg<'arena> {
    /// Builds the CFG of one function.
    #[must_use]
    pub fn build(function: Node<'arena>) -> Self {
        let mut b = CfgBuilder {
            nodes: Vec::new(),
            index: HashMap::new(),
            queue: Vec::new(),
            scanned: Vec::new(),
        };
        let entry = b.get_or_add(function);
        b.queue.push((function, StructCtx::default()));
        while let Some((abs, ctx)) = b.queue.pop() {
            let idx = b.get_or_add(abs);
            if b.scanned[idx] {
                continue;
            }
            b.scanned[idx] = true;
            if let Some(body) = abs.abstraction_body() {
                b.scan_body(idx, body, &ctx);
            }
        }

        let mut cfg = Cfg { entry, nodes: b.nodes, index: b.index };
        let idoms = cfg.compute_idoms(|_| true);
        let structured_idoms = cfg.compute_idoms(|kind| {
            !matches!(kind, EdgeKind::StructuredLeaveBody | EdgeKind::StructuredPseudoExit)
        });
        for (idx, (idom, structured_idom)) in
            idoms.into_iter().zip(structured_idoms.into_iter()).enumerate()
        {
            cfg.nodes[idx].idom = idom;
            cfg.nodes[idx].structured_idom = structured_idom;
        }
        for idx in 0..cfg.nodes.len() {
            if let Some(idom) = cfg.nodes[idx].idom {
                cfg.nodes[idom].dominates.push(idx);
            }
        }
        // depths follow the dominator tree, root first
        let mut stack = vec![entry];
        while let Some(idx) = stack.pop() {
            let depth = cfg.nodes[idx].idom.map_or(0, |idom| cfg.nodes[idom].depth + 1);
            cfg.nodes[idx].depth = depth;
            stack.extend(cfg.nodes[idx].dominates.iter().copied());
        }
        log::trace!(
            "built a cfg with {} nodes for {:?}",
            cfg.nodes.len(),
            cfg.nodes[entry].node
        );
        cfg
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> &CfgNode<'arena> {
        &self.nodes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CfgNode<'arena>> {
        self.nodes.iter()
    }

    /// The CFG node of an abstraction, if it is part of this graph.
    #[must_use]
    pub fn lookup(&self, abs: Node<'arena>) -> Option<usize> {
        self.index.get(&abs).copied()
    }

    /// Whether `a` is dominated by `b`: ascends `a`'s immediate dominators
    /// until it meets `b` or the root.
    #[must_use]
    pub fn is_dominated(&self, a: usize, b: usize) -> bool {
        let mut current = a;
        loop {
            if current == b {
                return true;
            }
            match self.nodes[current].idom {
                Some(idom) => current = idom,
                None => return false,
            }
        }
    }

    /// The deepest node dominating both `a` and `b`.
    #[must_use]
    pub fn common_dominator(&self, a: usize, b: usize) -> usize {
        let (mut a, mut b) = (a, b);
        while self.nodes[a].depth > self.nodes[b].depth {
            a = self.nodes[a].idom.expect("walked past the root");
        }
        while self.nodes[b].depth > self.nodes[a].depth {
            b = self.nodes[b].idom.expect("walked past the root");
        }
        while a != b {
            a = self.nodes[a].idom.expect("no common dominator");
            b = self.nodes[b].idom.expect("no common dominator");
        }
        a
    }

    /// The standard iterative dominator computation, over the subgraph of
    /// edges `keep` accepts.
    fn compute_idoms(&self, keep: impl Fn(EdgeKind) -> bool) -> Vec<Option<usize>> {
        let n = self.nodes.len();

        // reverse postorder over the kept edges
        let mut order = Vec::with_capacity(n);
        let mut visited = vec![false; n];
        let mut stack = vec![(self.entry, 0usize)];
        visited[self.entry] = true;
        while let Some(&(node, next)) = stack.last() {
            let succs = &self.nodes[node].succ_edges;
            if next < succs.len() {
                stack.last_mut().expect("non-empty stack").1 += 1;
                let edge = succs[next];
                if keep(edge.kind) && !visited[edge.dst] {
                    visited[edge.dst] = true;
                    stack.push((edge.dst, 0));
                }
            } else {
                order.push(node);
                stack.pop();
            }
        }
        order.reverse();

        let mut rpo_index = vec![usize::MAX; n];
        for (i, &node) in order.iter().enumerate() {
            rpo_index[node] = i;
        }

        let mut idom = vec![None; n];
        idom[self.entry] = Some(self.entry);
        let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| {
            while a != b {
                while rpo_index[a] > rpo_index[b] {
                    a = idom[a].expect("unprocessed dominator");
                }
                while rpo_index[b] > rpo_index[a] {
                    b = idom[b].expect("unprocessed dominator");
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &node in order.iter().skip(1) {
                let mut new_idom = None;
                for edge in &self.nodes[node].pred_edges {
                    if !keep(edge.kind) || idom[edge.src].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => edge.src,
                        Some(other) => intersect(&idom, edge.src, other),
                    });
                }
                if new_idom.is_some() && idom[node] != new_idom {
                    idom[node] = new_idom;
                    changed = true;
                }
            }
        }

        idom[self.entry] = None;
        idom
    }
}

static DOT_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\l")
}

fn dump_cfg_cluster<W: Write>(
    out: &mut W,
    cluster: usize,
    cfg: &Cfg,
    name: &str,
) -> io::Result<()> {
    writeln!(out, "subgraph cluster_{cluster} {{")?;
    writeln!(out, "label = \"{name}\";")?;
    let mut printer = Printer::default();
    for (idx, cfg_node) in cfg.iter().enumerate() {
        let node = cfg_node.node;
        let color = if node.is_case() {
            "green"
        } else if node.is_basic_block() {
            "blue"
        } else {
            "black"
        };
        let mut label = String::new();
        match node.abstraction_name() {
            Some(name) => label.push_str(name),
            None => label.push_str(&format!("%{}", node.id().0)),
        }
        label.push('\n');
        if let Some(body) = node.abstraction_body() {
            // labels show the instruction chain, one line per let
            let mut walker = body;
            while let Payload::Let { instruction, tail } = *walker {
                let mut line = String::new();
                let mut pending = Vec::new();
                let _ = printer.print_instruction(&mut line, instruction, 0, &mut pending);
                label.push_str(&line);
                label.push('\n');
                let Payload::AnonLambda { body, .. } = *tail else { break };
                walker = body;
            }
        }
        writeln!(
            out,
            "bb_{cluster}_{idx} [nojustify=true, label=\"{}\", color=\"{color}\", shape=box];",
            escape_label(&label)
        )?;
    }
    for cfg_node in cfg.iter() {
        for edge in &cfg_node.succ_edges {
            let color = match edge.kind {
                EdgeKind::Jump | EdgeKind::Branch | EdgeKind::Switch => "black",
                EdgeKind::LetTail => "green",
                EdgeKind::StructuredEnterBody => "blue",
                EdgeKind::StructuredLeaveBody => "red",
                EdgeKind::StructuredPseudoExit => "darkred",
            };
            writeln!(
                out,
                "bb_{cluster}_{} -> bb_{cluster}_{} [color=\"{color}\"];",
                edge.src, edge.dst
            )?;
        }
    }
    writeln!(out, "}}")
}

/// Emits a DOT graph of every function's CFG, one cluster per function.
pub fn dump_cfg<W: Write>(out: &mut W, module: &Module) -> io::Result<()> {
    writeln!(out, "digraph G {{")?;
    for (i, decl) in module.declarations().iter().enumerate() {
        if let Payload::Function(f) = **decl {
            if f.body.get().is_some() {
                let cfg = Cfg::build(*decl);
                dump_cfg_cluster(out, i, &cfg, f.name)?;
            }
        }
    }
    writeln!(out, "}}")
}

/// Writes `cfg<N>.dot` in the working directory, with a process-wide counter
/// so repeated dumps don't clobber each other.
pub fn dump_cfg_auto(module: &Module) -> io::Result<std::path::PathBuf> {
    let n = DOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::path::PathBuf::from(format!("cfg{n}.dot"));
    let mut file = std::fs::File::create(&path)?;
    dump_cfg(&mut file, module)?;
    log::debug!("dumped the cfg of '{}' to {}", module.name(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::builder::BodyBuilder;
    use crate::node::{AddressSpace, Op};

    fn build_branchy_function<'arena>(
        a: &mut crate::arena::IrArena<'arena>,
    ) -> (Module<'arena>, Node<'arena>) {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let ptr_t = Node::ptr_type(AddressSpace::Generic, u32_t, a);
        let qptr = Node::qualified_type(false, ptr_t, a);
        let p = Node::param(Some(qptr), Some("p"), a);
        let params = a.nodes(&[p]);
        let empty = a.nodes(&[]);
        let varying_u32 = Node::qualified_type(false, u32_t, a);
        let returns = a.nodes(&[varying_u32]);
        let fun = Node::function(&mut module, params, "branchy", empty, returns, a);
        let mem = fun.abstraction_mem(a);
        let mut bb = BodyBuilder::begin_body_with_mem(mem);

        let loaded = bb.gen_load(a, p);
        let zero = Node::uint32_literal(0, a);

        let true_case = Node::case(empty, a);
        let tc_mem = true_case.abstraction_mem(a);
        let mut tc = BodyBuilder::begin_body_with_mem(tc_mem);
        tc.gen_store(a, p, zero);
        true_case.set_abstraction_body(tc.finish_body_with_selection_merge(a, empty));

        let cmp = a.nodes(&[loaded, zero]);
        let cond = bb.gen_primop_e(a, Op::Gt, empty, cmp);
        let _ = bb.gen_if(a, empty, cond, true_case, None);

        let rets = a.nodes(&[loaded]);
        let body = bb.finish_body_with_return(a, rets);
        fun.set_abstraction_body(body);
        (module, fun)
    }

    #[test]
    fn entry_dominates_everything() {
        use_arena(ArenaConfig::default(), |arena| {
            let (_module, fun) = build_branchy_function(arena);
            let cfg = Cfg::build(fun);
            assert!(cfg.len() > 1);
            for idx in 0..cfg.len() {
                assert!(cfg.is_dominated(idx, cfg.entry));
            }
        });
    }

    #[test]
    fn structured_edges_reach_the_case() {
        use_arena(ArenaConfig::default(), |arena| {
            let (_module, fun) = build_branchy_function(arena);
            let cfg = Cfg::build(fun);
            let case_idx = (0..cfg.len()).find(|&i| cfg.node(i).node.is_case()).unwrap();
            assert!(cfg
                .node(case_idx)
                .pred_edges
                .iter()
                .any(|e| e.kind == EdgeKind::StructuredEnterBody));
            assert!(cfg
                .node(case_idx)
                .succ_edges
                .iter()
                .any(|e| e.kind == EdgeKind::StructuredLeaveBody));
        });
    }

    #[test]
    fn dot_dump_mentions_every_function() {
        use_arena(ArenaConfig::default(), |arena| {
            let (module, _fun) = build_branchy_function(arena);
            let mut out = Vec::new();
            dump_cfg(&mut out, &module).unwrap();
            let dot = String::from_utf8(out).unwrap();
            assert!(dot.contains("digraph G"));
            assert!(dot.contains("label = \"branchy\""));
            assert!(dot.contains("color=\"green\""));
        });
    }
}
