//! Instruction scheduling: which CFG node does an expression live in?
//!
//! Let-bound instructions, parameters and terminators have a fixed home: the
//! node that binds them. Floating pure expressions (whatever the folder left
//! unbound) are placed at the deepest node that dominates all of their users;
//! constants with no users float freely and get no placement at all.

use std::collections::HashMap;

use crate::analysis::cfg::Cfg;
use crate::analysis::uses::UsesMap;
use crate::node::{Node, Payload};

pub struct Scheduler<'a, 'arena> {
    cfg: &'a Cfg<'arena>,
    uses: &'a UsesMap<'arena>,
    placement: HashMap<Node<'arena>, Option<usize>>,
}

impl<'a, 'arena> Scheduler<'a, 'arena> {
    #[must_use]
    pub fn build(cfg: &'a Cfg<'arena>, uses: &'a UsesMap<'arena>) -> Self {
        let mut placement: HashMap<Node<'arena>, Option<usize>> = HashMap::new();

        // fixed homes: abstractions, their parameters, their let spines
        for idx in 0..cfg.len() {
            let abs = cfg.node(idx).node;
            placement.insert(abs, Some(idx));
            for param in abs.abstraction_params().iter() {
                placement.insert(*param, Some(idx));
            }
            let Some(body) = abs.abstraction_body() else { continue };
            let mut walker = body;
            loop {
                placement.insert(walker, Some(idx));
                match *walker {
                    Payload::Let { instruction, tail } => {
                        placement.insert(instruction, Some(idx));
                        let tail_home = cfg.lookup(tail).unwrap_or(idx);
                        for param in tail.abstraction_params().iter() {
                            placement.insert(*param, Some(tail_home));
                        }
                        let Payload::AnonLambda { body, .. } = *tail else {
                            panic!("let tail must be an anonymous lambda");
                        };
                        walker = body;
                    },
                    _ => break,
                }
            }
        }

        Scheduler { cfg, uses, placement }
    }

    /// The CFG node `node` is assigned to, or `None` for constants that may
    /// float.
    pub fn schedule_instruction(&mut self, node: Node<'arena>) -> Option<usize> {
        if let Some(&home) = self.placement.get(&node) {
            return home;
        }
        // avoid runaway recursion on cyclic use chains
        self.placement.insert(node, None);

        let mut home: Option<usize> = None;
        let users: Vec<Node<'arena>> =
            self.uses.uses_of(node).iter().map(|u| u.user).collect();
        for user in users {
            let Some(user_home) = self.schedule_instruction(user) else { continue };
            home = Some(match home {
                None => user_home,
                Some(existing) => self.cfg.common_dominator(existing, user_home),
            });
        }

        self.placement.insert(node, home);
        home
    }
}
