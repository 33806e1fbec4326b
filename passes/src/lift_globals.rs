//! Lifts `Global`-space variables into one shader storage buffer.
//!
//! Vulkan offers no free-form global memory, so every global variable in the
//! `Global` address space becomes a member of a single struct-typed SSBO
//! declaration. Each function grows a prelude that loads the members it
//! needs, then jumps to a `post-prelude` block holding the original body;
//! every reference to a lifted global is replaced by a load of the matching
//! struct member. Initial values are preserved as annotations for the runtime
//! to apply.

use ir::arena::IrArena;
use ir::builder::BodyBuilder;
use ir::module::Module;
use ir::node::{AddressSpace, Node, Payload, RecordSpecial};
use ir::rewrite::{
    recreate_decl_header_identity, recreate_node_identity, rewrite_module, rw, Rewrite, Rewriter,
};
use log::debug;

use crate::CompilerConfig;

fn is_lifted_global(node: Node) -> bool {
    matches!(*node, Payload::GlobalVariable(g) if g.space == AddressSpace::Global)
}

struct Context<'s, 'd> {
    rewriter: Rewriter<'s, 'd>,
    /// Prelude builder of the function currently being rewritten.
    bb: Option<BodyBuilder<'d>>,
    lifted_globals_decl: Option<Node<'d>>,
    /// The source function whose body is being rewritten, and the sentinel
    /// its memory chain is re-anchored to.
    current_fn: Option<Node<'s>>,
    post_prelude_mem: Option<Node<'d>>,
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
                let new = recreate_decl_header_identity(self, a, m, node);
                if let Some(body) = node.abstraction_body() {
                    // loads of lifted globals must not be shared between
                    // functions, so the body is rewritten under an overlay
                    let saved = self.rewriter.save();
                    let outer_fn = self.current_fn.replace(node);

                    let empty = a.nodes(&[]);
                    let post_prelude = Node::basic_block(empty, "post-prelude", a);
                    self.post_prelude_mem = Some(post_prelude.abstraction_mem(a));
                    let entry_mem = new.abstraction_mem(a);
                    self.bb = Some(BodyBuilder::begin_body_with_mem(entry_mem));

                    let new_body = rw(self, a, m, body);
                    post_prelude.set_abstraction_body(new_body);

                    let prelude = self.bb.take().expect("prelude builder");
                    let jump = Node::jump(post_prelude, empty, prelude.mem(), a);
                    new.set_abstraction_body(prelude.finish_body(a, jump));

                    self.current_fn = outer_fn;
                    self.post_prelude_mem = None;
                    self.rewriter.restore(saved);
                }
                Some(new)
            },
            // the function's own sentinel re-anchors at the post-prelude
            Payload::AbsMem { abs } if Some(abs) == self.current_fn => self.post_prelude_mem,
            Payload::RefDecl { decl } if is_lifted_global(decl) => {
                let lifted = self
                    .lifted_globals_decl
                    .expect("a global is referenced but none were lifted");
                let index = rw(self, a, m, decl);
                let base = Node::ref_decl(lifted, a);
                let zero = Node::int32_literal(0, a);
                let indices = a.nodes(&[index]);
                let bb = self
                    .bb
                    .as_mut()
                    .expect("this global reference is outside an abstraction");
                let addr = bb.gen_lea(a, base, zero, indices);
                Some(bb.gen_load(a, addr))
            },
            Payload::GlobalVariable(_) if is_lifted_global(node) => {
                unreachable!("lifted globals are registered before the module rewrite")
            },
            // other declarations never hoist loads into the current prelude
            _ if node.is_declaration() => {
                let outer = self.bb.take();
                let new = recreate_node_identity(self, a, m, node);
                self.bb = outer;
                Some(new)
            },
            _ => Some(recreate_node_identity(self, a, m, node)),
        }
    }
}

/// Runs the rewrite over a module.
pub fn lift_globals<'s, 'd>(
    _config: &CompilerConfig,
    a: &mut IrArena<'d>,
    src: &Module<'s>,
) -> Module<'d> {
    let mut dst = Module::new(src.name());
    let mut ctx = Context {
        rewriter: Rewriter::new(),
        bb: None,
        lifted_globals_decl: None,
        current_fn: None,
        post_prelude_mem: None,
    };

    let globals: Vec<Node<'s>> =
        src.declarations().iter().copied().filter(|d| is_lifted_global(*d)).collect();

    // first pass: record member types and names, and map each lifted global
    // to its member index
    let mut member_tys = Vec::new();
    let mut member_names = Vec::new();
    for (index, global) in globals.iter().enumerate() {
        debug!("lifting global '{}' to member {index}", global.declaration_name());
        let ty = global.ty().expect("global without a type");
        member_tys.push(rw(&mut ctx, a, &mut dst, ty));
        member_names.push(global.declaration_name());
        let index = i32::try_from(index).expect("too many globals");
        let literal = Node::int32_literal(index, a);
        ctx.rewriter.register_processed(*global, literal);
    }

    // gather the annotations up front so the declaration header never needs
    // to change afterwards
    let mut annotations = Vec::new();
    let zero = Node::int32_literal(0, a);
    annotations.push(Node::annotation_value("DescriptorSet", zero, a));
    annotations.push(Node::annotation_value("DescriptorBinding", zero, a));
    annotations.push(Node::annotation("Constants", a));
    for (index, global) in globals.iter().enumerate() {
        if let Some(init) = global.global_init() {
            let ninit = rw(&mut ctx, a, &mut dst, init);
            let index = i32::try_from(index).expect("too many globals");
            let literal = Node::int32_literal(index, a);
            let values = a.nodes(&[literal, ninit]);
            annotations.push(Node::annotation_values("InitialValue", values, a));
        }
    }

    if !globals.is_empty() {
        let members = a.nodes(&member_tys);
        let names = a.strings(&member_names);
        let struct_ty = Node::record_type(members, names, RecordSpecial::DecorateBlock, a);
        let annotations = a.nodes(&annotations);
        ctx.lifted_globals_decl = Some(Node::global_var(
            &mut dst,
            annotations,
            struct_ty,
            "lifted_globals",
            AddressSpace::Ssbo,
            a,
        ));
    }

    rewrite_module(&mut ctx, a, &mut dst, src);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::analysis::cfg::Cfg;
    use ir::arena::{use_arena, ArenaConfig};
    use ir::node::{final_terminator, Op};
    use ir::type_checker::unqualified_type;

    /// A module with one global counter and a function reading it.
    fn build_module_with_global<'a>(a: &mut IrArena<'a>) -> Module<'a> {
        let mut module = Module::new("m");
        let u32_t = Node::uint32_type(a);
        let empty = a.nodes(&[]);
        let g = Node::global_var(&mut module, empty, u32_t, "counter", AddressSpace::Global, a);
        let seven = Node::uint32_literal(7, a);
        g.set_global_init(seven);

        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let returns = a.nodes(&[uniform_u32]);
        let fun = Node::function(&mut module, empty, "read_counter", empty, returns, a);
        let mem = fun.abstraction_mem(a);
        let mut bb = BodyBuilder::begin_body_with_mem(mem);
        let gref = Node::ref_decl(g, a);
        let value = bb.gen_load(a, gref);
        let one = Node::uint32_literal(1, a);
        let ops = a.nodes(&[value, one]);
        let sum = bb.gen_primop_e(a, Op::Add, empty, ops);
        let rets = a.nodes(&[sum]);
        fun.set_abstraction_body(bb.finish_body_with_return(a, rets));
        module
    }

    #[test]
    fn globals_become_ssbo_members() {
        use_arena(ArenaConfig::default(), |arena| {
            let module = build_module_with_global(arena);
            let config = CompilerConfig::default();
            let out = lift_globals(&config, arena, &module);

            // the global itself is gone, replaced by the struct-typed SSBO
            assert!(out.find_declaration("counter").is_none());
            let lifted = out.find_declaration("lifted_globals").unwrap();
            let Payload::GlobalVariable(g) = *lifted else { panic!("expected a global") };
            assert_eq!(g.space, AddressSpace::Ssbo);
            let Payload::Record { members, names, special } = *g.ty else {
                panic!("expected a record type");
            };
            assert_eq!(special, RecordSpecial::DecorateBlock);
            assert_eq!(names.as_slice(), &["counter"]);
            // the member holds a pointer to the old global's contents
            assert!(matches!(*members[0], Payload::Ptr { pointee, .. } if {
                let u32_t = Node::uint32_type(arena);
                pointee == u32_t
            }));

            // the initial value survives as an annotation
            let init_ann = lifted.lookup_annotation("InitialValue").unwrap();
            let Payload::AnnotationValues { values, .. } = *init_ann else {
                panic!("expected annotation values");
            };
            assert_eq!(values.len(), 2);
        });
    }

    #[test]
    fn functions_get_a_prelude_jump() {
        use_arena(ArenaConfig::default(), |arena| {
            let module = build_module_with_global(arena);
            let config = CompilerConfig::default();
            let out = lift_globals(&config, arena, &module);

            let fun = out.find_declaration("read_counter").unwrap();
            let body = fun.abstraction_body().unwrap();
            // the body is now a prelude ending in a jump to post-prelude
            let leaf = final_terminator(body);
            let Payload::Jump { target, .. } = *leaf else { panic!("expected a jump") };
            assert_eq!(target.abstraction_name(), Some("post-prelude"));

            // the prelude leas into the struct and loads the member pointer
            let Payload::Let { instruction, tail } = *body else { panic!("expected a let") };
            assert!(matches!(*instruction, Payload::Lea { .. }));
            let Payload::AnonLambda { body: next, .. } = *tail else { panic!() };
            let Payload::Let { instruction, .. } = *next else { panic!("expected a let") };
            assert!(matches!(*instruction, Payload::Load { .. }));

            // and the loaded member is a pointer to the global's data
            let loaded_ptr = {
                let Payload::Let { tail, .. } = *next else { unreachable!() };
                let Payload::AnonLambda { params, .. } = *tail else { unreachable!() };
                params.first()
            };
            let loaded_ty = unqualified_type(loaded_ptr.ty().unwrap());
            assert!(matches!(*loaded_ty, Payload::Ptr { .. }));

            // the mem chain of the rewritten body still anchors correctly
            let cfg = Cfg::build(fun);
            for idx in 0..cfg.len() {
                assert!(cfg.is_dominated(idx, cfg.entry));
            }
        });
    }
}
