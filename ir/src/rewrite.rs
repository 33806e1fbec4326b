//! The rewriter: a memoized polymorphic map over nodes.
//!
//! Every transformation pass is a rewriter. A pass embeds a [`Rewriter`]
//! (the memo table) in its context, implements [`Rewrite::rewrite_node`] for
//! the cases it cares about, and defers to [`recreate_node_identity`] for
//! everything else. Rewriting a node twice returns the same image; rewriting
//! a node to `None` erases it, and downstream code finding a `None` image
//! (say, a jump to a deleted block) is expected to take remedial action.
//!
//! The memo table is persistent (cheap to clone), which is what scoped
//! overrides are built from: save the map, shadow a few entries, rewrite a
//! subtree, restore.

use im_rc::HashMap as ImHashMap;

use crate::arena::IrArena;
use crate::module::Module;
use crate::node::{Node, Nodes, Payload};

/// The memo table of a rewrite, from source nodes to their images.
pub type RewriteMap<'s, 'd> = ImHashMap<Node<'s>, Option<Node<'d>>>;

/// State shared by all rewrites: the memoized `source → destination` map.
///
/// Declarations live in their own table, which scoped overrides never touch:
/// a pass that shadows a few values inside a subtree must not forget which
/// functions and constants it already emitted, or it would emit them twice.
pub struct Rewriter<'s, 'd> {
    map: RewriteMap<'s, 'd>,
    decls: RewriteMap<'s, 'd>,
}

impl<'s, 'd> Default for Rewriter<'s, 'd> {
    fn default() -> Self {
        Rewriter { map: RewriteMap::new(), decls: RewriteMap::new() }
    }
}

impl<'s, 'd> Rewriter<'s, 'd> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The memoized image of `src`, if it was already rewritten. The outer
    /// `Option` is the memo hit; the inner one is `None` for erased nodes.
    #[must_use]
    pub fn lookup(&self, src: Node<'s>) -> Option<Option<Node<'d>>> {
        self.decls.get(&src).or_else(|| self.map.get(&src)).copied()
    }

    /// Seeds the memo table.
    pub fn register_processed(&mut self, src: Node<'s>, dst: Node<'d>) {
        if src.is_declaration() {
            self.decls.insert(src, Some(dst));
        } else {
            self.map.insert(src, Some(dst));
        }
    }

    /// Seeds the memo table with an erasure.
    pub fn register_erased(&mut self, src: Node<'s>) {
        if src.is_declaration() {
            self.decls.insert(src, None);
        } else {
            self.map.insert(src, None);
        }
    }

    /// Seeds the memo table pairwise.
    pub fn register_processed_list(&mut self, srcs: Nodes<'s>, dsts: Nodes<'d>) {
        assert!(srcs.len() == dsts.len(), "mismatched lists");
        for (src, dst) in srcs.iter().zip(dsts.iter()) {
            self.register_processed(*src, *dst);
        }
    }

    /// Drops a non-declaration mapping, so the node gets rewritten anew.
    pub fn forget(&mut self, src: Node<'s>) {
        self.map.remove(&src);
    }

    /// Snapshots the value memo for a scoped override. O(1).
    #[must_use]
    pub fn save(&self) -> RewriteMap<'s, 'd> {
        self.map.clone()
    }

    /// Restores a snapshot, popping a scoped override. Declaration images
    /// are kept.
    pub fn restore(&mut self, saved: RewriteMap<'s, 'd>) {
        self.map = saved;
    }
}

/// A rewriting pass. The default `rewrite_node` clones nodes unchanged.
pub trait Rewrite<'s, 'd> {
    fn rewriter(&mut self) -> &mut Rewriter<'s, 'd>;

    /// The per-node override. Returning `None` erases the node.
    fn rewrite_node(
        &mut self,
        a: &mut IrArena<'d>,
        m: &mut Module<'d>,
        node: Node<'s>,
    ) -> Option<Node<'d>> {
        Some(recreate_node_identity(self, a, m, node))
    }
}

/// The trivial rewrite: recreates everything as-is.
pub struct IdentityRewriter<'s, 'd> {
    pub rewriter: Rewriter<'s, 'd>,
}

impl<'s, 'd> Default for IdentityRewriter<'s, 'd> {
    fn default() -> Self {
        IdentityRewriter { rewriter: Rewriter::new() }
    }
}

impl<'s, 'd> Rewrite<'s, 'd> for IdentityRewriter<'s, 'd> {
    fn rewriter(&mut self) -> &mut Rewriter<'s, 'd> {
        &mut self.rewriter
    }
}

/// Rewrites `node`, memoized: the first call computes the image through the
/// pass's override, subsequent calls return the same image.
pub fn rewrite_node<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    node: Node<'s>,
) -> Option<Node<'d>> {
    if let Some(found) = r.rewriter().lookup(node) {
        return found;
    }
    let image = r.rewrite_node(a, m, node);
    match image {
        Some(image) => r.rewriter().register_processed(node, image),
        None => r.rewriter().register_erased(node),
    }
    image
}

/// Rewrites a node that is not allowed to be erased.
pub fn rw<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    node: Node<'s>,
) -> Node<'d> {
    rewrite_node(r, a, m, node)
        .unwrap_or_else(|| panic!("node was erased but is still referenced: {node:?}"))
}

/// Rewrites a whole list.
pub fn rewrite_nodes<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    nodes: Nodes<'s>,
) -> Nodes<'d> {
    let images: Vec<Node<'d>> = nodes.iter().map(|n| rw(r, a, m, *n)).collect();
    a.nodes(&images)
}

fn rewrite_opt<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    node: Option<Node<'s>>,
) -> Option<Node<'d>> {
    node.map(|n| rw(r, a, m, n))
}

/// Recreates fresh parameters with rewritten types, without touching the
/// memo table; the caller decides what they stand for.
pub fn recreate_params<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    params: Nodes<'s>,
) -> Nodes<'d> {
    let fresh: Vec<Node<'d>> = params
        .iter()
        .map(|p| match **p {
            Payload::Param { ty, name, .. } => {
                let ty = rewrite_opt(r, a, m, ty);
                Node::param(ty, name, a)
            },
            _ => panic!("not a parameter: {p:?}"),
        })
        .collect();
    a.nodes(&fresh)
}

/// Allocates an empty destination shell for a declaration, with a translated
/// header but no body, and registers the mapping so recursive self-references
/// resolve to the shell. The body is filled in as a separate step.
pub fn recreate_decl_header_identity<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    decl: Node<'s>,
) -> Node<'d> {
    let new = match *decl {
        Payload::Function(f) => {
            let annotations = rewrite_nodes(r, a, m, f.annotations);
            let params = rewrite_nodes(r, a, m, f.params);
            let return_types = rewrite_nodes(r, a, m, f.return_types);
            Node::function(m, params, f.name, annotations, return_types, a)
        },
        Payload::Constant(c) => {
            let annotations = rewrite_nodes(r, a, m, c.annotations);
            let type_hint = rw(r, a, m, c.type_hint);
            Node::constant(m, annotations, type_hint, c.name, a)
        },
        Payload::GlobalVariable(g) => {
            let annotations = rewrite_nodes(r, a, m, g.annotations);
            let ty = rw(r, a, m, g.ty);
            Node::global_var(m, annotations, ty, g.name, g.space, a)
        },
        Payload::NominalType(t) => {
            let annotations = rewrite_nodes(r, a, m, t.annotations);
            Node::nominal_type(m, annotations, t.name, a)
        },
        _ => panic!("not a declaration: {decl:?}"),
    };
    r.rewriter().register_processed(decl, new);
    new
}

/// Clones `node` into the destination arena by rewriting every sub-node,
/// producing the structurally identical image.
#[allow(clippy::too_many_lines)]
pub fn recreate_node_identity<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    node: Node<'s>,
) -> Node<'d> {
    match *node {
        // Types
        Payload::QualifiedType { uniform, ty } => {
            let ty = rw(r, a, m, ty);
            Node::qualified_type(uniform, ty, a)
        },
        Payload::NoRet => Node::noret_type(a),
        Payload::Int { width, signed } => Node::int_type(width, signed, a),
        Payload::Float { width } => Node::float_type(width, a),
        Payload::Bool => Node::bool_type(a),
        Payload::Mask => Node::mask_type(a),
        Payload::Ptr { space, pointee } => {
            let pointee = rw(r, a, m, pointee);
            Node::ptr_type(space, pointee, a)
        },
        Payload::Arr { element, size } => {
            let element = rw(r, a, m, element);
            let size = rewrite_opt(r, a, m, size);
            Node::arr_type(element, size, a)
        },
        Payload::Pack { element, width } => {
            let element = rw(r, a, m, element);
            Node::pack_type(element, width, a)
        },
        Payload::Record { members, names, special } => {
            let members = rewrite_nodes(r, a, m, members);
            let names = a.strings(names.as_slice());
            Node::record_type(members, names, special, a)
        },
        Payload::FnType { params, returns } => {
            let params = rewrite_nodes(r, a, m, params);
            let returns = rewrite_nodes(r, a, m, returns);
            Node::fn_type(params, returns, a)
        },
        Payload::BBType { params } => {
            let params = rewrite_nodes(r, a, m, params);
            Node::bb_type(params, a)
        },
        Payload::LamType { params } => {
            let params = rewrite_nodes(r, a, m, params);
            Node::lam_type(params, a)
        },
        Payload::JoinPointType { yields } => {
            let yields = rewrite_nodes(r, a, m, yields);
            Node::join_point_type(yields, a)
        },
        Payload::TypeDeclRef { decl } => {
            let decl = rw(r, a, m, decl);
            Node::type_decl_ref(decl, a)
        },

        // Values
        Payload::Param { ty, name, .. } => {
            let ty = rewrite_opt(r, a, m, ty);
            Node::param(ty, name, a)
        },
        Payload::IntLiteral { width, signed, value } => Node::int_literal(width, signed, value, a),
        Payload::FloatLiteral { width, bits } => Node::float_literal(width, bits, a),
        Payload::True => Node::true_literal(a),
        Payload::False => Node::false_literal(a),
        Payload::StringLiteral { string } => Node::string_literal_node(string, a),
        Payload::Composite { ty, contents } => {
            let ty = rw(r, a, m, ty);
            let contents = rewrite_nodes(r, a, m, contents);
            Node::composite(ty, contents, a)
        },
        Payload::RefDecl { decl } => {
            let decl = rw(r, a, m, decl);
            Node::ref_decl(decl, a)
        },
        Payload::FnAddr { function } => {
            let function = rw(r, a, m, function);
            Node::fn_addr(function, a)
        },
        Payload::AbsMem { abs } => {
            let abs = rw(r, a, m, abs);
            abs.abstraction_mem(a)
        },

        // Instructions
        Payload::PrimOp { op, type_args, operands } => {
            let type_args = rewrite_nodes(r, a, m, type_args);
            let operands = rewrite_nodes(r, a, m, operands);
            Node::prim_op(op, type_args, operands, a)
        },
        Payload::Call { callee, args, mem } => {
            let callee = rw(r, a, m, callee);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::call(callee, args, mem, a)
        },
        Payload::Load { ptr, mem } => {
            let ptr = rw(r, a, m, ptr);
            let mem = rw(r, a, m, mem);
            Node::load(ptr, mem, a)
        },
        Payload::Store { ptr, value, mem } => {
            let ptr = rw(r, a, m, ptr);
            let value = rw(r, a, m, value);
            let mem = rw(r, a, m, mem);
            Node::store(ptr, value, mem, a)
        },
        Payload::Lea { ptr, offset, indices } => {
            let ptr = rw(r, a, m, ptr);
            let offset = rw(r, a, m, offset);
            let indices = rewrite_nodes(r, a, m, indices);
            Node::lea(ptr, offset, indices, a)
        },
        Payload::PushStack { value, mem } => {
            let value = rw(r, a, m, value);
            let mem = rw(r, a, m, mem);
            Node::push_stack(value, mem, a)
        },
        Payload::PopStack { ty, mem } => {
            let ty = rw(r, a, m, ty);
            let mem = rw(r, a, m, mem);
            Node::pop_stack(ty, mem, a)
        },
        Payload::GetStackSize { mem } => {
            let mem = rw(r, a, m, mem);
            Node::get_stack_size(mem, a)
        },
        Payload::SetStackSize { value, mem } => {
            let value = rw(r, a, m, value);
            let mem = rw(r, a, m, mem);
            Node::set_stack_size(value, mem, a)
        },
        Payload::GetStackBaseAddr => Node::get_stack_base_addr(a),
        Payload::If { yield_types, condition, true_case, false_case, mem } => {
            let yield_types = rewrite_nodes(r, a, m, yield_types);
            let condition = rw(r, a, m, condition);
            let true_case = rw(r, a, m, true_case);
            let false_case = rewrite_opt(r, a, m, false_case);
            let mem = rw(r, a, m, mem);
            Node::if_instr(yield_types, condition, true_case, false_case, mem, a)
        },
        Payload::Loop { yield_types, initial_args, body, mem } => {
            let yield_types = rewrite_nodes(r, a, m, yield_types);
            let initial_args = rewrite_nodes(r, a, m, initial_args);
            let body = rw(r, a, m, body);
            let mem = rw(r, a, m, mem);
            Node::loop_instr(yield_types, initial_args, body, mem, a)
        },
        Payload::Match { yield_types, inspect, literals, cases, default_case, mem } => {
            let yield_types = rewrite_nodes(r, a, m, yield_types);
            let inspect = rw(r, a, m, inspect);
            let literals = rewrite_nodes(r, a, m, literals);
            let cases = rewrite_nodes(r, a, m, cases);
            let default_case = rw(r, a, m, default_case);
            let mem = rw(r, a, m, mem);
            Node::match_instr(yield_types, inspect, literals, cases, default_case, mem, a)
        },
        Payload::Control { yield_types, inside, mem } => {
            let yield_types = rewrite_nodes(r, a, m, yield_types);
            let inside = rw(r, a, m, inside);
            let mem = rw(r, a, m, mem);
            Node::control(yield_types, inside, mem, a)
        },
        Payload::Block { yields, entry, mem } => {
            let yields = rewrite_nodes(r, a, m, yields);
            let entry = rw(r, a, m, entry);
            let mem = rw(r, a, m, mem);
            Node::block_instr(yields, entry, mem, a)
        },

        // Terminators
        Payload::Let { instruction, tail } => {
            let instruction = rw(r, a, m, instruction);
            let tail = rw(r, a, m, tail);
            Node::let_(instruction, tail, a)
        },
        Payload::Jump { target, args, mem } => {
            let target = rw(r, a, m, target);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::jump(target, args, mem, a)
        },
        Payload::Branch { condition, true_target, false_target, args, mem } => {
            let condition = rw(r, a, m, condition);
            let true_target = rw(r, a, m, true_target);
            let false_target = rw(r, a, m, false_target);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::branch(condition, true_target, false_target, args, mem, a)
        },
        Payload::Switch { inspect, literals, targets, default_target, args, mem } => {
            let inspect = rw(r, a, m, inspect);
            let literals = rewrite_nodes(r, a, m, literals);
            let targets = rewrite_nodes(r, a, m, targets);
            let default_target = rw(r, a, m, default_target);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::br_switch(inspect, literals, targets, default_target, args, mem, a)
        },
        Payload::Return { args, mem } => {
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::fn_ret(args, mem, a)
        },
        Payload::TailCall { callee, args, mem } => {
            let callee = rw(r, a, m, callee);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::tail_call(callee, args, mem, a)
        },
        Payload::Join { join_point, args, mem } => {
            let join_point = rw(r, a, m, join_point);
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::join(join_point, args, mem, a)
        },
        Payload::MergeSelection { args, mem } => {
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::merge_selection(args, mem, a)
        },
        Payload::MergeContinue { args, mem } => {
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::merge_continue(args, mem, a)
        },
        Payload::MergeBreak { args, mem } => {
            let args = rewrite_nodes(r, a, m, args);
            let mem = rw(r, a, m, mem);
            Node::merge_break(args, mem, a)
        },
        Payload::Unreachable { mem } => {
            let mem = rw(r, a, m, mem);
            Node::unreachable(mem, a)
        },

        // Abstractions and declarations
        Payload::AnonLambda { params, body } => {
            let params = rewrite_nodes(r, a, m, params);
            let body = rw(r, a, m, body);
            Node::anon_lambda(params, body, a)
        },
        Payload::BasicBlock(bb) => {
            let params = rewrite_nodes(r, a, m, bb.params);
            let new = match bb.name {
                Some(name) => Node::basic_block(params, name, a),
                None => Node::case(params, a),
            };
            r.rewriter().register_processed(node, new);
            if let Some(body) = bb.body.get() {
                let body = rw(r, a, m, body);
                new.set_abstraction_body(body);
            }
            new
        },
        Payload::Function(f) => {
            let new = recreate_decl_header_identity(r, a, m, node);
            if let Some(body) = f.body.get() {
                let body = rw(r, a, m, body);
                new.set_abstraction_body(body);
            }
            new
        },
        Payload::Constant(c) => {
            let new = recreate_decl_header_identity(r, a, m, node);
            if let Some(value) = c.value.get() {
                let value = rw(r, a, m, value);
                new.set_constant_value(value);
            }
            new
        },
        Payload::GlobalVariable(g) => {
            let new = recreate_decl_header_identity(r, a, m, node);
            if let Some(init) = g.init.get() {
                let init = rw(r, a, m, init);
                new.set_global_init(init);
            }
            new
        },
        Payload::NominalType(t) => {
            let new = recreate_decl_header_identity(r, a, m, node);
            if let Some(body) = t.body.get() {
                let body = rw(r, a, m, body);
                new.set_nominal_type_body(body);
            }
            new
        },

        // Annotations
        Payload::Annotation { name } => Node::annotation(name, a),
        Payload::AnnotationValue { name, value } => {
            let value = rw(r, a, m, value);
            Node::annotation_value(name, value, a)
        },
        Payload::AnnotationValues { name, values } => {
            let values = rewrite_nodes(r, a, m, values);
            Node::annotation_values(name, values, a)
        },
    }
}

/// Rewrites every declaration of `src` into the destination module, in
/// order.
pub fn rewrite_module<'s, 'd, R: Rewrite<'s, 'd> + ?Sized>(
    r: &mut R,
    a: &mut IrArena<'d>,
    m: &mut Module<'d>,
    src: &Module<'s>,
) {
    for decl in src.declarations() {
        let _ = rewrite_node(r, a, m, *decl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::builder::BodyBuilder;
    use crate::node::{AddressSpace, Op};
    use crate::print::print_module_into_string;

    fn build_sample_module<'arena>(a: &mut IrArena<'arena>) -> Module<'arena> {
        let mut module = Module::new("sample");
        let u32_t = Node::uint32_type(a);
        let ptr_t = Node::ptr_type(AddressSpace::Global, u32_t, a);
        let qptr = Node::qualified_type(true, ptr_t, a);
        let p = Node::param(Some(qptr), Some("p"), a);
        let params = a.nodes(&[p]);
        let empty = a.nodes(&[]);
        let uniform_u32 = Node::qualified_type(true, u32_t, a);
        let returns = a.nodes(&[uniform_u32]);
        let fun = Node::function(&mut module, params, "get", empty, returns, a);
        let mem = fun.abstraction_mem(a);
        let mut bb = BodyBuilder::begin_body_with_mem(mem);
        let loaded = bb.gen_load(a, p);
        let one = Node::uint32_literal(1, a);
        let operands = a.nodes(&[loaded, one]);
        let sum = bb.gen_primop_e(a, Op::Add, empty, operands);
        let args = a.nodes(&[sum]);
        let body = bb.finish_body_with_return(a, args);
        fun.set_abstraction_body(body);
        module
    }

    #[test]
    fn identity_rewrite_preserves_the_serialized_form() {
        let printed = use_arena(ArenaConfig::default(), |arena| {
            let module = build_sample_module(arena);
            print_module_into_string(&module)
        });
        let rewritten = use_arena(ArenaConfig::default(), |src_arena| {
            let src = build_sample_module(src_arena);
            use_arena(ArenaConfig::default(), |dst_arena| {
                let mut dst = Module::new(src.name());
                let mut pass = IdentityRewriter::default();
                rewrite_module(&mut pass, dst_arena, &mut dst, &src);
                print_module_into_string(&dst)
            })
        });
        assert_eq!(printed, rewritten);
    }

    #[test]
    fn rewriting_twice_returns_the_same_image() {
        use_arena(ArenaConfig::default(), |src_arena| {
            let src = build_sample_module(src_arena);
            let fun = src.find_declaration("get").unwrap();
            use_arena(ArenaConfig::default(), |dst_arena| {
                let mut dst = Module::new("out");
                let mut pass = IdentityRewriter::default();
                let first = rewrite_node(&mut pass, dst_arena, &mut dst, fun);
                let second = rewrite_node(&mut pass, dst_arena, &mut dst, fun);
                assert_eq!(first, second);
            });
        });
    }

    #[test]
    fn scoped_overrides_pop_cleanly() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut dst = Module::new("out");
            let mut pass = IdentityRewriter::default();

            let lit = Node::uint32_literal(7, arena);
            let image = rewrite_node(&mut pass, arena, &mut dst, lit).unwrap();

            // shadow the literal inside an overlay, then pop it
            let saved = pass.rewriter.save();
            let shadow = Node::uint32_literal(8, arena);
            pass.rewriter.forget(lit);
            pass.rewriter.register_processed(lit, shadow);
            assert_eq!(pass.rewriter.lookup(lit), Some(Some(shadow)));
            pass.rewriter.restore(saved);
            assert_eq!(pass.rewriter.lookup(lit), Some(Some(image)));
        });
    }

    #[test]
    fn declaration_images_survive_overlays() {
        use_arena(ArenaConfig::default(), |arena| {
            let src = build_sample_module(arena);
            let fun = src.find_declaration("get").unwrap();
            let mut dst = Module::new("out");
            let mut pass = IdentityRewriter::default();
            let image = rewrite_node(&mut pass, arena, &mut dst, fun).unwrap();

            let saved = pass.rewriter.save();
            pass.rewriter.restore(saved);
            assert_eq!(pass.rewriter.lookup(fun), Some(Some(image)));
        });
    }
}
