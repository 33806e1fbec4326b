//! The body builder: an imperative façade over the immutable IR.
//!
//! A builder accumulates instructions, allocating output variables for each,
//! and finally folds them into a terminator-rooted body of nested lets while
//! threading the explicit memory chain. A builder is used exactly once: it is
//! either finished into a body, closed into a wrapper instruction, or
//! cancelled.
//!
//! Side-effect blocks are the subtle part. A builder begun with
//! [`BodyBuilder::begin_block_with_side_effects`] chains its instructions off
//! the sentinel of a placeholder block. Closing it yields an ordinary-looking
//! instruction; when that instruction is later folded by the *outer* builder,
//! the deferred contents attached to the sentinel are emplaced as a real
//! block and the surrounding code is routed through it with a jump. This is
//! how helpers insert control flow through what appears to be a pure
//! value-producing expression.

use crate::arena::IrArena;
use crate::node::{Node, Nodes, Op, Payload};
use crate::type_checker::{check_subtype, unwrap_multiple_yield_types};

/// One bound instruction, with the variables its outputs were bound to.
#[derive(Clone, Copy)]
pub(crate) struct StackEntry<'arena> {
    pub instruction: Node<'arena>,
    pub params: Nodes<'arena>,
}

/// The unfinished contents of a side-effect block, parked on its placeholder
/// until the outer builder folds the wrapper instruction.
#[derive(Clone, Copy)]
pub(crate) struct DeferredBlock<'arena> {
    pub entries: &'arena [StackEntry<'arena>],
    /// The outer memory token active when the block was begun.
    pub entry_mem: Node<'arena>,
}

enum BuilderKind<'arena> {
    /// No memory effects, no abstraction context. For building constants.
    Pure,
    /// The body of an abstraction, begun from a memory token.
    Body,
    /// A side-effect block, to be spliced into an enclosing chain.
    Block { entry_block: Node<'arena>, entry_mem: Node<'arena> },
    /// A control region, closed with a join to its own join point.
    Control { entry_block: Node<'arena>, entry_mem: Node<'arena>, yield_types: Nodes<'arena> },
}

/// See the [module documentation](self).
pub struct BodyBuilder<'arena> {
    kind: BuilderKind<'arena>,
    stack: Vec<StackEntry<'arena>>,
    mem: Option<Node<'arena>>,
}

impl<'arena> BodyBuilder<'arena> {
    /// Starts building a body whose memory chain begins at `mem`, usually an
    /// abstraction's sentinel.
    #[must_use]
    pub fn begin_body_with_mem(mem: Node<'arena>) -> Self {
        assert!(mem.is_mem_token(), "not a memory token: {mem:?}");
        BodyBuilder { kind: BuilderKind::Body, stack: Vec::new(), mem: Some(mem) }
    }

    /// Starts a pure block, with no memory chain at all.
    #[must_use]
    pub fn begin_block_pure() -> Self {
        BodyBuilder { kind: BuilderKind::Pure, stack: Vec::new(), mem: None }
    }

    /// Starts a side-effect block that will be spliced into the chain
    /// carrying `mem`.
    #[must_use]
    pub fn begin_block_with_side_effects(
        a: &mut IrArena<'arena>,
        mem: Node<'arena>,
    ) -> Self {
        assert!(mem.is_mem_token(), "not a memory token: {mem:?}");
        let params = a.nodes(&[]);
        let entry_block = Node::case(params, a);
        let entry = entry_block.abstraction_mem(a);
        BodyBuilder {
            kind: BuilderKind::Block { entry_block, entry_mem: mem },
            stack: Vec::new(),
            mem: Some(entry),
        }
    }

    /// Starts a control region yielding `yield_types` (unqualified data
    /// types), spliced into the chain carrying `mem`. Closed with
    /// [`Self::yield_values_and_wrap_in_control`].
    #[must_use]
    pub fn begin_control(
        a: &mut IrArena<'arena>,
        yield_types: Nodes<'arena>,
        mem: Node<'arena>,
    ) -> Self {
        assert!(mem.is_mem_token(), "not a memory token: {mem:?}");
        let jp_type = Node::join_point_type(yield_types, a);
        let jp_qualified = Node::qualified_type(true, jp_type, a);
        let jp = Node::param(Some(jp_qualified), Some("jp"), a);
        let params = a.nodes(&[jp]);
        let entry_block = Node::case(params, a);
        let entry = entry_block.abstraction_mem(a);
        BodyBuilder {
            kind: BuilderKind::Control { entry_block, entry_mem: mem, yield_types },
            stack: Vec::new(),
            mem: Some(entry),
        }
    }

    /// The current memory token: the last effectful instruction bound, or the
    /// token the builder was begun from.
    #[must_use]
    pub fn mem(&self) -> Node<'arena> {
        self.mem.expect("pure blocks have no memory chain")
    }

    /// Appends an instruction. In a typed arena, returns the variables bound
    /// to the values it yields; quotes are unwrapped on the spot and yield
    /// their operands directly.
    pub fn bind_instruction(
        &mut self,
        a: &mut IrArena<'arena>,
        instruction: Node<'arena>,
    ) -> Nodes<'arena> {
        self.bind(a, instruction, None, None, None)
    }

    /// Like [`Self::bind_instruction`], with debug names for the outputs.
    pub fn bind_instruction_named(
        &mut self,
        a: &mut IrArena<'arena>,
        instruction: Node<'arena>,
        names: &[&str],
    ) -> Nodes<'arena> {
        self.bind(a, instruction, None, None, Some(names))
    }

    /// The variant for untyped arenas: the yield arity cannot be guessed
    /// without typing information, so it is given explicitly, optionally with
    /// types and names.
    pub fn bind_instruction_extra(
        &mut self,
        a: &mut IrArena<'arena>,
        instruction: Node<'arena>,
        count: usize,
        types: Option<&[Node<'arena>]>,
        names: Option<&[&str]>,
    ) -> Nodes<'arena> {
        self.bind(a, instruction, Some(count), types, names)
    }

    fn bind(
        &mut self,
        a: &mut IrArena<'arena>,
        instruction: Node<'arena>,
        count: Option<usize>,
        provided_types: Option<&[Node<'arena>]>,
        names: Option<&[&str]>,
    ) -> Nodes<'arena> {
        assert!(instruction.is_instruction(), "cannot bind {instruction:?}");

        // a quote binds its operands directly, no let is emitted
        if let Payload::PrimOp { op: Op::Quote, operands, .. } = *instruction {
            return operands;
        }

        let types: Vec<Option<Node<'arena>>> = if a.config().check_types {
            let produced = unwrap_multiple_yield_types(
                instruction.ty().expect("instruction has no type"),
            );
            if let Some(provided) = provided_types {
                assert!(provided.len() == produced.len(), "wrong output arity");
                for (provided, produced) in provided.iter().zip(produced.iter()) {
                    check_subtype(*provided, *produced);
                }
                provided.iter().copied().map(Some).collect()
            } else {
                if let Some(count) = count {
                    assert!(count == produced.len(), "wrong output arity");
                }
                produced.into_iter().map(Some).collect()
            }
        } else {
            let count = count.expect("untyped arenas need an explicit output arity");
            match provided_types {
                Some(provided) => {
                    assert!(provided.len() == count, "wrong output arity");
                    provided.iter().copied().map(Some).collect()
                },
                None => vec![None; count],
            }
        };

        let default_name = instruction.tag_name();
        let params: Vec<Node<'arena>> = types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let name = names.map_or(default_name, |names| names[i]);
                Node::param(*ty, Some(name), a)
            })
            .collect();
        let params = a.nodes(&params);

        self.stack.push(StackEntry { instruction, params });
        if instruction.instruction_mem().is_some() {
            assert!(self.mem.is_some(), "effectful instruction in a pure block");
            self.mem = Some(instruction);
        }
        params
    }

    // Convenience helpers constructing the instruction and binding it.

    pub fn gen_primop(
        &mut self,
        a: &mut IrArena<'arena>,
        op: Op,
        type_args: Nodes<'arena>,
        operands: Nodes<'arena>,
    ) -> Nodes<'arena> {
        let instruction = Node::prim_op(op, type_args, operands, a);
        self.bind_instruction(a, instruction)
    }

    /// Like [`Self::gen_primop`], for operations yielding a single value.
    pub fn gen_primop_e(
        &mut self,
        a: &mut IrArena<'arena>,
        op: Op,
        type_args: Nodes<'arena>,
        operands: Nodes<'arena>,
    ) -> Node<'arena> {
        self.gen_primop(a, op, type_args, operands).first()
    }

    pub fn gen_load(&mut self, a: &mut IrArena<'arena>, ptr: Node<'arena>) -> Node<'arena> {
        let mem = self.mem();
        let instruction = Node::load(ptr, mem, a);
        self.bind_instruction(a, instruction).first()
    }

    pub fn gen_store(
        &mut self,
        a: &mut IrArena<'arena>,
        ptr: Node<'arena>,
        value: Node<'arena>,
    ) {
        let mem = self.mem();
        let instruction = Node::store(ptr, value, mem, a);
        let _ = self.bind_instruction(a, instruction);
    }

    pub fn gen_lea(
        &mut self,
        a: &mut IrArena<'arena>,
        ptr: Node<'arena>,
        offset: Node<'arena>,
        indices: Nodes<'arena>,
    ) -> Node<'arena> {
        let instruction = Node::lea(ptr, offset, indices, a);
        self.bind_instruction(a, instruction).first()
    }

    pub fn gen_call(
        &mut self,
        a: &mut IrArena<'arena>,
        callee: Node<'arena>,
        args: Nodes<'arena>,
    ) -> Nodes<'arena> {
        let mem = self.mem();
        let instruction = Node::call(callee, args, mem, a);
        self.bind_instruction(a, instruction)
    }

    /// Embeds a structured selection. The cases are built by the caller, from
    /// their own sentinels, and must merge back with `merge_selection`.
    pub fn gen_if(
        &mut self,
        a: &mut IrArena<'arena>,
        yield_types: Nodes<'arena>,
        condition: Node<'arena>,
        true_case: Node<'arena>,
        false_case: Option<Node<'arena>>,
    ) -> Nodes<'arena> {
        let mem = self.mem();
        let instruction = Node::if_instr(yield_types, condition, true_case, false_case, mem, a);
        self.bind_instruction(a, instruction)
    }

    /// Embeds a structured loop; the body merges back with `merge_continue`
    /// or `merge_break`.
    pub fn gen_loop(
        &mut self,
        a: &mut IrArena<'arena>,
        yield_types: Nodes<'arena>,
        initial_args: Nodes<'arena>,
        body: Node<'arena>,
    ) -> Nodes<'arena> {
        let mem = self.mem();
        let instruction = Node::loop_instr(yield_types, initial_args, body, mem, a);
        self.bind_instruction(a, instruction)
    }

    pub fn gen_match(
        &mut self,
        a: &mut IrArena<'arena>,
        yield_types: Nodes<'arena>,
        inspect: Node<'arena>,
        literals: Nodes<'arena>,
        cases: Nodes<'arena>,
        default_case: Node<'arena>,
    ) -> Nodes<'arena> {
        let mem = self.mem();
        let instruction =
            Node::match_instr(yield_types, inspect, literals, cases, default_case, mem, a);
        self.bind_instruction(a, instruction)
    }

    pub fn gen_push_stack(&mut self, a: &mut IrArena<'arena>, value: Node<'arena>) {
        let mem = self.mem();
        let instruction = Node::push_stack(value, mem, a);
        let _ = self.bind_instruction(a, instruction);
    }

    pub fn gen_pop_stack(&mut self, a: &mut IrArena<'arena>, ty: Node<'arena>) -> Node<'arena> {
        let mem = self.mem();
        let instruction = Node::pop_stack(ty, mem, a);
        self.bind_instruction(a, instruction).first()
    }

    pub fn gen_get_stack_size(&mut self, a: &mut IrArena<'arena>) -> Node<'arena> {
        let mem = self.mem();
        let instruction = Node::get_stack_size(mem, a);
        self.bind_instruction(a, instruction).first()
    }

    pub fn gen_set_stack_size(&mut self, a: &mut IrArena<'arena>, value: Node<'arena>) {
        let mem = self.mem();
        let instruction = Node::set_stack_size(value, mem, a);
        let _ = self.bind_instruction(a, instruction);
    }

    /// Folds the stack right-to-left into nested lets around `terminator`,
    /// emplacing any deferred side-effect blocks encountered on the way.
    pub fn finish_body(self, a: &mut IrArena<'arena>, terminator: Node<'arena>) -> Node<'arena> {
        assert!(
            matches!(self.kind, BuilderKind::Body),
            "only bodies are finished with a terminator; close blocks by wrapping them"
        );
        assert!(terminator.is_terminator(), "not a terminator: {terminator:?}");
        fold_entries(a, &self.stack, terminator)
    }

    /// Sugar for finishing with a `return`.
    pub fn finish_body_with_return(
        self,
        a: &mut IrArena<'arena>,
        args: Nodes<'arena>,
    ) -> Node<'arena> {
        let mem = self.mem();
        let terminator = Node::fn_ret(args, mem, a);
        self.finish_body(a, terminator)
    }

    /// Sugar for finishing a selection case with a `merge_selection`.
    pub fn finish_body_with_selection_merge(
        self,
        a: &mut IrArena<'arena>,
        args: Nodes<'arena>,
    ) -> Node<'arena> {
        let mem = self.mem();
        let terminator = Node::merge_selection(args, mem, a);
        self.finish_body(a, terminator)
    }

    /// Closes the builder into a value-yielding instruction.
    ///
    /// Pure blocks must have folded everything away and simply quote their
    /// values; side-effect blocks park their contents on the placeholder
    /// sentinel and return the wrapper instruction.
    pub fn yield_values_and_wrap_in_block(
        self,
        a: &mut IrArena<'arena>,
        values: Nodes<'arena>,
    ) -> Node<'arena> {
        match self.kind {
            BuilderKind::Pure => {
                assert!(
                    self.stack.is_empty(),
                    "pure blocks with unfolded instructions cannot be wrapped"
                );
                Node::quote(values, a)
            },
            BuilderKind::Block { entry_block, entry_mem } => {
                let entries = a.alloc_slice(&self.stack);
                let bb = entry_block.basic_block_data();
                assert!(bb.insert.get().is_none(), "block wrapped twice");
                bb.insert.set(Some(DeferredBlock { entries, entry_mem }));
                let mem = self.mem.expect("side-effect blocks have a chain");
                Node::block_instr(values, entry_block, mem, a)
            },
            _ => panic!("only pure and side-effect blocks can be wrapped in a block"),
        }
    }

    /// Single-value overload of [`Self::yield_values_and_wrap_in_block`].
    pub fn yield_value_and_wrap_in_block(
        self,
        a: &mut IrArena<'arena>,
        value: Node<'arena>,
    ) -> Node<'arena> {
        let values = a.nodes(&[value]);
        let wrapped = self.yield_values_and_wrap_in_block(a, values);
        match *wrapped {
            Payload::PrimOp { op: Op::Quote, operands, .. } if operands.len() == 1 => {
                operands.first()
            },
            _ => wrapped,
        }
    }

    /// Closes a control region: joins `values` to the region's join point and
    /// returns the `control` instruction.
    pub fn yield_values_and_wrap_in_control(
        self,
        a: &mut IrArena<'arena>,
        values: Nodes<'arena>,
    ) -> Node<'arena> {
        let BuilderKind::Control { entry_block, entry_mem, yield_types } = self.kind else {
            panic!("only control regions can be wrapped in a control")
        };
        let jp = entry_block.abstraction_params().first();
        let mem = self.mem.expect("control regions have a chain");
        let terminator = Node::join(jp, values, mem, a);
        let body = fold_entries(a, &self.stack, terminator);
        entry_block.set_abstraction_body(body);
        Node::control(yield_types, entry_block, entry_mem, a)
    }

    /// Discards the builder and everything bound into it.
    pub fn cancel_body(self) {
        drop(self);
    }
}

/// The shared folding loop. Entries wrapping a deferred side-effect block
/// split the fold: everything below the wrapper becomes the block's body, and
/// the chain is re-entered with a jump.
fn fold_entries<'arena>(
    a: &mut IrArena<'arena>,
    entries: &[StackEntry<'arena>],
    terminator: Node<'arena>,
) -> Node<'arena> {
    let mut body = terminator;
    for entry in entries.iter().rev() {
        let tail = Node::anon_lambda(entry.params, body, a);
        body = Node::let_(entry.instruction, tail, a);

        if let Payload::Block { entry: block, .. } = *entry.instruction {
            let deferred = block
                .basic_block_data()
                .insert
                .take()
                .expect("block wrapper without deferred contents");
            let inner = fold_entries(a, deferred.entries, body);
            block.set_abstraction_body(inner);
            let args = a.nodes(&[]);
            body = Node::jump(block, args, deferred.entry_mem, a);
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::node::{AddressSpace, IntWidth};

    fn generic_u32_ptr_param<'arena>(a: &mut IrArena<'arena>) -> Node<'arena> {
        let u32_t = Node::uint32_type(a);
        let ptr_t = Node::ptr_type(AddressSpace::Generic, u32_t, a);
        let qptr = Node::qualified_type(false, ptr_t, a);
        Node::param(Some(qptr), None, a)
    }

    #[test]
    fn pure_block_folds_constants() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut bb = BodyBuilder::begin_block_pure();
            let empty = arena.nodes(&[]);
            let x = Node::int32_literal(4, arena);
            let y = Node::int32_literal(38, arena);
            let operands = arena.nodes(&[x, y]);
            let sum = bb.gen_primop_e(arena, Op::Add, empty, operands);
            let result = bb.yield_value_and_wrap_in_block(arena, sum);
            assert_eq!(sum, result);
            assert!(
                matches!(*result, Payload::IntLiteral { width: IntWidth::I32, value: 42, .. })
            );
        });
    }

    #[test]
    fn empty_body_is_just_the_terminator() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let empty = arena.nodes(&[]);
            let fun = Node::function(&mut module, empty, "nop", empty, empty, arena);
            let mem = fun.abstraction_mem(arena);
            let bb = BodyBuilder::begin_body_with_mem(mem);
            let terminator = Node::fn_ret(empty, mem, arena);
            let body = bb.finish_body(arena, terminator);
            assert_eq!(body, terminator);
        });
    }

    #[test]
    fn binding_a_load_yields_a_typed_variable() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let p = generic_u32_ptr_param(arena);
            let params = arena.nodes(&[p]);
            let empty = arena.nodes(&[]);
            let u32_t = Node::uint32_type(arena);
            let varying_u32 = Node::qualified_type(false, u32_t, arena);
            let returns = arena.nodes(&[varying_u32]);
            let fun = Node::function(&mut module, params, "f", empty, returns, arena);
            let mem = fun.abstraction_mem(arena);
            let mut bb = BodyBuilder::begin_body_with_mem(mem);
            let loaded = bb.gen_load(arena, p);
            assert!(matches!(*loaded, Payload::Param { .. }));
            assert_eq!(loaded.ty(), Some(varying_u32));
            let args = arena.nodes(&[loaded]);
            let body = bb.finish_body_with_return(arena, args);
            fun.set_abstraction_body(body);
        });
    }

    #[test]
    fn mem_chain_reaches_the_function_sentinel() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let p1 = generic_u32_ptr_param(arena);
            let p2 = generic_u32_ptr_param(arena);
            let params = arena.nodes(&[p1, p2]);
            let empty = arena.nodes(&[]);
            let u32_t = Node::uint32_type(arena);
            let varying_u32 = Node::qualified_type(false, u32_t, arena);
            let returns = arena.nodes(&[varying_u32]);
            let fun = Node::function(&mut module, params, "fun", empty, returns, arena);
            let fun_mem = fun.abstraction_mem(arena);
            let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);

            let p1_value = bb.gen_load(arena, p1);

            let true_case = Node::case(empty, arena);
            let tc_mem = true_case.abstraction_mem(arena);
            let mut tc = BodyBuilder::begin_body_with_mem(tc_mem);
            let zero = Node::uint32_literal(0, arena);
            tc.gen_store(arena, p1, zero);
            true_case.set_abstraction_body(tc.finish_body_with_selection_merge(arena, empty));

            let cmp_operands = arena.nodes(&[p1_value, zero]);
            let cond = bb.gen_primop_e(arena, Op::Gt, empty, cmp_operands);
            let _ = bb.gen_if(arena, empty, cond, true_case, None);

            let p2_value = bb.gen_load(arena, p2);
            let sum_operands = arena.nodes(&[p1_value, p2_value]);
            let sum = bb.gen_primop_e(arena, Op::Add, empty, sum_operands);

            let args = arena.nodes(&[sum]);
            let ret = Node::fn_ret(args, bb.mem(), arena);
            fun.set_abstraction_body(bb.finish_body(arena, ret));

            // walk the chain backwards from the return
            let mut mem = ret.terminator_mem().unwrap();
            let anchor = loop {
                match mem.parent_mem() {
                    Some(parent) => mem = parent,
                    None => break mem,
                }
            };
            assert_eq!(anchor, fun_mem);
        });
    }

    #[test]
    fn impure_deferred_block_splices_the_store() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let p1 = generic_u32_ptr_param(arena);
            let params = arena.nodes(&[p1]);
            let empty = arena.nodes(&[]);
            let u32_t = Node::uint32_type(arena);
            let varying_u32 = Node::qualified_type(false, u32_t, arena);
            let returns = arena.nodes(&[varying_u32]);
            let fun = Node::function(&mut module, params, "fun", empty, returns, arena);
            let fun_mem = fun.abstraction_mem(arena);
            let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);

            let first_load = bb.gen_load(arena, p1);

            let mut block = BodyBuilder::begin_block_with_side_effects(arena, bb.mem());
            let zero = Node::uint32_literal(0, arena);
            block.gen_store(arena, p1, zero);
            let wrapped = block.yield_values_and_wrap_in_block(arena, empty);
            let _ = bb.bind_instruction(arena, wrapped);

            let second_load = bb.gen_load(arena, p1);
            let sum_operands = arena.nodes(&[first_load, second_load]);
            let sum = bb.gen_primop_e(arena, Op::Add, empty, sum_operands);

            let args = arena.nodes(&[sum]);
            let ret = Node::fn_ret(args, bb.mem(), arena);
            fun.set_abstraction_body(bb.finish_body(arena, ret));

            // the store must show up when walking the chain backwards
            let mut found_store = false;
            let mut mem = Some(ret.terminator_mem().unwrap());
            while let Some(step) = mem {
                if matches!(*step, Payload::Store { .. }) {
                    found_store = true;
                }
                mem = step.parent_mem();
            }
            assert!(found_store);

            // the function itself now jumps through the emplaced block
            let body = fun.abstraction_body().unwrap();
            let leaf = crate::node::final_terminator(body);
            assert!(matches!(*leaf, Payload::Jump { .. }));
        });
    }

    #[test]
    fn deferred_block_with_structured_if() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let p1 = generic_u32_ptr_param(arena);
            let params = arena.nodes(&[p1]);
            let empty = arena.nodes(&[]);
            let u32_t = Node::uint32_type(arena);
            let varying_u32 = Node::qualified_type(false, u32_t, arena);
            let returns = arena.nodes(&[varying_u32]);
            let fun = Node::function(&mut module, params, "fun", empty, returns, arena);
            let fun_mem = fun.abstraction_mem(arena);
            let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);

            let first_load = bb.gen_load(arena, p1);

            let mut block = BodyBuilder::begin_block_with_side_effects(arena, bb.mem());
            let true_case = Node::case(empty, arena);
            let tc_mem = true_case.abstraction_mem(arena);
            let mut tc = BodyBuilder::begin_body_with_mem(tc_mem);
            let zero = Node::uint32_literal(0, arena);
            tc.gen_store(arena, p1, zero);
            true_case.set_abstraction_body(tc.finish_body_with_selection_merge(arena, empty));
            let cmp_operands = arena.nodes(&[first_load, zero]);
            let cond = block.gen_primop_e(arena, Op::Neq, empty, cmp_operands);
            let _ = block.gen_if(arena, empty, cond, true_case, None);
            let wrapped = block.yield_values_and_wrap_in_block(arena, empty);
            let _ = bb.bind_instruction(arena, wrapped);

            let second_load = bb.gen_load(arena, p1);
            let sum_operands = arena.nodes(&[first_load, second_load]);
            let sum = bb.gen_primop_e(arena, Op::Add, empty, sum_operands);

            let args = arena.nodes(&[sum]);
            let ret = Node::fn_ret(args, bb.mem(), arena);
            fun.set_abstraction_body(bb.finish_body(arena, ret));

            // the store lives in the true case only
            let store_chain: Vec<_> = {
                let tc_body = true_case.abstraction_body().unwrap();
                let mut found = Vec::new();
                let mut node = tc_body;
                while let Payload::Let { instruction, tail } = *node {
                    found.push(instruction);
                    let Payload::AnonLambda { body, .. } = *tail else { unreachable!() };
                    node = body;
                }
                found
            };
            assert!(store_chain.iter().any(|i| matches!(**i, Payload::Store { .. })));

            // and the emplaced block's body holds the if, not the store
            let body = fun.abstraction_body().unwrap();
            let leaf = crate::node::final_terminator(body);
            let Payload::Jump { target, .. } = *leaf else { panic!("expected a jump") };
            let mut node = target.abstraction_body().unwrap();
            let mut saw_if = false;
            while let Payload::Let { instruction, tail } = *node {
                assert!(!matches!(*instruction, Payload::Store { .. }));
                saw_if |= matches!(*instruction, Payload::If { .. });
                let Payload::AnonLambda { body, .. } = *tail else { unreachable!() };
                node = body;
            }
            assert!(saw_if);
        });
    }

    #[test]
    fn control_region_joins_back() {
        use_arena(ArenaConfig::default(), |arena| {
            let mut module = crate::module::Module::new("m");
            let empty = arena.nodes(&[]);
            let u32_t = Node::uint32_type(arena);
            let uniform_u32 = Node::qualified_type(true, u32_t, arena);
            let returns = arena.nodes(&[uniform_u32]);
            let fun = Node::function(&mut module, empty, "f", empty, returns, arena);
            let fun_mem = fun.abstraction_mem(arena);
            let mut bb = BodyBuilder::begin_body_with_mem(fun_mem);

            let yield_types = arena.nodes(&[u32_t]);
            let control_builder = BodyBuilder::begin_control(arena, yield_types, bb.mem());
            let forty_two = Node::uint32_literal(42, arena);
            let values = arena.nodes(&[forty_two]);
            let control = control_builder.yield_values_and_wrap_in_control(arena, values);
            let outputs = bb.bind_instruction(arena, control);
            assert_eq!(outputs.len(), 1);

            let body = bb.finish_body_with_return(arena, outputs);
            fun.set_abstraction_body(body);
        });
    }
}
