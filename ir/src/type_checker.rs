//! Type checking.
//!
//! Invoked from node construction whenever the arena's configuration asks for
//! it: every variant has a rule here that computes the node's type or
//! validates its payload. A violated rule is a design-level programming error
//! in whatever built the node, so the rules abort after printing the
//! offending nodes rather than propagating a result.

use crate::arena::{IrArena, SubgroupMaskRepr};
use crate::node::{AddressSpace, Node, Nodes, Op, Payload, RecordSpecial};

/// `uniform T <: varying T`; records subtype memberwise; abstraction types
/// are contravariant in parameters and covariant in returns; pointers require
/// the same address space and a subtyping pointee.
#[must_use]
pub fn is_subtype<'a>(supertype: Node<'a>, ty: Node<'a>) -> bool {
    match (*supertype, *ty) {
        (
            Payload::QualifiedType { uniform: super_uniform, ty: super_ty },
            Payload::QualifiedType { uniform, ty },
        ) => {
            // uniform T <: varying T
            if super_uniform && !uniform {
                return false;
            }
            is_subtype(super_ty, ty)
        },
        (
            Payload::Record { members: supermembers, special: super_special, .. },
            Payload::Record { members, special, .. },
        ) => {
            super_special == special
                && supermembers.len() == members.len()
                && supermembers.iter().zip(members.iter()).all(|(s, t)| is_subtype(*s, *t))
        },
        (
            Payload::JoinPointType { yields: superyields },
            Payload::JoinPointType { yields },
        ) => {
            superyields.len() == yields.len()
                && yields.iter().zip(superyields.iter()).all(|(t, s)| is_subtype(*t, *s))
        },
        (
            Payload::FnType { params: superparams, returns: superreturns },
            Payload::FnType { params, returns },
        ) => {
            superreturns.len() == returns.len()
                && superparams.len() == params.len()
                && superreturns.iter().zip(returns.iter()).all(|(s, t)| is_subtype(*s, *t))
                && params.iter().zip(superparams.iter()).all(|(t, s)| is_subtype(*t, *s))
        },
        (Payload::BBType { params: superparams }, Payload::BBType { params })
        | (Payload::LamType { params: superparams }, Payload::LamType { params }) => {
            superparams.len() == params.len()
                && params.iter().zip(superparams.iter()).all(|(t, s)| is_subtype(*t, *s))
        },
        (
            Payload::Ptr { space: super_space, pointee: super_pointee },
            Payload::Ptr { space, pointee },
        ) => super_space == space && is_subtype(super_pointee, pointee),
        (
            Payload::Int { width: super_width, signed: super_signed },
            Payload::Int { width, signed },
        ) => super_width == width && super_signed == signed,
        (
            Payload::Arr { element: super_element, size: super_size },
            Payload::Arr { element, size },
        ) => super_size == size && is_subtype(super_element, element),
        (
            Payload::Pack { element: super_element, width: super_width },
            Payload::Pack { element, width },
        ) => super_width == width && is_subtype(super_element, element),
        (Payload::TypeDeclRef { decl: super_decl }, Payload::TypeDeclRef { decl }) => {
            super_decl == decl
        },
        (Payload::Float { width: super_width }, Payload::Float { width }) => super_width == width,
        (Payload::NoRet, Payload::NoRet)
        | (Payload::Bool, Payload::Bool)
        | (Payload::Mask, Payload::Mask) => true,
        _ => false,
    }
}

/// Aborts unless `ty <: supertype`.
pub fn check_subtype<'a>(supertype: Node<'a>, ty: Node<'a>) {
    assert!(
        is_subtype(supertype, ty),
        "type error: {ty} isn't a subtype of {supertype}"
    );
}

/// Oracle of what reinterpret casts are legal. Permissive for now.
#[must_use]
pub fn is_reinterpret_cast_legal(src_type: Node<'_>, dst_type: Node<'_>) -> bool {
    assert!(src_type.is_type() && dst_type.is_type());
    true
}

/// Does the same pointer value refer to the same memory across the
/// invocations in a subgroup?
#[must_use]
pub fn is_addr_space_uniform(a: &IrArena, space: AddressSpace) -> bool {
    match space {
        AddressSpace::FunctionLogical
        | AddressSpace::PrivateLogical
        | AddressSpace::Private
        | AddressSpace::Input => !a.config().is_simt,
        _ => true,
    }
}

/// The concrete type subgroup masks take in this arena.
pub fn actual_mask_type<'arena>(a: &mut IrArena<'arena>) -> Node<'arena> {
    match a.config().subgroup_mask_representation {
        SubgroupMaskRepr::Abstract => Node::mask_type(a),
        SubgroupMaskRepr::Int64 => Node::uint64_type(a),
        SubgroupMaskRepr::BallotVec4 => {
            let element = Node::uint32_type(a);
            Node::pack_type(element, 4, a)
        },
    }
}

/// Is this a type a value in the language can have?
#[must_use]
pub fn is_value_type(ty: Node) -> bool {
    match *ty {
        Payload::QualifiedType { ty, .. } => is_data_type(ty),
        _ => false,
    }
}

/// Is this a valid data type, usable inside other types and as a type
/// argument?
#[must_use]
pub fn is_data_type(ty: Node) -> bool {
    match *ty {
        Payload::Mask
        | Payload::JoinPointType { .. }
        | Payload::Int { .. }
        | Payload::Float { .. }
        | Payload::Bool
        | Payload::Ptr { .. }
        | Payload::Arr { .. }
        | Payload::Pack { .. } => true,
        // multi-return records are the results of instructions, not values
        Payload::Record { special, .. } => special != RecordSpecial::MultipleReturn,
        Payload::TypeDeclRef { decl } => {
            decl.nominal_type_body().map_or(true, is_data_type)
        },
        // the qualifier is only meant for values
        Payload::QualifiedType { .. } => false,
        // values cannot contain abstractions, and noret has no values at all
        Payload::FnType { .. }
        | Payload::BBType { .. }
        | Payload::LamType { .. }
        | Payload::NoRet => false,
        _ => false,
    }
}

/// Strips the qualifier off a value type.
#[must_use]
pub fn unqualified_type(ty: Node) -> Node {
    match *ty {
        Payload::QualifiedType { ty, .. } => ty,
        _ => panic!("type error: expected a qualified type, got {ty}"),
    }
}

/// Splits a value type into its uniformity and its data type.
#[must_use]
pub fn deconstruct_qualified_type(ty: Node) -> (bool, Node) {
    match *ty {
        Payload::QualifiedType { uniform, ty } => (uniform, ty),
        _ => panic!("type error: expected a qualified type, got {ty}"),
    }
}

#[must_use]
pub fn is_qualified_type_uniform(ty: Node) -> bool {
    deconstruct_qualified_type(ty).0
}

/// Splits a possibly-packed type into its element and its width (1 when the
/// type is scalar).
#[must_use]
pub fn deconstruct_maybe_packed_type(ty: Node) -> (Node, u32) {
    match *ty {
        Payload::Pack { element, width } => (element, width),
        _ => (ty, 1),
    }
}

/// Packs an element type to the given width, or leaves it scalar for width 1.
pub fn maybe_packed_type<'arena>(
    element: Node<'arena>,
    width: u32,
    a: &mut IrArena<'arena>,
) -> Node<'arena> {
    if width == 1 {
        element
    } else {
        Node::pack_type(element, width, a)
    }
}

/// Bundles the types an instruction yields into a single type: one type is
/// itself, several become a multiple-return record.
pub fn wrap_multiple_yield_types<'arena>(
    a: &mut IrArena<'arena>,
    types: &[Node<'arena>],
) -> Node<'arena> {
    if types.len() == 1 {
        types[0]
    } else {
        let members = a.nodes(types);
        let names = a.strings(&[]);
        Node::record_type(members, names, RecordSpecial::MultipleReturn, a)
    }
}

/// The inverse of [`wrap_multiple_yield_types`].
#[must_use]
pub fn unwrap_multiple_yield_types(ty: Node) -> Vec<Node> {
    match *ty {
        Payload::Record { members, special: RecordSpecial::MultipleReturn, .. } => {
            members.as_slice().to_vec()
        },
        _ => vec![ty],
    }
}

/// The types of a list of values.
#[must_use]
pub fn values_types<'arena>(values: Nodes<'arena>) -> Vec<Node<'arena>> {
    values
        .iter()
        .map(|v| v.ty().unwrap_or_else(|| panic!("type error: value {v} has no type")))
        .collect()
}

/// Qualifies a list of data types.
pub fn add_qualifiers<'arena>(
    a: &mut IrArena<'arena>,
    types: &[Node<'arena>],
    uniform: bool,
) -> Vec<Node<'arena>> {
    types.iter().map(|ty| Node::qualified_type(uniform, *ty, a)).collect()
}

/// The member types of a composite type, in element order.
#[must_use]
pub fn composite_type_element_types(ty: Node) -> Vec<Node> {
    match *ty {
        Payload::Record { members, .. } => members.as_slice().to_vec(),
        Payload::Arr { element, size } => {
            let size = size
                .and_then(|s| s.int_literal_value(false))
                .expect("composite array types need a known size");
            let size = usize::try_from(size).expect("array size out of range");
            vec![element; size]
        },
        Payload::Pack { element, width } => vec![element; width as usize],
        Payload::TypeDeclRef { decl } => {
            let body = decl.nominal_type_body().expect("incomplete nominal type");
            composite_type_element_types(body)
        },
        _ => panic!("type error: {ty} is not a composite type"),
    }
}

fn can_do_arithm(ty: Node) -> bool {
    matches!(*ty, Payload::Int { .. } | Payload::Float { .. })
}

fn can_do_bitstuff(ty: Node) -> bool {
    matches!(*ty, Payload::Int { .. } | Payload::Bool | Payload::Mask)
}

fn can_be_compared(ordered: bool, ty: Node) -> bool {
    if ordered {
        can_do_arithm(ty)
    } else {
        true
    }
}

fn stack_size_type<'arena>(a: &mut IrArena<'arena>) -> Node<'arena> {
    Node::uint32_type(a)
}

/// Checks that a list of argument types is compatible with a list of
/// parameter types.
fn check_arguments_against_parameters<'a>(param_types: &[Node<'a>], arg_types: &[Node<'a>]) {
    assert!(
        param_types.len() == arg_types.len(),
        "type error: expected {} arguments, got {}",
        param_types.len(),
        arg_types.len()
    );
    for (param, arg) in param_types.iter().zip(arg_types.iter()) {
        check_subtype(*param, *arg);
    }
}

/// Shared logic between indirect calls and tail calls: the callee must be a
/// uniform-or-varying pointer into program code.
fn check_value_call<'arena>(callee: Node<'arena>, arg_types: &[Node<'arena>]) -> Nodes<'arena> {
    assert!(callee.is_value(), "type error: callee {callee} is not a value");
    let callee_type = callee.ty().expect("callee has no type");
    let (_, callee_type) = deconstruct_qualified_type(callee_type);
    let Payload::Ptr { space: AddressSpace::ProgramCode, pointee } = *callee_type else {
        panic!("type error: callee {callee} is not a pointer into program code");
    };
    let Payload::FnType { params, returns } = *pointee else {
        panic!("type error: callee {callee} does not point to a function");
    };
    check_arguments_against_parameters(params.as_slice(), arg_types);
    returns
}

fn check_basic_block_call<'a>(target: Node<'a>, arg_types: &[Node<'a>]) {
    assert!(target.is_basic_block(), "type error: jump target {target} is not a basic block");
    let Payload::BBType { params } = *target.ty().expect("basic block has no type") else {
        panic!("type error: {target} does not have a basic block type");
    };
    check_arguments_against_parameters(params.as_slice(), arg_types);
}

fn abstraction_param_types<'arena>(params: Nodes<'arena>) -> Vec<Node<'arena>> {
    params
        .iter()
        .map(|p| match **p {
            Payload::Param { ty, .. } => {
                ty.unwrap_or_else(|| panic!("parameter {p} has no type"))
            },
            _ => panic!("type error: {p} is not a parameter"),
        })
        .collect()
}

/// Computes the type of a node about to be constructed, or `None` for nodes
/// that have no type of their own (types, memory sentinels, annotations,
/// nominal type declarations). Aborts on any rule violation.
pub(crate) fn infer_type<'arena>(
    a: &mut IrArena<'arena>,
    payload: &Payload<'arena>,
) -> Option<Node<'arena>> {
    match *payload {
        // Types carry no type themselves, but their payloads are validated.
        Payload::QualifiedType { ty, .. } => {
            assert!(is_data_type(ty), "type error: {ty} is not a data type");
            None
        },
        Payload::Record { members, names, special } => {
            assert!(
                names.is_empty() || names.len() == members.len(),
                "type error: record member names must match members"
            );
            for member in members.iter() {
                let qualified = matches!(**member, Payload::QualifiedType { .. });
                assert!(
                    (special == RecordSpecial::MultipleReturn) == qualified,
                    "type error: bad member {member} for record"
                );
            }
            None
        },
        Payload::Arr { element, .. } | Payload::Pack { element, .. } => {
            assert!(is_data_type(element), "type error: {element} is not a data type");
            None
        },
        Payload::JoinPointType { yields } => {
            for ty in yields.iter() {
                assert!(
                    !matches!(**ty, Payload::QualifiedType { .. }),
                    "type error: join point yields must be unqualified"
                );
            }
            None
        },
        Payload::TypeDeclRef { decl } => {
            assert!(
                matches!(*decl, Payload::NominalType(_)),
                "type error: {decl} is not a nominal type"
            );
            None
        },
        Payload::NoRet
        | Payload::Int { .. }
        | Payload::Float { .. }
        | Payload::Bool
        | Payload::Mask
        | Payload::Ptr { .. }
        | Payload::FnType { .. }
        | Payload::BBType { .. }
        | Payload::LamType { .. } => None,

        // Values
        Payload::Param { ty, .. } => {
            let ty = ty.expect("parameters in a typed arena need a type");
            assert!(is_value_type(ty), "type error: {ty} is not a value type");
            Some(ty)
        },
        Payload::IntLiteral { width, signed, .. } => {
            let ty = Node::int_type(width, signed, a);
            Some(Node::qualified_type(true, ty, a))
        },
        Payload::FloatLiteral { width, .. } => {
            let ty = Node::float_type(width, a);
            Some(Node::qualified_type(true, ty, a))
        },
        Payload::True | Payload::False => {
            let ty = Node::bool_type(a);
            Some(Node::qualified_type(true, ty, a))
        },
        Payload::StringLiteral { string } => {
            let len = u32::try_from(string.len()).expect("string literal too long");
            let element = Node::uint8_type(a);
            let size = Node::uint32_literal(len, a);
            let ty = Node::arr_type(element, Some(size), a);
            Some(Node::qualified_type(true, ty, a))
        },
        Payload::Composite { ty, contents } => {
            let expected = composite_type_element_types(ty);
            assert!(
                expected.len() == contents.len(),
                "type error: composite of {ty} wants {} members, got {}",
                expected.len(),
                contents.len()
            );
            let mut uniform = true;
            for (member, expected) in contents.iter().zip(expected.iter()) {
                let (member_uniform, member_ty) =
                    deconstruct_qualified_type(member.ty().expect("untyped composite member"));
                uniform &= member_uniform;
                check_subtype(*expected, member_ty);
            }
            Some(Node::qualified_type(uniform, ty, a))
        },
        Payload::RefDecl { decl } => {
            let ty = match *decl {
                Payload::GlobalVariable(_) | Payload::Constant(_) => {
                    decl.ty().expect("declaration has no type")
                },
                _ => panic!(
                    "type error: ref_decl works on globals and constants, see fn_addr for functions"
                ),
            };
            Some(Node::qualified_type(true, ty, a))
        },
        Payload::FnAddr { function } => {
            assert!(matches!(*function, Payload::Function(_)), "fn_addr needs a function");
            let fn_type = function.ty().expect("function has no type");
            let ptr = Node::ptr_type(AddressSpace::ProgramCode, fn_type, a);
            Some(Node::qualified_type(true, ptr, a))
        },
        Payload::AbsMem { abs } => {
            assert!(abs.is_abstraction(), "abs_mem needs an abstraction");
            None
        },

        // Instructions
        Payload::PrimOp { op, type_args, operands } => {
            Some(infer_prim_op(a, op, type_args, operands))
        },
        Payload::Call { callee, args, .. } => {
            let arg_types = values_types(args);
            let returns = check_value_call(callee, &arg_types);
            Some(wrap_multiple_yield_types(a, returns.as_slice()))
        },
        Payload::Load { ptr, .. } => {
            let (ptr_uniform, ptr_type) =
                deconstruct_qualified_type(ptr.ty().expect("untyped pointer"));
            let (ptr_type, width) = deconstruct_maybe_packed_type(ptr_type);
            let Payload::Ptr { space, pointee } = *ptr_type else {
                panic!("type error: load expects a pointer, got {ptr_type}");
            };
            let element = maybe_packed_type(pointee, width, a);
            let uniform = ptr_uniform && is_addr_space_uniform(a, space);
            Some(Node::qualified_type(uniform, element, a))
        },
        Payload::Store { ptr, value, .. } => {
            let (_, ptr_type) = deconstruct_qualified_type(ptr.ty().expect("untyped pointer"));
            let (ptr_type, width) = deconstruct_maybe_packed_type(ptr_type);
            let Payload::Ptr { pointee, .. } = *ptr_type else {
                panic!("type error: store expects a pointer, got {ptr_type}");
            };
            let element = maybe_packed_type(pointee, width, a);
            // stores need not be uniform, but they must store the right thing
            let expected = Node::qualified_type(!a.config().is_simt, element, a);
            check_subtype(expected, value.ty().expect("untyped stored value"));
            Some(Node::unit_type(a))
        },
        Payload::Lea { ptr, offset, indices } => Some(infer_lea(a, ptr, offset, indices)),
        Payload::PushStack { value, .. } => {
            let value_type = value.ty().expect("untyped pushed value");
            let (_, element) = deconstruct_qualified_type(value_type);
            assert!(is_data_type(element), "type error: {element} is not a data type");
            let expected = Node::qualified_type(false, element, a);
            check_subtype(expected, value_type);
            Some(Node::unit_type(a))
        },
        Payload::PopStack { ty, .. } => {
            assert!(is_data_type(ty), "type error: {ty} is not a data type");
            Some(Node::qualified_type(false, ty, a))
        },
        Payload::GetStackSize { .. } => {
            let ty = stack_size_type(a);
            Some(Node::qualified_type(false, ty, a))
        },
        Payload::SetStackSize { value, .. } => {
            let expected = stack_size_type(a);
            let given = unqualified_type(value.ty().expect("untyped stack size"));
            assert!(given == expected, "type error: stack sizes are {expected}, got {given}");
            Some(Node::unit_type(a))
        },
        Payload::GetStackBaseAddr => {
            let word = Node::int_type(a.config().memory.word_size, false, a);
            let arr = Node::arr_type(word, None, a);
            let ptr = Node::ptr_type(AddressSpace::Private, arr, a);
            Some(Node::qualified_type(false, ptr, a))
        },
        Payload::If { yield_types, condition, false_case, true_case, .. } => {
            let cond_type = unqualified_type(condition.ty().expect("untyped condition"));
            let bool_type = Node::bool_type(a);
            assert!(cond_type == bool_type, "type error: the condition of an if should be bool");
            assert!(true_case.is_case(), "if bodies must be cases");
            assert!(
                yield_types.is_empty() || false_case.is_some(),
                "type error: an if that yields values needs both branches"
            );
            for ty in yield_types.iter() {
                assert!(is_value_type(*ty), "type error: {ty} is not a value type");
            }
            Some(wrap_multiple_yield_types(a, yield_types.as_slice()))
        },
        Payload::Loop { yield_types, initial_args, body, .. } => {
            assert!(body.is_case(), "loop bodies must be cases");
            let param_types = abstraction_param_types(body.abstraction_params());
            check_arguments_against_parameters(&param_types, &values_types(initial_args));
            for ty in yield_types.iter() {
                assert!(is_value_type(*ty), "type error: {ty} is not a value type");
            }
            Some(wrap_multiple_yield_types(a, yield_types.as_slice()))
        },
        Payload::Match { yield_types, inspect, literals, cases, .. } => {
            let inspectee = unqualified_type(inspect.ty().expect("untyped inspectee"));
            assert!(
                matches!(*inspectee, Payload::Int { .. }),
                "type error: match inspects integers, got {inspectee}"
            );
            assert!(literals.len() == cases.len(), "type error: one case per literal");
            for lit in literals.iter() {
                assert!(lit.resolve_to_int_literal().is_some(), "match literals must be constant");
            }
            Some(wrap_multiple_yield_types(a, yield_types.as_slice()))
        },
        Payload::Control { yield_types, inside, .. } => {
            assert!(inside.is_case(), "control regions must be cases");
            let params = inside.abstraction_params();
            assert!(params.len() == 1, "control regions take exactly the join point");
            let jp_type = params.first().ty().expect("untyped join point");
            let (jp_uniform, jp_type) = deconstruct_qualified_type(jp_type);
            assert!(jp_uniform, "type error: join points must be uniform");
            let Payload::JoinPointType { yields } = *jp_type else {
                panic!("type error: {jp_type} is not a join point type");
            };
            assert!(yields.len() == yield_types.len(), "control yields must match its join point");
            for (ty, jp_yield) in yield_types.iter().zip(yields.iter()) {
                assert!(is_data_type(*ty), "type error: {ty} is not a data type");
                check_subtype(*ty, *jp_yield);
            }
            let qualified = add_qualifiers(a, yields.as_slice(), !a.config().is_simt);
            Some(wrap_multiple_yield_types(a, &qualified))
        },
        Payload::Block { yields, .. } => {
            let types = values_types(yields);
            Some(wrap_multiple_yield_types(a, &types))
        },

        // Terminators
        Payload::Let { instruction, tail } => {
            assert!(instruction.is_instruction(), "let binds instructions, got {instruction}");
            let Payload::AnonLambda { params, .. } = *tail else {
                panic!("type error: let tails must be anonymous lambdas");
            };
            let produced =
                unwrap_multiple_yield_types(instruction.ty().expect("untyped instruction"));
            let param_types = abstraction_param_types(params);
            check_arguments_against_parameters(&param_types, &produced);
            Some(Node::noret_type(a))
        },
        Payload::Jump { target, args, .. } => {
            check_basic_block_call(target, &values_types(args));
            Some(Node::noret_type(a))
        },
        Payload::Branch { condition, true_target, false_target, args, .. } => {
            let cond_type = unqualified_type(condition.ty().expect("untyped condition"));
            let bool_type = Node::bool_type(a);
            assert!(cond_type == bool_type, "type error: branch conditions should be bool");
            let arg_types = values_types(args);
            check_basic_block_call(true_target, &arg_types);
            check_basic_block_call(false_target, &arg_types);
            Some(Node::noret_type(a))
        },
        Payload::Switch { inspect, literals, targets, default_target, args, .. } => {
            let inspectee = unqualified_type(inspect.ty().expect("untyped inspectee"));
            assert!(
                matches!(*inspectee, Payload::Int { .. }),
                "type error: switch inspects integers, got {inspectee}"
            );
            assert!(literals.len() == targets.len(), "type error: one target per literal");
            let arg_types = values_types(args);
            for target in targets.iter() {
                check_basic_block_call(*target, &arg_types);
            }
            check_basic_block_call(default_target, &arg_types);
            Some(Node::noret_type(a))
        },
        Payload::Return { .. } => Some(Node::noret_type(a)),
        Payload::TailCall { callee, args, .. } => {
            let returns = check_value_call(callee, &values_types(args));
            assert!(returns.is_empty(), "type error: tail calls cannot return");
            Some(Node::noret_type(a))
        },
        Payload::Join { join_point, args, .. } => {
            let jp_type = join_point.ty().expect("untyped join point");
            let (jp_uniform, jp_type) = deconstruct_qualified_type(jp_type);
            assert!(jp_uniform, "type error: join points must be uniform");
            let Payload::JoinPointType { yields } = *jp_type else {
                panic!("type error: {jp_type} is not a join point type");
            };
            let expected = add_qualifiers(a, yields.as_slice(), !a.config().is_simt);
            check_arguments_against_parameters(&expected, &values_types(args));
            Some(Node::noret_type(a))
        },
        Payload::MergeSelection { .. }
        | Payload::MergeContinue { .. }
        | Payload::MergeBreak { .. }
        | Payload::Unreachable { .. } => Some(Node::noret_type(a)),

        // Declarations and abstractions
        Payload::Function(f) => {
            for ty in f.return_types.iter() {
                assert!(is_value_type(*ty), "type error: {ty} is not a value type");
            }
            let param_types = abstraction_param_types(f.params);
            let params = a.nodes(&param_types);
            Some(Node::fn_type(params, f.return_types, a))
        },
        Payload::BasicBlock(b) => {
            let param_types = abstraction_param_types(b.params);
            let params = a.nodes(&param_types);
            Some(Node::bb_type(params, a))
        },
        Payload::AnonLambda { params, .. } => {
            let param_types = abstraction_param_types(params);
            let params = a.nodes(&param_types);
            Some(Node::lam_type(params, a))
        },
        Payload::GlobalVariable(g) => {
            assert!(is_data_type(g.ty), "type error: {} is not a data type", g.ty);
            Some(Node::ptr_type(g.space, g.ty, a))
        },
        Payload::Constant(c) => {
            assert!(is_data_type(c.type_hint), "type error: bad constant type hint");
            Some(c.type_hint)
        },
        Payload::NominalType(_) => None,

        // Annotations
        Payload::Annotation { .. }
        | Payload::AnnotationValue { .. }
        | Payload::AnnotationValues { .. } => None,
    }
}

fn infer_lea<'arena>(
    a: &mut IrArena<'arena>,
    ptr: Node<'arena>,
    offset: Node<'arena>,
    indices: Nodes<'arena>,
) -> Node<'arena> {
    let (mut uniform, mut curr_ptr_type) =
        deconstruct_qualified_type(ptr.ty().expect("untyped pointer"));
    assert!(
        matches!(*curr_ptr_type, Payload::Ptr { .. }),
        "type error: lea expects a pointer as a base, got {curr_ptr_type}"
    );

    let (offset_uniform, offset_type) =
        deconstruct_qualified_type(offset.ty().expect("untyped offset"));
    assert!(
        matches!(*offset_type, Payload::Int { .. }),
        "type error: lea expects an integer offset"
    );
    uniform &= offset_uniform;

    let Payload::Ptr { pointee, .. } = *curr_ptr_type else { unreachable!() };
    let offset_is_zero = offset.int_literal_value(false) == Some(0);
    assert!(
        offset_is_zero || matches!(*pointee, Payload::Arr { .. }),
        "type error: a lea with a non-zero offset needs a pointer to an array"
    );

    // enter N levels of pointers
    for selector in indices.iter() {
        let (selector_uniform, selector_type) =
            deconstruct_qualified_type(selector.ty().expect("untyped selector"));
        assert!(
            matches!(*selector_type, Payload::Int { .. }),
            "type error: lea selectors must be integers"
        );
        uniform &= selector_uniform;

        let Payload::Ptr { pointee, space } = *curr_ptr_type else {
            panic!("type error: lea is supposed to work on, and yield, pointers");
        };
        let mut pointee = pointee;
        if let Payload::TypeDeclRef { decl } = *pointee {
            pointee = decl.nominal_type_body().expect("incomplete nominal type");
        }
        match *pointee {
            Payload::Arr { element, .. } => {
                curr_ptr_type = Node::ptr_type(space, element, a);
            },
            Payload::Record { members, .. } => {
                let index = selector
                    .int_literal_value(false)
                    .expect("type error: record selectors must be constant");
                let index = usize::try_from(index).expect("negative record selector");
                assert!(index < members.len(), "type error: record selector out of range");
                curr_ptr_type = Node::ptr_type(space, members[index], a);
            },
            _ => panic!("type error: lea selectors only work on pointers to arrays or records"),
        }
    }

    Node::qualified_type(uniform, curr_ptr_type, a)
}

#[allow(clippy::too_many_lines)]
fn infer_prim_op<'arena>(
    a: &mut IrArena<'arena>,
    op: Op,
    type_args: Nodes<'arena>,
    operands: Nodes<'arena>,
) -> Node<'arena> {
    for ta in type_args.iter() {
        assert!(ta.is_type(), "type error: {ta} is not a type");
    }
    for operand in operands.iter() {
        assert!(operand.is_value(), "type error: {operand} is not a value");
    }

    match op {
        Op::Quote => {
            assert!(type_args.is_empty());
            let types = values_types(operands);
            wrap_multiple_yield_types(a, &types)
        },
        Op::Neg => {
            assert!(type_args.is_empty() && operands.len() == 1);
            let ty = operands.first().ty().expect("untyped operand");
            let (_, data) = deconstruct_qualified_type(ty);
            let (element, _) = deconstruct_maybe_packed_type(data);
            assert!(can_do_arithm(element), "type error: cannot negate {element}");
            ty
        },
        Op::Lshift | Op::RshiftLogical | Op::RshiftArithm => {
            assert!(type_args.is_empty() && operands.len() == 2);
            let (value_uniform, value_type) =
                deconstruct_qualified_type(operands[0].ty().expect("untyped operand"));
            let (shift_uniform, shift_type) =
                deconstruct_qualified_type(operands[1].ty().expect("untyped operand"));
            let (value_element, value_width) = deconstruct_maybe_packed_type(value_type);
            let (shift_element, shift_width) = deconstruct_maybe_packed_type(shift_type);
            assert!(value_width == shift_width, "type error: shift width mismatch");
            assert!(matches!(*value_element, Payload::Int { .. }), "shifts work on integers");
            assert!(matches!(*shift_element, Payload::Int { .. }), "shift amounts are integers");
            let result = maybe_packed_type(value_element, value_width, a);
            Node::qualified_type(value_uniform && shift_uniform, result, a)
        },
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
            assert!(type_args.is_empty() && operands.len() == 2);
            let first_type = unqualified_type(operands.first().ty().expect("untyped operand"));
            let mut uniform = true;
            for operand in operands.iter() {
                let (operand_uniform, operand_type) =
                    deconstruct_qualified_type(operand.ty().expect("untyped operand"));
                let (element, _) = deconstruct_maybe_packed_type(operand_type);
                assert!(can_do_arithm(element), "type error: no arithmetic on {element}");
                assert!(first_type == operand_type, "type error: operand type mismatch");
                uniform &= operand_uniform;
            }
            Node::qualified_type(uniform, first_type, a)
        },
        Op::Not => {
            assert!(type_args.is_empty() && operands.len() == 1);
            let ty = operands.first().ty().expect("untyped operand");
            let (_, data) = deconstruct_qualified_type(ty);
            let (element, _) = deconstruct_maybe_packed_type(data);
            assert!(can_do_bitstuff(element), "type error: cannot bit-negate {element}");
            ty
        },
        Op::And | Op::Or | Op::Xor => {
            assert!(type_args.is_empty() && operands.len() == 2);
            let first_type = unqualified_type(operands.first().ty().expect("untyped operand"));
            let mut uniform = true;
            for operand in operands.iter() {
                let (operand_uniform, operand_type) =
                    deconstruct_qualified_type(operand.ty().expect("untyped operand"));
                let (element, _) = deconstruct_maybe_packed_type(operand_type);
                assert!(can_do_bitstuff(element), "type error: no bitwise ops on {element}");
                assert!(first_type == operand_type, "type error: operand type mismatch");
                uniform &= operand_uniform;
            }
            Node::qualified_type(uniform, first_type, a)
        },
        Op::Lt | Op::Lte | Op::Gt | Op::Gte | Op::Eq | Op::Neq => {
            let ordered = !matches!(op, Op::Eq | Op::Neq);
            assert!(type_args.is_empty() && operands.len() == 2);
            let first_type = unqualified_type(operands.first().ty().expect("untyped operand"));
            let (_, width) = deconstruct_maybe_packed_type(first_type);
            let mut uniform = true;
            for operand in operands.iter() {
                let (operand_uniform, operand_type) =
                    deconstruct_qualified_type(operand.ty().expect("untyped operand"));
                let (element, _) = deconstruct_maybe_packed_type(operand_type);
                assert!(can_be_compared(ordered, element), "type error: cannot order {element}");
                assert!(first_type == operand_type, "type error: operand type mismatch");
                uniform &= operand_uniform;
            }
            let bool_type = Node::bool_type(a);
            let result = maybe_packed_type(bool_type, width, a);
            Node::qualified_type(uniform, result, a)
        },
        Op::Select => {
            assert!(type_args.is_empty() && operands.len() == 3);
            let (cond_uniform, cond_type) =
                deconstruct_qualified_type(operands[0].ty().expect("untyped condition"));
            let (cond_element, width) = deconstruct_maybe_packed_type(cond_type);
            let bool_type = Node::bool_type(a);
            assert!(cond_element == bool_type, "type error: select conditions are bool");

            let mut alternatives = [None; 2];
            let mut uniform = cond_uniform;
            for i in 0..2 {
                let (alt_uniform, alt_type) =
                    deconstruct_qualified_type(operands[1 + i].ty().expect("untyped operand"));
                let (element, alt_width) = deconstruct_maybe_packed_type(alt_type);
                assert!(alt_width == width, "type error: select width mismatch");
                alternatives[i] = Some(element);
                uniform &= alt_uniform;
            }
            assert!(alternatives[0] == alternatives[1], "type error: select type mismatch");
            let result = maybe_packed_type(alternatives[0].expect("no alternative"), width, a);
            Node::qualified_type(uniform, result, a)
        },
        Op::Extract | Op::ExtractDynamic => {
            assert!(type_args.is_empty() && operands.len() >= 2);
            let dynamic = op == Op::ExtractDynamic;
            let (mut uniform, mut current) =
                deconstruct_qualified_type(operands.first().ty().expect("untyped operand"));
            for index in operands.iter().skip(1) {
                assert!(is_data_type(current), "type error: cannot extract from {current}");
                if dynamic {
                    let (index_uniform, index_type) =
                        deconstruct_qualified_type(index.ty().expect("untyped index"));
                    uniform &= index_uniform;
                    assert!(
                        matches!(*index_type, Payload::Int { .. }),
                        "extract_dynamic requires integer indices"
                    );
                } else {
                    assert!(
                        matches!(**index, Payload::IntLiteral { .. }),
                        "extract takes integer literals"
                    );
                }
                let mut stepped = current;
                if let Payload::TypeDeclRef { decl } = *stepped {
                    assert!(!dynamic, "cannot dynamically index a nominal type");
                    stepped = decl.nominal_type_body().expect("incomplete nominal type");
                }
                current = match *stepped {
                    Payload::Record { members, .. } => {
                        assert!(!dynamic, "cannot dynamically index a record");
                        let i = index.int_literal_value(false).expect("bad index");
                        let i = usize::try_from(i).expect("negative index");
                        assert!(i < members.len(), "type error: index out of range");
                        members[i]
                    },
                    Payload::Arr { element, .. } | Payload::Pack { element, .. } => element,
                    _ => panic!("type error: not a valid type to extract from: {stepped}"),
                };
            }
            Node::qualified_type(uniform, current, a)
        },
        Op::Convert => {
            assert!(type_args.len() == 1 && operands.len() == 1);
            let dst_type = type_args.first();
            assert!(is_data_type(dst_type), "type error: {dst_type} is not a data type");
            let (uniform, _) =
                deconstruct_qualified_type(operands.first().ty().expect("untyped operand"));
            Node::qualified_type(uniform, dst_type, a)
        },
        Op::Reinterpret => {
            assert!(type_args.len() == 1 && operands.len() == 1);
            let dst_type = type_args.first();
            assert!(is_data_type(dst_type), "type error: {dst_type} is not a data type");
            let (uniform, src_type) =
                deconstruct_qualified_type(operands.first().ty().expect("untyped operand"));
            assert!(is_reinterpret_cast_legal(src_type, dst_type), "illegal reinterpret");
            Node::qualified_type(uniform, dst_type, a)
        },
        Op::EmptyMask | Op::SubgroupActiveMask => {
            assert!(type_args.is_empty() && operands.is_empty());
            let mask = actual_mask_type(a);
            Node::qualified_type(true, mask, a)
        },
        Op::SubgroupBallot => {
            assert!(type_args.is_empty() && operands.len() == 1);
            let mask = actual_mask_type(a);
            Node::qualified_type(true, mask, a)
        },
        Op::MaskIsThreadActive => {
            assert!(type_args.is_empty() && operands.len() == 2);
            let uniform = operands.iter().all(|operand| {
                is_qualified_type_uniform(operand.ty().expect("untyped operand"))
            });
            let bool_type = Node::bool_type(a);
            Node::qualified_type(uniform, bool_type, a)
        },
        Op::SubgroupElectFirst => {
            assert!(type_args.is_empty() && operands.is_empty());
            let bool_type = Node::bool_type(a);
            Node::qualified_type(false, bool_type, a)
        },
        Op::SubgroupBroadcastFirst | Op::SubgroupReduceSum => {
            assert!(type_args.is_empty() && operands.len() == 1);
            let operand_type = unqualified_type(operands.first().ty().expect("untyped operand"));
            Node::qualified_type(true, operand_type, a)
        },
        Op::SubgroupLocalId => {
            assert!(type_args.is_empty() && operands.is_empty());
            let ty = Node::uint32_type(a);
            Node::qualified_type(false, ty, a)
        },
        Op::SubgroupId => {
            assert!(type_args.is_empty() && operands.is_empty());
            let ty = Node::uint32_type(a);
            Node::qualified_type(true, ty, a)
        },
        Op::WorkgroupId | Op::WorkgroupNum | Op::WorkgroupSize => {
            assert!(type_args.is_empty() && operands.is_empty());
            let element = Node::uint32_type(a);
            let ty = Node::pack_type(element, 3, a);
            Node::qualified_type(true, ty, a)
        },
        Op::WorkgroupLocalId | Op::GlobalId => {
            assert!(type_args.is_empty() && operands.is_empty());
            let element = Node::uint32_type(a);
            let ty = Node::pack_type(element, 3, a);
            Node::qualified_type(false, ty, a)
        },
        Op::Alloca | Op::AllocaLogical => {
            assert!(type_args.len() == 1 && operands.is_empty());
            let element = type_args.first();
            assert!(is_data_type(element), "type error: {element} is not a data type");
            let space = if op == Op::Alloca {
                AddressSpace::Private
            } else {
                AddressSpace::FunctionLogical
            };
            let ptr = Node::ptr_type(space, element, a);
            let uniform = is_addr_space_uniform(a, space);
            Node::qualified_type(uniform, ptr, a)
        },
        Op::DebugPrintf => {
            assert!(type_args.is_empty());
            Node::unit_type(a)
        },
    }
}
