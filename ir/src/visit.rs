//! Single-level enumeration of a node's operands, classified by role.
//!
//! The analyses are all built on this: the uses map records one `Use` per
//! visited operand, and the free-frontier walk recurses through the classes
//! it cares about. Annotations are metadata, not operands, and are not
//! visited.

use crate::node::{Node, Payload};

/// The role an operand plays for its user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandClass {
    Type,
    Value,
    Instruction,
    Terminator,
    Abstraction,
    BasicBlock,
    Declaration,
    Mem,
}

impl OperandClass {
    #[must_use]
    pub const fn mask(self) -> ClassMask {
        ClassMask(1 << self as u16)
    }
}

/// A set of operand classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassMask(u16);

impl ClassMask {
    pub const EMPTY: ClassMask = ClassMask(0);

    #[must_use]
    pub const fn union(self, other: ClassMask) -> ClassMask {
        ClassMask(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, class: OperandClass) -> bool {
        self.0 & (1 << class as u16) != 0
    }
}

impl core::ops::BitOr for ClassMask {
    type Output = ClassMask;

    fn bitor(self, rhs: ClassMask) -> ClassMask {
        self.union(rhs)
    }
}

/// Calls `f` once per operand of `node`, with the operand's class.
///
/// Bodies of nominal declarations count as operands (class `Terminator`),
/// which is what lets a reachability walk enter them.
pub fn visit_operands<'arena>(
    node: Node<'arena>,
    mut f: impl FnMut(OperandClass, Node<'arena>),
) {
    use OperandClass as C;

    let mut list = |f: &mut dyn FnMut(OperandClass, Node<'arena>),
                    class: C,
                    nodes: crate::node::Nodes<'arena>| {
        for n in nodes.iter() {
            f(class, *n);
        }
    };

    match *node {
        // Types
        Payload::QualifiedType { ty, .. } => f(C::Type, ty),
        Payload::Ptr { pointee, .. } => f(C::Type, pointee),
        Payload::Arr { element, size } => {
            f(C::Type, element);
            if let Some(size) = size {
                f(C::Value, size);
            }
        },
        Payload::Pack { element, .. } => f(C::Type, element),
        Payload::Record { members, .. } => list(&mut f, C::Type, members),
        Payload::FnType { params, returns } => {
            list(&mut f, C::Type, params);
            list(&mut f, C::Type, returns);
        },
        Payload::BBType { params } | Payload::LamType { params } => list(&mut f, C::Type, params),
        Payload::JoinPointType { yields } => list(&mut f, C::Type, yields),
        Payload::TypeDeclRef { decl } => f(C::Declaration, decl),
        Payload::NoRet
        | Payload::Int { .. }
        | Payload::Float { .. }
        | Payload::Bool
        | Payload::Mask => {},

        // Values
        Payload::Param { ty, .. } => {
            if let Some(ty) = ty {
                f(C::Type, ty);
            }
        },
        Payload::IntLiteral { .. }
        | Payload::FloatLiteral { .. }
        | Payload::True
        | Payload::False
        | Payload::StringLiteral { .. } => {},
        Payload::Composite { ty, contents } => {
            f(C::Type, ty);
            list(&mut f, C::Value, contents);
        },
        Payload::RefDecl { decl } => f(C::Declaration, decl),
        Payload::FnAddr { function } => f(C::Declaration, function),
        Payload::AbsMem { abs } => f(C::Abstraction, abs),

        // Instructions
        Payload::PrimOp { type_args, operands, .. } => {
            list(&mut f, C::Type, type_args);
            list(&mut f, C::Value, operands);
        },
        Payload::Call { callee, args, mem } => {
            f(C::Value, callee);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Load { ptr, mem } => {
            f(C::Value, ptr);
            f(C::Mem, mem);
        },
        Payload::Store { ptr, value, mem } => {
            f(C::Value, ptr);
            f(C::Value, value);
            f(C::Mem, mem);
        },
        Payload::Lea { ptr, offset, indices } => {
            f(C::Value, ptr);
            f(C::Value, offset);
            list(&mut f, C::Value, indices);
        },
        Payload::PushStack { value, mem } | Payload::SetStackSize { value, mem } => {
            f(C::Value, value);
            f(C::Mem, mem);
        },
        Payload::PopStack { ty, mem } => {
            f(C::Type, ty);
            f(C::Mem, mem);
        },
        Payload::GetStackSize { mem } => f(C::Mem, mem),
        Payload::GetStackBaseAddr => {},
        Payload::If { yield_types, condition, true_case, false_case, mem } => {
            list(&mut f, C::Type, yield_types);
            f(C::Value, condition);
            f(C::BasicBlock, true_case);
            if let Some(false_case) = false_case {
                f(C::BasicBlock, false_case);
            }
            f(C::Mem, mem);
        },
        Payload::Loop { yield_types, initial_args, body, mem } => {
            list(&mut f, C::Type, yield_types);
            list(&mut f, C::Value, initial_args);
            f(C::BasicBlock, body);
            f(C::Mem, mem);
        },
        Payload::Match { yield_types, inspect, literals, cases, default_case, mem } => {
            list(&mut f, C::Type, yield_types);
            f(C::Value, inspect);
            list(&mut f, C::Value, literals);
            list(&mut f, C::BasicBlock, cases);
            f(C::BasicBlock, default_case);
            f(C::Mem, mem);
        },
        Payload::Control { yield_types, inside, mem } => {
            list(&mut f, C::Type, yield_types);
            f(C::BasicBlock, inside);
            f(C::Mem, mem);
        },
        Payload::Block { yields, entry, mem } => {
            list(&mut f, C::Value, yields);
            f(C::BasicBlock, entry);
            f(C::Mem, mem);
        },

        // Terminators
        Payload::Let { instruction, tail } => {
            f(C::Instruction, instruction);
            f(C::Abstraction, tail);
        },
        Payload::Jump { target, args, mem } => {
            f(C::BasicBlock, target);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Branch { condition, true_target, false_target, args, mem } => {
            f(C::Value, condition);
            f(C::BasicBlock, true_target);
            f(C::BasicBlock, false_target);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Switch { inspect, literals, targets, default_target, args, mem } => {
            f(C::Value, inspect);
            list(&mut f, C::Value, literals);
            list(&mut f, C::BasicBlock, targets);
            f(C::BasicBlock, default_target);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Return { args, mem }
        | Payload::MergeSelection { args, mem }
        | Payload::MergeContinue { args, mem }
        | Payload::MergeBreak { args, mem } => {
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::TailCall { callee, args, mem } => {
            f(C::Value, callee);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Join { join_point, args, mem } => {
            f(C::Value, join_point);
            list(&mut f, C::Value, args);
            f(C::Mem, mem);
        },
        Payload::Unreachable { mem } => f(C::Mem, mem),

        // Declarations and abstractions
        Payload::Function(decl) => {
            list(&mut f, C::Value, decl.params);
            list(&mut f, C::Type, decl.return_types);
            if let Some(body) = decl.body.get() {
                f(C::Terminator, body);
            }
        },
        Payload::BasicBlock(decl) => {
            list(&mut f, C::Value, decl.params);
            if let Some(body) = decl.body.get() {
                f(C::Terminator, body);
            }
        },
        Payload::AnonLambda { params, body } => {
            list(&mut f, C::Value, params);
            f(C::Terminator, body);
        },
        Payload::Constant(decl) => {
            f(C::Type, decl.type_hint);
            if let Some(value) = decl.value.get() {
                f(C::Value, value);
            }
        },
        Payload::GlobalVariable(decl) => {
            f(C::Type, decl.ty);
            if let Some(init) = decl.init.get() {
                f(C::Value, init);
            }
        },
        Payload::NominalType(decl) => {
            if let Some(body) = decl.body.get() {
                f(C::Type, body);
            }
        },

        // Annotations carry metadata, not operands.
        Payload::Annotation { .. }
        | Payload::AnnotationValue { .. }
        | Payload::AnnotationValues { .. } => {},
    }
}
