//! Constant folding and canonicalization.
//!
//! Runs on every structural payload just before it is interned, when the
//! arena's configuration allows it. Folding replaces a payload with a
//! semantically equivalent one, possibly of a different tag; most rewrites
//! reduce an operation to a quote of its known result, which the body
//! builder then unwraps without emitting a binding at all.

use crate::arena::IrArena;
use crate::node::{IntWidth, Node, Op, Payload};
use crate::type_checker::unqualified_type;

pub(crate) fn fold_payload<'arena>(
    a: &mut IrArena<'arena>,
    payload: Payload<'arena>,
) -> Payload<'arena> {
    match payload {
        Payload::PrimOp { op, type_args, operands } => {
            fold_prim_op(a, op, type_args, operands).unwrap_or(payload)
        },
        // an address computation that goes nowhere is the pointer itself
        Payload::Lea { ptr, offset, indices }
            if indices.is_empty() && offset.int_literal_value(false) == Some(0) =>
        {
            quote_payload(a, &[ptr])
        },
        _ => payload,
    }
}

fn quote_payload<'arena>(a: &mut IrArena<'arena>, values: &[Node<'arena>]) -> Payload<'arena> {
    let type_args = a.nodes(&[]);
    let operands = a.nodes(values);
    Payload::PrimOp { op: Op::Quote, type_args, operands }
}

fn as_int_literal(node: Node) -> Option<(IntWidth, bool, u64)> {
    node.resolve_to_int_literal()
}

fn is_zero(node: Node) -> bool {
    node.int_literal_value(false) == Some(0)
}

fn is_one(node: Node) -> bool {
    node.int_literal_value(false) == Some(1)
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn fold_prim_op<'arena>(
    a: &mut IrArena<'arena>,
    op: Op,
    type_args: crate::node::Nodes<'arena>,
    operands: crate::node::Nodes<'arena>,
) -> Option<Payload<'arena>> {
    // malformed payloads are left for the type checker to reject
    match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
            if operands.len() != 2 {
                return None;
            }
            let x = operands[0];
            let y = operands[1];
            if let (Some((wx, sx, vx)), Some((wy, sy, vy))) = (as_int_literal(x), as_int_literal(y))
            {
                if wx != wy || sx != sy {
                    return None;
                }
                let value = if sx {
                    let shift = 64 - wx.bits();
                    let ix = ((vx << shift) as i64) >> shift;
                    let iy = ((vy << shift) as i64) >> shift;
                    match op {
                        Op::Add => ix.wrapping_add(iy) as u64,
                        Op::Sub => ix.wrapping_sub(iy) as u64,
                        Op::Mul => ix.wrapping_mul(iy) as u64,
                        Op::Div if iy != 0 => ix.wrapping_div(iy) as u64,
                        Op::Mod if iy != 0 => ix.wrapping_rem(iy) as u64,
                        _ => return None,
                    }
                } else {
                    match op {
                        Op::Add => vx.wrapping_add(vy),
                        Op::Sub => vx.wrapping_sub(vy),
                        Op::Mul => vx.wrapping_mul(vy),
                        Op::Div if vy != 0 => vx.wrapping_div(vy),
                        Op::Mod if vy != 0 => vx.wrapping_rem(vy),
                        _ => return None,
                    }
                };
                let lit = Node::int_literal(wx, sx, value, a);
                return Some(quote_payload(a, &[lit]));
            }
            // identities on integer literals
            match op {
                Op::Add if is_zero(y) => Some(quote_payload(a, &[x])),
                Op::Add if is_zero(x) => Some(quote_payload(a, &[y])),
                Op::Sub if is_zero(y) => Some(quote_payload(a, &[x])),
                Op::Mul if is_one(y) => Some(quote_payload(a, &[x])),
                Op::Mul if is_one(x) => Some(quote_payload(a, &[y])),
                Op::Mul if is_zero(x) => Some(quote_payload(a, &[x])),
                Op::Mul if is_zero(y) => Some(quote_payload(a, &[y])),
                Op::Div if is_one(y) => Some(quote_payload(a, &[x])),
                _ => None,
            }
        },
        Op::Neg => {
            let (w, s, v) = as_int_literal(operands.as_slice().first().copied()?)?;
            let lit = Node::int_literal(w, s, (v as i64).wrapping_neg() as u64, a);
            Some(quote_payload(a, &[lit]))
        },
        Op::And | Op::Or | Op::Xor => {
            if operands.len() != 2 {
                return None;
            }
            let x = operands[0];
            let y = operands[1];
            let (wx, sx, vx) = as_int_literal(x)?;
            let (wy, sy, vy) = as_int_literal(y)?;
            if wx != wy || sx != sy {
                return None;
            }
            let value = match op {
                Op::And => vx & vy,
                Op::Or => vx | vy,
                Op::Xor => vx ^ vy,
                _ => unreachable!(),
            };
            let lit = Node::int_literal(wx, sx, value, a);
            Some(quote_payload(a, &[lit]))
        },
        Op::Not => {
            let (w, s, v) = as_int_literal(operands.as_slice().first().copied()?)?;
            let lit = Node::int_literal(w, s, !v, a);
            Some(quote_payload(a, &[lit]))
        },
        Op::Eq | Op::Neq | Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
            if operands.len() != 2 {
                return None;
            }
            let (wx, sx, _) = as_int_literal(operands[0])?;
            let (wy, sy, _) = as_int_literal(operands[1])?;
            if wx != wy || sx != sy {
                return None;
            }
            let x = operands[0].int_literal_value(sx)?;
            let y = operands[1].int_literal_value(sy)?;
            let result = match op {
                Op::Eq => x == y,
                Op::Neq => x != y,
                Op::Lt => x < y,
                Op::Lte => x <= y,
                Op::Gt => x > y,
                Op::Gte => x >= y,
                _ => unreachable!(),
            };
            let lit =
                if result { Node::true_literal(a) } else { Node::false_literal(a) };
            Some(quote_payload(a, &[lit]))
        },
        Op::Select => {
            if operands.len() != 3 {
                return None;
            }
            match *operands[0] {
                Payload::True => Some(quote_payload(a, &[operands[1]])),
                Payload::False => Some(quote_payload(a, &[operands[2]])),
                _ => None,
            }
        },
        Op::Convert => {
            if operands.len() != 1 || type_args.len() != 1 {
                return None;
            }
            let value = operands.first();
            let src_type = unqualified_type(value.ty()?);
            // conversion through an identical type vanishes
            (src_type == type_args.first()).then(|| quote_payload(a, &[value]))
        },
        Op::Reinterpret => {
            if operands.len() != 1 || type_args.len() != 1 {
                return None;
            }
            let value = operands.first();
            let dst_type = type_args.first();
            if let Some(ty) = value.ty() {
                if unqualified_type(ty) == dst_type {
                    return Some(quote_payload(a, &[value]));
                }
            }
            // reinterpret(T, reinterpret(U, x)) collapses to reinterpret(T, x)
            if let Payload::PrimOp { op: Op::Reinterpret, operands: inner, .. } =
                *value.resolve_to_definition()
            {
                let operands = a.nodes(&[inner.first()]);
                return Some(Payload::PrimOp { op: Op::Reinterpret, type_args, operands });
            }
            None
        },
        Op::Extract => {
            // a single literal index into a composite literal picks the element
            if operands.len() != 2 {
                return None;
            }
            let Payload::Composite { contents, .. } = *operands[0].resolve_to_definition() else {
                return None;
            };
            let index = operands[1].int_literal_value(false)?;
            let index = usize::try_from(index).ok()?;
            let element = *contents.get(index)?;
            Some(quote_payload(a, &[element]))
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{use_arena, ArenaConfig};
    use crate::node::RecordSpecial;

    #[test]
    fn literal_arithmetic_folds() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::int32_literal(4, arena);
            let y = Node::int32_literal(38, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[x, y]);
            let folded = Node::prim_op(Op::Add, empty, operands, arena);
            let expected = Node::int32_literal(42, arena);
            assert_eq!(folded, Node::quote_single(expected, arena));
        });
    }

    #[test]
    fn additive_identity_folds() {
        use_arena(ArenaConfig::default(), |arena| {
            let u32_t = Node::uint32_type(arena);
            let varying = Node::qualified_type(false, u32_t, arena);
            let p = Node::param(Some(varying), Some("x"), arena);
            let zero = Node::uint32_literal(0, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[p, zero]);
            let folded = Node::prim_op(Op::Add, empty, operands, arena);
            assert_eq!(folded, Node::quote_single(p, arena));
        });
    }

    #[test]
    fn signed_wrapping_matches_width() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::int_literal(IntWidth::I8, true, 0x7F, arena);
            let y = Node::int_literal(IntWidth::I8, true, 1, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[x, y]);
            let folded = Node::prim_op(Op::Add, empty, operands, arena);
            let expected = Node::int_literal(IntWidth::I8, true, 0x80, arena);
            assert_eq!(folded, Node::quote_single(expected, arena));
        });
    }

    #[test]
    fn division_by_zero_does_not_fold() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::uint32_literal(10, arena);
            let zero = Node::uint32_literal(0, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[x, zero]);
            let folded = Node::prim_op(Op::Div, empty, operands, arena);
            assert!(matches!(*folded, Payload::PrimOp { op: Op::Div, .. }));
        });
    }

    #[test]
    fn comparisons_fold_to_bool_literals() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::int32_literal(-1, arena);
            let y = Node::int32_literal(1, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[x, y]);
            let folded = Node::prim_op(Op::Lt, empty, operands, arena);
            let t = Node::true_literal(arena);
            assert_eq!(folded, Node::quote_single(t, arena));
        });
    }

    #[test]
    fn identity_conversion_vanishes() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::uint32_literal(3, arena);
            let u32_t = Node::uint32_type(arena);
            let type_args = arena.nodes(&[u32_t]);
            let operands = arena.nodes(&[x]);
            let folded = Node::prim_op(Op::Convert, type_args, operands, arena);
            assert_eq!(folded, Node::quote_single(x, arena));
        });
    }

    #[test]
    fn nested_reinterpret_collapses() {
        use_arena(ArenaConfig::default(), |arena| {
            let x = Node::uint32_literal(3, arena);
            let i32_t = Node::int32_type(arena);
            let f32_t = Node::fp32_type(arena);
            let inner_args = arena.nodes(&[i32_t]);
            let inner_ops = arena.nodes(&[x]);
            let inner = Node::prim_op(Op::Reinterpret, inner_args, inner_ops, arena);
            let outer_args = arena.nodes(&[f32_t]);
            let outer_ops = arena.nodes(&[inner]);
            let outer = Node::prim_op(Op::Reinterpret, outer_args, outer_ops, arena);
            let direct_ops = arena.nodes(&[x]);
            let direct = Node::prim_op(Op::Reinterpret, outer_args, direct_ops, arena);
            assert_eq!(outer, direct);
        });
    }

    #[test]
    fn extract_from_composite_literal() {
        use_arena(ArenaConfig::default(), |arena| {
            let u32_t = Node::uint32_type(arena);
            let members = arena.nodes(&[u32_t, u32_t]);
            let names = arena.strings(&[]);
            let rec = Node::record_type(members, names, RecordSpecial::NotSpecial, arena);
            let x = Node::uint32_literal(10, arena);
            let y = Node::uint32_literal(20, arena);
            let contents = arena.nodes(&[x, y]);
            let composite = Node::composite(rec, contents, arena);
            let one = Node::uint32_literal(1, arena);
            let empty = arena.nodes(&[]);
            let operands = arena.nodes(&[composite, one]);
            let folded = Node::prim_op(Op::Extract, empty, operands, arena);
            assert_eq!(folded, Node::quote_single(y, arena));
        });
    }

    #[test]
    fn zero_lea_collapses_to_pointer() {
        use_arena(ArenaConfig::default(), |arena| {
            let u32_t = Node::uint32_type(arena);
            let ptr_t = Node::ptr_type(crate::node::AddressSpace::Global, u32_t, arena);
            let qptr = Node::qualified_type(true, ptr_t, arena);
            let p = Node::param(Some(qptr), Some("p"), arena);
            let zero = Node::uint32_literal(0, arena);
            let none = arena.nodes(&[]);
            let lea = Node::lea(p, zero, none, arena);
            assert_eq!(lea, Node::quote_single(p, arena));
        });
    }
}
