//! A textual form for nodes and modules.
//!
//! Printing assigns display numbers in first-visit order, not from the raw
//! per-arena ids, so two structurally identical modules print identically
//! even when they live in different arenas. This is what the identity-rewrite
//! law is checked against.

use core::fmt::{self, Write};
use std::collections::HashMap;

use crate::module::Module;
use crate::node::{FloatWidth, IntWidth, Node, Nodes, Payload, RecordSpecial};

/// Stateful printer: remembers display numbers across everything printed
/// through it.
pub struct Printer<'arena> {
    ids: HashMap<Node<'arena>, usize>,
    next: usize,
}

impl<'arena> Default for Printer<'arena> {
    fn default() -> Self {
        Printer { ids: HashMap::new(), next: 0 }
    }
}

fn int_suffix(width: IntWidth, signed: bool) -> &'static str {
    match (width, signed) {
        (IntWidth::I8, true) => "i8",
        (IntWidth::I16, true) => "i16",
        (IntWidth::I32, true) => "i32",
        (IntWidth::I64, true) => "i64",
        (IntWidth::I8, false) => "u8",
        (IntWidth::I16, false) => "u16",
        (IntWidth::I32, false) => "u32",
        (IntWidth::I64, false) => "u64",
    }
}

impl<'arena> Printer<'arena> {
    fn display_id(&mut self, node: Node<'arena>) -> usize {
        if let Some(&id) = self.ids.get(&node) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(node, id);
        id
    }

    fn block_name(&mut self, bb: Node<'arena>) -> String {
        let id = self.display_id(bb);
        match bb.abstraction_name() {
            Some(name) => format!("^{name}.{id}"),
            None => format!("^{id}"),
        }
    }

    /// Prints a type.
    pub fn print_type(&mut self, w: &mut impl Write, ty: Node<'arena>) -> fmt::Result {
        match *ty {
            Payload::QualifiedType { uniform, ty } => {
                write!(w, "{} ", if uniform { "uniform" } else { "varying" })?;
                self.print_type(w, ty)
            },
            Payload::NoRet => write!(w, "noret"),
            Payload::Int { width, signed } => write!(w, "{}", int_suffix(width, signed)),
            Payload::Float { width } => match width {
                FloatWidth::F16 => write!(w, "f16"),
                FloatWidth::F32 => write!(w, "f32"),
                FloatWidth::F64 => write!(w, "f64"),
            },
            Payload::Bool => write!(w, "bool"),
            Payload::Mask => write!(w, "mask"),
            Payload::Ptr { space, pointee } => {
                write!(w, "ptr<{space:?}, ")?;
                self.print_type(w, pointee)?;
                write!(w, ">")
            },
            Payload::Arr { element, size } => {
                write!(w, "[")?;
                self.print_type(w, element)?;
                if let Some(size) = size {
                    write!(w, "; ")?;
                    self.print_value(w, size)?;
                }
                write!(w, "]")
            },
            Payload::Pack { element, width } => {
                write!(w, "pack<")?;
                self.print_type(w, element)?;
                write!(w, " x {width}>")
            },
            Payload::Record { members, names, special } => {
                match special {
                    RecordSpecial::NotSpecial => write!(w, "record")?,
                    RecordSpecial::MultipleReturn => write!(w, "values")?,
                    RecordSpecial::DecorateBlock => write!(w, "block_record")?,
                }
                write!(w, "{{")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(w, ", ")?;
                    }
                    if let Some(name) = names.get(i) {
                        write!(w, "{name}: ")?;
                    }
                    self.print_type(w, *member)?;
                }
                write!(w, "}}")
            },
            Payload::FnType { params, returns } => {
                write!(w, "fn(")?;
                self.print_type_list(w, params)?;
                write!(w, ") -> (")?;
                self.print_type_list(w, returns)?;
                write!(w, ")")
            },
            Payload::BBType { params } => {
                write!(w, "bb(")?;
                self.print_type_list(w, params)?;
                write!(w, ")")
            },
            Payload::LamType { params } => {
                write!(w, "lam(")?;
                self.print_type_list(w, params)?;
                write!(w, ")")
            },
            Payload::JoinPointType { yields } => {
                write!(w, "join(")?;
                self.print_type_list(w, yields)?;
                write!(w, ")")
            },
            Payload::TypeDeclRef { decl } => write!(w, "@{}", decl.declaration_name()),
            _ => panic!("not a type: {ty:?}"),
        }
    }

    fn print_type_list(&mut self, w: &mut impl Write, types: Nodes<'arena>) -> fmt::Result {
        for (i, ty) in types.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            self.print_type(w, *ty)?;
        }
        Ok(())
    }

    /// Prints a value inline.
    pub fn print_value(&mut self, w: &mut impl Write, value: Node<'arena>) -> fmt::Result {
        match *value {
            Payload::Param { name, .. } => {
                let id = self.display_id(value);
                match name {
                    Some(name) => write!(w, "%{name}.{id}"),
                    None => write!(w, "%{id}"),
                }
            },
            Payload::IntLiteral { width, signed, value } => {
                if signed {
                    let shift = 64 - width.bits();
                    #[allow(clippy::cast_possible_wrap)]
                    let v = ((value << shift) as i64) >> shift;
                    write!(w, "{v}{}", int_suffix(width, signed))
                } else {
                    write!(w, "{value}{}", int_suffix(width, signed))
                }
            },
            Payload::FloatLiteral { width, bits } => match width {
                FloatWidth::F16 => write!(w, "f16[{bits:#x}]"),
                #[allow(clippy::cast_possible_truncation)]
                FloatWidth::F32 => write!(w, "{}f32", f32::from_bits(bits as u32)),
                FloatWidth::F64 => write!(w, "{}f64", f64::from_bits(bits)),
            },
            Payload::True => write!(w, "true"),
            Payload::False => write!(w, "false"),
            Payload::StringLiteral { string } => write!(w, "{string:?}"),
            Payload::Composite { ty, contents } => {
                write!(w, "composite ")?;
                self.print_type(w, ty)?;
                write!(w, " {{")?;
                self.print_value_list(w, contents)?;
                write!(w, "}}")
            },
            Payload::RefDecl { decl } => write!(w, "@{}", decl.declaration_name()),
            Payload::FnAddr { function } => write!(w, "&@{}", function.declaration_name()),
            Payload::AbsMem { abs } => {
                let name = self.block_name(abs);
                write!(w, "mem({name})")
            },
            _ => panic!("not a value: {value:?}"),
        }
    }

    fn print_value_list(&mut self, w: &mut impl Write, values: Nodes<'arena>) -> fmt::Result {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            self.print_value(w, *value)?;
        }
        Ok(())
    }

    fn print_case(
        &mut self,
        w: &mut impl Write,
        case: Node<'arena>,
        indent: usize,
        pending: &mut Vec<Node<'arena>>,
    ) -> fmt::Result {
        writeln!(w, "{{")?;
        let params = case.abstraction_params();
        if !params.is_empty() {
            write!(w, "{:indent$}  |", "")?;
            self.print_value_list(w, params)?;
            writeln!(w, "|")?;
        }
        match case.abstraction_body() {
            Some(body) => self.print_body(w, body, indent + 2, pending)?,
            None => writeln!(w, "{:indent$}  <no body>", "")?,
        }
        write!(w, "{:indent$}}}", "")
    }

    /// Prints a single instruction; jump targets discovered inside nested
    /// cases are queued on `pending`.
    pub fn print_instruction(
        &mut self,
        w: &mut impl Write,
        instr: Node<'arena>,
        indent: usize,
        pending: &mut Vec<Node<'arena>>,
    ) -> fmt::Result {
        match *instr {
            Payload::PrimOp { op, type_args, operands } => {
                write!(w, "{op:?}")?;
                if !type_args.is_empty() {
                    write!(w, "[")?;
                    self.print_type_list(w, type_args)?;
                    write!(w, "]")?;
                }
                write!(w, " ")?;
                self.print_value_list(w, operands)
            },
            Payload::Call { callee, args, .. } => {
                write!(w, "call ")?;
                self.print_value(w, callee)?;
                write!(w, "(")?;
                self.print_value_list(w, args)?;
                write!(w, ")")
            },
            Payload::Load { ptr, .. } => {
                write!(w, "load ")?;
                self.print_value(w, ptr)
            },
            Payload::Store { ptr, value, .. } => {
                write!(w, "store ")?;
                self.print_value(w, ptr)?;
                write!(w, ", ")?;
                self.print_value(w, value)
            },
            Payload::Lea { ptr, offset, indices } => {
                write!(w, "lea ")?;
                self.print_value(w, ptr)?;
                write!(w, ", ")?;
                self.print_value(w, offset)?;
                write!(w, ", [")?;
                self.print_value_list(w, indices)?;
                write!(w, "]")
            },
            Payload::PushStack { value, .. } => {
                write!(w, "push_stack ")?;
                self.print_value(w, value)
            },
            Payload::PopStack { ty, .. } => {
                write!(w, "pop_stack[")?;
                self.print_type(w, ty)?;
                write!(w, "]")
            },
            Payload::GetStackSize { .. } => write!(w, "get_stack_size"),
            Payload::SetStackSize { value, .. } => {
                write!(w, "set_stack_size ")?;
                self.print_value(w, value)
            },
            Payload::GetStackBaseAddr => write!(w, "get_stack_base_addr"),
            Payload::If { condition, true_case, false_case, .. } => {
                write!(w, "if ")?;
                self.print_value(w, condition)?;
                write!(w, " ")?;
                self.print_case(w, true_case, indent, pending)?;
                if let Some(false_case) = false_case {
                    write!(w, " else ")?;
                    self.print_case(w, false_case, indent, pending)?;
                }
                Ok(())
            },
            Payload::Loop { initial_args, body, .. } => {
                write!(w, "loop (")?;
                self.print_value_list(w, initial_args)?;
                write!(w, ") ")?;
                self.print_case(w, body, indent, pending)
            },
            Payload::Match { inspect, literals, cases, default_case, .. } => {
                write!(w, "match ")?;
                self.print_value(w, inspect)?;
                write!(w, " ")?;
                for (lit, case) in literals.iter().zip(cases.iter()) {
                    write!(w, "case ")?;
                    self.print_value(w, *lit)?;
                    write!(w, " ")?;
                    self.print_case(w, *case, indent, pending)?;
                    write!(w, " ")?;
                }
                write!(w, "default ")?;
                self.print_case(w, default_case, indent, pending)
            },
            Payload::Control { inside, .. } => {
                write!(w, "control ")?;
                self.print_case(w, inside, indent, pending)
            },
            Payload::Block { yields, .. } => {
                write!(w, "block_end(")?;
                self.print_value_list(w, yields)?;
                write!(w, ")")
            },
            _ => panic!("not an instruction: {instr:?}"),
        }
    }

    fn print_jump_args(&mut self, w: &mut impl Write, args: Nodes<'arena>) -> fmt::Result {
        write!(w, "(")?;
        self.print_value_list(w, args)?;
        write!(w, ")")
    }

    /// Prints a terminator-rooted body, queueing jump targets for later.
    fn print_body(
        &mut self,
        w: &mut impl Write,
        body: Node<'arena>,
        indent: usize,
        pending: &mut Vec<Node<'arena>>,
    ) -> fmt::Result {
        let mut node = body;
        loop {
            write!(w, "{:indent$}", "")?;
            match *node {
                Payload::Let { instruction, tail } => {
                    let Payload::AnonLambda { params, body } = *tail else {
                        panic!("let tail must be an anonymous lambda");
                    };
                    write!(w, "let")?;
                    if !params.is_empty() {
                        write!(w, " ")?;
                        self.print_value_list(w, params)?;
                    }
                    write!(w, " = ")?;
                    self.print_instruction(w, instruction, indent, pending)?;
                    writeln!(w, ";")?;
                    node = body;
                },
                Payload::Jump { target, args, .. } => {
                    if !pending.contains(&target) {
                        pending.push(target);
                    }
                    let name = self.block_name(target);
                    write!(w, "jump {name}")?;
                    self.print_jump_args(w, args)?;
                    writeln!(w, ";")?;
                    return Ok(());
                },
                Payload::Branch { condition, true_target, false_target, args, .. } => {
                    for target in [true_target, false_target] {
                        if !pending.contains(&target) {
                            pending.push(target);
                        }
                    }
                    write!(w, "branch ")?;
                    self.print_value(w, condition)?;
                    let true_name = self.block_name(true_target);
                    let false_name = self.block_name(false_target);
                    write!(w, ", {true_name}, {false_name}")?;
                    self.print_jump_args(w, args)?;
                    writeln!(w, ";")?;
                    return Ok(());
                },
                Payload::Switch { inspect, literals, targets, default_target, args, .. } => {
                    for target in targets.iter().chain(core::iter::once(&default_target)) {
                        if !pending.contains(target) {
                            pending.push(*target);
                        }
                    }
                    write!(w, "switch ")?;
                    self.print_value(w, inspect)?;
                    for (lit, target) in literals.iter().zip(targets.iter()) {
                        write!(w, ", ")?;
                        self.print_value(w, *lit)?;
                        let name = self.block_name(*target);
                        write!(w, " -> {name}")?;
                    }
                    let default_name = self.block_name(default_target);
                    write!(w, ", default -> {default_name}")?;
                    self.print_jump_args(w, args)?;
                    writeln!(w, ";")?;
                    return Ok(());
                },
                Payload::Return { args, .. } => {
                    write!(w, "return (")?;
                    self.print_value_list(w, args)?;
                    writeln!(w, ");")?;
                    return Ok(());
                },
                Payload::TailCall { callee, args, .. } => {
                    write!(w, "tail_call ")?;
                    self.print_value(w, callee)?;
                    self.print_jump_args(w, args)?;
                    writeln!(w, ";")?;
                    return Ok(());
                },
                Payload::Join { join_point, args, .. } => {
                    write!(w, "join ")?;
                    self.print_value(w, join_point)?;
                    self.print_jump_args(w, args)?;
                    writeln!(w, ";")?;
                    return Ok(());
                },
                Payload::MergeSelection { args, .. } => {
                    write!(w, "merge_selection (")?;
                    self.print_value_list(w, args)?;
                    writeln!(w, ");")?;
                    return Ok(());
                },
                Payload::MergeContinue { args, .. } => {
                    write!(w, "merge_continue (")?;
                    self.print_value_list(w, args)?;
                    writeln!(w, ");")?;
                    return Ok(());
                },
                Payload::MergeBreak { args, .. } => {
                    write!(w, "merge_break (")?;
                    self.print_value_list(w, args)?;
                    writeln!(w, ");")?;
                    return Ok(());
                },
                Payload::Unreachable { .. } => {
                    writeln!(w, "unreachable;")?;
                    return Ok(());
                },
                _ => panic!("not a terminator: {node:?}"),
            }
        }
    }

    /// Prints a whole abstraction: its entry body, then every basic block it
    /// jumps to, transitively.
    pub fn print_abstraction_with_blocks(
        &mut self,
        w: &mut impl Write,
        abs: Node<'arena>,
        indent: usize,
    ) -> fmt::Result {
        let mut pending = Vec::new();
        let mut printed = Vec::new();
        match abs.abstraction_body() {
            Some(body) => self.print_body(w, body, indent, &mut pending)?,
            None => writeln!(w, "{:indent$}<no body>", "")?,
        }
        while let Some(bb) = pending.iter().find(|bb| !printed.contains(*bb)).copied() {
            printed.push(bb);
            let name = self.block_name(bb);
            write!(w, "{:indent$}cont {name}", "")?;
            let params = bb.abstraction_params();
            write!(w, "(")?;
            self.print_value_list(w, params)?;
            writeln!(w, "):")?;
            match bb.abstraction_body() {
                Some(body) => self.print_body(w, body, indent + 2, &mut pending)?,
                None => writeln!(w, "{:indent$}  <no body>", "")?,
            }
        }
        Ok(())
    }

    /// Prints a top-level declaration.
    pub fn print_declaration(&mut self, w: &mut impl Write, decl: Node<'arena>) -> fmt::Result {
        for annotation in decl.annotations().iter() {
            write!(w, "  #[{}", annotation.annotation_name())?;
            match **annotation {
                Payload::AnnotationValue { value, .. } => {
                    write!(w, " = ")?;
                    self.print_value(w, value)?;
                },
                Payload::AnnotationValues { values, .. } => {
                    write!(w, " = (")?;
                    self.print_value_list(w, values)?;
                    write!(w, ")")?;
                },
                _ => {},
            }
            writeln!(w, "]")?;
        }
        match *decl {
            Payload::Function(f) => {
                write!(w, "  fn @{}(", f.name)?;
                self.print_value_list(w, f.params)?;
                write!(w, ") -> (")?;
                self.print_type_list(w, f.return_types)?;
                writeln!(w, ") {{")?;
                self.print_abstraction_with_blocks(w, decl, 4)?;
                writeln!(w, "  }}")
            },
            Payload::Constant(c) => {
                write!(w, "  const ")?;
                self.print_type(w, c.type_hint)?;
                write!(w, " @{} = ", c.name)?;
                match c.value.get() {
                    Some(value) => self.print_value(w, value)?,
                    None => write!(w, "<no value>")?,
                }
                writeln!(w, ";")
            },
            Payload::GlobalVariable(g) => {
                write!(w, "  var {:?} ", g.space)?;
                self.print_type(w, g.ty)?;
                write!(w, " @{}", g.name)?;
                if let Some(init) = g.init.get() {
                    write!(w, " = ")?;
                    self.print_value(w, init)?;
                }
                writeln!(w, ";")
            },
            Payload::NominalType(t) => {
                write!(w, "  struct @{} = ", t.name)?;
                match t.body.get() {
                    Some(body) => self.print_type(w, body)?,
                    None => write!(w, "<no body>")?,
                }
                writeln!(w, ";")
            },
            _ => panic!("not a declaration: {decl:?}"),
        }
    }

    /// Prints a module.
    pub fn print_module(&mut self, w: &mut impl Write, module: &Module<'arena>) -> fmt::Result {
        writeln!(w, "module {:?} {{", module.name())?;
        for decl in module.declarations() {
            self.print_declaration(w, *decl)?;
        }
        writeln!(w, "}}")
    }
}

/// Renders a module to a string.
#[must_use]
pub fn print_module_into_string(module: &Module) -> String {
    let mut out = String::new();
    let mut printer = Printer::default();
    printer.print_module(&mut out, module).expect("formatting failed");
    out
}

/// Dumps a module to stderr.
pub fn dump_module(module: &Module) {
    eprint!("{}", print_module_into_string(module));
}

/// One-line rendering of a single node, used by diagnostics and `Display`.
pub(crate) fn fmt_node(f: &mut fmt::Formatter, node: Node) -> fmt::Result {
    let mut printer = Printer::default();
    let mut pending = Vec::new();
    let mut out = String::new();
    let result = if node.is_type() {
        printer.print_type(&mut out, node)
    } else if node.is_value() || matches!(*node, Payload::AbsMem { .. }) {
        printer.print_value(&mut out, node)
    } else if node.is_instruction() {
        printer.print_instruction(&mut out, node, 0, &mut pending)
    } else if node.is_terminator() {
        printer.print_body(&mut out, node, 0, &mut pending)
    } else if node.is_declaration() {
        printer.print_declaration(&mut out, node)
    } else {
        write!(&mut out, "{node:?}")
    };
    result?;
    write!(f, "{}", out.trim_end())
}
