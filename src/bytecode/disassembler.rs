//! Bytecode disassembler for debug output.

use super::instruction::{CallSpec, Instruction, OpCode};
use super::module::{CodeObject, Constant, ModuleObject};

/// Disassemble every code object of a module to a human-readable string.
pub fn disassemble_module(module: &ModuleObject) -> String {
    let mut out = String::new();
    for (index, code) in module.code.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        disassemble_code(module, code, index == module.main, &mut out);
    }
    out
}

fn disassemble_code(module: &ModuleObject, code: &CodeObject, is_main: bool, out: &mut String) {
    out.push_str(&format!(
        "== {}({}){}{} ==\n",
        code.symbol.name,
        code.symbol.attributes.join(", "),
        if is_main { " [main]" } else { "" },
        if code.noscope { " [noscope]" } else { "" },
    ));
    for (offset, ins) in code.instructions.iter().enumerate() {
        out.push_str(&format!("{:04} ", offset));
        disassemble_instruction(module, ins, out);
        out.push('\n');
    }
}

fn disassemble_instruction(module: &ModuleObject, ins: &Instruction, out: &mut String) {
    let name = mnemonic(ins.op);
    match ins.op {
        OpCode::LoadConst => {
            let val = ins.index().and_then(|i| module.constants.get(i));
            out.push_str(&format!("{:<20} {:>5} ({})", name, ins.arg, format_constant(val)));
        }
        op if op.uses_constant() => {
            out.push_str(&format!(
                "{:<20} {:>5} ({})",
                name,
                ins.arg,
                constant_string(module, ins.arg)
            ));
        }
        OpCode::Call => {
            let spec = CallSpec::from_operand(ins.arg);
            out.push_str(&format!(
                "{:<20} {:>5} (positional={}, kwargs={})",
                name,
                ins.arg,
                spec.positional(),
                spec.has_keyword_dict()
            ));
        }
        op if op.is_jump() => out.push_str(&format!("{:<20} -> {:04}", name, ins.arg)),
        OpCode::Concat
        | OpCode::MakeArray
        | OpCode::MakeDict
        | OpCode::MakeFunction
        | OpCode::MakeClass
        | OpCode::Await => out.push_str(&format!("{:<20} {:>5}", name, ins.arg)),
        _ => out.push_str(&name),
    }
}

/// `JumpIfFalseOrPop` -> `JUMP_IF_FALSE_OR_POP`.
fn mnemonic(op: OpCode) -> String {
    let debug = format!("{:?}", op);
    let mut out = String::with_capacity(debug.len() + 4);
    for (i, c) in debug.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn constant_string(module: &ModuleObject, idx: i32) -> String {
    match usize::try_from(idx).ok().and_then(|i| module.constants.get(i)) {
        Some(Constant::String(s)) => s.clone(),
        _ => format!("?{}", idx),
    }
}

fn format_constant(val: Option<&Constant>) -> String {
    match val {
        Some(Constant::Undef) => "undef".to_string(),
        Some(Constant::Null) => "null".to_string(),
        Some(Constant::Bool(b)) => format!("{}", b),
        Some(Constant::Int(n)) => format!("{}", n),
        Some(Constant::Float(n)) => format!("{}", n),
        Some(Constant::String(s)) => format!("\"{}\"", s),
        Some(Constant::DateTime(s)) => format!("@{}", s),
        Some(Constant::Array(items)) => format!("<array of {}>", items.len()),
        Some(Constant::Dict(entries)) => format!("<dict of {}>", entries.len()),
        Some(Constant::Code(i)) => format!("<code {}>", i),
        None => "???".to_string(),
    }
}
