//! disasm.rs — Désassembleur lisible (humain) d'un chunk.
//!
//! Une instruction par ligne : offset, ligne source, mnémonique,
//! opérandes avec constantes résolues. Les fonctions du pool sont
//! désassemblées récursivement.

use std::fmt::Write as _;

use crate::bytecode::chunk::{Chunk, Const};
use crate::bytecode::op::{Op, OperandKind};

/// Désassemble un chunk entier, avec titre.
pub fn disassemble(chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "== {title} ==  (code={} octets, consts={})", chunk.len(), chunk.consts.len());
    let mut offset = 0usize;
    while offset < chunk.code.len() {
        offset = disassemble_at(chunk, offset, &mut out);
    }
    // sous-fonctions
    for (idx, c) in chunk.consts.iter() {
        if let Const::Func(f) = c {
            let _ = writeln!(&mut out);
            out.push_str(&disassemble(&f.chunk, &format!("fn {} (const {idx})", f.name)));
        }
    }
    out
}

/// Désassemble l'instruction à `offset` ; renvoie l'offset suivant.
pub fn disassemble_at(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let line = chunk.line_for(offset);
    let _ = write!(out, "{offset:05}  (l.{line:>4})  ");

    let byte = chunk.code[offset];
    let Some(op) = Op::from_byte(byte) else {
        let _ = writeln!(out, "octet inconnu 0x{byte:02X}");
        return offset + 1;
    };

    match op.operand_kind() {
        OperandKind::None => {
            let _ = writeln!(out, "{}", op.mnemonic());
            offset + 1
        }
        OperandKind::Byte => {
            let operand = chunk.code.get(offset + 1).copied().unwrap_or(0);
            let _ = writeln!(out, "{} {}", op.mnemonic(), operand);
            offset + 2
        }
        OperandKind::Short => {
            let v = chunk.read_short(offset + 1);
            let target = match op {
                Op::Loop => (offset + 3).wrapping_sub(v as usize),
                _ => offset + 3 + v as usize,
            };
            let _ = writeln!(out, "{} {} -> {:05}", op.mnemonic(), v, target);
            offset + 3
        }
        OperandKind::ConstByte => {
            let idx = chunk.code.get(offset + 1).copied().unwrap_or(0) as u32;
            let _ = writeln!(out, "{} {} {}", op.mnemonic(), idx, resolved(chunk, idx));
            offset + 2
        }
        OperandKind::ConstLong => {
            let idx = read_u24(chunk, offset + 1);
            let _ = writeln!(out, "{} {} {}", op.mnemonic(), idx, resolved(chunk, idx));
            offset + 4
        }
        OperandKind::ClosureSpecial => {
            let (idx, mut next) = if op == Op::Closure {
                (chunk.code.get(offset + 1).copied().unwrap_or(0) as u32, offset + 2)
            } else {
                (read_u24(chunk, offset + 1), offset + 4)
            };
            let _ = write!(out, "{} {} {}", op.mnemonic(), idx, resolved(chunk, idx));
            let upvalues = match chunk.const_at(idx) {
                Some(Const::Func(f)) => f.upvalue_count as usize,
                _ => 0,
            };
            for _ in 0..upvalues {
                let is_local = chunk.code.get(next).copied().unwrap_or(0) != 0;
                let index = chunk.code.get(next + 1).copied().unwrap_or(0);
                let _ = write!(out, " [{} {}]", if is_local { "local" } else { "upval" }, index);
                next += 2;
            }
            let _ = writeln!(out);
            next
        }
        OperandKind::StructDef => {
            let name_idx = chunk.code.get(offset + 1).copied().unwrap_or(0) as u32;
            let field_count = chunk.code.get(offset + 2).copied().unwrap_or(0) as usize;
            let _ = write!(out, "{} {}", op.mnemonic(), resolved(chunk, name_idx));
            let mut next = offset + 3;
            for _ in 0..field_count {
                let f_idx = chunk.code.get(next).copied().unwrap_or(0) as u32;
                let _ = write!(out, " {}", resolved(chunk, f_idx));
                next += 1;
            }
            let _ = writeln!(out);
            next
        }
    }
}

fn resolved(chunk: &Chunk, idx: u32) -> String {
    match chunk.const_at(idx) {
        Some(c) => format!("/* {c} */"),
        None => "/* ?? */".into(),
    }
}

fn read_u24(chunk: &Chunk, offset: usize) -> u32 {
    let b0 = chunk.code.get(offset).copied().unwrap_or(0) as u32;
    let b1 = chunk.code.get(offset + 1).copied().unwrap_or(0) as u32;
    let b2 = chunk.code.get(offset + 2).copied().unwrap_or(0) as u32;
    b0 | (b1 << 8) | (b2 << 16)
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_constants_and_jumps() {
        let mut c = Chunk::new();
        let k = c.add_const(Const::Str("greet".into()));
        c.push_op(Op::Constant, 1);
        c.push_byte(k as u8, 1);
        c.push_op(Op::JumpIfFalse, 2);
        c.push_short(4, 2);
        c.push_op(Op::Return, 3);
        let text = disassemble(&c, "test");
        assert!(text.contains("const 0 /* \"greet\" */"));
        assert!(text.contains("jz 4"));
        assert!(text.contains("ret"));
    }
}
