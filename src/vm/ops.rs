//! Bytecode operations for the stack VM.
//!
//! Every instruction is one opcode byte followed by a fixed-size immediate
//! (0, 1, 2, 4 or 8 bytes, little-endian). Jump offsets are relative to the
//! address of the next instruction.

use super::error::Fault;

// Opcode tags
pub const OP_NOP: u8 = 0x00;
pub const OP_PUSH_INT: u8 = 0x01;
pub const OP_PUSH_DOUBLE: u8 = 0x02;
pub const OP_POP: u8 = 0x03;
pub const OP_DUP: u8 = 0x04;
pub const OP_ADD: u8 = 0x10;
pub const OP_SUB: u8 = 0x11;
pub const OP_MUL: u8 = 0x12;
pub const OP_DIV: u8 = 0x13;
pub const OP_MOD: u8 = 0x14;
pub const OP_NEG: u8 = 0x15;
pub const OP_EQ: u8 = 0x18;
pub const OP_NE: u8 = 0x19;
pub const OP_LT: u8 = 0x1A;
pub const OP_LE: u8 = 0x1B;
pub const OP_GT: u8 = 0x1C;
pub const OP_GE: u8 = 0x1D;
pub const OP_DADD: u8 = 0x20;
pub const OP_DSUB: u8 = 0x21;
pub const OP_DMUL: u8 = 0x22;
pub const OP_DDIV: u8 = 0x23;
pub const OP_DMOD: u8 = 0x24;
pub const OP_DNEG: u8 = 0x25;
pub const OP_DEQ: u8 = 0x28;
pub const OP_DNE: u8 = 0x29;
pub const OP_DLT: u8 = 0x2A;
pub const OP_DLE: u8 = 0x2B;
pub const OP_DGT: u8 = 0x2C;
pub const OP_DGE: u8 = 0x2D;
pub const OP_INT_TO_DOUBLE: u8 = 0x30;
pub const OP_DOUBLE_TO_INT: u8 = 0x31;
pub const OP_DSQRT: u8 = 0x32;
pub const OP_JMP: u8 = 0x40;
pub const OP_JMP_IF_ZERO: u8 = 0x41;
pub const OP_JMP_IF_NOT_ZERO: u8 = 0x42;
pub const OP_CALL: u8 = 0x48;
pub const OP_RET: u8 = 0x49;
pub const OP_LOAD_LOCAL: u8 = 0x50;
pub const OP_STORE_LOCAL: u8 = 0x51;
pub const OP_LOAD_GLOBAL: u8 = 0x52;
pub const OP_STORE_GLOBAL: u8 = 0x53;
pub const OP_ARRAY_NEW: u8 = 0x60;
pub const OP_ARRAY_LOAD: u8 = 0x61;
pub const OP_ARRAY_STORE: u8 = 0x62;
pub const OP_ARRAY_LEN: u8 = 0x63;
pub const OP_PRINT_INT: u8 = 0x70;
pub const OP_READ_INT: u8 = 0x71;
pub const OP_HALT: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // ========================================
    // Stack
    // ========================================
    Nop,
    PushInt(i64),
    PushDouble(f64),
    Pop,
    Dup,

    // ========================================
    // Integer arithmetic / comparison
    // ========================================
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // ========================================
    // Double arithmetic / comparison
    // ========================================
    DAdd,
    DSub,
    DMul,
    DDiv,
    DMod,
    DNeg,
    DEq,
    DNe,
    DLt,
    DLe,
    DGt,
    DGe,
    IntToDouble,
    DoubleToInt,
    DSqrt,

    // ========================================
    // Control flow
    // ========================================
    Jmp(i32),
    JmpIfZero(i32),
    JmpIfNotZero(i32),
    Call(u16),
    Ret,

    // ========================================
    // Variables
    // ========================================
    LoadLocal(u8),
    StoreLocal(u8),
    LoadGlobal(u16),
    StoreGlobal(u16),

    // ========================================
    // Arrays
    // ========================================
    ArrayNew,
    ArrayLoad,
    ArrayStore,
    ArrayLen,

    // ========================================
    // I/O
    // ========================================
    PrintInt,
    ReadInt,
    Halt,
}

/// Immediate operand size in bytes for an opcode, or `None` if the opcode is
/// not part of the instruction set.
pub fn operand_size(opcode: u8) -> Option<usize> {
    let size = match opcode {
        OP_PUSH_INT | OP_PUSH_DOUBLE => 8,
        OP_JMP | OP_JMP_IF_ZERO | OP_JMP_IF_NOT_ZERO => 4,
        OP_CALL | OP_LOAD_GLOBAL | OP_STORE_GLOBAL => 2,
        OP_LOAD_LOCAL | OP_STORE_LOCAL => 1,
        OP_NOP | OP_POP | OP_DUP | OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_NEG
        | OP_EQ | OP_NE | OP_LT | OP_LE | OP_GT | OP_GE | OP_DADD | OP_DSUB | OP_DMUL
        | OP_DDIV | OP_DMOD | OP_DNEG | OP_DEQ | OP_DNE | OP_DLT | OP_DLE | OP_DGT | OP_DGE
        | OP_INT_TO_DOUBLE | OP_DOUBLE_TO_INT | OP_DSQRT | OP_RET | OP_ARRAY_NEW
        | OP_ARRAY_LOAD | OP_ARRAY_STORE | OP_ARRAY_LEN | OP_PRINT_INT | OP_READ_INT
        | OP_HALT => 0,
        _ => return None,
    };
    Some(size)
}

/// Decode the instruction starting at `pc`. Returns the operation and the
/// total instruction size (opcode + immediate).
pub fn decode(code: &[u8], pc: usize) -> Result<(Op, usize), Fault> {
    let opcode = *code.get(pc).ok_or(Fault::JumpOutOfRange(pc as i64))?;
    let imm_size = operand_size(opcode).ok_or(Fault::UnknownOpcode(opcode))?;
    let imm = code
        .get(pc + 1..pc + 1 + imm_size)
        .ok_or(Fault::TruncatedInstruction(opcode))?;

    let op = match opcode {
        OP_NOP => Op::Nop,
        OP_PUSH_INT => Op::PushInt(i64::from_le_bytes(imm8(imm))),
        OP_PUSH_DOUBLE => Op::PushDouble(f64::from_le_bytes(imm8(imm))),
        OP_POP => Op::Pop,
        OP_DUP => Op::Dup,
        OP_ADD => Op::Add,
        OP_SUB => Op::Sub,
        OP_MUL => Op::Mul,
        OP_DIV => Op::Div,
        OP_MOD => Op::Mod,
        OP_NEG => Op::Neg,
        OP_EQ => Op::Eq,
        OP_NE => Op::Ne,
        OP_LT => Op::Lt,
        OP_LE => Op::Le,
        OP_GT => Op::Gt,
        OP_GE => Op::Ge,
        OP_DADD => Op::DAdd,
        OP_DSUB => Op::DSub,
        OP_DMUL => Op::DMul,
        OP_DDIV => Op::DDiv,
        OP_DMOD => Op::DMod,
        OP_DNEG => Op::DNeg,
        OP_DEQ => Op::DEq,
        OP_DNE => Op::DNe,
        OP_DLT => Op::DLt,
        OP_DLE => Op::DLe,
        OP_DGT => Op::DGt,
        OP_DGE => Op::DGe,
        OP_INT_TO_DOUBLE => Op::IntToDouble,
        OP_DOUBLE_TO_INT => Op::DoubleToInt,
        OP_DSQRT => Op::DSqrt,
        OP_JMP => Op::Jmp(i32::from_le_bytes(imm4(imm))),
        OP_JMP_IF_ZERO => Op::JmpIfZero(i32::from_le_bytes(imm4(imm))),
        OP_JMP_IF_NOT_ZERO => Op::JmpIfNotZero(i32::from_le_bytes(imm4(imm))),
        OP_CALL => Op::Call(u16::from_le_bytes([imm[0], imm[1]])),
        OP_RET => Op::Ret,
        OP_LOAD_LOCAL => Op::LoadLocal(imm[0]),
        OP_STORE_LOCAL => Op::StoreLocal(imm[0]),
        OP_LOAD_GLOBAL => Op::LoadGlobal(u16::from_le_bytes([imm[0], imm[1]])),
        OP_STORE_GLOBAL => Op::StoreGlobal(u16::from_le_bytes([imm[0], imm[1]])),
        OP_ARRAY_NEW => Op::ArrayNew,
        OP_ARRAY_LOAD => Op::ArrayLoad,
        OP_ARRAY_STORE => Op::ArrayStore,
        OP_ARRAY_LEN => Op::ArrayLen,
        OP_PRINT_INT => Op::PrintInt,
        OP_READ_INT => Op::ReadInt,
        OP_HALT => Op::Halt,
        _ => return Err(Fault::UnknownOpcode(opcode)),
    };
    Ok((op, 1 + imm_size))
}

fn imm8(imm: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&imm[..8]);
    buf
}

fn imm4(imm: &[u8]) -> [u8; 4] {
    [imm[0], imm[1], imm[2], imm[3]]
}

impl Op {
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Nop => OP_NOP,
            Op::PushInt(_) => OP_PUSH_INT,
            Op::PushDouble(_) => OP_PUSH_DOUBLE,
            Op::Pop => OP_POP,
            Op::Dup => OP_DUP,
            Op::Add => OP_ADD,
            Op::Sub => OP_SUB,
            Op::Mul => OP_MUL,
            Op::Div => OP_DIV,
            Op::Mod => OP_MOD,
            Op::Neg => OP_NEG,
            Op::Eq => OP_EQ,
            Op::Ne => OP_NE,
            Op::Lt => OP_LT,
            Op::Le => OP_LE,
            Op::Gt => OP_GT,
            Op::Ge => OP_GE,
            Op::DAdd => OP_DADD,
            Op::DSub => OP_DSUB,
            Op::DMul => OP_DMUL,
            Op::DDiv => OP_DDIV,
            Op::DMod => OP_DMOD,
            Op::DNeg => OP_DNEG,
            Op::DEq => OP_DEQ,
            Op::DNe => OP_DNE,
            Op::DLt => OP_DLT,
            Op::DLe => OP_DLE,
            Op::DGt => OP_DGT,
            Op::DGe => OP_DGE,
            Op::IntToDouble => OP_INT_TO_DOUBLE,
            Op::DoubleToInt => OP_DOUBLE_TO_INT,
            Op::DSqrt => OP_DSQRT,
            Op::Jmp(_) => OP_JMP,
            Op::JmpIfZero(_) => OP_JMP_IF_ZERO,
            Op::JmpIfNotZero(_) => OP_JMP_IF_NOT_ZERO,
            Op::Call(_) => OP_CALL,
            Op::Ret => OP_RET,
            Op::LoadLocal(_) => OP_LOAD_LOCAL,
            Op::StoreLocal(_) => OP_STORE_LOCAL,
            Op::LoadGlobal(_) => OP_LOAD_GLOBAL,
            Op::StoreGlobal(_) => OP_STORE_GLOBAL,
            Op::ArrayNew => OP_ARRAY_NEW,
            Op::ArrayLoad => OP_ARRAY_LOAD,
            Op::ArrayStore => OP_ARRAY_STORE,
            Op::ArrayLen => OP_ARRAY_LEN,
            Op::PrintInt => OP_PRINT_INT,
            Op::ReadInt => OP_READ_INT,
            Op::Halt => OP_HALT,
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        1 + operand_size(self.opcode()).unwrap_or(0)
    }

    /// Append the encoded instruction to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.opcode());
        match *self {
            Op::PushInt(n) => buf.extend_from_slice(&n.to_le_bytes()),
            Op::PushDouble(f) => buf.extend_from_slice(&f.to_le_bytes()),
            Op::Jmp(off) | Op::JmpIfZero(off) | Op::JmpIfNotZero(off) => {
                buf.extend_from_slice(&off.to_le_bytes())
            }
            Op::Call(idx) | Op::LoadGlobal(idx) | Op::StoreGlobal(idx) => {
                buf.extend_from_slice(&idx.to_le_bytes())
            }
            Op::LoadLocal(idx) | Op::StoreLocal(idx) => buf.push(idx),
            _ => {}
        }
    }

    /// Relative jump offset, if this is a jump.
    pub fn jump_offset(&self) -> Option<i32> {
        match *self {
            Op::Jmp(off) | Op::JmpIfZero(off) | Op::JmpIfNotZero(off) => Some(off),
            _ => None,
        }
    }

    /// Returns the mnemonic used by the assembler and disassembler.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::PushInt(_) => "push_int",
            Op::PushDouble(_) => "push_double",
            Op::Pop => "pop",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Neg => "neg",
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Lt => "lt",
            Op::Le => "le",
            Op::Gt => "gt",
            Op::Ge => "ge",
            Op::DAdd => "dadd",
            Op::DSub => "dsub",
            Op::DMul => "dmul",
            Op::DDiv => "ddiv",
            Op::DMod => "dmod",
            Op::DNeg => "dneg",
            Op::DEq => "deq",
            Op::DNe => "dne",
            Op::DLt => "dlt",
            Op::DLe => "dle",
            Op::DGt => "dgt",
            Op::DGe => "dge",
            Op::IntToDouble => "i2d",
            Op::DoubleToInt => "d2i",
            Op::DSqrt => "dsqrt",
            Op::Jmp(_) => "jmp",
            Op::JmpIfZero(_) => "jz",
            Op::JmpIfNotZero(_) => "jnz",
            Op::Call(_) => "call",
            Op::Ret => "ret",
            Op::LoadLocal(_) => "load_local",
            Op::StoreLocal(_) => "store_local",
            Op::LoadGlobal(_) => "load_global",
            Op::StoreGlobal(_) => "store_global",
            Op::ArrayNew => "array_new",
            Op::ArrayLoad => "array_load",
            Op::ArrayStore => "array_store",
            Op::ArrayLen => "array_len",
            Op::PrintInt => "print_int",
            Op::ReadInt => "read_int",
            Op::Halt => "halt",
        }
    }

    /// Operations with no immediate, keyed by mnemonic.
    pub fn from_simple_name(name: &str) -> Option<Op> {
        let op = match name {
            "nop" => Op::Nop,
            "pop" => Op::Pop,
            "dup" => Op::Dup,
            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "div" => Op::Div,
            "mod" => Op::Mod,
            "neg" => Op::Neg,
            "eq" => Op::Eq,
            "ne" => Op::Ne,
            "lt" => Op::Lt,
            "le" => Op::Le,
            "gt" => Op::Gt,
            "ge" => Op::Ge,
            "dadd" => Op::DAdd,
            "dsub" => Op::DSub,
            "dmul" => Op::DMul,
            "ddiv" => Op::DDiv,
            "dmod" => Op::DMod,
            "dneg" => Op::DNeg,
            "deq" => Op::DEq,
            "dne" => Op::DNe,
            "dlt" => Op::DLt,
            "dle" => Op::DLe,
            "dgt" => Op::DGt,
            "dge" => Op::DGe,
            "i2d" => Op::IntToDouble,
            "d2i" => Op::DoubleToInt,
            "dsqrt" => Op::DSqrt,
            "ret" => Op::Ret,
            "array_new" => Op::ArrayNew,
            "array_load" => Op::ArrayLoad,
            "array_store" => Op::ArrayStore,
            "array_len" => Op::ArrayLen,
            "print_int" => Op::PrintInt,
            "read_int" => Op::ReadInt,
            "halt" => Op::Halt,
            _ => return None,
        };
        Some(op)
    }
}

/// Encode a sequence of operations into bytecode.
pub fn assemble_ops(ops: &[Op]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ops.iter().map(Op::size).sum());
    for op in ops {
        op.encode(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(Op::PushInt(0).size(), 9);
        assert_eq!(Op::PushDouble(0.0).size(), 9);
        assert_eq!(Op::Jmp(0).size(), 5);
        assert_eq!(Op::Call(0).size(), 3);
        assert_eq!(Op::LoadLocal(0).size(), 2);
        assert_eq!(Op::LoadGlobal(0).size(), 3);
        assert_eq!(Op::Add.size(), 1);
    }

    #[test]
    fn test_decode_every_op() {
        let ops = vec![
            Op::Nop,
            Op::PushInt(i64::MIN),
            Op::PushDouble(-2.5),
            Op::Jmp(-17),
            Op::JmpIfZero(4),
            Op::JmpIfNotZero(0),
            Op::Call(513),
            Op::LoadLocal(200),
            Op::StoreGlobal(65535),
            Op::DSqrt,
            Op::Halt,
        ];
        let code = assemble_ops(&ops);
        let mut pc = 0;
        for expected in &ops {
            let (op, size) = decode(&code, pc).unwrap();
            assert_eq!(&op, expected);
            assert_eq!(size, expected.size());
            pc += size;
        }
        assert_eq!(pc, code.len());
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(decode(&[0xEE], 0), Err(Fault::UnknownOpcode(0xEE)));
    }

    #[test]
    fn test_truncated_operand() {
        assert_eq!(
            decode(&[OP_PUSH_INT, 1, 2, 3], 0),
            Err(Fault::TruncatedInstruction(OP_PUSH_INT))
        );
        assert_eq!(
            decode(&[OP_CALL, 1], 0),
            Err(Fault::TruncatedInstruction(OP_CALL))
        );
    }

    #[test]
    fn test_simple_names_roundtrip() {
        for op in [Op::Add, Op::DGe, Op::ArrayLen, Op::ReadInt, Op::Halt] {
            assert_eq!(Op::from_simple_name(op.name()), Some(op));
        }
        assert_eq!(Op::from_simple_name("push_int"), None);
    }
}
