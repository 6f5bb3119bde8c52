//! Binary module loading and serialization.
//!
//! Binary format (all integers little-endian):
//! - Magic: "SVMB" (4 bytes)
//! - Version: u16
//! - Entry function index: u16
//! - Global count: u16
//! - Function count: u16
//! - Functions: arity u8, local count u8, code length u32, code bytes
//!
//! Function indices are implicit in table order.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use super::error::LoadError;
use super::ops::decode;
use super::{BytecodeModule, FunctionInfo, Op};

/// Magic bytes for stackvm modules.
pub const MAGIC: &[u8; 4] = b"SVMB";

/// Current module format version.
pub const VERSION: u16 = 1;

/// Size of the fixed module header.
pub const HEADER_SIZE: usize = 12;

const FUNCTION_HEADER_SIZE: usize = 6;

/// Parse a module from its binary form.
pub fn load(data: &[u8]) -> Result<BytecodeModule, LoadError> {
    if data.len() < HEADER_SIZE {
        return Err(LoadError::TooShort {
            len: data.len(),
            needed: HEADER_SIZE,
        });
    }

    let mut r = Reader::new(data);
    let magic = r.u32();
    if magic != u32::from_le_bytes(*MAGIC) {
        return Err(LoadError::BadMagic(magic));
    }
    let version = r.u16();
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion {
            found: version,
            expected: VERSION,
        });
    }
    let entry = r.u16();
    let global_count = r.u16();
    let function_count = r.u16() as usize;

    let mut functions = Vec::with_capacity(function_count);
    for index in 0..function_count {
        if r.remaining() < FUNCTION_HEADER_SIZE {
            return Err(LoadError::TruncatedFunction {
                index,
                needed: FUNCTION_HEADER_SIZE,
                available: r.remaining(),
            });
        }
        let arity = r.u8();
        let locals = r.u8();
        let code_len = r.u32() as usize;
        if locals < arity {
            return Err(LoadError::LocalsBelowArity {
                index,
                arity,
                locals,
            });
        }
        let code = r.bytes(code_len).ok_or(LoadError::TruncatedFunction {
            index,
            needed: code_len,
            available: r.remaining(),
        })?;
        functions.push(FunctionInfo::new(index as u16, arity, locals, code.to_vec()));
    }

    if r.remaining() > 0 {
        return Err(LoadError::TrailingBytes {
            count: r.remaining(),
        });
    }
    if entry as usize >= functions.len() {
        return Err(LoadError::InvalidEntryPoint {
            entry,
            count: functions.len(),
        });
    }

    Ok(BytecodeModule {
        version,
        global_count,
        entry,
        functions,
    })
}

/// Read and parse a module file.
pub fn load_file(path: impl AsRef<Path>) -> Result<BytecodeModule, LoadError> {
    let data = fs::read(path)?;
    load(&data)
}

/// Encode a module into its binary form. Inverse of [`load`].
pub fn serialize(module: &BytecodeModule) -> Vec<u8> {
    let code_bytes: usize = module
        .functions
        .iter()
        .map(|f| FUNCTION_HEADER_SIZE + f.code.len())
        .sum();
    let mut buf = Vec::with_capacity(HEADER_SIZE + code_bytes);

    buf.extend_from_slice(MAGIC);
    write_u16(&mut buf, module.version);
    write_u16(&mut buf, module.entry);
    write_u16(&mut buf, module.global_count);
    write_u16(&mut buf, module.functions.len() as u16);

    for func in &module.functions {
        buf.push(func.arity);
        buf.push(func.locals_count);
        write_u32(&mut buf, func.code.len() as u32);
        buf.extend_from_slice(&func.code);
    }
    buf
}

/// Render bytecode one instruction per line. Jump targets are shown as
/// absolute offsets. Bytes that do not decode are shown as `.byte` lines.
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < code.len() {
        match decode(code, pc) {
            Ok((op, size)) => {
                let _ = write!(out, "{:04x}: {}", pc, op.name());
                match op {
                    Op::PushInt(n) => {
                        let _ = write!(out, " {}", n);
                    }
                    Op::PushDouble(f) => {
                        let _ = write!(out, " {:?}", f);
                    }
                    Op::Call(idx)
                    | Op::LoadGlobal(idx)
                    | Op::StoreGlobal(idx) => {
                        let _ = write!(out, " {}", idx);
                    }
                    Op::LoadLocal(idx) | Op::StoreLocal(idx) => {
                        let _ = write!(out, " {}", idx);
                    }
                    _ => {}
                }
                if let Some(offset) = op.jump_offset() {
                    let target = (pc + size) as i64 + offset as i64;
                    let _ = write!(out, " {:+} ; -> {:04x}", offset, target);
                }
                out.push('\n');
                pc += size;
            }
            Err(_) => {
                let _ = writeln!(out, "{:04x}: .byte {:#04x}", pc, code[pc]);
                pc += 1;
            }
        }
    }
    out
}

/// Disassemble every function of a module, with headers.
pub fn disassemble_module(module: &BytecodeModule) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "; version {}, {} globals, entry {}",
        module.version, module.global_count, module.entry
    );
    for func in &module.functions {
        let _ = writeln!(
            out,
            "\n.func {} arity={} locals={} ; {} bytes",
            func.index,
            func.arity,
            func.locals_count,
            func.code.len()
        );
        out.push_str(&disassemble(&func.code));
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    // Callers check `remaining()` before the fixed-size reads below.
    fn u8(&mut self) -> u8 {
        let v = self.data[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let b = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{assemble_ops, Op};

    fn module(functions: Vec<FunctionInfo>) -> BytecodeModule {
        BytecodeModule {
            version: VERSION,
            global_count: 3,
            entry: 0,
            functions,
        }
    }

    #[test]
    fn test_roundtrip() {
        let m = module(vec![
            FunctionInfo::new(0, 0, 1, assemble_ops(&[Op::Call(1), Op::Halt])),
            FunctionInfo::new(1, 2, 4, assemble_ops(&[Op::LoadLocal(1), Op::Ret])),
        ]);
        let bytes = serialize(&m);
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(load(&bytes).unwrap(), m);
    }

    #[test]
    fn test_header_layout() {
        let m = BytecodeModule {
            version: VERSION,
            global_count: 0x0203,
            entry: 0,
            functions: vec![FunctionInfo::new(0, 1, 2, vec![0xFF])],
        };
        let bytes = serialize(&m);
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(&bytes[8..10], &[0x03, 0x02]);
        assert_eq!(&bytes[10..12], &[1, 0]);
        assert_eq!(&bytes[12..], &[1, 2, 1, 0, 0, 0, 0xFF]);
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            load(b"SVMB\x01\x00"),
            Err(LoadError::TooShort { len: 6, needed: 12 })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = serialize(&BytecodeModule::single(vec![0xFF]));
        bytes[0] = b'X';
        assert!(matches!(load(&bytes), Err(LoadError::BadMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = serialize(&BytecodeModule::single(vec![0xFF]));
        bytes[4] = 9;
        assert!(matches!(
            load(&bytes),
            Err(LoadError::UnsupportedVersion {
                found: 9,
                expected: VERSION
            })
        ));
    }

    #[test]
    fn test_truncated_code() {
        let mut bytes = serialize(&BytecodeModule::single(assemble_ops(&[
            Op::PushInt(1),
            Op::Halt,
        ])));
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            load(&bytes),
            Err(LoadError::TruncatedFunction { index: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_function_header() {
        let mut bytes = serialize(&BytecodeModule::single(vec![]));
        bytes.truncate(HEADER_SIZE + 3);
        assert!(matches!(
            load(&bytes),
            Err(LoadError::TruncatedFunction {
                index: 0,
                needed: 6,
                available: 3
            })
        ));
    }

    #[test]
    fn test_invalid_entry() {
        let mut m = BytecodeModule::single(vec![0xFF]);
        m.entry = 1;
        assert!(matches!(
            load(&serialize(&m)),
            Err(LoadError::InvalidEntryPoint { entry: 1, count: 1 })
        ));

        m.entry = 0;
        m.functions.clear();
        assert!(matches!(
            load(&serialize(&m)),
            Err(LoadError::InvalidEntryPoint { entry: 0, count: 0 })
        ));
    }

    #[test]
    fn test_locals_below_arity() {
        let m = module(vec![FunctionInfo::new(0, 2, 1, vec![0xFF])]);
        assert!(matches!(
            load(&serialize(&m)),
            Err(LoadError::LocalsBelowArity {
                index: 0,
                arity: 2,
                locals: 1
            })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&BytecodeModule::single(vec![0xFF]));
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            load(&bytes),
            Err(LoadError::TrailingBytes { count: 2 })
        ));
    }

    #[test]
    fn test_disassemble() {
        let code = assemble_ops(&[Op::PushInt(3), Op::JmpIfZero(1), Op::Nop, Op::Halt]);
        let text = disassemble(&code);
        assert_eq!(
            text,
            "0000: push_int 3\n0009: jz +1 ; -> 000f\n000e: nop\n000f: halt\n"
        );
    }

    #[test]
    fn test_disassemble_bad_bytes() {
        let text = disassemble(&[0xEE, 0x01, 0x02]);
        assert!(text.starts_with("0000: .byte 0xee\n"));
        assert!(text.contains(".byte 0x01"));
    }
}
