//! Text assembler for stackvm bytecode.
//!
//! # Syntax
//!
//! ```text
//! .globals 1              # number of global slots
//! .entry main             # entry function (name or index, default: first)
//!
//! .func main arity=0 locals=1
//!     push_int 10
//!     store_local 0
//! loop:
//!     load_local 0
//!     jz done
//!     load_local 0
//!     call dec
//!     store_local 0
//!     jmp loop
//! done:
//!     halt
//! .end
//!
//! .func dec arity=1 locals=1
//!     load_local 0
//!     push_int 1
//!     sub
//!     ret
//! .end
//! ```
//!
//! - Mnemonics are the lowercase instruction names (`push_int`, `dadd`, ...)
//! - Jump operands are labels local to the function, or relative byte offsets
//! - Call operands are function names or indices
//! - Comments start with `#`; commas between operands are ignored
//!
//! Functions are numbered in declaration order.

use std::collections::HashMap;

use thiserror::Error;

use crate::vm::{bytecode, BytecodeModule, FunctionInfo, Op};

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AsmError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown instruction `{mnemonic}`")]
    UnknownInstruction { line: usize, mnemonic: String },

    #[error("line {line}: undefined label `{label}`")]
    UndefinedLabel { line: usize, label: String },

    #[error("line {line}: duplicate label `{label}`")]
    DuplicateLabel { line: usize, label: String },

    #[error("line {line}: undefined function `{name}`")]
    UndefinedFunction { line: usize, name: String },

    #[error("duplicate function `{0}`")]
    DuplicateFunction(String),

    #[error("unterminated function `{0}` (missing .end)")]
    UnterminatedFunction(String),

    #[error("no functions defined")]
    Empty,
}

fn syntax(line: usize, message: impl Into<String>) -> AsmError {
    AsmError::Syntax {
        line,
        message: message.into(),
    }
}

/// One instruction line awaiting operand resolution.
#[derive(Debug)]
struct PendingInst {
    line: usize,
    mnemonic: String,
    operand: Option<String>,
}

#[derive(Debug)]
enum Item {
    Label(String, usize),
    Inst(PendingInst),
}

#[derive(Debug)]
struct FuncSource {
    name: String,
    arity: u8,
    locals: u8,
    items: Vec<Item>,
}

/// Assemble source text into a module.
pub fn assemble(source: &str) -> Result<BytecodeModule, AsmError> {
    let (global_count, entry, funcs) = parse(source)?;
    if funcs.is_empty() {
        return Err(AsmError::Empty);
    }

    let mut names: HashMap<&str, u16> = HashMap::new();
    for (index, func) in funcs.iter().enumerate() {
        if names.insert(func.name.as_str(), index as u16).is_some() {
            return Err(AsmError::DuplicateFunction(func.name.clone()));
        }
    }

    let entry = match entry {
        None => 0,
        Some((line, name)) => resolve_function(&names, &name, line)?,
    };

    let functions = funcs
        .iter()
        .enumerate()
        .map(|(index, func)| {
            let code = assemble_function(func, &names)?;
            Ok(FunctionInfo::new(index as u16, func.arity, func.locals, code))
        })
        .collect::<Result<Vec<_>, AsmError>>()?;

    Ok(BytecodeModule {
        version: bytecode::VERSION,
        global_count,
        entry,
        functions,
    })
}

/// Assemble source text straight to the binary module format.
pub fn assemble_to_bytes(source: &str) -> Result<Vec<u8>, AsmError> {
    assemble(source).map(|module| bytecode::serialize(&module))
}

type Parsed = (u16, Option<(usize, String)>, Vec<FuncSource>);

fn parse(source: &str) -> Result<Parsed, AsmError> {
    let mut global_count = 0u16;
    let mut entry = None;
    let mut funcs = Vec::new();
    let mut current: Option<FuncSource> = None;

    for (i, raw) in source.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.split(COMMENT_CHAR).next().unwrap_or("").trim();
        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        // Blank, comment-only and separator-only lines.
        let Some(&first) = tokens.first() else {
            continue;
        };

        match first {
            ".globals" => {
                let n = tokens.get(1).ok_or_else(|| syntax(line_no, ".globals needs a count"))?;
                global_count = parse_number(n, line_no)?;
            }
            ".entry" => {
                let name = tokens.get(1).ok_or_else(|| syntax(line_no, ".entry needs a function"))?;
                entry = Some((line_no, name.to_string()));
            }
            ".func" => {
                if let Some(open) = &current {
                    return Err(AsmError::UnterminatedFunction(open.name.clone()));
                }
                current = Some(parse_func_header(&tokens, line_no)?);
            }
            ".end" => {
                let func = current
                    .take()
                    .ok_or_else(|| syntax(line_no, ".end outside of a function"))?;
                funcs.push(func);
            }
            directive if directive.starts_with('.') => {
                return Err(syntax(line_no, format!("unknown directive `{}`", directive)));
            }
            label if label.ends_with(LABEL_SUFFIX) && tokens.len() == 1 => {
                let func = current
                    .as_mut()
                    .ok_or_else(|| syntax(line_no, "label outside of a function"))?;
                let name = label.trim_end_matches(LABEL_SUFFIX);
                if name.is_empty() {
                    return Err(syntax(line_no, "empty label"));
                }
                func.items.push(Item::Label(name.to_string(), line_no));
            }
            mnemonic => {
                let func = current
                    .as_mut()
                    .ok_or_else(|| syntax(line_no, "instruction outside of a function"))?;
                if tokens.len() > 2 {
                    return Err(syntax(line_no, "too many operands"));
                }
                func.items.push(Item::Inst(PendingInst {
                    line: line_no,
                    mnemonic: mnemonic.to_string(),
                    operand: tokens.get(1).map(|s| s.to_string()),
                }));
            }
        }
    }

    if let Some(open) = current {
        return Err(AsmError::UnterminatedFunction(open.name));
    }
    Ok((global_count, entry, funcs))
}

fn parse_func_header(tokens: &[&str], line: usize) -> Result<FuncSource, AsmError> {
    let name = tokens
        .get(1)
        .ok_or_else(|| syntax(line, ".func needs a name"))?
        .to_string();
    let mut arity = 0u8;
    let mut locals = None;
    for attr in &tokens[2..] {
        let (key, value) = attr
            .split_once('=')
            .ok_or_else(|| syntax(line, format!("expected key=value, got `{}`", attr)))?;
        match key {
            "arity" => arity = parse_number(value, line)?,
            "locals" => locals = Some(parse_number(value, line)?),
            _ => return Err(syntax(line, format!("unknown attribute `{}`", key))),
        }
    }
    // Locals default to the parameters alone.
    let locals = locals.unwrap_or(arity);
    if locals < arity {
        return Err(syntax(line, "locals must be at least arity"));
    }
    Ok(FuncSource {
        name,
        arity,
        locals,
        items: Vec::new(),
    })
}

fn parse_number<T: std::str::FromStr>(text: &str, line: usize) -> Result<T, AsmError> {
    text.parse()
        .map_err(|_| syntax(line, format!("invalid number `{}`", text)))
}

fn resolve_function(names: &HashMap<&str, u16>, name: &str, line: usize) -> Result<u16, AsmError> {
    if let Some(&index) = names.get(name) {
        return Ok(index);
    }
    match name.parse::<u16>() {
        Ok(index) if (index as usize) < names.len() => Ok(index),
        _ => Err(AsmError::UndefinedFunction {
            line,
            name: name.to_string(),
        }),
    }
}

/// Operand kinds, used to size instructions before labels are known.
fn placeholder(mnemonic: &str) -> Option<Op> {
    if let Some(op) = Op::from_simple_name(mnemonic) {
        return Some(op);
    }
    let op = match mnemonic {
        "push_int" => Op::PushInt(0),
        "push_double" => Op::PushDouble(0.0),
        "jmp" => Op::Jmp(0),
        "jz" => Op::JmpIfZero(0),
        "jnz" => Op::JmpIfNotZero(0),
        "call" => Op::Call(0),
        "load_local" => Op::LoadLocal(0),
        "store_local" => Op::StoreLocal(0),
        "load_global" => Op::LoadGlobal(0),
        "store_global" => Op::StoreGlobal(0),
        _ => return None,
    };
    Some(op)
}

fn assemble_function(func: &FuncSource, names: &HashMap<&str, u16>) -> Result<Vec<u8>, AsmError> {
    // Pass 1: byte offset of every instruction and label.
    let mut labels: HashMap<&str, usize> = HashMap::new();
    let mut offsets = Vec::new();
    let mut pc = 0;
    for item in &func.items {
        match item {
            Item::Label(name, line) => {
                if labels.insert(name.as_str(), pc).is_some() {
                    return Err(AsmError::DuplicateLabel {
                        line: *line,
                        label: name.clone(),
                    });
                }
            }
            Item::Inst(inst) => {
                let op = placeholder(&inst.mnemonic).ok_or_else(|| AsmError::UnknownInstruction {
                    line: inst.line,
                    mnemonic: inst.mnemonic.clone(),
                })?;
                offsets.push(pc);
                pc += op.size();
            }
        }
    }

    // Pass 2: encode with resolved operands.
    let mut code = Vec::with_capacity(pc);
    let insts = func.items.iter().filter_map(|item| match item {
        Item::Inst(inst) => Some(inst),
        Item::Label(..) => None,
    });
    for (inst, &at) in insts.zip(&offsets) {
        let op = resolve(inst, at, &labels, names)?;
        op.encode(&mut code);
    }
    Ok(code)
}

fn resolve(
    inst: &PendingInst,
    at: usize,
    labels: &HashMap<&str, usize>,
    names: &HashMap<&str, u16>,
) -> Result<Op, AsmError> {
    let line = inst.line;
    if let Some(op) = Op::from_simple_name(&inst.mnemonic) {
        if inst.operand.is_some() {
            return Err(syntax(line, format!("`{}` takes no operand", inst.mnemonic)));
        }
        return Ok(op);
    }
    let operand = inst
        .operand
        .as_deref()
        .ok_or_else(|| syntax(line, format!("`{}` needs an operand", inst.mnemonic)))?;

    let jump = |make: fn(i32) -> Op| -> Result<Op, AsmError> {
        let offset = match labels.get(operand) {
            Some(&target) => {
                let next = at + make(0).size();
                target as i64 - next as i64
            }
            None => operand.parse::<i64>().map_err(|_| AsmError::UndefinedLabel {
                line,
                label: operand.to_string(),
            })?,
        };
        let offset = i32::try_from(offset).map_err(|_| syntax(line, "jump offset out of range"))?;
        Ok(make(offset))
    };

    let op = match inst.mnemonic.as_str() {
        "push_int" => Op::PushInt(parse_number(operand, line)?),
        "push_double" => Op::PushDouble(parse_number(operand, line)?),
        "jmp" => jump(Op::Jmp)?,
        "jz" => jump(Op::JmpIfZero)?,
        "jnz" => jump(Op::JmpIfNotZero)?,
        "call" => Op::Call(resolve_function(names, operand, line)?),
        "load_local" => Op::LoadLocal(parse_number(operand, line)?),
        "store_local" => Op::StoreLocal(parse_number(operand, line)?),
        "load_global" => Op::LoadGlobal(parse_number(operand, line)?),
        "store_global" => Op::StoreGlobal(parse_number(operand, line)?),
        _ => {
            return Err(AsmError::UnknownInstruction {
                line,
                mnemonic: inst.mnemonic.clone(),
            });
        }
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::assemble_ops;

    #[test]
    fn test_single_function() {
        let module = assemble(
            r#"
            .func main arity=0 locals=0
                push_int 2
                push_int 3   # comment
                add
                halt
            .end
            "#,
        )
        .unwrap();
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.entry, 0);
        assert_eq!(
            module.functions[0].code,
            assemble_ops(&[Op::PushInt(2), Op::PushInt(3), Op::Add, Op::Halt])
        );
    }

    #[test]
    fn test_labels_resolve_both_directions() {
        let module = assemble(
            r#"
            .func main locals=1
            top:
                load_local 0
                jz out
                jmp top
            out:
                halt
            .end
            "#,
        )
        .unwrap();
        assert_eq!(
            module.functions[0].code,
            assemble_ops(&[
                Op::LoadLocal(0),
                Op::JmpIfZero(5),
                Op::Jmp(-12),
                Op::Halt
            ])
        );
    }

    #[test]
    fn test_calls_by_name_and_entry() {
        let module = assemble(
            r#"
            .globals 2
            .entry main
            .func helper arity=1 locals=1
                load_local 0
                ret
            .end
            .func main
                push_int 4
                call helper
                call 0
                halt
            .end
            "#,
        )
        .unwrap();
        assert_eq!(module.global_count, 2);
        assert_eq!(module.entry, 1);
        assert_eq!(module.functions[0].arity, 1);
        assert_eq!(
            module.functions[1].code,
            assemble_ops(&[Op::PushInt(4), Op::Call(0), Op::Call(0), Op::Halt])
        );
    }

    #[test]
    fn test_numeric_jump_offset() {
        let module = assemble(".func f\njmp -5\n.end").unwrap();
        assert_eq!(module.functions[0].code, assemble_ops(&[Op::Jmp(-5)]));
    }

    #[test]
    fn test_separator_only_lines_skipped() {
        let module = assemble(".func main\n ,\n , ,  # nothing\n halt\n.end").unwrap();
        assert_eq!(module.functions[0].code, assemble_ops(&[Op::Halt]));
    }

    #[test]
    fn test_errors() {
        assert_eq!(assemble(""), Err(AsmError::Empty));
        assert!(matches!(
            assemble(".func f\n frobnicate\n.end"),
            Err(AsmError::UnknownInstruction { line: 2, .. })
        ));
        assert!(matches!(
            assemble(".func f\n jmp nowhere\n.end"),
            Err(AsmError::UndefinedLabel { line: 2, .. })
        ));
        assert!(matches!(
            assemble(".func f\n call g\n.end"),
            Err(AsmError::UndefinedFunction { line: 2, .. })
        ));
        assert!(matches!(
            assemble(".func f\na:\na:\n.end"),
            Err(AsmError::DuplicateLabel { line: 3, .. })
        ));
        assert_eq!(
            assemble(".func f\n.end\n.func f\n.end"),
            Err(AsmError::DuplicateFunction("f".to_string()))
        );
        assert_eq!(
            assemble(".func f\n halt"),
            Err(AsmError::UnterminatedFunction("f".to_string()))
        );
        assert!(matches!(
            assemble(".func f arity=2 locals=1\n.end"),
            Err(AsmError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            assemble(".func f\n add 1\n.end"),
            Err(AsmError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            assemble(".func f\n push_int\n.end"),
            Err(AsmError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_bytes_load_back() {
        let bytes = assemble_to_bytes(".func main\n push_int 7\n halt\n.end").unwrap();
        let module = bytecode::load(&bytes).unwrap();
        assert_eq!(module.functions[0].code, assemble_ops(&[Op::PushInt(7), Op::Halt]));
    }
}
