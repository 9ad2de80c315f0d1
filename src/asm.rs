//! Two-pass assembler for the toy ISA.
//!
//! Line syntax:
//! ```text
//! label:
//! LOAD   REGd, [REGs]
//! STORE  REGs, [REGd]
//! FMUL   REGd, REGa, REGb
//! FADD   REGd, REGa, REGb
//! REDUCE REGd, REGa, REGb
//! INC    REGx
//! DEC    REGx
//! MOVI   REGx, IMM64        ; decimal or 0xHEX
//! JNZ    label              ; REG0 is the implicit counter
//! ```
//! Comments start with `;` or `#`; commas, brackets and whitespace all
//! separate tokens; mnemonics and register names are case-insensitive.

use crate::isa::{Instr, Program, NUM_REGS};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("line {line}: unknown mnemonic `{mnemonic}`")]
    UnknownMnemonic { line: usize, mnemonic: String },
    #[error("line {line}: expected `{expected}`")]
    Syntax { line: usize, expected: &'static str },
    #[error("line {line}: invalid register `{token}` (REG0..REG{})", NUM_REGS - 1)]
    BadRegister { line: usize, token: String },
    #[error("line {line}: invalid immediate `{token}`")]
    BadImmediate { line: usize, token: String },
    #[error("line {line}: empty label")]
    EmptyLabel { line: usize },
    #[error("line {line}: duplicate label `{label}`")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: jump to unknown label `{label}`")]
    UnknownLabel { line: usize, label: String },
    #[error("cannot read program: {0}")]
    Io(#[from] std::io::Error),
}

fn strip_comment(line: &str) -> &str {
    match line.find([';', '#']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_reg(token: &str, line: usize) -> Result<usize, Error> {
    let bad = || Error::BadRegister {
        line,
        token: token.to_string(),
    };
    if !token.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("REG")) {
        return Err(bad());
    }
    let idx: usize = token[3..].parse().map_err(|_| bad())?;
    if idx >= NUM_REGS {
        return Err(bad());
    }
    Ok(idx)
}

fn parse_imm(token: &str, line: usize) -> Result<u64, Error> {
    let bad = || Error::BadImmediate {
        line,
        token: token.to_string(),
    };
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| bad())
    } else {
        token.parse().map_err(|_| bad())
    }
}

/// Assemble program text into a [`Program`].
///
/// Pass 1 collects labels against instruction indices; pass 2 parses the
/// instructions; jump targets are checked at the end so a bad label is a
/// load-time error, never a runtime one.
pub fn assemble(src: &str) -> Result<Program, Error> {
    // (source line number, content) with comments and blanks removed
    let lines: Vec<(usize, &str)> = src
        .lines()
        .enumerate()
        .map(|(idx, raw)| (idx + 1, strip_comment(raw).trim()))
        .filter(|(_, content)| !content.is_empty())
        .collect();

    let mut program = Program::default();
    let mut body = Vec::new();
    let mut pc = 0;
    for &(line, content) in &lines {
        if let Some(label) = content.strip_suffix(':') {
            let label = label.trim();
            if label.is_empty() {
                return Err(Error::EmptyLabel { line });
            }
            if program.labels.contains_key(label) {
                return Err(Error::DuplicateLabel {
                    line,
                    label: label.to_string(),
                });
            }
            program.labels.insert(label.to_string(), pc);
        } else {
            body.push((line, content));
            pc += 1;
        }
    }

    for &(line, content) in &body {
        let tokens: Vec<&str> = content
            .split(|c: char| c == '[' || c == ']' || c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect();
        let Some(&mnemonic) = tokens.first() else {
            return Err(Error::Syntax {
                line,
                expected: "instruction",
            });
        };

        let instr = match mnemonic.to_ascii_uppercase().as_str() {
            "LOAD" => {
                let [rd, ra] = operands(&tokens, line, "LOAD Rd, [Rs]")?;
                Instr::load(parse_reg(rd, line)?, parse_reg(ra, line)?)
            }
            "STORE" => {
                let [ra, rd] = operands(&tokens, line, "STORE Rs, [Rd]")?;
                Instr::store(parse_reg(ra, line)?, parse_reg(rd, line)?)
            }
            "FMUL" => {
                let [rd, ra, rb] = operands(&tokens, line, "FMUL Rd, Ra, Rb")?;
                Instr::fmul(
                    parse_reg(rd, line)?,
                    parse_reg(ra, line)?,
                    parse_reg(rb, line)?,
                )
            }
            "FADD" => {
                let [rd, ra, rb] = operands(&tokens, line, "FADD Rd, Ra, Rb")?;
                Instr::fadd(
                    parse_reg(rd, line)?,
                    parse_reg(ra, line)?,
                    parse_reg(rb, line)?,
                )
            }
            "REDUCE" => {
                let [rd, ra, rb] = operands(&tokens, line, "REDUCE Rd, Ra, Rb")?;
                Instr::reduce(
                    parse_reg(rd, line)?,
                    parse_reg(ra, line)?,
                    parse_reg(rb, line)?,
                )
            }
            "INC" => {
                let [rd] = operands(&tokens, line, "INC Reg")?;
                Instr::inc(parse_reg(rd, line)?)
            }
            "DEC" => {
                let [rd] = operands(&tokens, line, "DEC Reg")?;
                Instr::dec(parse_reg(rd, line)?)
            }
            "MOVI" => {
                let [rd, imm] = operands(&tokens, line, "MOVI Reg, Imm")?;
                Instr::movi(parse_reg(rd, line)?, parse_imm(imm, line)?)
            }
            "JNZ" => {
                let [label] = operands(&tokens, line, "JNZ label")?;
                Instr::jnz(label.to_string())
            }
            _ => {
                return Err(Error::UnknownMnemonic {
                    line,
                    mnemonic: mnemonic.to_string(),
                })
            }
        };
        program.code.push(instr);
    }

    for (pc, instr) in program.code.iter().enumerate() {
        if let Some(label) = &instr.label {
            if program.resolve(label).is_none() {
                return Err(Error::UnknownLabel {
                    line: body[pc].0,
                    label: label.clone(),
                });
            }
        }
    }

    log::debug!(
        "assembled {} instructions, {} labels",
        program.code.len(),
        program.labels.len()
    );
    Ok(program)
}

/// Read and assemble a program file.
pub fn assemble_file(path: impl AsRef<Path>) -> Result<Program, Error> {
    let src = std::fs::read_to_string(path)?;
    assemble(&src)
}

fn operands<'t, const N: usize>(
    tokens: &[&'t str],
    line: usize,
    expected: &'static str,
) -> Result<[&'t str; N], Error> {
    let args: [&str; N] = tokens[1..]
        .try_into()
        .map_err(|_| Error::Syntax { line, expected })?;
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Opcode;

    #[test]
    fn assembles_dot_product_kernel() {
        let program = assemble(
            "; partial dot product\n\
             loop:\n\
             LOAD REG4, [REG1]\n\
             LOAD REG5, [REG2]\n\
             FMUL REG6, REG4, REG5\n\
             LOAD REG7, [REG3]\n\
             FADD REG7, REG7, REG6\n\
             STORE REG7, [REG3]\n\
             INC REG1\n\
             INC REG2\n\
             DEC REG0\n\
             JNZ loop\n",
        )
        .unwrap();
        assert_eq!(program.len(), 10);
        assert_eq!(program.resolve("loop"), Some(0));
        assert_eq!(program.code[0], Instr::load(4, 1));
        assert_eq!(program.code[5], Instr::store(7, 3));
        assert_eq!(program.code[9].op, Opcode::Jnz);
    }

    #[test]
    fn mnemonics_and_registers_are_case_insensitive() {
        let program = assemble("movi reg3, 0x200\nload Reg4, [reg3]").unwrap();
        assert_eq!(program.code[0], Instr::movi(3, 0x200));
        assert_eq!(program.code[1], Instr::load(4, 3));
    }

    #[test]
    fn immediates_decimal_and_hex() {
        let program = assemble("MOVI REG0, 42\nMOVI REG1, 0xFF").unwrap();
        assert_eq!(program.code[0].imm, 42);
        assert_eq!(program.code[1].imm, 0xff);
    }

    #[test]
    fn labels_do_not_consume_pc_slots() {
        let program = assemble("start:\nINC REG1\nmid:\nDEC REG0\nJNZ mid").unwrap();
        assert_eq!(program.resolve("start"), Some(0));
        assert_eq!(program.resolve("mid"), Some(1));
    }

    #[test]
    fn rejects_unknown_mnemonic() {
        assert!(matches!(
            assemble("FROB REG1"),
            Err(Error::UnknownMnemonic { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_register() {
        assert!(matches!(
            assemble("INC REG8"),
            Err(Error::BadRegister { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_label() {
        assert!(matches!(
            assemble("a:\nINC REG0\na:\nDEC REG0"),
            Err(Error::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn rejects_unknown_jump_target() {
        assert!(matches!(
            assemble("JNZ nowhere"),
            Err(Error::UnknownLabel { .. })
        ));
    }

    #[test]
    fn rejects_bad_immediate() {
        assert!(matches!(
            assemble("MOVI REG1, banana"),
            Err(Error::BadImmediate { .. })
        ));
    }

    #[test]
    fn rejects_wrong_operand_count() {
        assert!(matches!(
            assemble("LOAD REG1"),
            Err(Error::Syntax { line: 1, .. })
        ));
    }
}
