use crate::cache::Cache;
use crate::config::WORD_BYTES;
use crate::isa::{Opcode, Program, NUM_REGS};
use crate::{address, pe_id, word};
use std::sync::{Arc, Mutex};

/// A processing element: eight 64-bit registers, a program counter and a
/// handle to its private cache.
///
/// One `step` executes at most one instruction; once the program is
/// consumed, `step` is a no-op and `is_done` reports true. The only
/// observable effect on the memory subsystem is the `load`/`store` calls
/// issued to the cache.
#[derive(Debug)]
pub struct Core {
    id: pe_id,
    cache: Arc<Mutex<Cache>>,
    program: Program,
    pc: usize,
    regs: [word; NUM_REGS],
}

impl Core {
    #[must_use]
    pub fn new(id: pe_id, cache: Arc<Mutex<Cache>>) -> Self {
        Self {
            id,
            cache,
            program: Program::default(),
            pc: 0,
            regs: [0; NUM_REGS],
        }
    }

    #[must_use]
    pub fn id(&self) -> pe_id {
        self.id
    }

    pub fn load_program(&mut self, program: Program) {
        self.program = program;
        self.pc = 0;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pc >= self.program.len()
    }

    #[must_use]
    pub fn reg(&self, idx: usize) -> word {
        assert!(idx < NUM_REGS, "register index {idx} out of range");
        self.regs[idx]
    }

    pub fn set_reg(&mut self, idx: usize, value: word) {
        assert!(idx < NUM_REGS, "register index {idx} out of range");
        self.regs[idx] = value;
    }

    /// Execute at most one instruction.
    pub fn step(&mut self) {
        if self.is_done() {
            return;
        }
        self.exec_one();
    }

    fn mem_load(&self, addr: address) -> word {
        self.cache.lock().unwrap().load(addr, WORD_BYTES).1
    }

    fn mem_store(&self, addr: address, value: word) {
        self.cache.lock().unwrap().store(addr, WORD_BYTES, value);
    }

    fn exec_one(&mut self) {
        let instr = self.program.code[self.pc].clone();
        match instr.op {
            Opcode::Load => {
                let addr = self.regs[instr.ra];
                let value = self.mem_load(addr);
                self.regs[instr.rd] = value;
                log::trace!("[pe {}] LOAD R{} <- [{addr:#x}]", self.id, instr.rd);
                self.pc += 1;
            }
            Opcode::Store => {
                let addr = self.regs[instr.rd];
                self.mem_store(addr, self.regs[instr.ra]);
                log::trace!("[pe {}] STORE R{} -> [{addr:#x}]", self.id, instr.ra);
                self.pc += 1;
            }
            Opcode::Fmul => {
                let a = f64::from_bits(self.regs[instr.ra]);
                let b = f64::from_bits(self.regs[instr.rb]);
                self.regs[instr.rd] = (a * b).to_bits();
                self.pc += 1;
            }
            Opcode::Fadd => {
                let a = f64::from_bits(self.regs[instr.ra]);
                let b = f64::from_bits(self.regs[instr.rb]);
                self.regs[instr.rd] = (a + b).to_bits();
                self.pc += 1;
            }
            Opcode::Reduce => {
                let base = self.regs[instr.ra];
                let count = self.regs[instr.rb];
                let mut sum = 0.0;
                for i in 0..count {
                    let v = self.mem_load(base + i * WORD_BYTES as address);
                    sum += f64::from_bits(v);
                }
                self.regs[instr.rd] = sum.to_bits();
                log::trace!(
                    "[pe {}] REDUCE base={base:#x} count={count} -> {sum}",
                    self.id
                );
                self.pc += 1;
            }
            Opcode::Inc => {
                self.regs[instr.rd] = self.regs[instr.rd].wrapping_add(WORD_BYTES as word);
                self.pc += 1;
            }
            Opcode::Dec => {
                self.regs[instr.rd] = self.regs[instr.rd].wrapping_sub(1);
                self.pc += 1;
            }
            Opcode::Movi => {
                self.regs[instr.rd] = instr.imm;
                self.pc += 1;
            }
            Opcode::Jnz => {
                let label = instr
                    .label
                    .as_deref()
                    .expect("JNZ carries a label by construction");
                let target = match self.program.resolve(label) {
                    Some(target) => target,
                    // unreachable for assembled programs; hand-built ones
                    // are a programming error and abort the run
                    None => panic!("jump to unknown label `{label}`"),
                };
                if self.regs[0] != 0 {
                    self.pc = target;
                } else {
                    self.pc += 1;
                }
            }
        }
    }
}
