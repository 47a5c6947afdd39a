//! The basic-block interpreter loop.
//!
//! A decoded block executes one instruction at a time. Non-branch
//! instructions never touch EIP; it still names the block start until a
//! branch instruction writes it. When an instruction faults, EIP must be
//! re-pointed at an architecturally meaningful boundary before delivery:
//! the faulting instruction itself for faults, the next instruction for
//! traps — and a faulting branch has usually *already* written EIP, which
//! must be undone first. That unwind rule lives in
//! [`BasicBlock::execute`] and is the reason this loop exists at all.

use crate::exceptions::{CpuExit, ExecEvent, ModeSwitch};
use crate::mem::MemoryBus;
use crate::processor::Processor;

/// Outcome of a single instruction or of a whole block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Fall through to the next instruction.
    None,
    /// A branch was taken; EIP has been updated.
    Taken,
    /// An architectural fault was delivered; EIP names the handler.
    Exception,
    /// Execution must resume in another mode; `x86_count` instructions of
    /// this block ran before the switch.
    ModeSwitch { to: ModeSwitch, x86_count: u32 },
}

/// One decoded instruction, produced by the external decoder.
pub trait Instruction {
    /// Apply this instruction to the processor. Non-branch instructions
    /// leave EIP alone.
    fn execute(&self, cpu: &mut Processor, bus: &mut MemoryBus) -> Result<Branch, ExecEvent>;

    /// Whether this instruction updates EIP itself when it executes.
    fn is_branch(&self) -> bool {
        false
    }

    /// Byte offset of this instruction from the start of the block.
    fn delta(&self) -> u32;
}

/// Per-block observation hooks (profiling, tracing, block caching).
pub trait BlockHooks {
    fn pre_block(&mut self, _cpu: &Processor) {}
    fn post_instruction(&mut self, _cpu: &Processor, _index: usize) {}
    fn post_block(&mut self, _cpu: &Processor) {}
}

/// A contiguous run of decoded instructions ending in a branch (or an
/// EIP-advancing terminator the decoder appends).
pub struct BasicBlock {
    ops: Vec<Box<dyn Instruction>>,
    x86_length: u32,
    hooks: Option<Box<dyn BlockHooks>>,
}

impl BasicBlock {
    pub fn new(ops: Vec<Box<dyn Instruction>>, x86_length: u32) -> Self {
        Self {
            ops,
            x86_length,
            hooks: None,
        }
    }

    pub fn with_hooks(
        ops: Vec<Box<dyn Instruction>>,
        x86_length: u32,
        hooks: Box<dyn BlockHooks>,
    ) -> Self {
        Self {
            ops,
            x86_length,
            hooks: Some(hooks),
        }
    }

    pub fn x86_length(&self) -> u32 {
        self.x86_length
    }

    pub fn x86_count(&self) -> u32 {
        self.ops.len() as u32
    }

    fn pre_block(&mut self, cpu: &Processor) {
        if let Some(hooks) = &mut self.hooks {
            hooks.pre_block(cpu);
        }
    }

    fn post_instruction(&mut self, cpu: &Processor, index: usize) {
        if let Some(hooks) = &mut self.hooks {
            hooks.post_instruction(cpu, index);
        }
    }

    fn post_block(&mut self, cpu: &Processor) {
        if let Some(hooks) = &mut self.hooks {
            hooks.post_block(cpu);
        }
    }

    /// Run the block to its branch, delivering any architectural fault on
    /// the way out. Only a triple fault escapes as an error.
    pub fn execute(&mut self, cpu: &mut Processor, bus: &mut MemoryBus) -> Result<Branch, CpuExit> {
        self.pre_block(cpu);
        let result = self.run(cpu, bus);
        self.post_block(cpu);
        result
    }

    fn run(&mut self, cpu: &mut Processor, bus: &mut MemoryBus) -> Result<Branch, CpuExit> {
        let mut index = 0;
        loop {
            match self.ops[index].execute(cpu, bus) {
                Ok(Branch::None) => {
                    self.post_instruction(cpu, index);
                    index += 1;
                    if index == self.ops.len() {
                        // The decoder terminates every block with an
                        // EIP-updating instruction.
                        panic!("basic block fell off its end without a branch");
                    }
                }
                Ok(branch) => {
                    self.post_instruction(cpu, index);
                    return Ok(branch);
                }
                Err(ExecEvent::Switch(to)) => {
                    return Ok(Branch::ModeSwitch {
                        to,
                        x86_count: index as u32 + 1,
                    });
                }
                Err(ExecEvent::Fault(e)) => {
                    let current = &self.ops[index];
                    // Point EIP at the faulting instruction. A branch has
                    // already written EIP, so first undo its update.
                    cpu.eip = cpu.eip.wrapping_add(current.delta());
                    if current.is_branch() {
                        cpu.eip = cpu.eip.wrapping_sub(self.x86_length);
                    }
                    if !e.points_to_self() {
                        // Traps resume after the trapping instruction.
                        let advance = if current.is_branch() {
                            self.x86_length - current.delta()
                        } else {
                            self.ops[index + 1].delta() - current.delta()
                        };
                        cpu.eip = cpu.eip.wrapping_add(advance);
                    }

                    let delivered = if !cpu.is_protected_mode() {
                        cpu.handle_real_mode_exception(bus, e).map(|()| None)
                    } else if cpu.is_virtual8086_mode() {
                        cpu.handle_virtual8086_mode_exception(bus, e)
                    } else {
                        cpu.handle_protected_mode_exception(bus, e).map(|()| None)
                    };
                    return match delivered? {
                        Some(to) => Ok(Branch::ModeSwitch {
                            to,
                            x86_count: index as u32 + 1,
                        }),
                        None => Ok(Branch::Exception),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::ProcessorException;
    use crate::mem::flat_bus;
    use crate::processor::CpuConfig;
    use crate::regs::Gpr;

    struct AddToEax(u32, u32);

    impl Instruction for AddToEax {
        fn execute(&self, cpu: &mut Processor, _bus: &mut MemoryBus) -> Result<Branch, ExecEvent> {
            let v = cpu.regs.get32(Gpr::Eax).wrapping_add(self.0);
            cpu.regs.set32(Gpr::Eax, v);
            Ok(Branch::None)
        }

        fn delta(&self) -> u32 {
            self.1
        }
    }

    struct JumpTo(u32, u32);

    impl Instruction for JumpTo {
        fn execute(&self, cpu: &mut Processor, _bus: &mut MemoryBus) -> Result<Branch, ExecEvent> {
            cpu.eip = self.0;
            Ok(Branch::Taken)
        }

        fn is_branch(&self) -> bool {
            true
        }

        fn delta(&self) -> u32 {
            self.1
        }
    }

    struct FaultAt(ProcessorException, u32);

    impl Instruction for FaultAt {
        fn execute(&self, _cpu: &mut Processor, _bus: &mut MemoryBus) -> Result<Branch, ExecEvent> {
            Err(self.0.into())
        }

        fn delta(&self) -> u32 {
            self.1
        }
    }

    fn machine() -> (Processor, MemoryBus, crate::mem::FlatRam) {
        let (mut bus, ram) = flat_bus(0x1_0000);
        let mut cpu = Processor::new(CpuConfig::default());
        cpu.reset(&mut bus);
        // IVT entry for #GP (vector 13) so real-mode delivery lands
        // somewhere recognizable.
        ram.load(13 * 4, &0x2000u16.to_le_bytes());
        ram.load(13 * 4 + 2, &0x0100u16.to_le_bytes());
        cpu.regs.set32(Gpr::Esp, 0x8000);
        cpu.ss.set_selector(0);
        cpu.cs.set_selector(0);
        cpu.eip = 0x1000;
        (cpu, bus, ram)
    }

    #[test]
    fn straight_line_block_runs_to_its_branch() {
        let (mut cpu, mut bus, _ram) = machine();
        let mut block = BasicBlock::new(
            vec![
                Box::new(AddToEax(1, 0)),
                Box::new(AddToEax(2, 2)),
                Box::new(JumpTo(0x4000, 4)),
            ],
            7,
        );
        let branch = block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(branch, Branch::Taken);
        assert_eq!(cpu.regs.get32(Gpr::Eax), 3);
        assert_eq!(cpu.eip, 0x4000);
        assert_eq!(block.x86_count(), 3);
        assert_eq!(block.x86_length(), 7);
    }

    #[test]
    fn fault_repoints_eip_at_faulting_instruction() {
        let (mut cpu, mut bus, _ram) = machine();
        // Op layout: [0..2) add, [2..5) faulting op, [5..7) jump.
        let mut block = BasicBlock::new(
            vec![
                Box::new(AddToEax(1, 0)),
                Box::new(FaultAt(ProcessorException::GENERAL_PROTECTION_0, 2)),
                Box::new(JumpTo(0, 5)),
            ],
            7,
        );
        let branch = block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(branch, Branch::Exception);
        // The frame the real-mode handler pushed holds the faulting
        // instruction's address: block start 0x1000 + delta 2.
        let sp = cpu.regs.get16(Gpr::Esp);
        let pushed_ip = cpu.ss.get_word(&mut bus, u32::from(sp)).unwrap();
        assert_eq!(pushed_ip, 0x1002);
        // And execution resumes at the IVT-provided handler.
        assert_eq!(cpu.eip, 0x2000);
        assert_eq!(cpu.cs.get_selector(), 0x0100);
    }

    #[test]
    fn trap_repoints_eip_after_trapping_instruction() {
        let (mut cpu, mut bus, ram) = machine();
        // Breakpoint (#BP) is a trap: saved EIP names the next op.
        ram.load(3 * 4, &0x3000u16.to_le_bytes());
        ram.load(3 * 4 + 2, &0x0200u16.to_le_bytes());

        let trap = ProcessorException::plain(crate::exceptions::Vector::Breakpoint);
        let mut block = BasicBlock::new(
            vec![Box::new(FaultAt(trap, 0)), Box::new(JumpTo(0, 1))],
            3,
        );
        let branch = block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(branch, Branch::Exception);
        let sp = cpu.regs.get16(Gpr::Esp);
        let pushed_ip = cpu.ss.get_word(&mut bus, u32::from(sp)).unwrap();
        // Saved EIP is the *next* instruction: 0x1000 + next.delta.
        assert_eq!(pushed_ip, 0x1001);
        assert_eq!(cpu.eip, 0x3000);
        assert_eq!(cpu.cs.get_selector(), 0x0200);
    }

    #[test]
    fn faulting_branch_backs_out_its_eip_update() {
        let (mut cpu, mut bus, _ram) = machine();

        struct BranchThenFault {
            delta: u32,
            block_len: u32,
        }
        impl Instruction for BranchThenFault {
            fn execute(
                &self,
                cpu: &mut Processor,
                _bus: &mut MemoryBus,
            ) -> Result<Branch, ExecEvent> {
                // Model a branch that updated EIP before faulting.
                cpu.eip = cpu.eip.wrapping_add(self.block_len);
                Err(ProcessorException::GENERAL_PROTECTION_0.into())
            }
            fn is_branch(&self) -> bool {
                true
            }
            fn delta(&self) -> u32 {
                self.delta
            }
        }

        let mut block = BasicBlock::new(
            vec![
                Box::new(AddToEax(1, 0)),
                Box::new(BranchThenFault {
                    delta: 2,
                    block_len: 7,
                }),
            ],
            7,
        );
        let branch = block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(branch, Branch::Exception);
        let sp = cpu.regs.get16(Gpr::Esp);
        let pushed_ip = cpu.ss.get_word(&mut bus, u32::from(sp)).unwrap();
        // (0x1000 + 7) + 2 - 7 = 0x1002: the branch instruction itself.
        assert_eq!(pushed_ip, 0x1002);
    }

    #[test]
    fn mode_switch_reports_instruction_count() {
        let (mut cpu, mut bus, _ram) = machine();

        struct SwitchMode;
        impl Instruction for SwitchMode {
            fn execute(
                &self,
                _cpu: &mut Processor,
                _bus: &mut MemoryBus,
            ) -> Result<Branch, ExecEvent> {
                Err(ModeSwitch::Protected.into())
            }
            fn delta(&self) -> u32 {
                2
            }
        }

        let mut block = BasicBlock::new(
            vec![
                Box::new(AddToEax(1, 0)),
                Box::new(SwitchMode),
                Box::new(JumpTo(0, 4)),
            ],
            6,
        );
        let branch = block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(
            branch,
            Branch::ModeSwitch {
                to: ModeSwitch::Protected,
                x86_count: 2
            }
        );
    }

    #[test]
    fn hooks_fire_on_every_path() {
        use std::cell::Cell;
        use std::rc::Rc;

        #[derive(Default)]
        struct Counts {
            pre: Cell<u32>,
            post_insn: Cell<u32>,
            post_block: Cell<u32>,
        }
        struct Counting(Rc<Counts>);
        impl BlockHooks for Counting {
            fn pre_block(&mut self, _cpu: &Processor) {
                self.0.pre.set(self.0.pre.get() + 1);
            }
            fn post_instruction(&mut self, _cpu: &Processor, _index: usize) {
                self.0.post_insn.set(self.0.post_insn.get() + 1);
            }
            fn post_block(&mut self, _cpu: &Processor) {
                self.0.post_block.set(self.0.post_block.get() + 1);
            }
        }

        let (mut cpu, mut bus, _ram) = machine();
        let counts = Rc::new(Counts::default());
        let mut block = BasicBlock::with_hooks(
            vec![Box::new(AddToEax(1, 0)), Box::new(JumpTo(0, 2))],
            4,
            Box::new(Counting(Rc::clone(&counts))),
        );
        block.execute(&mut cpu, &mut bus).unwrap();
        assert_eq!(counts.pre.get(), 1);
        assert_eq!(counts.post_insn.get(), 2);
        assert_eq!(counts.post_block.get(), 1);
    }
}
