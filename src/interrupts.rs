//! Interrupt and exception delivery for the three execution modes, with
//! the rollback / double-fault / triple-fault escalation ladder.
//!
//! Each mode has three entry points (architectural fault, software INT,
//! hardware IRQ). Delivery first snapshots (ESP, EIP, CS, SS); a fault
//! raised while building the handler frame restores the snapshot and is
//! either folded into #DF(0) by the classic combination table or delivered
//! in its own right. A failure while delivering #DF is a triple fault and
//! terminates the machine.
//!
//! Virtual-8086 delivery lands in a protected-mode handler, so its entry
//! points hand back the [`ModeSwitch`] the execution driver must obey.

use tracing::{error, info, warn};

use crate::exceptions::{CpuExit, ModeSwitch, ProcessorException, Vector};
use crate::mem::{MemoryBus, SpaceKind};
use crate::processor::{
    Processor, CR4_VIRTUAL8086_MODE_EXTENSIONS, IFLAGS_HARDWARE_INTERRUPT, IFLAGS_RESET_REQUEST,
};
use crate::regs::Gpr;
use crate::segments::{seg_type, Segment};
use crate::system::{Clock, InterruptController};
use crate::xfer::GateWidth;

/// Saved user-visible state for delivery rollback.
struct DeliverySnapshot {
    esp: u32,
    eip: u32,
    cs: Segment,
    ss: Segment,
}

impl Processor {
    fn snapshot_for_delivery(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            esp: self.regs.get32(Gpr::Esp),
            eip: self.eip,
            cs: self.cs.clone(),
            ss: self.ss.clone(),
        }
    }

    fn roll_back_delivery(&mut self, snapshot: DeliverySnapshot) {
        self.regs.set32(Gpr::Esp, snapshot.esp);
        self.eip = snapshot.eip;
        // The saved segments were live, so reinstalling cannot fault.
        let _ = self.set_cs(snapshot.cs);
        let _ = self.set_ss(snapshot.ss);
    }

    // ------------------------------------------------------------------
    // Interrupt-check points (after each block).
    // ------------------------------------------------------------------

    pub fn process_real_mode_interrupts(
        &mut self,
        bus: &mut MemoryBus,
        clock: &mut dyn Clock,
        pic: &mut dyn InterruptController,
        instructions: u32,
    ) -> Result<(), CpuExit> {
        clock.update_and_process(instructions);
        if self.interrupts_inhibited() {
            self.retire_instruction();
            return Ok(());
        }
        if !self.interrupt_enable {
            return Ok(());
        }
        let flags = self.interrupt_flags_value();
        if flags & IFLAGS_RESET_REQUEST != 0 {
            self.reset(bus);
            return Ok(());
        }
        if flags & IFLAGS_HARDWARE_INTERRUPT != 0 {
            self.consume_interrupt_flag(IFLAGS_HARDWARE_INTERRUPT);
            let vector = pic.cpu_get_interrupt();
            return self.handle_hard_real_mode_interrupt(bus, vector);
        }
        Ok(())
    }

    pub fn process_protected_mode_interrupts(
        &mut self,
        bus: &mut MemoryBus,
        clock: &mut dyn Clock,
        pic: &mut dyn InterruptController,
        instructions: u32,
    ) -> Result<(), CpuExit> {
        clock.update_and_process(instructions);
        if self.interrupts_inhibited() {
            self.retire_instruction();
            return Ok(());
        }
        if !self.interrupt_enable {
            return Ok(());
        }
        let flags = self.interrupt_flags_value();
        if flags & IFLAGS_RESET_REQUEST != 0 {
            self.reset(bus);
            return Ok(());
        }
        if flags & IFLAGS_HARDWARE_INTERRUPT != 0 {
            self.consume_interrupt_flag(IFLAGS_HARDWARE_INTERRUPT);
            let vector = pic.cpu_get_interrupt();
            return self.handle_hard_protected_mode_interrupt(bus, vector);
        }
        Ok(())
    }

    pub fn process_virtual8086_mode_interrupts(
        &mut self,
        bus: &mut MemoryBus,
        clock: &mut dyn Clock,
        pic: &mut dyn InterruptController,
        instructions: u32,
    ) -> Result<Option<ModeSwitch>, CpuExit> {
        clock.update_and_process(instructions);
        if self.interrupts_inhibited() {
            self.retire_instruction();
            return Ok(None);
        }
        if !self.interrupt_enable {
            return Ok(None);
        }
        let flags = self.interrupt_flags_value();
        if flags & IFLAGS_RESET_REQUEST != 0 {
            self.reset(bus);
            return Ok(None);
        }
        if flags & IFLAGS_HARDWARE_INTERRUPT != 0 {
            self.consume_interrupt_flag(IFLAGS_HARDWARE_INTERRUPT);
            if self.get_cr4() & CR4_VIRTUAL8086_MODE_EXTENSIONS != 0 {
                unimplemented!("VME-assisted interrupt delivery");
            }
            let vector = pic.cpu_get_interrupt();
            return self.handle_hard_virtual8086_mode_interrupt(bus, vector);
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Real mode.
    // ------------------------------------------------------------------

    pub fn handle_real_mode_exception(
        &mut self,
        bus: &mut MemoryBus,
        e: ProcessorException,
    ) -> Result<(), CpuExit> {
        match self.follow_real_mode_interrupt(bus, e.vector.number()) {
            Ok(()) => Ok(()),
            Err(nested) => {
                if e.vector == Vector::DoubleFault {
                    error!(%nested, "triple fault: unhandleable, machine will halt");
                    return Err(CpuExit::TripleFault);
                }
                if nested.combines_to_double_fault(&e) {
                    self.handle_real_mode_exception(bus, ProcessorException::DOUBLE_FAULT_0)
                } else {
                    self.handle_real_mode_exception(bus, nested)
                }
            }
        }
    }

    pub fn handle_hard_real_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
    ) -> Result<(), CpuExit> {
        match self.follow_real_mode_interrupt(bus, vector) {
            Ok(()) => Ok(()),
            Err(nested) => self.handle_real_mode_exception(bus, nested),
        }
    }

    fn follow_real_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
    ) -> Result<(), ProcessorException> {
        let entry = u32::from(vector) * 4;
        if entry + 3 > self.idtr.get_limit() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        let new_eip = self.idtr.get_word(bus, entry)?;
        let new_selector = self.idtr.get_word(bus, entry + 2)?;

        let flags = self.get_eflags() as u16;
        let mut esp = self.regs.get32(Gpr::Esp);
        esp = self.push16_at(bus, esp, flags)?;
        self.interrupt_enable = false;
        self.trap = false;
        self.alignment_check = false;
        self.resume = false;
        let old_cs = self.cs.get_selector();
        esp = self.push16_at(bus, esp, old_cs)?;
        esp = self.push16_at(bus, esp, self.eip as u16)?;

        self.regs.set32(Gpr::Esp, esp);
        self.eip = u32::from(new_eip);
        if !self.cs.set_selector(new_selector) {
            // CS was still a protected-mode segment; replace it outright.
            info!("rebuilding CS as a real-mode segment during real-mode delivery");
            let _ = self.set_cs(Segment::real(SpaceKind::Physical, new_selector));
            self.set_cpl(bus, 0);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protected mode.
    // ------------------------------------------------------------------

    pub fn handle_protected_mode_exception(
        &mut self,
        bus: &mut MemoryBus,
        pe: ProcessorException,
    ) -> Result<(), CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_protected_mode_exception(
            bus,
            pe.vector.number(),
            pe.has_error_code(),
            pe.error_code(),
            false,
            false,
        ) {
            Ok(()) => Ok(()),
            Err(nested) => {
                warn!(outer = %pe, %nested, "fault while delivering exception");
                self.roll_back_delivery(snapshot);

                if pe.vector == Vector::DoubleFault {
                    error!("triple fault: unhandleable, machine will halt");
                    return Err(CpuExit::TripleFault);
                }
                if nested.combines_to_double_fault(&pe) {
                    self.handle_protected_mode_exception(bus, ProcessorException::DOUBLE_FAULT_0)
                } else {
                    self.handle_protected_mode_exception(bus, nested)
                }
            }
        }
    }

    /// INT n. On a delivery fault, EIP is first repointed at the INT
    /// instruction itself so the nested fault's frame names it.
    pub fn handle_soft_protected_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
        instruction_length: u32,
    ) -> Result<(), CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_protected_mode_exception(bus, vector, false, 0, false, true) {
            Ok(()) => Ok(()),
            Err(nested) => {
                self.roll_back_delivery(snapshot);
                if nested.points_to_self() {
                    self.eip = self.eip.wrapping_sub(instruction_length);
                }
                self.handle_protected_mode_exception(bus, nested)
            }
        }
    }

    pub fn handle_hard_protected_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
    ) -> Result<(), CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_protected_mode_exception(bus, vector, false, 0, true, false) {
            Ok(()) => Ok(()),
            Err(nested) => {
                self.roll_back_delivery(snapshot);
                self.handle_protected_mode_exception(bus, nested)
            }
        }
    }

    /// Gate DPL check (software interrupts only) and presence check.
    fn check_gate(
        &self,
        gate: &Segment,
        selector: u16,
        software: bool,
    ) -> Result<(), ProcessorException> {
        if software && gate.get_dpl() < self.get_cpl() {
            return Err(ProcessorException::gp(selector + 2));
        }
        if !gate.is_present() {
            return Err(ProcessorException::np(selector + 2));
        }
        Ok(())
    }

    fn follow_protected_mode_exception(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
        has_error_code: bool,
        error_code: u16,
        hardware: bool,
        software: bool,
    ) -> Result<(), ProcessorException> {
        if vector == Vector::PageFault.number() {
            let walked = bus.linear.last_walked_address();
            self.set_cr2(walked);
        }

        let selector = u16::from(vector) << 3;
        let ext: u16 = if hardware { 1 } else { 0 };

        let gate = bus
            .with_supervisor(|bus| {
                let descriptor = self.idtr.get_qword(bus, u32::from(selector))?;
                Segment::protected_mode(SpaceKind::Linear, selector, descriptor)
            })
            .map_err(|_| ProcessorException::gp(selector + 2 + ext))?;

        let (width, interrupt_gate) = match gate.get_type() {
            seg_type::TASK_GATE => {
                // TODO: task-gate delivery needs the nested-task switch.
                unimplemented!("interrupt delivery through a task gate")
            }
            seg_type::INTERRUPT_GATE_16 => (GateWidth::Bits16, true),
            seg_type::TRAP_GATE_16 => (GateWidth::Bits16, false),
            seg_type::INTERRUPT_GATE_32 => (GateWidth::Bits32, true),
            seg_type::TRAP_GATE_32 => (GateWidth::Bits32, false),
            t => {
                info!(gate_type = t, "invalid gate type for interrupt delivery");
                return Err(ProcessorException::gp(selector + 2 + ext));
            }
        };

        self.check_gate(&gate, selector, software)?;

        let target_selector = gate.gate_target_segment();
        let target_segment = self
            .get_segment(bus, target_selector)
            .map_err(|_| ProcessorException::gp(target_selector + ext))?;

        if target_segment.get_dpl() > self.get_cpl() {
            return Err(ProcessorException::gp(target_selector + ext));
        }

        let code = if has_error_code {
            Some(error_code)
        } else {
            None
        };

        match target_segment.get_type() {
            t if t & 0x1c == 0x18 => {
                // Non-conforming code.
                if !target_segment.is_present() {
                    return Err(ProcessorException::np(target_selector + ext));
                }
                if target_segment.get_dpl() < self.get_cpl() {
                    self.deliver_inter_privilege(
                        bus,
                        &gate,
                        target_segment,
                        width,
                        interrupt_gate,
                        code,
                    )
                } else if target_segment.get_dpl() == self.get_cpl() {
                    self.deliver_intra_privilege(
                        bus,
                        &gate,
                        target_segment,
                        width,
                        interrupt_gate,
                        code,
                    )
                } else {
                    Err(ProcessorException::gp(target_selector + ext))
                }
            }
            t if t & 0x1c == 0x1c => {
                // Conforming code always runs at the interrupted CPL.
                if !target_segment.is_present() {
                    return Err(ProcessorException::np(selector));
                }
                self.deliver_intra_privilege(bus, &gate, target_segment, width, interrupt_gate, code)
            }
            _ => Err(ProcessorException::gp(target_selector + ext)),
        }
    }

    fn push_frame_value(
        &mut self,
        bus: &mut MemoryBus,
        width: GateWidth,
        val: u32,
    ) -> Result<(), ProcessorException> {
        match width {
            GateWidth::Bits16 => self.push16(bus, val as u16),
            GateWidth::Bits32 => self.push32(bus, val),
        }
    }

    fn frame_room_check(
        &self,
        stack: &Segment,
        esp: u32,
        width: GateWidth,
        slots: u32,
    ) -> Result<(), ProcessorException> {
        let bytes = match width {
            GateWidth::Bits16 => 2,
            GateWidth::Bits32 => 4,
        };
        let esp = if stack.get_default_size_flag() {
            esp
        } else {
            esp & 0xffff
        };
        if esp < slots * bytes && esp > 0 {
            return Err(ProcessorException::STACK_SEGMENT_0);
        }
        Ok(())
    }

    /// Interrupt to a more-privileged handler: switch to the stack the
    /// TSS names, push the old SS:ESP, then the return frame.
    fn deliver_inter_privilege(
        &mut self,
        bus: &mut MemoryBus,
        gate: &Segment,
        target_segment: Segment,
        width: GateWidth,
        interrupt_gate: bool,
        error_code: Option<u16>,
    ) -> Result<(), ProcessorException> {
        let dpl = target_segment.get_dpl();
        let (new_stack_selector, new_esp) = self.read_inner_stack_from_tss(bus, dpl)?;

        let mut new_stack = self
            .get_segment(bus, new_stack_selector)
            .map_err(|_| ProcessorException::ts(new_stack_selector))?;
        self.validate_inner_stack_segment(
            &new_stack,
            dpl,
            new_stack_selector,
            ProcessorException::ss(new_stack_selector),
        )?;

        let slots = if error_code.is_some() { 6 } else { 5 };
        self.frame_room_check(&new_stack, new_esp, width, slots)?;

        let target_offset = match width {
            GateWidth::Bits16 => gate.gate_target_offset() & 0xffff,
            GateWidth::Bits32 => gate.gate_target_offset(),
        };
        target_segment.check_address(target_offset)?;

        let old_ss = self.ss.get_selector();
        let old_esp = self.regs.get32(Gpr::Esp);
        let old_cs = self.cs.get_selector();
        let old_eip = self.eip;
        let old_eflags = self.get_eflags();

        new_stack.set_rpl(dpl);
        self.set_ss(new_stack)?;
        self.regs.set32(Gpr::Esp, new_esp);

        self.set_cs(target_segment)?;
        self.eip = target_offset;
        let new_cpl = self.cs.get_dpl();
        self.set_cpl(bus, new_cpl);
        self.cs.set_rpl(new_cpl);

        self.push_frame_value(bus, width, u32::from(old_ss))?;
        self.push_frame_value(bus, width, old_esp)?;
        self.push_frame_value(bus, width, old_eflags)?;
        self.push_frame_value(bus, width, u32::from(old_cs))?;
        self.push_frame_value(bus, width, old_eip)?;
        if let Some(code) = error_code {
            self.push_frame_value(bus, width, u32::from(code))?;
        }

        if interrupt_gate {
            self.interrupt_enable = false;
        }
        self.trap = false;
        self.nested_task = false;
        self.vm86_mode = false;
        self.resume = false;
        Ok(())
    }

    /// Interrupt at the current privilege: frame goes on the running
    /// stack.
    fn deliver_intra_privilege(
        &mut self,
        bus: &mut MemoryBus,
        gate: &Segment,
        target_segment: Segment,
        width: GateWidth,
        interrupt_gate: bool,
        error_code: Option<u16>,
    ) -> Result<(), ProcessorException> {
        let slots = if error_code.is_some() { 4 } else { 3 };
        let esp = self.regs.get32(Gpr::Esp);
        let stack = self.ss.clone();
        self.frame_room_check(&stack, esp, width, slots)?;

        let target_offset = match width {
            GateWidth::Bits16 => gate.gate_target_offset() & 0xffff,
            GateWidth::Bits32 => gate.gate_target_offset(),
        };
        target_segment.check_address(target_offset)?;

        let old_cs = self.cs.get_selector();
        let old_eip = self.eip;
        let old_eflags = self.get_eflags();

        self.push_frame_value(bus, width, old_eflags)?;
        self.push_frame_value(bus, width, u32::from(old_cs))?;
        self.push_frame_value(bus, width, old_eip)?;
        if let Some(code) = error_code {
            self.push_frame_value(bus, width, u32::from(code))?;
        }

        self.set_cs(target_segment)?;
        self.eip = target_offset;
        let cpl = self.get_cpl();
        self.cs.set_rpl(cpl);

        if interrupt_gate {
            self.interrupt_enable = false;
        }
        self.trap = false;
        self.nested_task = false;
        self.vm86_mode = false;
        self.resume = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Virtual-8086 mode.
    // ------------------------------------------------------------------

    /// Gate for VM86 software INTs: VME handling is not modeled, and IOPL
    /// below 3 traps to the monitor with #GP(0). Instruction handlers
    /// call this before the delivery entry point.
    pub fn check_vm86_soft_interrupt(&self) -> Result<(), ProcessorException> {
        if self.get_cr4() & CR4_VIRTUAL8086_MODE_EXTENSIONS != 0 {
            unimplemented!("VME-assisted software interrupts");
        }
        if self.iopl < 3 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        Ok(())
    }

    pub fn handle_virtual8086_mode_exception(
        &mut self,
        bus: &mut MemoryBus,
        pe: ProcessorException,
    ) -> Result<Option<ModeSwitch>, CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_virtual8086_mode_exception(
            bus,
            pe.vector.number(),
            pe.has_error_code(),
            pe.error_code(),
            false,
            false,
        ) {
            Ok(switch) => Ok(Some(switch)),
            Err(nested) => {
                warn!(outer = %pe, %nested, "fault while delivering VM86 exception");
                self.roll_back_delivery(snapshot);

                if pe.vector == Vector::DoubleFault {
                    error!("triple fault: unhandleable, machine will halt");
                    return Err(CpuExit::TripleFault);
                }
                if nested.combines_to_double_fault(&pe) {
                    self.handle_virtual8086_mode_exception(bus, ProcessorException::DOUBLE_FAULT_0)
                } else {
                    self.handle_virtual8086_mode_exception(bus, nested)
                }
            }
        }
    }

    pub fn handle_soft_virtual8086_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
        instruction_length: u32,
    ) -> Result<Option<ModeSwitch>, CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_virtual8086_mode_exception(bus, vector, false, 0, false, true) {
            Ok(switch) => Ok(Some(switch)),
            Err(nested) => {
                self.roll_back_delivery(snapshot);
                if nested.points_to_self() {
                    self.eip = self.eip.wrapping_sub(instruction_length);
                }
                if nested.vector == Vector::DoubleFault {
                    error!("triple fault: unhandleable, machine will halt");
                    return Err(CpuExit::TripleFault);
                }
                self.handle_virtual8086_mode_exception(bus, nested)
            }
        }
    }

    pub fn handle_hard_virtual8086_mode_interrupt(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
    ) -> Result<Option<ModeSwitch>, CpuExit> {
        let snapshot = self.snapshot_for_delivery();
        match self.follow_virtual8086_mode_exception(bus, vector, false, 0, true, false) {
            Ok(switch) => Ok(Some(switch)),
            Err(nested) => {
                self.roll_back_delivery(snapshot);
                self.handle_virtual8086_mode_exception(bus, nested)
            }
        }
    }

    /// VM86 delivery always lands in a ring-0 32-bit protected-mode
    /// handler; the extended frame additionally saves and then nulls the
    /// VM86 data segments.
    fn follow_virtual8086_mode_exception(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
        has_error_code: bool,
        error_code: u16,
        hardware: bool,
        software: bool,
    ) -> Result<ModeSwitch, ProcessorException> {
        if vector == Vector::PageFault.number() {
            let walked = bus.linear.last_walked_address();
            self.set_cr2(walked);
        }

        let selector = u16::from(vector) << 3;
        let ext: u16 = if hardware { 1 } else { 0 };

        if u32::from(selector) + 7 > self.idtr.get_limit() {
            return Err(ProcessorException::gp(selector + 2 + ext));
        }

        let gate = bus
            .with_supervisor(|bus| {
                let descriptor = self.idtr.get_qword(bus, u32::from(selector))?;
                Segment::protected_mode(SpaceKind::Linear, selector, descriptor)
            })
            .map_err(|_| ProcessorException::gp(selector + 2 + ext))?;

        if !gate.is_system() {
            return Err(ProcessorException::gp(selector + 2));
        }

        let interrupt_gate = match gate.get_type() {
            seg_type::INTERRUPT_GATE_32 => true,
            seg_type::TRAP_GATE_32 => false,
            seg_type::TASK_GATE => {
                unimplemented!("VM86 interrupt delivery through a task gate")
            }
            seg_type::INTERRUPT_GATE_16 | seg_type::TRAP_GATE_16 => {
                unimplemented!("VM86 interrupt delivery through a 16-bit gate")
            }
            t => {
                warn!(gate_type = t, "invalid gate type for VM86 delivery");
                return Err(ProcessorException::gp(selector + 2 + ext));
            }
        };

        self.check_gate(&gate, selector, software)?;

        let target_selector = gate.gate_target_segment();
        if target_selector & 0xfffc == 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        let target_segment = self
            .get_segment(bus, target_selector)
            .map_err(|_| ProcessorException::gp((target_selector & 0xfffc) + ext))?;

        if target_segment.get_dpl() > self.get_cpl() || target_segment.is_system() {
            return Err(ProcessorException::gp((target_selector & 0xfffc) + ext));
        }
        if !target_segment.is_present() {
            return Err(ProcessorException::np(target_selector & 0xfffc));
        }

        if target_segment.get_type() & 0x1c != 0x18 {
            // Conforming handlers cannot take over from VM86.
            return Err(ProcessorException::gp(target_selector & 0xfffc));
        }
        if target_segment.get_dpl() >= self.get_cpl() {
            unimplemented!("same-level VM86 exception delivery")
        }
        if target_segment.get_dpl() != 0 {
            return Err(ProcessorException::gp(target_selector & 0xfffc));
        }

        // Interrupt to inner privilege (ring 0).
        let dpl = target_segment.get_dpl();
        let (new_stack_selector, new_esp) = self.read_inner_stack_from_tss(bus, dpl)?;
        if new_stack_selector & 0xfffc == 0 {
            return Err(ProcessorException::ts(0));
        }
        let mut new_stack = self
            .get_segment(bus, new_stack_selector)
            .map_err(|_| ProcessorException::ts(new_stack_selector))?;
        self.validate_inner_stack_segment(
            &new_stack,
            dpl,
            new_stack_selector & 0xfffc,
            ProcessorException::ss(new_stack_selector & 0xfffc),
        )?;

        let slots = if has_error_code { 10 } else { 9 };
        self.frame_room_check(&new_stack, new_esp, GateWidth::Bits32, slots)?;

        let target_offset = gate.gate_target_offset();
        target_segment.check_address(target_offset)?;

        let old_ss = u32::from(self.ss.get_selector());
        let old_esp = self.regs.get32(Gpr::Esp);
        let old_cs = u32::from(self.cs.get_selector());
        let old_eip = self.eip & 0xffff;
        let old_eflags = self.get_eflags();
        let old_gs = u32::from(self.gs.get_selector());
        let old_fs = u32::from(self.fs.get_selector());
        let old_ds = u32::from(self.ds.get_selector());
        let old_es = u32::from(self.es.get_selector());

        new_stack.set_rpl(dpl);
        self.set_ss(new_stack)?;
        self.regs.set32(Gpr::Esp, new_esp);

        self.set_cs(target_segment)?;
        self.eip = target_offset;
        let new_cpl = self.cs.get_dpl();
        self.set_cpl(bus, new_cpl);
        self.cs.set_rpl(new_cpl);

        self.push32(bus, old_gs)?;
        self.push32(bus, old_fs)?;
        self.push32(bus, old_ds)?;
        self.push32(bus, old_es)?;
        self.push32(bus, old_ss)?;
        self.push32(bus, old_esp)?;
        self.push32(bus, old_eflags)?;
        self.push32(bus, old_cs)?;
        self.push32(bus, old_eip)?;
        if has_error_code {
            self.push32(bus, u32::from(error_code))?;
        }

        self.set_gs(Segment::null());
        self.set_fs(Segment::null());
        self.set_ds(Segment::null());
        self.set_es(Segment::null());

        if interrupt_gate {
            self.interrupt_enable = false;
        }
        self.trap = false;
        self.nested_task = false;
        self.vm86_mode = false;
        self.resume = false;

        Ok(ModeSwitch::Protected)
    }
}
