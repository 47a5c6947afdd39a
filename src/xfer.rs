//! Far control transfers: `call far`, `ret far`, `jmp far`, `iret`,
//! `sysenter`/`sysexit`.
//!
//! Every protected-mode entry point is specialized by operand size and
//! stack address size, then dispatches on the target descriptor type.
//! Gate frames use the width fixed by the gate type, independent of the
//! instruction's operand size, so the four `call far` variants share one
//! gate path.
//!
//! The protected-mode `iret` routines return the merged EFLAGS image
//! instead of applying it: the caller commits it through
//! [`Processor::set_eflags`], which is where a restored VM bit unwinds as
//! the virtual-8086 mode switch.

use tracing::warn;

use crate::exceptions::{ExecEvent, ProcessorException};
use crate::mem::{MemoryBus, SpaceKind};
use crate::msr;
use crate::processor::{Processor, RPL_MASK};
use crate::regs::Gpr;
use crate::segments::{seg_type, Segment};

/// Frame width a gate builds, fixed by the gate descriptor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateWidth {
    Bits16,
    Bits32,
}

impl GateWidth {
    fn bytes(self) -> u32 {
        match self {
            GateWidth::Bits16 => 2,
            GateWidth::Bits32 => 4,
        }
    }
}

const EFLAGS_VM: u32 = 1 << 17;

/// Non-conforming code: 0x18..=0x1b; conforming: 0x1c..=0x1f.
fn is_nonconforming_code(seg_type: u8) -> bool {
    seg_type & 0x1c == 0x18
}

fn is_conforming_code(seg_type: u8) -> bool {
    seg_type & 0x1c == 0x1c
}

impl Processor {
    // ------------------------------------------------------------------
    // Real-mode transfers.
    // ------------------------------------------------------------------

    pub fn call_far_real(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u16,
    ) -> Result<(), ProcessorException> {
        let sp = u32::from(self.regs.get16(Gpr::Esp));
        if sp < 4 && sp != 0 {
            return Err(ProcessorException::STACK_SEGMENT_0);
        }

        let old_cs = self.cs.get_selector();
        self.ss
            .set_word(bus, sp.wrapping_sub(2) & 0xffff, old_cs)?;
        self.ss
            .set_word(bus, sp.wrapping_sub(4) & 0xffff, self.eip as u16)?;
        self.regs.set16(Gpr::Esp, sp.wrapping_sub(4) as u16);

        self.eip = u32::from(target_eip);
        self.cs.set_selector(target_selector);
        Ok(())
    }

    pub fn jump_far_real(&mut self, selector: u16, eip: u32) {
        self.cs.set_selector(selector);
        self.eip = eip;
    }

    /// Real-mode software INT: push FLAGS/CS/IP, clear IF/TF/AC/RF, load
    /// the handler from the IVT.
    pub fn int_o16_a16(
        &mut self,
        bus: &mut MemoryBus,
        vector: u8,
    ) -> Result<(), ProcessorException> {
        let sp = u32::from(self.regs.get16(Gpr::Esp));
        if sp < 6 && sp != 0 {
            return Err(ProcessorException::STACK_SEGMENT_0);
        }

        let mut esp = self.regs.get32(Gpr::Esp);
        let flags = self.get_eflags() as u16;
        esp = self.push16_at(bus, esp, flags)?;
        self.interrupt_enable = false;
        self.trap = false;
        self.alignment_check = false;
        self.resume = false;
        let old_cs = self.cs.get_selector();
        esp = self.push16_at(bus, esp, old_cs)?;
        esp = self.push16_at(bus, esp, self.eip as u16)?;

        let entry = 4 * u32::from(vector);
        let new_eip = self.idtr.get_word(bus, entry)?;
        let new_cs = self.idtr.get_word(bus, entry + 2)?;

        self.cs.set_selector(new_cs);
        self.eip = u32::from(new_eip);
        self.regs.set32(Gpr::Esp, esp);
        Ok(())
    }

    pub fn iret_o16_a16(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let eip = u32::from(self.pop16(bus)?);
        let cs = self.pop16(bus)?;
        let flags = self.pop16(bus)?;
        self.cs.set_selector(cs);
        self.eip = eip;
        self.set_flags16(flags);
        Ok(())
    }

    pub fn iret_o32_a16(&mut self, bus: &mut MemoryBus) -> Result<(), ExecEvent> {
        let eip = self.pop32(bus)?;
        let cs = self.pop32(bus)? as u16;
        let flags = self.pop32(bus)?;
        self.cs.check_address(eip)?;
        self.cs.set_selector(cs);
        self.eip = eip;
        // VIF, VIP and VM are unchanged by a real-mode IRETD.
        self.set_eflags_masked(flags, 0x25_7fd5)?;
        Ok(())
    }

    /// VM86 IRET is only serviced directly when IOPL is 3; otherwise the
    /// monitor gets a #GP(0) to emulate it.
    pub fn iret_vm_o16_a16(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        if self.iopl != 3 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        self.ss
            .check_address(self.regs.get32(Gpr::Esp).wrapping_add(5) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

        let sp = u32::from(self.regs.get16(Gpr::Esp));
        let new_eip = u32::from(self.ss.get_word(bus, sp & 0xffff)?);
        let new_cs = self.ss.get_word(bus, sp.wrapping_add(2) & 0xffff)?;
        let mut new_flags = u32::from(self.ss.get_word(bus, sp.wrapping_add(4) & 0xffff)?);

        self.eip = new_eip;
        self.set_cs(Segment::virtual8086(SpaceKind::Linear, new_cs, true))?;
        self.regs
            .set16(Gpr::Esp, (sp as u16).wrapping_add(6));

        // IOPL is not restorable from VM86.
        new_flags = (new_flags & !0x3000) | ((self.iopl & 3) << 12);
        self.set_flags16(new_flags as u16);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protected-mode IRET.
    // ------------------------------------------------------------------

    pub fn iret_pm_o16_a16(&mut self, bus: &mut MemoryBus) -> Result<u32, ProcessorException> {
        if self.nested_task {
            return self.iret_from_task();
        }
        self.ss
            .check_address(self.regs.get32(Gpr::Esp).wrapping_add(5) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;
        let eip = u32::from(self.pop16(bus)?);
        let cs = self.pop16(bus)?;
        let flags = u32::from(self.pop16(bus)?);
        self.iret16_protected_16bit_addressing(bus, cs, eip, flags)
    }

    pub fn iret_pm_o32_a16(&mut self, bus: &mut MemoryBus) -> Result<u32, ProcessorException> {
        if self.nested_task {
            return self.iret_from_task();
        }
        self.ss
            .check_address((u32::from(self.regs.get16(Gpr::Esp)) + 11) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;
        let eip = self.pop32(bus)?;
        let cs = self.pop32(bus)? as u16;
        let flags = self.pop32(bus)?;

        if flags & EFLAGS_VM != 0 && self.get_cpl() == 0 {
            self.iret_to_vm86_16bit_addressing(bus, cs, eip, flags)
        } else {
            self.iret32_protected_16bit_addressing(bus, cs, eip, flags)
        }
    }

    pub fn iret_pm_o32_a32(&mut self, bus: &mut MemoryBus) -> Result<u32, ProcessorException> {
        if self.nested_task {
            return self.iret_from_task();
        }
        self.ss
            .check_address(self.regs.get32(Gpr::Esp).wrapping_add(11))
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;
        let eip = self.pop32(bus)?;
        let cs = self.pop32(bus)? as u16;
        let flags = self.pop32(bus)?;

        if flags & EFLAGS_VM != 0 && self.get_cpl() == 0 {
            self.iret_to_vm86_32bit_addressing(bus, cs, eip, flags)
        } else {
            self.iret32_protected_32bit_addressing(bus, cs, eip, flags)
        }
    }

    fn iret_from_task(&mut self) -> Result<u32, ProcessorException> {
        // TODO: task-linked IRET (EFLAGS.NT) needs the back-link walk.
        unimplemented!("IRET with NT set (task return)")
    }

    fn iret_to_vm86_16bit_addressing(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
    ) -> Result<u32, ProcessorException> {
        self.ss
            .check_address((u32::from(self.regs.get16(Gpr::Esp)) + 23) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;
        self.resume_vm86_frame(bus, new_cs, new_eip)?;
        Ok(new_eflags)
    }

    fn iret_to_vm86_32bit_addressing(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
    ) -> Result<u32, ProcessorException> {
        self.ss
            .check_address(self.regs.get32(Gpr::Esp).wrapping_add(23))
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;
        if new_eip > 0xfffff {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.resume_vm86_frame(bus, new_cs, new_eip)?;
        Ok(new_eflags)
    }

    /// Pop the extended VM86 frame (ESP, SS, ES, DS, FS, GS) and rebuild
    /// all six segments as VM86 variants at CPL 3.
    fn resume_vm86_frame(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
    ) -> Result<(), ProcessorException> {
        self.set_cs(Segment::virtual8086(SpaceKind::Linear, new_cs, true))?;
        self.eip = new_eip & 0xffff;
        let new_esp = self.pop32(bus)?;
        let new_ss = self.pop32(bus)? as u16;
        let es = self.pop32(bus)? as u16;
        let ds = self.pop32(bus)? as u16;
        let fs = self.pop32(bus)? as u16;
        let gs = self.pop32(bus)? as u16;
        self.set_es(Segment::virtual8086(SpaceKind::Linear, es, false));
        self.set_ds(Segment::virtual8086(SpaceKind::Linear, ds, false));
        self.set_fs(Segment::virtual8086(SpaceKind::Linear, fs, false));
        self.set_gs(Segment::virtual8086(SpaceKind::Linear, gs, false));
        self.set_ss(Segment::virtual8086(SpaceKind::Linear, new_ss, false))?;
        self.regs.set32(Gpr::Esp, new_esp);
        self.set_cpl(bus, 3);
        Ok(())
    }

    /// Merge popped EFLAGS with the running image: IF only at sufficient
    /// IOPL, IOPL (and for 32-bit forms VM/VIF/VIP) only at CPL 0. The
    /// gates use the CPL in force *before* the return lowers it.
    fn merge_return_eflags(&self, new_eflags: u32, base_mask: u32, cpl0_mask: u32) -> u32 {
        let mut eflags = self.get_eflags();
        eflags = (eflags & !base_mask) | (new_eflags & base_mask);
        if u32::from(self.get_cpl()) <= self.iopl {
            eflags = (eflags & !0x200) | (new_eflags & 0x200);
        }
        if self.get_cpl() == 0 {
            eflags = (eflags & !cpl0_mask) | (new_eflags & cpl0_mask);
        }
        eflags
    }

    /// Drop any data segment the new, lower privilege may not keep:
    /// data or non-conforming code with DPL below the new CPL.
    fn invalidate_low_privilege_data_segments(&mut self) {
        let cpl = self.get_cpl();
        let doomed = |seg: &Segment| {
            let t = seg.get_type();
            (t & 0x18 == 0x10 || is_nonconforming_code(t)) && cpl > seg.get_dpl()
        };
        if doomed(&self.es) {
            self.set_es(Segment::null());
        }
        if doomed(&self.ds) {
            self.set_ds(Segment::null());
        }
        if doomed(&self.fs) {
            self.set_fs(Segment::null());
        }
        if doomed(&self.gs) {
            self.set_gs(Segment::null());
        }
    }

    fn iret16_protected_16bit_addressing(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
    ) -> Result<u32, ProcessorException> {
        let return_segment = self.get_segment(bus, new_cs)?;
        if return_segment.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        match return_segment.get_type() {
            t if is_nonconforming_code(t) => {
                if return_segment.get_rpl() < self.get_cpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(new_cs));
                }

                if return_segment.get_rpl() > self.get_cpl() {
                    // Outer privilege level: the frame also holds SS:ESP.
                    self.ss
                        .check_address(self.regs.get32(Gpr::Esp).wrapping_add(3) & 0xffff)
                        .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

                    let sp = u32::from(self.regs.get16(Gpr::Esp));
                    let return_esp = u32::from(self.ss.get_word(bus, sp & 0xffff)?);
                    let new_ss = self.ss.get_word(bus, sp.wrapping_add(2) & 0xffff)?;

                    let return_stack = self.get_segment(bus, new_ss)?;
                    if return_stack.get_rpl() != return_segment.get_rpl()
                        || return_stack.get_type() & 0x12 != 0x12
                        || return_stack.get_dpl() != return_segment.get_rpl()
                    {
                        return Err(ProcessorException::gp(new_ss));
                    }
                    if !return_stack.is_present() {
                        return Err(ProcessorException::gp(new_ss));
                    }

                    return_segment.check_address(new_eip)?;

                    self.eip = new_eip;
                    self.set_cs(return_segment)?;
                    self.set_ss(return_stack)?;
                    self.regs.set32(Gpr::Esp, return_esp);

                    let eflags = self.merge_return_eflags(new_eflags, 0x4dd5, 0x3000);
                    let new_cpl = self.cs.get_rpl();
                    self.set_cpl(bus, new_cpl);
                    self.invalidate_low_privilege_data_segments();
                    Ok(eflags)
                } else {
                    // Same privilege level.
                    return_segment.check_address(new_eip)?;
                    self.set_cs(return_segment)?;
                    self.eip = new_eip;
                    Ok(self.merge_return_eflags(new_eflags, 0x4dd5, 0x3000))
                }
            }
            t if is_conforming_code(t) => {
                if return_segment.get_rpl() < self.get_cpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if return_segment.get_dpl() > return_segment.get_rpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(new_cs));
                }
                // TODO: conforming return targets (no known guest takes
                // this path; fail loudly rather than guess).
                warn!("16-bit IRET to conforming code segment not implemented");
                unimplemented!("iret to conforming code segment")
            }
            t => {
                warn!(seg_type = t, "invalid segment type for IRET");
                Err(ProcessorException::gp(new_cs))
            }
        }
    }

    fn iret32_protected_16bit_addressing(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
    ) -> Result<u32, ProcessorException> {
        let outer_probe = (u32::from(self.regs.get16(Gpr::Esp)) + 7) & 0xffff;
        self.iret32_protected(bus, new_cs, new_eip, new_eflags, outer_probe)
    }

    fn iret32_protected_32bit_addressing(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
    ) -> Result<u32, ProcessorException> {
        let outer_probe = self.regs.get32(Gpr::Esp).wrapping_add(7);
        self.iret32_protected(bus, new_cs, new_eip, new_eflags, outer_probe)
    }

    fn iret32_protected(
        &mut self,
        bus: &mut MemoryBus,
        new_cs: u16,
        new_eip: u32,
        new_eflags: u32,
        outer_probe: u32,
    ) -> Result<u32, ProcessorException> {
        let return_segment = self.get_segment(bus, new_cs)?;
        if return_segment.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        match return_segment.get_type() {
            t if is_nonconforming_code(t) => {
                if return_segment.get_rpl() < self.get_cpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(new_cs));
                }

                if return_segment.get_rpl() > self.get_cpl() {
                    // Outer privilege level.
                    self.ss
                        .check_address(outer_probe)
                        .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

                    let return_esp = self.pop32(bus)?;
                    let new_ss = self.pop32(bus)? as u16;

                    let return_stack = self.get_segment(bus, new_ss)?;
                    if return_stack.get_rpl() != return_segment.get_rpl()
                        || return_stack.get_type() & 0x12 != 0x12
                        || return_stack.get_dpl() != return_segment.get_rpl()
                    {
                        return Err(ProcessorException::gp(new_ss));
                    }
                    if !return_stack.is_present() {
                        return Err(ProcessorException::gp(new_ss));
                    }

                    return_segment.check_address(new_eip)?;

                    self.eip = new_eip;
                    self.set_cs(return_segment)?;
                    self.set_ss(return_stack)?;
                    self.regs.set32(Gpr::Esp, return_esp);

                    let eflags = self.merge_return_eflags(new_eflags, 0x25_4dd5, 0x1a_3000);
                    let new_cpl = self.cs.get_rpl();
                    self.set_cpl(bus, new_cpl);
                    self.invalidate_low_privilege_data_segments();
                    Ok(eflags)
                } else {
                    // Same privilege level.
                    return_segment.check_address(new_eip)?;
                    self.set_cs(return_segment)?;
                    self.eip = new_eip;
                    Ok(self.merge_return_eflags(new_eflags, 0x25_4dd5, 0x1a_3000))
                }
            }
            t if is_conforming_code(t) => {
                if return_segment.get_rpl() < self.get_cpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if return_segment.get_dpl() > return_segment.get_rpl() {
                    return Err(ProcessorException::gp(new_cs));
                }
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(new_cs));
                }
                if return_segment.get_rpl() > self.get_cpl() {
                    // TODO: conforming outer return (no known guest).
                    warn!("IRET to conforming outer privilege level not implemented");
                    unimplemented!("iret to conforming code at outer privilege")
                }
                // Conforming same-privilege return.
                return_segment.check_address(new_eip)?;
                self.eip = new_eip;
                self.set_cs(return_segment)?;
                Ok(self.merge_return_eflags(new_eflags, 0x25_4dd5, 0x1a_3000))
            }
            t => {
                warn!(seg_type = t, "invalid segment type for IRET");
                Err(ProcessorException::gp(new_cs))
            }
        }
    }

    // ------------------------------------------------------------------
    // RET far.
    // ------------------------------------------------------------------

    pub fn ret_far_o16_a16(
        &mut self,
        bus: &mut MemoryBus,
        stack_delta: u32,
    ) -> Result<(), ProcessorException> {
        let esp = self.regs.get32(Gpr::Esp);
        self.ss
            .check_address(esp.wrapping_add(3) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

        let temp_eip = u32::from(self.ss.get_word(bus, esp & 0xffff)?);
        let temp_cs = self.ss.get_word(bus, esp.wrapping_add(2) & 0xffff)?;

        if temp_cs & RPL_MASK == 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.ret_far(
            bus,
            stack_delta,
            temp_cs,
            temp_eip,
            RetFarWidths {
                outer_probe: esp.wrapping_add(7).wrapping_add(stack_delta) & 0xffff,
                outer_esp_at: esp.wrapping_add(4).wrapping_add(stack_delta) & 0xffff,
                outer_ss_at: esp.wrapping_add(6).wrapping_add(stack_delta) & 0xffff,
                outer_implemented: true,
                word_frame: true,
                same_level_sp: SameLevelSp::Sp16(esp.wrapping_add(4).wrapping_add(stack_delta)),
            },
        )
    }

    pub fn ret_far_o16_a32(
        &mut self,
        bus: &mut MemoryBus,
        stack_delta: u32,
    ) -> Result<(), ProcessorException> {
        let esp = self.regs.get32(Gpr::Esp);
        self.ss
            .check_address(esp.wrapping_add(3))
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

        let temp_eip = u32::from(self.ss.get_word(bus, esp)?);
        let temp_cs = self.ss.get_word(bus, esp.wrapping_add(2))?;

        self.ret_far(
            bus,
            stack_delta,
            temp_cs,
            temp_eip,
            RetFarWidths {
                outer_probe: 0,
                outer_esp_at: 0,
                outer_ss_at: 0,
                outer_implemented: false,
                word_frame: true,
                same_level_sp: SameLevelSp::Esp32(esp.wrapping_add(4).wrapping_add(stack_delta)),
            },
        )
    }

    pub fn ret_far_o32_a16(
        &mut self,
        bus: &mut MemoryBus,
        stack_delta: u32,
    ) -> Result<(), ProcessorException> {
        let esp = self.regs.get32(Gpr::Esp);
        self.ss
            .check_address(esp.wrapping_add(7) & 0xffff)
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

        let temp_eip = self.ss.get_dword(bus, esp & 0xffff)?;
        let temp_cs = self.ss.get_dword(bus, esp.wrapping_add(4) & 0xffff)? as u16;

        self.ret_far(
            bus,
            stack_delta,
            temp_cs,
            temp_eip,
            RetFarWidths {
                outer_probe: 0,
                outer_esp_at: 0,
                outer_ss_at: 0,
                outer_implemented: false,
                word_frame: false,
                same_level_sp: SameLevelSp::Sp16(esp.wrapping_add(8).wrapping_add(stack_delta)),
            },
        )
    }

    pub fn ret_far_o32_a32(
        &mut self,
        bus: &mut MemoryBus,
        stack_delta: u32,
    ) -> Result<(), ProcessorException> {
        let esp = self.regs.get32(Gpr::Esp);
        self.ss
            .check_address(esp.wrapping_add(7))
            .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

        let temp_eip = self.ss.get_dword(bus, esp)?;
        let temp_cs = self.ss.get_dword(bus, esp.wrapping_add(4))? as u16;

        self.ret_far(
            bus,
            stack_delta,
            temp_cs,
            temp_eip,
            RetFarWidths {
                outer_probe: esp.wrapping_add(15),
                outer_esp_at: esp.wrapping_add(8).wrapping_add(stack_delta),
                outer_ss_at: esp.wrapping_add(12).wrapping_add(stack_delta),
                outer_implemented: true,
                word_frame: false,
                same_level_sp: SameLevelSp::Esp32(esp.wrapping_add(8).wrapping_add(stack_delta)),
            },
        )
    }

    fn ret_far(
        &mut self,
        bus: &mut MemoryBus,
        stack_delta: u32,
        temp_cs: u16,
        temp_eip: u32,
        widths: RetFarWidths,
    ) -> Result<(), ProcessorException> {
        let return_segment = self.get_segment(bus, temp_cs)?;
        if return_segment.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        if return_segment.get_rpl() < self.get_cpl() {
            warn!(
                rpl = return_segment.get_rpl(),
                cpl = self.get_cpl(),
                "RPL below CPL in far return to {temp_cs:#x}"
            );
            return Err(ProcessorException::gp(temp_cs));
        }

        match return_segment.get_type() {
            t if is_nonconforming_code(t) => {
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(temp_cs));
                }

                if return_segment.get_rpl() > self.get_cpl() {
                    if !widths.outer_implemented {
                        // TODO: mixed-width outer-level far returns.
                        warn!("non-conforming outer privilege far return not implemented for this width pair");
                        unimplemented!("outer-level far return for this operand/address size");
                    }
                    self.ss
                        .check_address(widths.outer_probe)
                        .map_err(|_| ProcessorException::STACK_SEGMENT_0)?;

                    let (return_esp, new_ss) = if widths.word_frame {
                        (
                            u32::from(self.ss.get_word(bus, widths.outer_esp_at)?),
                            self.ss.get_word(bus, widths.outer_ss_at)?,
                        )
                    } else {
                        (
                            self.ss.get_dword(bus, widths.outer_esp_at)?,
                            self.ss.get_dword(bus, widths.outer_ss_at)? as u16,
                        )
                    };

                    if new_ss & RPL_MASK == 0 {
                        return Err(ProcessorException::GENERAL_PROTECTION_0);
                    }
                    let return_stack = self.get_segment(bus, new_ss)?;
                    if return_stack.get_rpl() != return_segment.get_rpl()
                        || return_stack.get_type() & 0x12 != 0x12
                        || return_stack.get_dpl() != return_segment.get_rpl()
                    {
                        return Err(ProcessorException::gp(new_ss & RPL_MASK));
                    }
                    if !return_stack.is_present() {
                        return Err(ProcessorException::ss(new_ss & RPL_MASK));
                    }

                    return_segment.check_address(temp_eip)?;

                    self.eip = temp_eip;
                    self.set_cs(return_segment)?;
                    self.set_ss(return_stack)?;
                    self.regs
                        .set32(Gpr::Esp, return_esp.wrapping_add(stack_delta));

                    let new_cpl = self.cs.get_rpl();
                    self.set_cpl(bus, new_cpl);
                    self.invalidate_low_privilege_data_segments();
                } else {
                    return_segment.check_address(temp_eip)?;
                    widths.same_level_sp.commit(self);
                    self.eip = temp_eip;
                    self.set_cs(return_segment)?;
                }
                Ok(())
            }
            t if is_conforming_code(t) => {
                if return_segment.get_dpl() > return_segment.get_rpl() {
                    return Err(ProcessorException::gp(temp_cs));
                }
                if !return_segment.is_present() {
                    return Err(ProcessorException::np(temp_cs));
                }
                if return_segment.get_rpl() > self.get_cpl() {
                    // TODO: conforming outer-level far return.
                    warn!("conforming outer privilege far return not implemented");
                    unimplemented!("far return to conforming code at outer privilege");
                }
                return_segment.check_address(temp_eip)?;
                widths.same_level_sp.commit(self);
                self.eip = temp_eip;
                self.set_cs(return_segment)?;
                Ok(())
            }
            _ => Err(ProcessorException::gp(temp_cs)),
        }
    }

    // ------------------------------------------------------------------
    // CALL far, protected mode.
    // ------------------------------------------------------------------

    pub fn call_far_pm_o16_a16(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
    ) -> Result<(), ProcessorException> {
        if target_selector & RPL_MASK == 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.call_far_pm(bus, target_selector, target_eip, CallWidth::O16)
    }

    pub fn call_far_pm_o16_a32(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
    ) -> Result<(), ProcessorException> {
        self.call_far_pm(bus, target_selector, target_eip, CallWidth::O16)
    }

    pub fn call_far_pm_o32_a16(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
    ) -> Result<(), ProcessorException> {
        self.call_far_pm(bus, target_selector, target_eip, CallWidth::O32A16)
    }

    pub fn call_far_pm_o32_a32(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
    ) -> Result<(), ProcessorException> {
        self.call_far_pm(bus, target_selector, target_eip, CallWidth::O32)
    }

    fn call_far_pm(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
        width: CallWidth,
    ) -> Result<(), ProcessorException> {
        let new_segment = self.get_segment(bus, target_selector)?;
        if new_segment.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        match new_segment.get_type() {
            seg_type::TSS_16_AVAILABLE | seg_type::TSS_16_BUSY => {
                // TODO: 16-bit TSS task switch.
                warn!("16-bit TSS call target not implemented");
                unimplemented!("call through 16-bit TSS")
            }
            seg_type::TASK_GATE => {
                warn!("task gate call target not implemented");
                unimplemented!("call through task gate")
            }
            seg_type::TSS_32_AVAILABLE | seg_type::TSS_32_BUSY => {
                warn!("TSS call target not implemented");
                unimplemented!("call through 32-bit TSS")
            }
            gate @ (seg_type::CALL_GATE_16 | seg_type::CALL_GATE_32) => {
                if new_segment.get_dpl() < new_segment.get_rpl()
                    || new_segment.get_dpl() < self.get_cpl()
                {
                    return Err(ProcessorException::gp(target_selector & RPL_MASK));
                }
                if !new_segment.is_present() {
                    return Err(ProcessorException::np(target_selector & RPL_MASK));
                }
                let gate_width = if gate == seg_type::CALL_GATE_16 {
                    GateWidth::Bits16
                } else {
                    GateWidth::Bits32
                };
                self.call_through_gate(bus, &new_segment, gate_width)
            }
            t if is_nonconforming_code(t) => {
                if new_segment.get_rpl() > self.get_cpl()
                    || new_segment.get_dpl() != self.get_cpl()
                {
                    return Err(ProcessorException::gp(target_selector));
                }
                if !new_segment.is_present() {
                    return Err(ProcessorException::np(target_selector));
                }
                self.call_direct_code(bus, new_segment, target_eip, width)
            }
            t if is_conforming_code(t) => {
                // TODO: direct conforming call target.
                warn!("conforming code call target not implemented");
                unimplemented!("call to conforming code segment")
            }
            t => {
                warn!(seg_type = t, "invalid segment type for far call");
                Err(ProcessorException::gp(target_selector))
            }
        }
    }

    fn call_direct_code(
        &mut self,
        bus: &mut MemoryBus,
        new_segment: Segment,
        target_eip: u32,
        width: CallWidth,
    ) -> Result<(), ProcessorException> {
        let cpl = self.get_cpl();
        let old_cs = self.cs.get_selector();
        let old_eip = self.eip;
        match width {
            CallWidth::O16 => {
                let esp = self.regs.get32(Gpr::Esp);
                if esp < 4 && esp > 0 {
                    return Err(ProcessorException::STACK_SEGMENT_0);
                }
                new_segment.check_address(target_eip & 0xffff)?;
                self.push16(bus, old_cs)?;
                self.push16(bus, old_eip as u16)?;
                self.set_cs(new_segment)?;
                self.cs.set_rpl(cpl);
                self.eip = target_eip & 0xffff;
            }
            CallWidth::O32A16 => {
                if self.regs.get32(Gpr::Esp) & 0xffff < 8 {
                    return Err(ProcessorException::STACK_SEGMENT_0);
                }
                new_segment.check_address(target_eip)?;
                self.push32(bus, u32::from(old_cs))?;
                self.push32(bus, old_eip)?;
                self.set_cs(new_segment)?;
                self.cs.set_rpl(cpl);
                self.eip = target_eip;
            }
            CallWidth::O32 => {
                let esp = self.regs.get32(Gpr::Esp);
                if esp < 8 && esp > 0 {
                    return Err(ProcessorException::STACK_SEGMENT_0);
                }
                new_segment.check_address(target_eip)?;
                self.push32(bus, u32::from(old_cs))?;
                self.push32(bus, old_eip)?;
                self.set_cs(new_segment)?;
                self.cs.set_rpl(cpl);
                self.eip = target_eip;
            }
        }
        Ok(())
    }

    /// Resolve and take a call gate. The gate width decides frame and
    /// parameter sizes; the calling instruction's operand size does not.
    fn call_through_gate(
        &mut self,
        bus: &mut MemoryBus,
        gate: &Segment,
        width: GateWidth,
    ) -> Result<(), ProcessorException> {
        let target_selector = gate.gate_target_segment();
        if target_selector & RPL_MASK == 0 {
            return Err(ProcessorException::np(0));
        }

        let target_segment = self
            .get_segment(bus, target_selector)
            .map_err(|_| ProcessorException::gp(target_selector & RPL_MASK))?;
        if target_segment.is_null() {
            return Err(ProcessorException::gp(target_selector & RPL_MASK));
        }
        if target_segment.get_dpl() > self.get_cpl()
            || target_segment.is_system()
            || target_segment.get_type() & 0x18 == 0x10
        {
            return Err(ProcessorException::gp(target_selector & RPL_MASK));
        }
        if !target_segment.is_present() {
            return Err(ProcessorException::np(target_selector & RPL_MASK));
        }

        match target_segment.get_type() {
            t if is_nonconforming_code(t) => {
                if target_segment.get_dpl() < self.get_cpl() {
                    self.call_gate_inner(bus, gate, target_segment, width)
                } else if target_segment.get_dpl() == self.get_cpl() {
                    // TODO: gate to same-privilege code.
                    warn!("call gate to same privilege level not implemented");
                    unimplemented!("call gate same-privilege path")
                } else {
                    Err(ProcessorException::gp(target_selector))
                }
            }
            _ => {
                // Conforming targets through a gate.
                warn!("call gate to conforming segment not implemented");
                unimplemented!("call gate conforming path")
            }
        }
    }

    /// Inner-privilege call through a gate: switch to the stack the TSS
    /// names for the target privilege, copy the parameters across, then
    /// build the return frame on the new stack.
    fn call_gate_inner(
        &mut self,
        bus: &mut MemoryBus,
        gate: &Segment,
        target_segment: Segment,
        width: GateWidth,
    ) -> Result<(), ProcessorException> {
        let dpl = target_segment.get_dpl();
        let (new_stack_selector, new_esp) = self.read_inner_stack_from_tss(bus, dpl)?;

        if new_stack_selector & RPL_MASK == 0 {
            return Err(ProcessorException::ts(0));
        }
        let mut new_stack = self
            .get_segment(bus, new_stack_selector)
            .map_err(|_| ProcessorException::ts(new_stack_selector))?;
        self.validate_inner_stack_segment(
            &new_stack,
            dpl,
            new_stack_selector & RPL_MASK,
            ProcessorException::np(new_stack_selector & RPL_MASK),
        )?;

        let parameters = gate.gate_parameter_count();
        let unit = width.bytes();
        let room = 4 * unit + unit * parameters;
        let room_esp = if new_stack.get_default_size_flag() {
            new_esp
        } else {
            new_esp & 0xffff
        };
        if room_esp < room && room_esp > 0 {
            return Err(ProcessorException::STACK_SEGMENT_0);
        }

        let target_offset = match width {
            GateWidth::Bits16 => gate.gate_target_offset() & 0xffff,
            GateWidth::Bits32 => gate.gate_target_offset(),
        };

        let return_ss = self.ss.get_selector();
        let old_stack = self.ss.clone();
        let return_esp = if old_stack.get_default_size_flag() {
            self.regs.get32(Gpr::Esp)
        } else {
            self.regs.get32(Gpr::Esp) & 0xffff
        };
        let old_cs = self.cs.get_selector();
        let old_eip = if self.cs.get_default_size_flag() {
            self.eip
        } else {
            self.eip & 0xffff
        };

        new_stack.set_rpl(dpl);
        self.set_ss(new_stack)?;
        self.regs.set32(Gpr::Esp, new_esp);

        match width {
            GateWidth::Bits16 => {
                self.push16(bus, return_ss)?;
                self.push16(bus, return_esp as u16)?;
                for i in 0..parameters {
                    let mut at = return_esp
                        .wrapping_add(2 * parameters)
                        .wrapping_sub(2 * i)
                        .wrapping_sub(2);
                    if !old_stack.get_default_size_flag() {
                        at &= 0xffff;
                    }
                    let param = old_stack.get_word(bus, at)?;
                    self.push16(bus, param)?;
                }
                self.push16(bus, old_cs)?;
                self.push16(bus, old_eip as u16)?;
            }
            GateWidth::Bits32 => {
                self.push32(bus, u32::from(return_ss))?;
                self.push32(bus, return_esp)?;
                for i in 0..parameters {
                    let mut at = return_esp
                        .wrapping_add(4 * parameters)
                        .wrapping_sub(4 * i)
                        .wrapping_sub(4);
                    if !old_stack.get_default_size_flag() {
                        at &= 0xffff;
                    }
                    let param = old_stack.get_dword(bus, at)?;
                    self.push32(bus, param)?;
                }
                self.push32(bus, u32::from(old_cs))?;
                self.push32(bus, old_eip)?;
            }
        }

        target_segment.check_address(target_offset)?;
        self.set_cs(target_segment)?;
        self.eip = target_offset;
        let new_cpl = self.ss.get_dpl();
        self.set_cpl(bus, new_cpl);
        let cpl = self.get_cpl();
        self.cs.set_rpl(cpl);
        Ok(())
    }

    /// Fetch SS:ESP for a privilege level from the current TSS, honoring
    /// both TSS layouts, under supervisor paging.
    pub(crate) fn read_inner_stack_from_tss(
        &self,
        bus: &mut MemoryBus,
        dpl: u8,
    ) -> Result<(u16, u32), ProcessorException> {
        if self.tss.get_type() & 0x8 != 0 {
            let stack_address = u32::from(dpl) * 8 + 4;
            if stack_address + 7 > self.tss.get_limit() {
                return Err(ProcessorException::ts(self.tss.get_selector()));
            }
            bus.with_supervisor(|bus| {
                let esp = self.tss.get_dword(bus, stack_address)?;
                let ss = self.tss.get_word(bus, stack_address + 4)?;
                Ok((ss, esp))
            })
        } else {
            let stack_address = u32::from(dpl) * 4 + 2;
            if stack_address + 4 > self.tss.get_limit() {
                return Err(ProcessorException::ts(self.tss.get_selector()));
            }
            bus.with_supervisor(|bus| {
                let esp = u32::from(self.tss.get_word(bus, stack_address)?);
                let ss = self.tss.get_word(bus, stack_address + 2)?;
                Ok((ss, esp))
            })
        }
    }

    /// Validate the stack segment an inner-privilege transition is about
    /// to load: RPL and DPL must equal the target privilege and it must
    /// be writable data; `not_present` names the fault a missing segment
    /// raises at this site.
    pub(crate) fn validate_inner_stack_segment(
        &self,
        seg: &Segment,
        dpl: u8,
        error_selector: u16,
        not_present: ProcessorException,
    ) -> Result<(), ProcessorException> {
        if seg.get_rpl() != dpl {
            return Err(ProcessorException::ts(error_selector));
        }
        if seg.get_dpl() != dpl || seg.get_type() & 0x1a != 0x12 {
            return Err(ProcessorException::ts(error_selector));
        }
        if !seg.is_present() {
            return Err(not_present);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // JMP far, protected mode.
    // ------------------------------------------------------------------

    pub fn jump_far_pm(
        &mut self,
        bus: &mut MemoryBus,
        target_selector: u16,
        target_eip: u32,
    ) -> Result<(), ProcessorException> {
        let new_segment = self.get_segment(bus, target_selector)?;
        if new_segment.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        match new_segment.get_type() {
            seg_type::TASK_GATE => {
                if new_segment.get_dpl() < self.get_cpl()
                    || new_segment.get_dpl() < new_segment.get_rpl()
                {
                    return Err(ProcessorException::gp(target_selector));
                }
                if !new_segment.is_present() {
                    return Err(ProcessorException::np(target_selector));
                }
                let tss_selector = new_segment.gate_target_segment();
                // A task gate's TSS must live in the GDT.
                if tss_selector & 0x4 != 0 {
                    return Err(ProcessorException::gp(tss_selector & RPL_MASK));
                }
                let tss_segment = self.get_segment(bus, tss_selector)?;
                self.switch_task(bus, tss_segment, tss_selector, false)
            }
            seg_type::TSS_32_AVAILABLE | seg_type::TSS_32_BUSY => {
                self.switch_task(bus, new_segment, target_selector, true)
            }
            seg_type::TSS_16_AVAILABLE | seg_type::TSS_16_BUSY => {
                // TODO: 16-bit TSS task switch.
                warn!("16-bit TSS jump target not implemented");
                unimplemented!("jump through 16-bit TSS")
            }
            seg_type::CALL_GATE_16 | seg_type::CALL_GATE_32 => {
                warn!("call gate jump target not implemented");
                unimplemented!("jump through call gate")
            }
            t if is_nonconforming_code(t) => {
                if new_segment.get_rpl() != self.get_cpl()
                    || new_segment.get_dpl() > self.get_cpl()
                {
                    return Err(ProcessorException::gp(target_selector));
                }
                if !new_segment.is_present() {
                    return Err(ProcessorException::np(target_selector));
                }
                new_segment.check_address(target_eip)?;
                let mut seg = new_segment;
                seg.set_rpl(self.get_cpl());
                self.set_cs(seg)?;
                self.eip = target_eip;
                Ok(())
            }
            t if is_conforming_code(t) => {
                if new_segment.get_dpl() > self.get_cpl() {
                    return Err(ProcessorException::gp(target_selector));
                }
                if !new_segment.is_present() {
                    return Err(ProcessorException::np(target_selector));
                }
                new_segment.check_address(target_eip)?;
                let mut seg = new_segment;
                seg.set_rpl(self.get_cpl());
                self.set_cs(seg)?;
                self.eip = target_eip;
                Ok(())
            }
            t => {
                warn!(seg_type = t, "invalid segment type for far jump");
                Err(ProcessorException::gp(target_selector))
            }
        }
    }

    // ------------------------------------------------------------------
    // SYSENTER / SYSEXIT.
    // ------------------------------------------------------------------

    pub fn sysenter(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let cs_selector = self.get_msr(msr::SYSENTER_CS) as u32;
        if cs_selector == 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.interrupt_enable = false;
        self.resume = false;
        self.vm86_mode = false;

        // Flat 4 GiB ring-0 code and data, as the fast-path contract fixes.
        self.set_cs(Segment::protected_mode(
            SpaceKind::Linear,
            (cs_selector as u16) & RPL_MASK,
            0x00cf_9b00_0000_ffff,
        )?)?;
        self.set_cpl(bus, 0);
        self.set_ss(Segment::protected_mode(
            SpaceKind::Linear,
            (cs_selector as u16).wrapping_add(8) & RPL_MASK,
            0x00cf_9300_0000_ffff,
        )?)?;

        self.regs
            .set32(Gpr::Esp, self.get_msr(msr::SYSENTER_ESP) as u32);
        self.eip = self.get_msr(msr::SYSENTER_EIP) as u32;
        Ok(())
    }

    pub fn sysexit(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let cs_selector = self.get_msr(msr::SYSENTER_CS) as u32 as u16;
        if cs_selector & RPL_MASK == 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        if self.get_cpl() != 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }

        self.set_cs(Segment::protected_mode(
            SpaceKind::Linear,
            cs_selector.wrapping_add(16) | 3,
            0x00cf_fb00_0000_ffff,
        )?)?;
        self.set_cpl(bus, 3);
        let mut new_ss = Segment::protected_mode(
            SpaceKind::Linear,
            cs_selector.wrapping_add(24) | 3,
            0x00cf_f300_0000_ffff,
        )?;
        self.correct_alignment_checking(&mut new_ss);
        self.set_ss(new_ss)?;

        self.regs.set32(Gpr::Esp, self.regs.get32(Gpr::Ecx));
        self.eip = self.regs.get32(Gpr::Edx);
        Ok(())
    }
}

/// Per-variant offsets for the far-return stack frame.
struct RetFarWidths {
    outer_probe: u32,
    outer_esp_at: u32,
    outer_ss_at: u32,
    outer_implemented: bool,
    word_frame: bool,
    same_level_sp: SameLevelSp,
}

/// How the same-privilege return commits the stack pointer.
enum SameLevelSp {
    Sp16(u32),
    Esp32(u32),
}

impl SameLevelSp {
    fn commit(&self, cpu: &mut Processor) {
        match self {
            SameLevelSp::Sp16(v) => cpu.regs.set16(Gpr::Esp, *v as u16),
            SameLevelSp::Esp32(v) => cpu.regs.set32(Gpr::Esp, *v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallWidth {
    O16,
    O32A16,
    O32,
}
