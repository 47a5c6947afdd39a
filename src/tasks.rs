//! Hardware task switching through a 32-bit TSS.
//!
//! The outgoing context is saved into the current TSS, busy bits are
//! rewritten in the GDT under supervisor scope, and the incoming context
//! is validated field by field: any mismatch raises #TS with the
//! offending selector, which then travels through normal interrupt
//! delivery (and can escalate to a double fault there).

use tracing::{debug, warn};

use crate::exceptions::ProcessorException;
use crate::mem::MemoryBus;
use crate::processor::{
    read_supervisor_byte, read_supervisor_dword, read_supervisor_word, set_supervisor_dword,
    set_supervisor_word, Processor, RPL_MASK,
};
use crate::regs::Gpr;
use crate::segments::Segment;

// 32-bit TSS field offsets.
const TSS_EIP: u32 = 0x20;
const TSS_EFLAGS: u32 = 0x24;
const TSS_EAX: u32 = 0x28;
const TSS_ECX: u32 = 0x2c;
const TSS_EDX: u32 = 0x30;
const TSS_EBX: u32 = 0x34;
const TSS_ESP: u32 = 0x38;
const TSS_EBP: u32 = 0x3c;
const TSS_ESI: u32 = 0x40;
const TSS_EDI: u32 = 0x44;
const TSS_ES: u32 = 0x48;
const TSS_CS: u32 = 0x4c;
const TSS_SS: u32 = 0x50;
const TSS_DS: u32 = 0x54;
const TSS_FS: u32 = 0x58;
const TSS_GS: u32 = 0x5c;
const TSS_LDT: u32 = 0x60;
const TSS_TRAP: u32 = 0x64;

/// Busy bit in the high dword of a TSS descriptor.
const DESCRIPTOR_BUSY: u32 = 0x200;

impl Processor {
    /// Branch into another task through its TSS descriptor (or a task
    /// gate, in which case the gate-level checks already ran and
    /// `check_privilege` is false).
    pub(crate) fn switch_task(
        &mut self,
        bus: &mut MemoryBus,
        new_tss: Segment,
        target_selector: u16,
        check_privilege: bool,
    ) -> Result<(), ProcessorException> {
        if check_privilege
            && (new_tss.get_dpl() < self.get_cpl() || new_tss.get_dpl() < new_tss.get_rpl())
        {
            return Err(ProcessorException::gp(target_selector));
        }
        if !new_tss.is_present() {
            return Err(ProcessorException::np(target_selector));
        }
        if new_tss.get_limit() < 0x67 {
            return Err(ProcessorException::ts(target_selector));
        }
        if new_tss.get_type() & 0x2 != 0 {
            // Already busy.
            return Err(ProcessorException::gp(target_selector));
        }

        // Fault now, not mid-switch, if either TSS is paged out.
        read_supervisor_byte(bus, &new_tss, 0)?;
        read_supervisor_byte(bus, &self.tss, 0)?;

        if self.tss.get_limit() < 0x5f {
            return Err(ProcessorException::ts(self.tss.get_selector() & RPL_MASK));
        }

        // Save the outgoing context into the current TSS.
        let old_tss = self.tss.clone();
        set_supervisor_dword(bus, &old_tss, TSS_EIP, self.eip)?;
        set_supervisor_dword(bus, &old_tss, TSS_EFLAGS, self.get_eflags())?;
        for (offset, reg) in [
            (TSS_EAX, Gpr::Eax),
            (TSS_ECX, Gpr::Ecx),
            (TSS_EDX, Gpr::Edx),
            (TSS_EBX, Gpr::Ebx),
            (TSS_ESP, Gpr::Esp),
            (TSS_EBP, Gpr::Ebp),
            (TSS_ESI, Gpr::Esi),
            (TSS_EDI, Gpr::Edi),
        ] {
            set_supervisor_dword(bus, &old_tss, offset, self.regs.get32(reg))?;
        }
        for (offset, selector) in [
            (TSS_ES, self.es.get_selector()),
            (TSS_CS, self.cs.get_selector()),
            (TSS_SS, self.ss.get_selector()),
            (TSS_DS, self.ds.get_selector()),
            (TSS_FS, self.fs.get_selector()),
            (TSS_GS, self.gs.get_selector()),
        ] {
            set_supervisor_word(bus, &old_tss, offset, selector)?;
        }

        // Incoming selector file.
        let es_selector = read_supervisor_word(bus, &new_tss, TSS_ES)?;
        let cs_selector = read_supervisor_word(bus, &new_tss, TSS_CS)?;
        let ss_selector = read_supervisor_word(bus, &new_tss, TSS_SS)?;
        let ds_selector = read_supervisor_word(bus, &new_tss, TSS_DS)?;
        let fs_selector = read_supervisor_word(bus, &new_tss, TSS_FS)?;
        let gs_selector = read_supervisor_word(bus, &new_tss, TSS_GS)?;
        let ldt_selector = read_supervisor_word(bus, &new_tss, TSS_LDT)?;
        let trap_word = read_supervisor_word(bus, &new_tss, TSS_TRAP)?;
        if trap_word & 0x1 != 0 {
            debug!("incoming task requests a debug trap; not modeled");
        }

        // The outgoing segment registers keep their descriptor caches but
        // take the incoming selectors, so a fault between here and the
        // final validation can still name them.
        self.es.set_selector_raw(es_selector);
        self.cs.set_selector_raw(cs_selector);
        self.ss.set_selector_raw(ss_selector);
        self.ds.set_selector_raw(ds_selector);
        if !self.fs.is_null() {
            self.fs.set_selector_raw(fs_selector);
        }
        if !self.gs.is_null() {
            self.gs.set_selector_raw(gs_selector);
        }

        // Busy-bit handover in the GDT.
        let old_descriptor_at = u32::from(old_tss.get_selector() & 0xfff8) + 4;
        let high = read_supervisor_dword(bus, &self.gdtr, old_descriptor_at)?;
        set_supervisor_dword(bus, &self.gdtr, old_descriptor_at, high & !DESCRIPTOR_BUSY)?;

        let new_descriptor_at = u32::from(target_selector & 0xfff8) + 4;
        let high = read_supervisor_dword(bus, &self.gdtr, new_descriptor_at)?;
        set_supervisor_dword(bus, &self.gdtr, new_descriptor_at, high | DESCRIPTOR_BUSY)?;

        self.set_task_switched_flag();
        self.tss = self.get_segment(bus, target_selector)?;

        // Incoming register file and flags. The VM bit is committed
        // silently; whether we resume in VM86 is checked below.
        self.eip = read_supervisor_dword(bus, &self.tss, TSS_EIP)?;
        let new_eflags = read_supervisor_dword(bus, &self.tss, TSS_EFLAGS)?;
        for (offset, reg) in [
            (TSS_EAX, Gpr::Eax),
            (TSS_ECX, Gpr::Ecx),
            (TSS_EDX, Gpr::Edx),
            (TSS_EBX, Gpr::Ebx),
            (TSS_ESP, Gpr::Esp),
            (TSS_EBP, Gpr::Ebp),
            (TSS_ESI, Gpr::Esi),
            (TSS_EDI, Gpr::Edi),
        ] {
            let value = read_supervisor_dword(bus, &self.tss, offset)?;
            self.regs.set32(reg, value);
        }
        self.set_eflags_no_switch(new_eflags);

        // A task switch disables the local breakpoint enables.
        self.dr7 &= !0x155;

        // Force a full privilege re-derivation; a mis-loaded SS below must
        // not be reachable at an inner ring.
        self.set_cpl(bus, 3);

        if ldt_selector & 0x4 != 0 {
            return Err(ProcessorException::ts(ldt_selector));
        }
        if ldt_selector & RPL_MASK != 0 {
            self.gdtr
                .check_address(u32::from(ldt_selector & !0x7) + 7)?;
            let access = read_supervisor_byte(bus, &self.gdtr, u32::from(ldt_selector & !0x7) + 5)?;
            if access & 0xe != 2 {
                warn!(
                    access,
                    "LDT selector in task switch names a non-LDT descriptor"
                );
                return Err(ProcessorException::ts(ldt_selector & RPL_MASK));
            }
            let new_ldt = self.get_segment(bus, ldt_selector)?;
            if !new_ldt.is_system() || !new_ldt.is_present() {
                return Err(ProcessorException::ts(ldt_selector & RPL_MASK));
            }
            self.ldtr = new_ldt;
        }

        if self.is_virtual8086_mode() {
            // TODO: rebuild the six segments as VM86 variants.
            warn!("task switch into a VM86 task not implemented");
            unimplemented!("task switch to VM86 mode")
        }

        self.set_cpl(bus, (cs_selector & 3) as u8);

        // Stack segment first; everything else pushes through it on a
        // nested fault.
        if ss_selector & RPL_MASK == 0 {
            return Err(ProcessorException::ts(ss_selector & RPL_MASK));
        }
        let new_ss = self.get_segment(bus, ss_selector)?;
        if new_ss.is_system() || new_ss.get_type() & 0x18 == 0x18 || new_ss.get_type() & 0x1a != 0x12
        {
            return Err(ProcessorException::ts(ss_selector & RPL_MASK));
        }
        if !new_ss.is_present() {
            return Err(ProcessorException::ss(ss_selector & RPL_MASK));
        }
        if new_ss.get_dpl() != (cs_selector & 3) as u8 {
            warn!(
                ss_dpl = new_ss.get_dpl(),
                cs_rpl = cs_selector & 3,
                "SS.DPL does not match CS.RPL in task switch"
            );
            return Err(ProcessorException::ts(ss_selector & RPL_MASK));
        }
        if new_ss.get_dpl() != new_ss.get_rpl() {
            return Err(ProcessorException::ts(ss_selector & RPL_MASK));
        }
        self.set_ss(new_ss)?;

        let new_cs_rpl = (cs_selector & 3) as u8;
        for (selector, which) in [
            (ds_selector, DataSeg::Ds),
            (es_selector, DataSeg::Es),
            (fs_selector, DataSeg::Fs),
            (gs_selector, DataSeg::Gs),
        ] {
            if selector & RPL_MASK == 0 {
                continue;
            }
            let seg = self.get_segment(bus, selector)?;
            let t = seg.get_type();
            if seg.is_system() || (t & 0x18 == 0x18 && t & 0x2 == 0) {
                return Err(ProcessorException::ts(selector & RPL_MASK));
            }
            if t & 0x1c != 0x1c {
                // Not conforming code: ordinary privilege rules apply.
                if seg.get_rpl() > seg.get_dpl() || new_cs_rpl > seg.get_dpl() {
                    return Err(ProcessorException::ts(selector & RPL_MASK));
                }
            }
            if !seg.is_present() {
                return Err(ProcessorException::np(selector & RPL_MASK));
            }
            match which {
                DataSeg::Ds => self.set_ds(seg),
                DataSeg::Es => self.set_es(seg),
                DataSeg::Fs => self.set_fs(seg),
                DataSeg::Gs => self.set_gs(seg),
            }
        }

        if cs_selector & RPL_MASK == 0 {
            return Err(ProcessorException::ts(cs_selector & RPL_MASK));
        }
        let new_cs = self.get_segment(bus, cs_selector)?;
        let t = new_cs.get_type();
        if new_cs.is_system() || t & 0x18 == 0x10 {
            return Err(ProcessorException::ts(cs_selector & RPL_MASK));
        }
        let conforming = t & 0x1c == 0x1c;
        if !conforming && new_cs.get_dpl() != new_cs.get_rpl() {
            return Err(ProcessorException::ts(cs_selector & RPL_MASK));
        }
        if conforming && new_cs.get_dpl() > new_cs.get_rpl() {
            return Err(ProcessorException::ts(cs_selector & RPL_MASK));
        }
        if !new_cs.is_present() {
            return Err(ProcessorException::np(cs_selector & RPL_MASK));
        }
        self.set_cs(new_cs)?;
        self.cs.check_address(self.eip)?;

        Ok(())
    }
}

#[derive(Clone, Copy)]
enum DataSeg {
    Ds,
    Es,
    Fs,
    Gs,
}
