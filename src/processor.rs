//! The architectural processor: register file, lazy flags, segmentation
//! state, control/debug registers, MSRs, privilege level, and the
//! interrupt-request word shared with device threads.
//!
//! One `Processor` exists per emulated CPU. Lifecycle: construct with a
//! [`CpuConfig`], wire the memory bus and collaborators, then [`reset`]
//! (power-on or triple fault) and run blocks against it.
//!
//! [`reset`]: Processor::reset

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::exceptions::{ExecEvent, ModeSwitch, ProcessorException};
use crate::flags::LazyFlags;
use crate::mem::{MemoryBus, SpaceKind};
use crate::regs::{Gpr, RegFile};
use crate::segments::Segment;
use crate::snapshot::{Decoder, Encoder, SnapshotError};
use crate::system::{Clock, Fpu, InterruptController, NullFpu};

pub const IFLAGS_HARDWARE_INTERRUPT: u32 = 0x1;
pub const IFLAGS_PROCESSOR_EXCEPTION: u32 = 0x2;
pub const IFLAGS_RESET_REQUEST: u32 = 0x4;

pub const CR0_PROTECTION_ENABLE: u32 = 0x1;
pub const CR0_MONITOR_COPROCESSOR: u32 = 0x2;
pub const CR0_FPU_EMULATION: u32 = 0x4;
pub const CR0_TASK_SWITCHED: u32 = 0x8;
pub const CR0_EXTENSION_TYPE: u32 = 0x10;
pub const CR0_NUMERIC_ERROR: u32 = 0x20;
pub const CR0_WRITE_PROTECT: u32 = 0x10000;
pub const CR0_ALIGNMENT_MASK: u32 = 0x40000;
pub const CR0_NOT_WRITETHROUGH: u32 = 0x2000_0000;
pub const CR0_CACHE_DISABLE: u32 = 0x4000_0000;
pub const CR0_PAGING: u32 = 0x8000_0000;

pub const CR3_PAGE_WRITES_TRANSPARENT: u32 = 0x8;
pub const CR3_PAGE_CACHE_DISABLE: u32 = 0x10;

pub const CR4_VIRTUAL8086_MODE_EXTENSIONS: u32 = 0x1;
pub const CR4_PROTECTED_MODE_VIRTUAL_INTERRUPTS: u32 = 0x2;
pub const CR4_TIME_STAMP_DISABLE: u32 = 0x4;
pub const CR4_DEBUGGING_EXTENSIONS: u32 = 0x8;
pub const CR4_PAGE_SIZE_EXTENSIONS: u32 = 0x10;
pub const CR4_PHYSICAL_ADDRESS_EXTENSION: u32 = 0x20;
pub const CR4_MACHINE_CHECK_ENABLE: u32 = 0x40;
pub const CR4_PAGE_GLOBAL_ENABLE: u32 = 0x80;

pub const RPL_MASK: u16 = 0xfffc;

/// Segment register numbering, matching the reg field encoding of segment
/// override prefixes and mov instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SegIndex {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// Map a decoded segment operand name to its index; parsed once at decode
/// time.
pub fn segment_index(name: &str) -> SegIndex {
    match name {
        "es" => SegIndex::Es,
        "cs" => SegIndex::Cs,
        "ss" => SegIndex::Ss,
        "ds" => SegIndex::Ds,
        "fs" => SegIndex::Fs,
        "gs" => SegIndex::Gs,
        _ => panic!("unknown segment: {name}"),
    }
}

/// Options consumed by this core.
#[derive(Debug, Clone, Copy)]
pub struct CpuConfig {
    /// Decoder block-size cap. When 1, HLT skips host sleeps because the
    /// caller is single-stepping.
    pub max_instructions_per_block: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            max_instructions_per_block: 1000,
        }
    }
}

impl CpuConfig {
    pub fn skip_sleeps(&self) -> bool {
        self.max_instructions_per_block == 1
    }
}

pub struct Processor {
    pub regs: RegFile,
    pub eip: u32,

    pub cs: Segment,
    pub ds: Segment,
    pub ss: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub idtr: Segment,
    pub gdtr: Segment,
    pub ldtr: Segment,
    pub tss: Segment,

    /// The six lazily-derived arithmetic flags.
    pub arith: LazyFlags,
    /// The directly-stored EFLAGS control bits.
    pub df: bool,
    pub trap: bool,
    pub interrupt_enable: bool,
    pub iopl: u32,
    pub nested_task: bool,
    pub resume: bool,
    pub vm86_mode: bool,
    pub alignment_check: bool,
    pub virtual_interrupt: bool,
    pub virtual_interrupt_pending: bool,
    pub id_flag: bool,

    cr0: u32,
    cr1: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr4: u32,
    pub dr5: u32,
    pub dr6: u32,
    pub dr7: u32,

    interrupt_flags: Arc<AtomicU32>,
    /// STI / MOV SS interrupt shadow: non-zero masks maskable delivery
    /// until the next instruction retires.
    interrupt_inhibit: u8,
    alignment_checking: bool,
    msrs: BTreeMap<u32, u64>,
    reset_time: u64,
    cpl: u8,
    pub fpu: Box<dyn Fpu>,
    config: CpuConfig,
}

impl Processor {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            regs: RegFile::new(),
            eip: 0,
            cs: Segment::real(SpaceKind::Physical, 0),
            ds: Segment::real(SpaceKind::Physical, 0),
            ss: Segment::real(SpaceKind::Physical, 0),
            es: Segment::real(SpaceKind::Physical, 0),
            fs: Segment::real(SpaceKind::Physical, 0),
            gs: Segment::real(SpaceKind::Physical, 0),
            idtr: Segment::descriptor_table(SpaceKind::Physical, 0, 0xffff),
            gdtr: Segment::descriptor_table(SpaceKind::Physical, 0, 0xffff),
            ldtr: Segment::null(),
            tss: Segment::null(),
            arith: LazyFlags::default(),
            df: false,
            trap: false,
            interrupt_enable: false,
            iopl: 0,
            nested_task: false,
            resume: false,
            vm86_mode: false,
            alignment_check: false,
            virtual_interrupt: false,
            virtual_interrupt_pending: false,
            id_flag: false,
            cr0: CR0_CACHE_DISABLE | CR0_NOT_WRITETHROUGH | CR0_EXTENSION_TYPE,
            cr1: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr4: 0,
            dr5: 0,
            dr6: 0xffff_0ff0,
            dr7: 0x700,
            interrupt_flags: Arc::new(AtomicU32::new(0)),
            interrupt_inhibit: 0,
            alignment_checking: false,
            msrs: BTreeMap::new(),
            reset_time: 0,
            cpl: 0,
            fpu: Box::new(NullFpu),
            config,
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Power-on / triple-fault reset.
    pub fn reset(&mut self, bus: &mut MemoryBus) {
        self.reset_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.regs = RegFile::new();

        self.interrupt_flags.store(0, Ordering::SeqCst);
        self.interrupt_inhibit = 0;
        self.cpl = 0;
        bus.linear.reset();
        self.alignment_checking = false;

        self.eip = 0xfff0;

        self.cr0 = CR0_CACHE_DISABLE | CR0_NOT_WRITETHROUGH | CR0_EXTENSION_TYPE;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;

        self.dr0 = 0;
        self.dr1 = 0;
        self.dr2 = 0;
        self.dr3 = 0;
        self.dr6 = 0xffff_0ff0;
        self.dr7 = 0x700;

        self.arith = LazyFlags::default();
        self.df = false;
        self.trap = false;
        self.interrupt_enable = false;
        self.nested_task = false;
        self.resume = false;
        self.vm86_mode = false;
        self.alignment_check = false;
        self.virtual_interrupt = false;
        self.virtual_interrupt_pending = false;
        self.id_flag = false;
        self.iopl = 0;

        self.cs = Segment::real(SpaceKind::Physical, 0xf000);
        self.ds = Segment::real(SpaceKind::Physical, 0);
        self.ss = Segment::real(SpaceKind::Physical, 0);
        self.es = Segment::real(SpaceKind::Physical, 0);
        self.fs = Segment::real(SpaceKind::Physical, 0);
        self.gs = Segment::real(SpaceKind::Physical, 0);

        self.idtr = Segment::descriptor_table(SpaceKind::Physical, 0, 0xffff);
        self.gdtr = Segment::descriptor_table(SpaceKind::Physical, 0, 0xffff);
        self.ldtr = Segment::null();
        self.tss = Segment::null();

        self.msrs.clear();
        self.fpu.init();
    }

    // ------------------------------------------------------------------
    // Modes and privilege.
    // ------------------------------------------------------------------

    pub fn is_protected_mode(&self) -> bool {
        self.cr0 & CR0_PROTECTION_ENABLE != 0
    }

    pub fn is_virtual8086_mode(&self) -> bool {
        self.vm86_mode
    }

    pub fn get_cpl(&self) -> u8 {
        self.cpl
    }

    /// CPL changes also flip the linear space's supervisor flag and
    /// re-derive alignment checking; callers pair this with a CS.RPL
    /// update.
    pub fn set_cpl(&mut self, bus: &mut MemoryBus, value: u8) {
        self.cpl = value & 3;
        bus.linear.set_supervisor(self.cpl == 0);
        self.check_alignment_checking();
    }

    pub fn alignment_checking(&self) -> bool {
        self.alignment_checking
    }

    fn check_alignment_checking(&mut self) {
        let live = self.cpl == 3 && self.alignment_check && self.cr0 & CR0_ALIGNMENT_MASK != 0;
        if live != self.alignment_checking {
            debug!(enabled = live, "alignment checking toggled");
            self.alignment_checking = live;
            self.update_alignment_checking_in_data_segments();
        }
    }

    fn update_alignment_checking_in_data_segments(&mut self) {
        let space = if self.alignment_checking {
            SpaceKind::AlignmentChecked
        } else {
            SpaceKind::Linear
        };
        self.ds.set_address_space(space);
        self.ss.set_address_space(space);
        self.es.set_address_space(space);
        self.fs.set_address_space(space);
        self.gs.set_address_space(space);
    }

    /// Move a freshly resolved data segment onto the alignment-checked
    /// overlay when checking is live.
    pub fn correct_alignment_checking(&self, segment: &mut Segment) {
        if self.alignment_checking && segment.get_type() & 0x18 == 0x10 {
            segment.set_address_space(SpaceKind::AlignmentChecked);
        }
    }

    pub(crate) fn convert_segments_to_real_mode(&mut self) {
        for index in [
            SegIndex::Cs,
            SegIndex::Ds,
            SegIndex::Ss,
            SegIndex::Es,
            SegIndex::Fs,
            SegIndex::Gs,
        ] {
            let selector = self.segment(index).get_selector();
            let seg = Segment::real(SpaceKind::Physical, selector);
            match index {
                SegIndex::Cs => self.cs = seg,
                SegIndex::Ds => self.ds = seg,
                SegIndex::Ss => self.ss = seg,
                SegIndex::Es => self.es = seg,
                SegIndex::Fs => self.fs = seg,
                SegIndex::Gs => self.gs = seg,
            }
        }
    }

    pub(crate) fn convert_segments_to_protected_mode(&mut self) {
        self.cs.set_address_space(SpaceKind::Linear);
        self.ds.set_address_space(SpaceKind::Linear);
        self.ss.set_address_space(SpaceKind::Linear);
        self.es.set_address_space(SpaceKind::Linear);
        self.fs.set_address_space(SpaceKind::Linear);
        self.gs.set_address_space(SpaceKind::Linear);
    }

    // ------------------------------------------------------------------
    // Segment registers.
    // ------------------------------------------------------------------

    pub fn segment(&self, index: SegIndex) -> &Segment {
        match index {
            SegIndex::Es => &self.es,
            SegIndex::Cs => &self.cs,
            SegIndex::Ss => &self.ss,
            SegIndex::Ds => &self.ds,
            SegIndex::Fs => &self.fs,
            SegIndex::Gs => &self.gs,
        }
    }

    /// Install an already-resolved CS. The null segment is never legal
    /// here.
    pub fn set_cs(&mut self, seg: Segment) -> Result<(), ProcessorException> {
        if seg.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.cs = seg;
        Ok(())
    }

    /// Install an already-resolved SS. The null segment is never legal
    /// here.
    pub fn set_ss(&mut self, seg: Segment) -> Result<(), ProcessorException> {
        if seg.is_null() {
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        self.ss = seg;
        Ok(())
    }

    pub fn set_ds(&mut self, seg: Segment) {
        self.ds = seg;
    }

    pub fn set_es(&mut self, seg: Segment) {
        self.es = seg;
    }

    pub fn set_fs(&mut self, seg: Segment) {
        self.fs = seg;
    }

    pub fn set_gs(&mut self, seg: Segment) {
        self.gs = seg;
    }

    /// Selector write to a segment register: a bare store in real and
    /// VM86 modes, a checked descriptor load in protected mode.
    pub fn set_segment_selector(
        &mut self,
        bus: &mut MemoryBus,
        index: SegIndex,
        selector: u16,
    ) -> Result<(), ProcessorException> {
        if !self.is_protected_mode() || self.is_virtual8086_mode() {
            match index {
                SegIndex::Es => self.es.set_selector(selector),
                SegIndex::Cs => self.cs.set_selector(selector),
                SegIndex::Ss => self.ss.set_selector(selector),
                SegIndex::Ds => self.ds.set_selector(selector),
                SegIndex::Fs => self.fs.set_selector(selector),
                SegIndex::Gs => self.gs.set_selector(selector),
            };
            return Ok(());
        }
        let seg = self.load_checked_segment(bus, selector)?;
        match index {
            SegIndex::Es => self.set_es(seg),
            SegIndex::Cs => self.set_cs(seg)?,
            SegIndex::Ss => self.set_ss(seg)?,
            SegIndex::Ds => self.set_ds(seg),
            SegIndex::Fs => self.set_fs(seg),
            SegIndex::Gs => self.set_gs(seg),
        }
        Ok(())
    }

    /// Resolve a selector against GDT/LDT, reading the table in
    /// supervisor mode. Presence is not checked here; `get_type` on the
    /// result is what transfer code dispatches on.
    pub fn get_segment(
        &self,
        bus: &mut MemoryBus,
        selector: u16,
    ) -> Result<Segment, ProcessorException> {
        let offset = u32::from(selector & 0xfff8);
        let table = if selector & 0x4 != 0 {
            &self.ldtr
        } else {
            if selector < 4 {
                return Ok(Segment::null());
            }
            &self.gdtr
        };
        if offset.checked_add(7).map_or(true, |end| end > table.get_limit()) {
            return Err(ProcessorException::gp(selector & RPL_MASK));
        }
        let descriptor = bus.with_supervisor(|bus| table.get_qword(bus, offset))?;
        let mut seg = Segment::protected_mode(SpaceKind::Linear, selector, descriptor)?;
        self.correct_alignment_checking(&mut seg);
        Ok(seg)
    }

    /// Checked load used by data-segment moves: null selectors yield the
    /// null segment, non-present descriptors raise #NP(selector).
    pub fn load_checked_segment(
        &self,
        bus: &mut MemoryBus,
        selector: u16,
    ) -> Result<Segment, ProcessorException> {
        if selector < 4 {
            return Ok(Segment::null());
        }
        let seg = self.get_segment(bus, selector)?;
        if !seg.is_present() {
            return Err(ProcessorException::np(selector));
        }
        Ok(seg)
    }

    pub fn create_descriptor_table_segment(&self, base: u32, limit: u32) -> Segment {
        Segment::descriptor_table(SpaceKind::Linear, base, limit)
    }

    /// Linear address of the next instruction fetch.
    pub fn instruction_pointer(&self) -> Result<u32, ProcessorException> {
        self.cs.translate_address_read(self.eip)
    }

    // ------------------------------------------------------------------
    // EFLAGS.
    // ------------------------------------------------------------------

    pub fn of(&self) -> bool {
        self.arith.of()
    }

    pub fn set_of(&mut self, val: bool) {
        self.arith.set_of(val);
    }

    pub fn sf(&self) -> bool {
        self.arith.sf()
    }

    pub fn set_sf(&mut self, val: bool) {
        self.arith.set_sf(val);
    }

    pub fn zf(&self) -> bool {
        self.arith.zf()
    }

    pub fn set_zf(&mut self, val: bool) {
        self.arith.set_zf(val);
    }

    pub fn af(&self) -> bool {
        self.arith.af()
    }

    pub fn set_af(&mut self, val: bool) {
        self.arith.set_af(val);
    }

    pub fn pf(&self) -> bool {
        self.arith.pf()
    }

    pub fn set_pf(&mut self, val: bool) {
        self.arith.set_pf(val);
    }

    pub fn cf(&self) -> bool {
        self.arith.cf()
    }

    pub fn set_cf(&mut self, val: bool) {
        self.arith.set_cf(val);
    }

    pub fn get_io_privilege_level(&self) -> u32 {
        self.iopl
    }

    /// Assemble the architectural EFLAGS image: reserved bit 1 set, the
    /// six arithmetic bits resolved, control bits in their places.
    pub fn get_eflags(&self) -> u32 {
        let mut result = 0x2 | self.arith.arith_bits();
        if self.trap {
            result |= 0x100;
        }
        if self.interrupt_enable {
            result |= 0x200;
        }
        if self.df {
            result |= 0x400;
        }
        result |= (self.iopl & 3) << 12;
        if self.nested_task {
            result |= 0x4000;
        }
        if self.resume {
            result |= 0x1_0000;
        }
        if self.vm86_mode {
            result |= 0x2_0000;
        }
        if self.alignment_check {
            result |= 0x4_0000;
        }
        if self.virtual_interrupt {
            result |= 0x8_0000;
        }
        if self.virtual_interrupt_pending {
            result |= 0x10_0000;
        }
        if self.id_flag {
            result |= 0x20_0000;
        }
        result
    }

    /// 16-bit flag image write (real-mode IRET and POPF).
    pub fn set_flags16(&mut self, flags: u16) {
        let flags = u32::from(flags);
        self.arith.load_arith_bits(flags);
        self.trap = flags & 0x100 != 0;
        self.interrupt_enable = flags & 0x200 != 0;
        self.df = flags & 0x400 != 0;
        self.iopl = (flags >> 12) & 3;
        self.nested_task = flags & 0x4000 != 0;
    }

    pub fn set_eflags_masked(&mut self, eflags: u32, change_mask: u32) -> Result<(), ModeSwitch> {
        self.set_eflags((self.get_eflags() & !change_mask) | (eflags & change_mask))
    }

    /// Full EFLAGS write. An AC change re-derives the alignment-checked
    /// data-segment binding; a VM-bit change unwinds as the matching mode
    /// switch after the bit is committed.
    pub fn set_eflags(&mut self, eflags: u32) -> Result<(), ModeSwitch> {
        self.arith.load_arith_bits(eflags);
        self.trap = eflags & 0x100 != 0;
        self.interrupt_enable = eflags & 0x200 != 0;
        self.df = eflags & 0x400 != 0;
        self.iopl = (eflags >> 12) & 3;
        self.nested_task = eflags & 0x4000 != 0;
        self.resume = eflags & 0x1_0000 != 0;
        self.virtual_interrupt = eflags & 0x8_0000 != 0;
        self.virtual_interrupt_pending = eflags & 0x10_0000 != 0;
        self.id_flag = eflags & 0x20_0000 != 0;

        if self.alignment_check != (eflags & 0x4_0000 != 0) {
            self.alignment_check = eflags & 0x4_0000 != 0;
            self.check_alignment_checking();
        }

        if self.vm86_mode != (eflags & 0x2_0000 != 0) {
            self.vm86_mode = eflags & 0x2_0000 != 0;
            return Err(if self.vm86_mode {
                ModeSwitch::Virtual8086
            } else {
                ModeSwitch::Protected
            });
        }
        Ok(())
    }

    /// EFLAGS write that commits a VM-bit change without unwinding. Task
    /// switches restore the incoming context's flags this way and then
    /// inspect the mode themselves.
    pub(crate) fn set_eflags_no_switch(&mut self, eflags: u32) {
        self.arith.load_arith_bits(eflags);
        self.trap = eflags & 0x100 != 0;
        self.interrupt_enable = eflags & 0x200 != 0;
        self.df = eflags & 0x400 != 0;
        self.iopl = (eflags >> 12) & 3;
        self.nested_task = eflags & 0x4000 != 0;
        self.resume = eflags & 0x1_0000 != 0;
        self.vm86_mode = eflags & 0x2_0000 != 0;
        self.virtual_interrupt = eflags & 0x8_0000 != 0;
        self.virtual_interrupt_pending = eflags & 0x10_0000 != 0;
        self.id_flag = eflags & 0x20_0000 != 0;
        if self.alignment_check != (eflags & 0x4_0000 != 0) {
            self.alignment_check = eflags & 0x4_0000 != 0;
            self.check_alignment_checking();
        }
    }

    // ------------------------------------------------------------------
    // Control and debug registers, MSRs.
    // ------------------------------------------------------------------

    pub fn get_cr0(&self) -> u32 {
        self.cr0
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PAGING != 0
    }

    /// CR0 write: forwards paging/caching/WP changes to the linear space,
    /// re-derives alignment checking, and on a PE toggle converts the
    /// segment file and unwinds as a mode switch.
    pub fn set_cr0(&mut self, bus: &mut MemoryBus, value: u32) -> Result<(), ExecEvent> {
        let value = value | CR0_EXTENSION_TYPE;
        let changed = value ^ self.cr0;
        if changed == 0 {
            return Ok(());
        }

        self.cr0 = value;

        let paging_changed = changed & CR0_PAGING != 0;
        let caching_changed = changed & CR0_CACHE_DISABLE != 0;
        let mode_switch = changed & CR0_PROTECTION_ENABLE != 0;
        let wp_changed = changed & CR0_WRITE_PROTECT != 0;
        let alignment_changed = changed & CR0_ALIGNMENT_MASK != 0;

        if changed & CR0_NOT_WRITETHROUGH != 0 {
            debug!("unimplemented CR0 bits changed, now {value:#x}");
        }

        if paging_changed && value & CR0_PROTECTION_ENABLE == 0 && value & CR0_PAGING != 0 {
            return Err(ProcessorException::GENERAL_PROTECTION_0.into());
        }

        if alignment_changed {
            self.check_alignment_checking();
        }

        if paging_changed || caching_changed {
            bus.linear.set_paging_enabled(value & CR0_PAGING != 0);
            bus.linear.set_page_cache_enabled(value & CR0_CACHE_DISABLE == 0);
        }

        if wp_changed {
            bus.linear
                .set_write_protect_user_pages(value & CR0_WRITE_PROTECT != 0);
        }

        if mode_switch {
            if value & CR0_PROTECTION_ENABLE != 0 {
                self.convert_segments_to_protected_mode();
                return Err(ModeSwitch::Protected.into());
            }
            self.set_cpl(bus, 0);
            self.convert_segments_to_real_mode();
            return Err(ModeSwitch::Real.into());
        }
        Ok(())
    }

    /// Set CR0.TS without going through the mode-switch machinery.
    pub(crate) fn set_task_switched_flag(&mut self) {
        self.cr0 |= CR0_TASK_SWITCHED;
    }

    pub fn get_cr2(&self) -> u32 {
        self.cr2
    }

    pub fn set_cr2(&mut self, value: u32) {
        self.cr2 = value;
    }

    pub fn get_cr3(&self) -> u32 {
        self.cr3
    }

    pub fn set_cr3(&mut self, bus: &mut MemoryBus, value: u32) {
        self.cr3 = value;
        bus.linear
            .set_page_write_through(value & CR3_PAGE_WRITES_TRANSPARENT != 0);
        bus.linear
            .set_page_cache_enabled(value & CR3_PAGE_CACHE_DISABLE == 0);
        bus.linear.set_page_directory_base_address(value);
    }

    pub fn get_cr4(&self) -> u32 {
        self.cr4
    }

    pub fn set_cr4(&mut self, bus: &mut MemoryBus, value: u32) {
        if self.cr4 == value {
            return;
        }
        self.cr4 = (self.cr4 & !0x5f) | (value & 0x5f);
        if self.cr4 & CR4_VIRTUAL8086_MODE_EXTENSIONS != 0 {
            warn!("virtual-8086 mode extensions enabled");
        }
        if self.cr4 & CR4_PROTECTED_MODE_VIRTUAL_INTERRUPTS != 0 {
            warn!("protected-mode virtual interrupts enabled");
        }
        if self.cr4 & CR4_DEBUGGING_EXTENSIONS != 0 {
            warn!("debugging extensions enabled");
        }
        if self.cr4 & CR4_TIME_STAMP_DISABLE != 0 {
            warn!("RDTSC restricted to CPL 0");
        }
        if self.cr4 & CR4_PHYSICAL_ADDRESS_EXTENSION != 0 {
            unimplemented!("36-bit addressing enabled");
        }
        bus.linear
            .set_global_pages_enabled(value & CR4_PAGE_GLOBAL_ENABLE != 0);
        bus.linear
            .set_page_size_extensions_enabled(self.cr4 & CR4_PAGE_SIZE_EXTENSIONS != 0);
    }

    pub fn get_cr(&self, index: usize) -> u32 {
        match index {
            0 => self.cr0,
            2 => self.cr2,
            3 => self.cr3,
            4 => self.cr4,
            _ => panic!("unknown control register: cr{index}"),
        }
    }

    pub fn set_cr(
        &mut self,
        bus: &mut MemoryBus,
        index: usize,
        value: u32,
    ) -> Result<(), ExecEvent> {
        match index {
            0 => self.set_cr0(bus, value)?,
            2 => self.set_cr2(value),
            3 => self.set_cr3(bus, value),
            4 => self.set_cr4(bus, value),
            _ => panic!("unknown control register: cr{index}"),
        }
        Ok(())
    }

    pub fn get_dr(&self, index: usize) -> u32 {
        match index {
            0 => self.dr0,
            1 => self.dr1,
            2 => self.dr2,
            3 => self.dr3,
            4 => self.dr4,
            5 => self.dr5,
            6 => self.dr6,
            7 => self.dr7,
            _ => panic!("unknown debug register: dr{index}"),
        }
    }

    pub fn set_dr(&mut self, index: usize, value: u32) {
        match index {
            0 => self.dr0 = value,
            1 => self.dr1 = value,
            2 => self.dr2 = value,
            3 => self.dr3 = value,
            4 => self.dr4 = value,
            5 => self.dr5 = value,
            6 => self.dr6 = value,
            7 => self.dr7 = value,
            _ => panic!("unknown debug register: dr{index}"),
        }
    }

    pub fn get_msr(&self, index: u32) -> u64 {
        match self.msrs.get(&index) {
            Some(value) => *value,
            None => {
                info!("reading unset MSR {index:#x}, returning 0");
                0
            }
        }
    }

    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
    }

    // ------------------------------------------------------------------
    // Interrupt-request word (shared with device threads).
    // ------------------------------------------------------------------

    /// Cloneable handle for external interrupt sources.
    pub fn interrupt_line(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.interrupt_flags)
    }

    pub fn raise_interrupt(&self) {
        self.interrupt_flags
            .fetch_or(IFLAGS_HARDWARE_INTERRUPT, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt_flags
            .fetch_and(!IFLAGS_HARDWARE_INTERRUPT, Ordering::SeqCst);
    }

    pub fn request_reset(&self) {
        self.interrupt_flags
            .fetch_or(IFLAGS_RESET_REQUEST, Ordering::SeqCst);
    }

    /// Mask maskable interrupts until one more instruction has retired
    /// (the shadow after STI, MOV SS and POP SS).
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 1;
    }

    /// Called by the execution engine after each retired instruction to
    /// age the interrupt shadow.
    pub fn retire_instruction(&mut self) {
        if self.interrupt_inhibit > 0 {
            self.interrupt_inhibit -= 1;
        }
    }

    pub(crate) fn interrupts_inhibited(&self) -> bool {
        self.interrupt_inhibit > 0
    }

    pub(crate) fn interrupt_flags_value(&self) -> u32 {
        self.interrupt_flags.load(Ordering::SeqCst)
    }

    pub(crate) fn consume_interrupt_flag(&self, flag: u32) {
        self.interrupt_flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// HLT: spin the virtual clock until a hardware interrupt is pending.
    pub fn wait_for_interrupt(&mut self, clock: &mut dyn Clock) {
        debug!(nanos = clock.get_emulated_nanos(), "halt entered");
        let mut spins = 0u64;
        while self.interrupt_flags.load(Ordering::SeqCst) & IFLAGS_HARDWARE_INTERRUPT == 0 {
            clock.update_now_and_process(!self.config.skip_sleeps());
            spins += 1;
        }
        debug!(
            nanos = clock.get_emulated_nanos(),
            spins, "halt left on pending interrupt"
        );
    }

    /// Route an FPU error: IRQ 13 through the controller on pre-487
    /// wiring, #MF when CR0.NE selects native reporting.
    pub fn report_fpu_exception(
        &self,
        pic: &mut dyn InterruptController,
    ) -> Result<(), ProcessorException> {
        if self.cr0 & CR0_NUMERIC_ERROR == 0 {
            info!("reporting FPU error via IRQ 13");
            pic.set_irq(13, true);
            Ok(())
        } else {
            info!("reporting FPU error via #MF");
            Err(ProcessorException::FLOATING_POINT)
        }
    }

    // ------------------------------------------------------------------
    // Stack operations.
    // ------------------------------------------------------------------

    pub fn push16(&mut self, bus: &mut MemoryBus, val: u16) -> Result<(), ProcessorException> {
        if self.ss.get_default_size_flag() {
            let offset = self.regs.get32(Gpr::Esp).wrapping_sub(2);
            self.ss.set_word(bus, offset, val)?;
            self.regs.set32(Gpr::Esp, offset);
        } else {
            let offset = self.regs.get16(Gpr::Esp).wrapping_sub(2);
            self.ss.set_word(bus, u32::from(offset), val)?;
            self.regs.set16(Gpr::Esp, offset);
        }
        Ok(())
    }

    /// Transactional form: write at `addr - 2` and return the new stack
    /// pointer without committing it, so multi-push sequences can commit
    /// once.
    pub fn push16_at(
        &mut self,
        bus: &mut MemoryBus,
        addr: u32,
        val: u16,
    ) -> Result<u32, ProcessorException> {
        if self.ss.get_default_size_flag() {
            self.ss.set_word(bus, addr.wrapping_sub(2), val)?;
            Ok(addr.wrapping_sub(2))
        } else {
            self.ss
                .set_word(bus, addr.wrapping_sub(2) & 0xffff, val)?;
            Ok((addr & !0xffff) | (addr.wrapping_sub(2) & 0xffff))
        }
    }

    pub fn pop16(&mut self, bus: &mut MemoryBus) -> Result<u16, ProcessorException> {
        if self.ss.get_default_size_flag() {
            let offset = self.regs.get32(Gpr::Esp);
            let val = self.ss.get_word(bus, offset)?;
            self.regs.set32(Gpr::Esp, offset.wrapping_add(2));
            Ok(val)
        } else {
            let offset = self.regs.get16(Gpr::Esp);
            let val = self.ss.get_word(bus, u32::from(offset))?;
            self.regs.set16(Gpr::Esp, offset.wrapping_add(2));
            Ok(val)
        }
    }

    pub fn push32(&mut self, bus: &mut MemoryBus, val: u32) -> Result<(), ProcessorException> {
        if self.ss.get_default_size_flag() {
            let esp = self.regs.get32(Gpr::Esp);
            if esp < 4 && esp > 0 {
                return Err(ProcessorException::STACK_SEGMENT_0);
            }
            let offset = esp.wrapping_sub(4);
            self.ss.set_dword(bus, offset, val)?;
            self.regs.set32(Gpr::Esp, offset);
        } else {
            let sp = self.regs.get32(Gpr::Esp) & 0xffff;
            if sp < 4 && sp > 0 {
                return Err(ProcessorException::STACK_SEGMENT_0);
            }
            let offset = sp.wrapping_sub(4) & 0xffff;
            self.ss.set_dword(bus, offset, val)?;
            self.regs.set16(Gpr::Esp, offset as u16);
        }
        Ok(())
    }

    pub fn pop32(&mut self, bus: &mut MemoryBus) -> Result<u32, ProcessorException> {
        if self.ss.get_default_size_flag() {
            let offset = self.regs.get32(Gpr::Esp);
            let val = self.ss.get_dword(bus, offset)?;
            self.regs.set32(Gpr::Esp, offset.wrapping_add(4));
            Ok(val)
        } else {
            let offset = u32::from(self.regs.get16(Gpr::Esp));
            let val = self.ss.get_dword(bus, offset)?;
            self.regs
                .set16(Gpr::Esp, (offset.wrapping_add(4)) as u16);
            Ok(val)
        }
    }

    fn pusha_bounds_check(offset: u32) -> Result<(), ProcessorException> {
        // The hardware re-checks at every push; a wrapped odd SP dies
        // before the first one.
        if offset < 16 && offset & 0x1 == 0x1 {
            if offset < 6 {
                warn!("PUSHA with tiny odd SP would shut down a real machine");
            }
            return Err(ProcessorException::GENERAL_PROTECTION_0);
        }
        Ok(())
    }

    pub fn pusha(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let (mut offset, offmask) = if self.ss.get_default_size_flag() {
            (self.regs.get32(Gpr::Esp), 0xffff_ffff)
        } else {
            (u32::from(self.regs.get16(Gpr::Esp)), 0xffff)
        };
        Self::pusha_bounds_check(offset)?;

        let temp = self.regs.get32(Gpr::Esp);
        for val in [
            self.regs.get16(Gpr::Eax),
            self.regs.get16(Gpr::Ecx),
            self.regs.get16(Gpr::Edx),
            self.regs.get16(Gpr::Ebx),
            temp as u16,
            self.regs.get16(Gpr::Ebp),
            self.regs.get16(Gpr::Esi),
            self.regs.get16(Gpr::Edi),
        ] {
            offset = offset.wrapping_sub(2);
            self.ss.set_word(bus, offset & offmask, val)?;
        }
        let esp = self.regs.get32(Gpr::Esp);
        self.regs.set32(Gpr::Esp, (esp & !offmask) | (offset & offmask));
        Ok(())
    }

    pub fn pushad(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let (mut offset, offmask) = if self.ss.get_default_size_flag() {
            (self.regs.get32(Gpr::Esp), 0xffff_ffff)
        } else {
            (u32::from(self.regs.get16(Gpr::Esp)), 0xffff)
        };
        Self::pusha_bounds_check(offset)?;

        let temp = self.regs.get32(Gpr::Esp);
        for val in [
            self.regs.get32(Gpr::Eax),
            self.regs.get32(Gpr::Ecx),
            self.regs.get32(Gpr::Edx),
            self.regs.get32(Gpr::Ebx),
            temp,
            self.regs.get32(Gpr::Ebp),
            self.regs.get32(Gpr::Esi),
            self.regs.get32(Gpr::Edi),
        ] {
            offset = offset.wrapping_sub(4);
            self.ss.set_dword(bus, offset & offmask, val)?;
        }
        let esp = self.regs.get32(Gpr::Esp);
        self.regs.set32(Gpr::Esp, (esp & !offmask) | (offset & offmask));
        Ok(())
    }

    pub fn popa(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let (mut offset, offmask) = if self.ss.get_default_size_flag() {
            (self.regs.get32(Gpr::Esp), 0xffff_ffff)
        } else {
            (u32::from(self.regs.get16(Gpr::Esp)), 0xffff)
        };

        let di = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);
        let si = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);
        let bp = self.ss.get_word(bus, offmask & offset)?;
        // Skip the saved SP slot.
        offset = offset.wrapping_add(4);
        let bx = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);
        let dx = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);
        let cx = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);
        let ax = self.ss.get_word(bus, offmask & offset)?;
        offset = offset.wrapping_add(2);

        self.regs.set16(Gpr::Edi, di);
        self.regs.set16(Gpr::Esi, si);
        self.regs.set16(Gpr::Ebp, bp);
        self.regs.set16(Gpr::Ebx, bx);
        self.regs.set16(Gpr::Edx, dx);
        self.regs.set16(Gpr::Ecx, cx);
        self.regs.set16(Gpr::Eax, ax);
        let esp = self.regs.get32(Gpr::Esp);
        self.regs.set32(Gpr::Esp, (esp & !offmask) | (offset & offmask));
        Ok(())
    }

    pub fn popad(&mut self, bus: &mut MemoryBus) -> Result<(), ProcessorException> {
        let (mut offset, offmask) = if self.ss.get_default_size_flag() {
            (self.regs.get32(Gpr::Esp), 0xffff_ffff)
        } else {
            (u32::from(self.regs.get16(Gpr::Esp)), 0xffff)
        };

        let edi = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);
        let esi = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);
        let ebp = self.ss.get_dword(bus, offmask & offset)?;
        // Skip the saved ESP slot.
        offset = offset.wrapping_add(8);
        let ebx = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);
        let edx = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);
        let ecx = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);
        let eax = self.ss.get_dword(bus, offmask & offset)?;
        offset = offset.wrapping_add(4);

        self.regs.set32(Gpr::Edi, edi);
        self.regs.set32(Gpr::Esi, esi);
        self.regs.set32(Gpr::Ebp, ebp);
        self.regs.set32(Gpr::Ebx, ebx);
        self.regs.set32(Gpr::Edx, edx);
        self.regs.set32(Gpr::Ecx, ecx);
        self.regs.set32(Gpr::Eax, eax);
        let esp = self.regs.get32(Gpr::Esp);
        self.regs.set32(Gpr::Esp, (esp & !offmask) | (offset & offmask));
        Ok(())
    }

    pub fn enter_o32_a32(
        &mut self,
        bus: &mut MemoryBus,
        frame_size: u32,
        nesting_level: u32,
    ) -> Result<(), ProcessorException> {
        let nesting_level = nesting_level % 32;

        let mut temp_esp = self.regs.get32(Gpr::Esp);
        let mut temp_ebp = self.regs.get32(Gpr::Ebp);

        let needed = 4 + frame_size + 4 * nesting_level;
        if temp_esp < needed && temp_esp > 0 {
            return Err(ProcessorException::STACK_SEGMENT_0);
        }

        temp_esp = temp_esp.wrapping_sub(4);
        self.ss.set_dword(bus, temp_esp, temp_ebp)?;

        let frame_temp = temp_esp;

        if nesting_level != 0 {
            for _ in 1..nesting_level {
                temp_ebp = temp_ebp.wrapping_sub(4);
                temp_esp = temp_esp.wrapping_sub(4);
                let saved = self.ss.get_dword(bus, temp_ebp)?;
                self.ss.set_dword(bus, temp_esp, saved)?;
            }
            temp_esp = temp_esp.wrapping_sub(4);
            self.ss.set_dword(bus, temp_esp, frame_temp)?;
        }

        self.regs.set32(Gpr::Ebp, frame_temp);
        self.regs
            .set32(Gpr::Esp, frame_temp.wrapping_sub(frame_size).wrapping_sub(4 * nesting_level));
        Ok(())
    }

    // ------------------------------------------------------------------
    // I/O permission bitmap.
    // ------------------------------------------------------------------

    fn io_permission_covered(
        &self,
        bus: &mut MemoryBus,
        port: u16,
        mask: u16,
    ) -> Result<bool, ProcessorException> {
        let probe = self
            .tss
            .get_word(bus, 102)
            .and_then(|base| self.tss.get_word(bus, u32::from(base) + u32::from(port >> 3)));
        match probe {
            Ok(bits) => Ok(bits.wrapping_shr(u32::from(port & 0x7)) & mask == 0),
            // A bitmap read past the TSS limit denies the port.
            Err(e) if e.vector == crate::exceptions::Vector::GeneralProtection => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn check_io_permissions8(
        &self,
        bus: &mut MemoryBus,
        port: u16,
    ) -> Result<bool, ProcessorException> {
        if u32::from(self.cpl) <= self.iopl && !self.is_virtual8086_mode() {
            return Ok(true);
        }
        self.io_permission_covered(bus, port, 0x1)
    }

    pub fn check_io_permissions16(
        &self,
        bus: &mut MemoryBus,
        port: u16,
    ) -> Result<bool, ProcessorException> {
        if u32::from(self.cpl) <= self.iopl && !self.is_virtual8086_mode() {
            return Ok(true);
        }
        self.io_permission_covered(bus, port, 0x3)
    }

    pub fn check_io_permissions32(
        &self,
        bus: &mut MemoryBus,
        port: u16,
    ) -> Result<bool, ProcessorException> {
        if u32::from(self.cpl) <= self.iopl && !self.is_virtual8086_mode() {
            return Ok(true);
        }
        self.io_permission_covered(bus, port, 0xf)
    }

    // ------------------------------------------------------------------
    // CPUID.
    // ------------------------------------------------------------------

    pub fn cpuid(&mut self) {
        match self.regs.get32(Gpr::Eax) {
            0x00 => {
                self.regs.set32(Gpr::Eax, 0x02);
                self.regs.set32(Gpr::Ebx, 0x756e_6547); // "Genu"
                self.regs.set32(Gpr::Edx, 0x4965_6e69); // "ineI"
                self.regs.set32(Gpr::Ecx, 0x6c65_746e); // "ntel"
            }
            0x01 => {
                self.regs.set32(Gpr::Eax, 0x0000_0533); // Pentium MMX, model 8, stepping 3
                self.regs.set32(Gpr::Ebx, 8 << 8);
                self.regs.set32(Gpr::Ecx, 0);
                let mut features = 0u32;
                features |= 1; // FPU
                features |= 1 << 2; // DE
                features |= 1 << 3; // PSE
                features |= 1 << 4; // TSC
                features |= 1 << 5; // MSR
                features |= 1 << 7; // MCE
                features |= 1 << 8; // CMPXCHG8B
                features |= 1 << 13; // PGE
                features |= 1 << 14; // MCA
                features |= 1 << 15; // CMOV
                self.regs.set32(Gpr::Edx, features);
            }
            _ => {
                self.regs.set32(Gpr::Eax, 0x41_0601);
                self.regs.set32(Gpr::Ebx, 0);
                self.regs.set32(Gpr::Ecx, 0);
                self.regs.set32(Gpr::Edx, 0);
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshot.
    // ------------------------------------------------------------------

    /// Serialize the architectural state. Field order is the wire
    /// contract: GPRs (EAX, EBX, EDX, ECX, ESI, EDI, ESP, EBP), EIP,
    /// DR0-7, CR0-4, the six arithmetic flags materialized
    /// (CF,PF,AF,ZF,SF), TF, IF, DF, OF, IOPL, NT, RF, VM, AC, VIF, VIP,
    /// ID, an FPU-present marker and the FPU image, the interrupt-request
    /// word, the live alignment-check flag, reset time, CPL, the MSR map,
    /// then CS, DS, SS, ES, FS, GS, IDTR, GDTR, LDTR, TSS.
    pub fn save_state(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        for r in [
            Gpr::Eax,
            Gpr::Ebx,
            Gpr::Edx,
            Gpr::Ecx,
            Gpr::Esi,
            Gpr::Edi,
            Gpr::Esp,
            Gpr::Ebp,
        ] {
            enc.put_u32(self.regs.get32(r));
        }
        enc.put_u32(self.eip);
        for dr in [
            self.dr0, self.dr1, self.dr2, self.dr3, self.dr4, self.dr5, self.dr6, self.dr7,
        ] {
            enc.put_u32(dr);
        }
        for cr in [self.cr0, self.cr1, self.cr2, self.cr3, self.cr4] {
            enc.put_u32(cr);
        }
        enc.put_bool(self.arith.cf());
        enc.put_bool(self.arith.pf());
        enc.put_bool(self.arith.af());
        enc.put_bool(self.arith.zf());
        enc.put_bool(self.arith.sf());
        enc.put_bool(self.trap);
        enc.put_bool(self.interrupt_enable);
        enc.put_bool(self.df);
        enc.put_bool(self.arith.of());
        enc.put_u32(self.iopl);
        enc.put_bool(self.nested_task);
        enc.put_bool(self.resume);
        enc.put_bool(self.vm86_mode);
        enc.put_bool(self.alignment_check);
        enc.put_bool(self.virtual_interrupt);
        enc.put_bool(self.virtual_interrupt_pending);
        enc.put_bool(self.id_flag);
        enc.put_bool(true);
        self.fpu.save_state(&mut enc);

        enc.put_u32(self.interrupt_flags.load(Ordering::SeqCst));
        enc.put_bool(self.alignment_checking);
        enc.put_u64(self.reset_time);
        enc.put_u32(u32::from(self.cpl));

        enc.put_u32(self.msrs.len() as u32);
        for (key, value) in &self.msrs {
            enc.put_u32(*key);
            enc.put_u64(*value);
        }

        for seg in [
            &self.cs, &self.ds, &self.ss, &self.es, &self.fs, &self.gs, &self.idtr, &self.gdtr,
            &self.ldtr, &self.tss,
        ] {
            seg.save(&mut enc);
        }
        enc.finish()
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut dec = Decoder::new(bytes);
        for r in [
            Gpr::Eax,
            Gpr::Ebx,
            Gpr::Edx,
            Gpr::Ecx,
            Gpr::Esi,
            Gpr::Edi,
            Gpr::Esp,
            Gpr::Ebp,
        ] {
            let v = dec.u32()?;
            self.regs.set32(r, v);
        }
        self.eip = dec.u32()?;
        self.dr0 = dec.u32()?;
        self.dr1 = dec.u32()?;
        self.dr2 = dec.u32()?;
        self.dr3 = dec.u32()?;
        self.dr4 = dec.u32()?;
        self.dr5 = dec.u32()?;
        self.dr6 = dec.u32()?;
        self.dr7 = dec.u32()?;
        self.cr0 = dec.u32()?;
        self.cr1 = dec.u32()?;
        self.cr2 = dec.u32()?;
        self.cr3 = dec.u32()?;
        self.cr4 = dec.u32()?;
        self.arith = LazyFlags::default();
        self.arith.set_cf(dec.bool()?);
        self.arith.set_pf(dec.bool()?);
        self.arith.set_af(dec.bool()?);
        self.arith.set_zf(dec.bool()?);
        self.arith.set_sf(dec.bool()?);
        self.trap = dec.bool()?;
        self.interrupt_enable = dec.bool()?;
        self.df = dec.bool()?;
        self.arith.set_of(dec.bool()?);
        self.iopl = dec.u32()?;
        self.nested_task = dec.bool()?;
        self.resume = dec.bool()?;
        self.vm86_mode = dec.bool()?;
        self.alignment_check = dec.bool()?;
        self.virtual_interrupt = dec.bool()?;
        self.virtual_interrupt_pending = dec.bool()?;
        self.id_flag = dec.bool()?;
        let _fpu_present = dec.bool()?;
        self.fpu.load_state(&mut dec)?;

        self.interrupt_flags.store(dec.u32()?, Ordering::SeqCst);
        self.alignment_checking = dec.bool()?;
        self.reset_time = dec.u64()?;
        self.cpl = dec.u32()? as u8;

        let count = dec.u32()?;
        self.msrs.clear();
        for _ in 0..count {
            let key = dec.u32()?;
            let value = dec.u64()?;
            self.msrs.insert(key, value);
        }

        let data_space = if !self.is_protected_mode() {
            SpaceKind::Physical
        } else if self.alignment_checking {
            SpaceKind::AlignmentChecked
        } else {
            SpaceKind::Linear
        };
        self.cs = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.ds = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.ss = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.es = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.fs = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.gs = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.idtr = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.gdtr = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.ldtr = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        self.tss = Segment::load(&mut dec, data_space, self.alignment_checking)?;
        Ok(())
    }
}

// ------------------------------------------------------------------
// Supervisor-scoped system-structure access helpers.
// ------------------------------------------------------------------

pub(crate) fn read_supervisor_byte(
    bus: &mut MemoryBus,
    seg: &Segment,
    offset: u32,
) -> Result<u8, ProcessorException> {
    bus.with_supervisor(|bus| seg.get_byte(bus, offset))
}

pub(crate) fn read_supervisor_word(
    bus: &mut MemoryBus,
    seg: &Segment,
    offset: u32,
) -> Result<u16, ProcessorException> {
    bus.with_supervisor(|bus| seg.get_word(bus, offset))
}

pub(crate) fn read_supervisor_dword(
    bus: &mut MemoryBus,
    seg: &Segment,
    offset: u32,
) -> Result<u32, ProcessorException> {
    bus.with_supervisor(|bus| seg.get_dword(bus, offset))
}

pub(crate) fn set_supervisor_word(
    bus: &mut MemoryBus,
    seg: &Segment,
    offset: u32,
    data: u16,
) -> Result<(), ProcessorException> {
    bus.with_supervisor(|bus| seg.set_word(bus, offset, data))
}

pub(crate) fn set_supervisor_dword(
    bus: &mut MemoryBus,
    seg: &Segment,
    offset: u32,
    data: u32,
) -> Result<(), ProcessorException> {
    bus.with_supervisor(|bus| seg.set_dword(bus, offset, data))
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.is_protected_mode() {
            if self.is_virtual8086_mode() {
                "virtual-8086"
            } else {
                "protected"
            }
        } else {
            "real"
        };
        writeln!(f, "CPU state ({mode} mode):")?;
        writeln!(
            f,
            "EAX {:08x}  EBX {:08x}  ECX {:08x}  EDX {:08x}",
            self.regs.get32(Gpr::Eax),
            self.regs.get32(Gpr::Ebx),
            self.regs.get32(Gpr::Ecx),
            self.regs.get32(Gpr::Edx)
        )?;
        writeln!(
            f,
            "ESI {:08x}  EDI {:08x}  ESP {:08x}  EBP {:08x}",
            self.regs.get32(Gpr::Esi),
            self.regs.get32(Gpr::Edi),
            self.regs.get32(Gpr::Esp),
            self.regs.get32(Gpr::Ebp)
        )?;
        writeln!(f, "EIP {:08x}  EFLAGS {:08x}  CPL {}", self.eip, self.get_eflags(), self.cpl)?;
        for (name, seg) in [
            ("CS", &self.cs),
            ("DS", &self.ds),
            ("ES", &self.es),
            ("FS", &self.fs),
            ("GS", &self.gs),
            ("SS", &self.ss),
        ] {
            writeln!(
                f,
                "{name} {:04x} base {:08x} limit {:08x}",
                seg.get_selector(),
                seg.get_base(),
                seg.get_limit()
            )?;
        }
        writeln!(
            f,
            "GDTR base {:08x} limit {:08x}  IDTR base {:08x} limit {:08x}",
            self.gdtr.get_base(),
            self.gdtr.get_limit(),
            self.idtr.get_base(),
            self.idtr.get_limit()
        )?;
        writeln!(
            f,
            "CR0 {:08x}  CR2 {:08x}  CR3 {:08x}  CR4 {:08x}",
            self.cr0, self.cr2, self.cr3, self.cr4
        )
    }
}
