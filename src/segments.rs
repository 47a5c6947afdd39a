//! Segment values: real-mode, virtual-8086, descriptor-table, protected
//! mode (with its 8-byte descriptor cache), and the null segment.
//!
//! A segment pairs its variant with the [`SpaceKind`] it is bound to, so
//! mode and alignment-check transitions are a re-binding, not a reload.
//! All memory accessors check the segment limit first (expand-down
//! segments invert the test) and then translate through the bound space.

use crate::exceptions::ProcessorException;
use crate::mem::{MemoryBus, SpaceKind};
use crate::snapshot::{Decoder, Encoder, SnapshotError};

/// Descriptor type-byte values (access byte low 5 bits, S bit included)
/// dispatched on by the control-transfer and delivery code.
pub mod seg_type {
    pub const TSS_16_AVAILABLE: u8 = 0x01;
    pub const LDT: u8 = 0x02;
    pub const TSS_16_BUSY: u8 = 0x03;
    pub const CALL_GATE_16: u8 = 0x04;
    pub const TASK_GATE: u8 = 0x05;
    pub const INTERRUPT_GATE_16: u8 = 0x06;
    pub const TRAP_GATE_16: u8 = 0x07;
    pub const TSS_32_AVAILABLE: u8 = 0x09;
    pub const TSS_32_BUSY: u8 = 0x0b;
    pub const CALL_GATE_32: u8 = 0x0c;
    pub const INTERRUPT_GATE_32: u8 = 0x0e;
    pub const TRAP_GATE_32: u8 = 0x0f;
}

/// Decoded fields of an 8-byte protected-mode descriptor, cached at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorCache {
    pub base: u32,
    /// Effective limit (granularity applied).
    pub limit: u32,
    /// Access byte: type (4) | S (1) | DPL (2) | P (1).
    pub access: u8,
    /// D/B flag.
    pub default_size: bool,
    pub granularity: bool,
}

impl DescriptorCache {
    pub fn decode(descriptor: u64) -> Self {
        let base = ((descriptor >> 16) & 0xff_ffff) as u32 | (((descriptor >> 56) & 0xff) as u32) << 24;
        let limit_raw = (descriptor & 0xffff) as u32 | (((descriptor >> 48) & 0xf) as u32) << 16;
        let granularity = descriptor & (1 << 55) != 0;
        let limit = if granularity {
            (limit_raw << 12) | 0xfff
        } else {
            limit_raw
        };
        Self {
            base,
            limit,
            access: ((descriptor >> 40) & 0xff) as u8,
            default_size: descriptor & (1 << 54) != 0,
            granularity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SegKind {
    Null,
    Real {
        selector: u16,
    },
    Virtual8086 {
        selector: u16,
        rpl: u8,
        code: bool,
    },
    DescriptorTable {
        base: u32,
        limit: u32,
    },
    Protected {
        selector: u16,
        descriptor: u64,
        rpl: u8,
        cache: DescriptorCache,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    kind: SegKind,
    space: SpaceKind,
}

impl Segment {
    pub fn null() -> Self {
        Self {
            kind: SegKind::Null,
            space: SpaceKind::Linear,
        }
    }

    pub fn real(space: SpaceKind, selector: u16) -> Self {
        Self {
            kind: SegKind::Real { selector },
            space,
        }
    }

    pub fn virtual8086(space: SpaceKind, selector: u16, code: bool) -> Self {
        Self {
            kind: SegKind::Virtual8086 {
                selector,
                rpl: 3,
                code,
            },
            space,
        }
    }

    pub fn descriptor_table(space: SpaceKind, base: u32, limit: u32) -> Self {
        Self {
            kind: SegKind::DescriptorTable { base, limit },
            space,
        }
    }

    /// Decode an 8-byte descriptor into a protected-mode segment. Reserved
    /// system types are malformed and raise #GP(selector).
    pub fn protected_mode(
        space: SpaceKind,
        selector: u16,
        descriptor: u64,
    ) -> Result<Self, ProcessorException> {
        let cache = DescriptorCache::decode(descriptor);
        if cache.access & 0x10 == 0 && matches!(cache.access & 0xf, 0x0 | 0x8 | 0xa | 0xd) {
            return Err(ProcessorException::gp(selector & 0xfffc));
        }
        Ok(Self {
            kind: SegKind::Protected {
                selector,
                descriptor,
                rpl: (selector & 3) as u8,
                cache,
            },
            space,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, SegKind::Null)
    }

    pub fn address_space(&self) -> SpaceKind {
        self.space
    }

    pub fn set_address_space(&mut self, space: SpaceKind) {
        self.space = space;
    }

    pub fn get_selector(&self) -> u16 {
        match &self.kind {
            SegKind::Null | SegKind::DescriptorTable { .. } => 0,
            SegKind::Real { selector } => *selector,
            SegKind::Virtual8086 { selector, .. } => *selector,
            SegKind::Protected { selector, rpl, .. } => (selector & 0xfffc) | u16::from(*rpl),
        }
    }

    /// Store a bare selector, where the variant supports it without a
    /// descriptor reload. Returns `false` when the caller must resolve a
    /// descriptor instead (protected-mode variants).
    pub fn set_selector(&mut self, value: u16) -> bool {
        match &mut self.kind {
            SegKind::Real { selector } => {
                *selector = value;
                true
            }
            SegKind::Virtual8086 { selector, .. } => {
                *selector = value;
                true
            }
            SegKind::Null | SegKind::DescriptorTable { .. } | SegKind::Protected { .. } => false,
        }
    }

    /// Overwrite the cached selector without revalidation. Task switches
    /// store the outgoing selectors this way while the old context is
    /// still live.
    pub fn set_selector_raw(&mut self, value: u16) {
        if let SegKind::Protected { selector, rpl, .. } = &mut self.kind {
            *selector = value;
            *rpl = (value & 3) as u8;
        }
    }

    pub fn get_base(&self) -> u32 {
        match &self.kind {
            SegKind::Null => 0,
            SegKind::Real { selector } => u32::from(*selector) << 4,
            SegKind::Virtual8086 { selector, .. } => u32::from(*selector) << 4,
            SegKind::DescriptorTable { base, .. } => *base,
            SegKind::Protected { cache, .. } => cache.base,
        }
    }

    pub fn get_limit(&self) -> u32 {
        match &self.kind {
            SegKind::Null => 0,
            SegKind::Real { .. } | SegKind::Virtual8086 { .. } => 0xffff,
            SegKind::DescriptorTable { limit, .. } => *limit,
            SegKind::Protected { cache, .. } => cache.limit,
        }
    }

    /// Access-byte low five bits, descriptor-type bit included: data
    /// segments are 0x10..=0x17, code 0x18..=0x1f, system gates and TSSs
    /// 0x01..=0x0f.
    pub fn get_type(&self) -> u8 {
        match &self.kind {
            SegKind::Null | SegKind::DescriptorTable { .. } => 0,
            // Writable data for stack/data use, readable code for CS.
            SegKind::Real { .. } => 0x13,
            SegKind::Virtual8086 { code, .. } => {
                if *code {
                    0x1b
                } else {
                    0x13
                }
            }
            SegKind::Protected { cache, .. } => cache.access & 0x1f,
        }
    }

    pub fn get_dpl(&self) -> u8 {
        match &self.kind {
            SegKind::Virtual8086 { .. } => 3,
            SegKind::Protected { cache, .. } => (cache.access >> 5) & 3,
            _ => 0,
        }
    }

    pub fn get_rpl(&self) -> u8 {
        match &self.kind {
            SegKind::Virtual8086 { rpl, .. } => *rpl,
            SegKind::Protected { rpl, .. } => *rpl,
            _ => 0,
        }
    }

    pub fn set_rpl(&mut self, value: u8) {
        match &mut self.kind {
            SegKind::Virtual8086 { rpl, .. } => *rpl = value & 3,
            SegKind::Protected { rpl, .. } => *rpl = value & 3,
            _ => {}
        }
    }

    pub fn is_present(&self) -> bool {
        match &self.kind {
            SegKind::Null => false,
            SegKind::Real { .. } | SegKind::Virtual8086 { .. } | SegKind::DescriptorTable { .. } => {
                true
            }
            SegKind::Protected { cache, .. } => cache.access & 0x80 != 0,
        }
    }

    pub fn is_system(&self) -> bool {
        match &self.kind {
            SegKind::Protected { cache, .. } => cache.access & 0x10 == 0,
            _ => false,
        }
    }

    /// D/B flag: 32-bit operand/stack-size default.
    pub fn get_default_size_flag(&self) -> bool {
        match &self.kind {
            SegKind::Protected { cache, .. } => cache.default_size,
            _ => false,
        }
    }

    /// Raw descriptor image, for busy-bit rewrites and snapshots.
    pub fn raw_descriptor(&self) -> u64 {
        match &self.kind {
            SegKind::Protected { descriptor, .. } => *descriptor,
            _ => 0,
        }
    }

    // --- gate payload accessors (protected-mode system descriptors) ---

    pub fn gate_target_segment(&self) -> u16 {
        (self.raw_descriptor() >> 16) as u16
    }

    pub fn gate_target_offset(&self) -> u32 {
        let raw = self.raw_descriptor();
        match self.get_type() {
            seg_type::CALL_GATE_16 | seg_type::INTERRUPT_GATE_16 | seg_type::TRAP_GATE_16 => {
                (raw & 0xffff) as u32
            }
            _ => (raw & 0xffff) as u32 | (((raw >> 48) & 0xffff) as u32) << 16,
        }
    }

    pub fn gate_parameter_count(&self) -> u32 {
        ((self.raw_descriptor() >> 32) & 0x1f) as u32
    }

    // --- bounds checks and translation ---

    /// Limit check: `offset ≤ limit` for up segments, `limit < offset ≤
    /// upper bound` for expand-down data segments.
    pub fn check_address(&self, offset: u32) -> Result<(), ProcessorException> {
        match &self.kind {
            SegKind::Null => Err(ProcessorException::GENERAL_PROTECTION_0),
            SegKind::Real { .. } | SegKind::Virtual8086 { .. } => {
                if offset > 0xffff {
                    Err(ProcessorException::GENERAL_PROTECTION_0)
                } else {
                    Ok(())
                }
            }
            SegKind::DescriptorTable { limit, .. } => {
                if offset > *limit {
                    Err(ProcessorException::GENERAL_PROTECTION_0)
                } else {
                    Ok(())
                }
            }
            SegKind::Protected { cache, .. } => {
                let expand_down = cache.access & 0x1c == 0x14;
                if expand_down {
                    let upper = if cache.default_size { 0xffff_ffff } else { 0xffff };
                    if offset <= cache.limit || offset > upper {
                        return Err(ProcessorException::GENERAL_PROTECTION_0);
                    }
                } else if offset > cache.limit {
                    return Err(ProcessorException::GENERAL_PROTECTION_0);
                }
                Ok(())
            }
        }
    }

    pub fn translate_address_read(&self, offset: u32) -> Result<u32, ProcessorException> {
        self.check_address(offset)?;
        Ok(self.get_base().wrapping_add(offset))
    }

    pub fn translate_address_write(&self, offset: u32) -> Result<u32, ProcessorException> {
        self.check_address(offset)?;
        Ok(self.get_base().wrapping_add(offset))
    }

    // --- memory accessors through the bound space ---

    pub fn get_byte(&self, bus: &mut MemoryBus, offset: u32) -> Result<u8, ProcessorException> {
        let addr = self.translate_address_read(offset)?;
        bus.get_byte(self.space, addr)
    }

    pub fn get_word(&self, bus: &mut MemoryBus, offset: u32) -> Result<u16, ProcessorException> {
        let addr = self.translate_address_read(offset)?;
        bus.get_word(self.space, addr)
    }

    pub fn get_dword(&self, bus: &mut MemoryBus, offset: u32) -> Result<u32, ProcessorException> {
        let addr = self.translate_address_read(offset)?;
        bus.get_dword(self.space, addr)
    }

    pub fn get_qword(&self, bus: &mut MemoryBus, offset: u32) -> Result<u64, ProcessorException> {
        let addr = self.translate_address_read(offset)?;
        bus.get_qword(self.space, addr)
    }

    pub fn set_byte(
        &self,
        bus: &mut MemoryBus,
        offset: u32,
        val: u8,
    ) -> Result<(), ProcessorException> {
        let addr = self.translate_address_write(offset)?;
        bus.set_byte(self.space, addr, val)
    }

    pub fn set_word(
        &self,
        bus: &mut MemoryBus,
        offset: u32,
        val: u16,
    ) -> Result<(), ProcessorException> {
        let addr = self.translate_address_write(offset)?;
        bus.set_word(self.space, addr, val)
    }

    pub fn set_dword(
        &self,
        bus: &mut MemoryBus,
        offset: u32,
        val: u32,
    ) -> Result<(), ProcessorException> {
        let addr = self.translate_address_write(offset)?;
        bus.set_dword(self.space, addr, val)
    }

    pub fn set_qword(
        &self,
        bus: &mut MemoryBus,
        offset: u32,
        val: u64,
    ) -> Result<(), ProcessorException> {
        let addr = self.translate_address_write(offset)?;
        bus.set_qword(self.space, addr, val)
    }

    // --- snapshot ---

    pub fn save(&self, enc: &mut Encoder) {
        match &self.kind {
            SegKind::Real { selector } => {
                enc.put_u32(0);
                enc.put_u32(u32::from(*selector));
            }
            SegKind::Virtual8086 {
                selector,
                rpl,
                code,
            } => {
                enc.put_u32(1);
                enc.put_u32(u32::from(*selector));
                enc.put_bool(*code);
                enc.put_u32(u32::from(*rpl));
            }
            SegKind::DescriptorTable { base, limit } => {
                enc.put_u32(2);
                enc.put_u32(*base);
                enc.put_u32(*limit);
            }
            SegKind::Protected {
                selector,
                descriptor,
                rpl,
                ..
            } => {
                enc.put_u32(3);
                enc.put_u32(u32::from(*selector));
                enc.put_u64(*descriptor);
                enc.put_u32(u32::from(*rpl));
            }
            SegKind::Null => enc.put_u32(4),
        }
    }

    /// Rebuild a segment from the stream; `data_space` is the binding the
    /// loading processor has chosen for real/vm86/table segments (physical
    /// in real mode, linear or alignment-checked in protected mode).
    pub fn load(
        dec: &mut Decoder<'_>,
        data_space: SpaceKind,
        alignment_checking: bool,
    ) -> Result<Self, SnapshotError> {
        let tag = dec.u32()?;
        match tag {
            0 => Ok(Segment::real(data_space, dec.u32()? as u16)),
            1 => {
                let selector = dec.u32()? as u16;
                let code = dec.bool()?;
                let rpl = dec.u32()? as u8;
                let mut seg = Segment::virtual8086(data_space, selector, code);
                seg.set_rpl(rpl);
                Ok(seg)
            }
            2 => {
                let base = dec.u32()?;
                let limit = dec.u32()?;
                Ok(Segment::descriptor_table(data_space, base, limit))
            }
            3 => {
                let selector = dec.u32()? as u16;
                let descriptor = dec.u64()?;
                let rpl = dec.u32()? as u8;
                let mut seg = Segment::protected_mode(SpaceKind::Linear, selector, descriptor)
                    .map_err(|_| SnapshotError::InvalidSegmentTag(tag))?;
                if alignment_checking && seg.get_type() & 0x18 == 0x10 {
                    seg.set_address_space(SpaceKind::AlignmentChecked);
                }
                seg.set_rpl(rpl);
                Ok(seg)
            }
            4 => Ok(Segment::null()),
            other => Err(SnapshotError::InvalidSegmentTag(other)),
        }
    }
}
