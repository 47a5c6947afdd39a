//! Shared fixtures: descriptor builders and a protected-mode machine with
//! a conventional flat GDT.

#![allow(dead_code)]

use p5_cpu_core::exceptions::{ExecEvent, ModeSwitch};
use p5_cpu_core::mem::{flat_bus, FlatRam, MemoryBus};
use p5_cpu_core::processor::{CpuConfig, Processor, SegIndex, CR0_PROTECTION_ENABLE};

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b;
pub const USER_DS: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
pub const TSS_BASE: u32 = 0x3000;

pub fn descriptor(base: u32, limit_raw: u32, access: u8, flags: u8) -> u64 {
    u64::from(limit_raw & 0xffff)
        | u64::from(base & 0xffff) << 16
        | u64::from((base >> 16) & 0xff) << 32
        | u64::from(access) << 40
        | u64::from((limit_raw >> 16) & 0xf) << 48
        | u64::from(flags & 0xf) << 52
        | u64::from(base >> 24) << 56
}

/// 16- or 32-bit interrupt/trap/call gate.
pub fn gate(selector: u16, offset: u32, gate_type: u8, dpl: u8, present: bool, params: u8) -> u64 {
    u64::from(offset & 0xffff)
        | u64::from(selector) << 16
        | u64::from(params & 0x1f) << 32
        | u64::from(gate_type | (dpl & 3) << 5 | (present as u8) << 7) << 40
        | u64::from(offset >> 16) << 48
}

pub fn write_gdt_entry(ram: &FlatRam, index: u16, desc: u64) {
    ram.load(GDT_BASE + u32::from(index) * 8, &desc.to_le_bytes());
}

pub fn write_idt_entry(ram: &FlatRam, vector: u8, desc: u64) {
    ram.load(IDT_BASE + u32::from(vector) * 8, &desc.to_le_bytes());
}

pub fn real_machine(size: usize) -> (Processor, MemoryBus, FlatRam) {
    let (mut bus, ram) = flat_bus(size);
    let mut cpu = Processor::new(CpuConfig::default());
    cpu.reset(&mut bus);
    (cpu, bus, ram)
}

pub fn enable_protected_mode(cpu: &mut Processor, bus: &mut MemoryBus) {
    match cpu.set_cr0(bus, cpu.get_cr0() | CR0_PROTECTION_ENABLE) {
        Err(ExecEvent::Switch(ModeSwitch::Protected)) => {}
        other => panic!("unexpected outcome entering protected mode: {other:?}"),
    }
}

/// A machine already in protected mode with the conventional GDT:
/// kernel code/data, user code/data, one 32-bit TSS. CS/SS are kernel,
/// EIP 0x0040_0000-ish values are in range of the flat segments.
pub fn protected_machine(size: usize) -> (Processor, MemoryBus, FlatRam) {
    let (mut cpu, mut bus, ram) = real_machine(size);

    write_gdt_entry(&ram, 0, 0);
    write_gdt_entry(&ram, 1, descriptor(0, 0xfffff, 0x9a, 0b1100));
    write_gdt_entry(&ram, 2, descriptor(0, 0xfffff, 0x92, 0b1100));
    write_gdt_entry(&ram, 3, descriptor(0, 0xfffff, 0xfa, 0b1100));
    write_gdt_entry(&ram, 4, descriptor(0, 0xfffff, 0xf2, 0b1100));
    write_gdt_entry(&ram, 5, descriptor(TSS_BASE, 0x67, 0x89, 0));

    cpu.gdtr = cpu.create_descriptor_table_segment(GDT_BASE, 6 * 8 - 1);
    cpu.idtr = cpu.create_descriptor_table_segment(IDT_BASE, 256 * 8 - 1);

    enable_protected_mode(&mut cpu, &mut bus);
    cpu.set_segment_selector(&mut bus, SegIndex::Cs, KERNEL_CS)
        .unwrap();
    cpu.set_segment_selector(&mut bus, SegIndex::Ss, KERNEL_DS)
        .unwrap();
    (cpu, bus, ram)
}

/// Fill in SS0/ESP0 of the TSS at `TSS_BASE` and install TR.
pub fn install_tss(cpu: &mut Processor, bus: &mut MemoryBus, ram: &FlatRam, ss0: u16, esp0: u32) {
    ram.load(TSS_BASE + 4, &esp0.to_le_bytes());
    ram.load(TSS_BASE + 8, &ss0.to_le_bytes());
    cpu.tss = cpu.get_segment(bus, TSS_SEL).unwrap();
}

/// Drop the machine to ring 3 on the user segments.
pub fn enter_ring3(cpu: &mut Processor, bus: &mut MemoryBus) {
    cpu.set_segment_selector(bus, SegIndex::Cs, USER_CS).unwrap();
    cpu.set_cpl(bus, 3);
    cpu.set_segment_selector(bus, SegIndex::Ss, USER_DS).unwrap();
    cpu.set_segment_selector(bus, SegIndex::Ds, USER_DS).unwrap();
}
