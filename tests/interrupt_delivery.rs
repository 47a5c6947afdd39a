//! Interrupt and exception delivery across real and protected mode,
//! including the rollback / double-fault / triple-fault ladder.

mod common;

use common::*;
use pretty_assertions::assert_eq;

use p5_cpu_core::exceptions::{CpuExit, ProcessorException, Vector};
use p5_cpu_core::mem::{FlatLinear, FlatRam, MemoryBus};
use p5_cpu_core::processor::SegIndex;
use p5_cpu_core::regs::Gpr;
use p5_cpu_core::segments::seg_type;

#[test]
fn real_mode_int21_pushes_frame_and_vectors_through_ivt() {
    let (mut cpu, mut bus, ram) = real_machine(0x10_0000);

    // IVT[0x21] = 0x0100:0x2000.
    ram.load(0x21 * 4, &0x2000u16.to_le_bytes());
    ram.load(0x21 * 4 + 2, &0x0100u16.to_le_bytes());

    cpu.cs.set_selector(0xf000);
    cpu.eip = 0x0200;
    cpu.ss.set_selector(0);
    cpu.regs.set32(Gpr::Esp, 0xff00);
    cpu.interrupt_enable = true;
    cpu.trap = true;

    cpu.int_o16_a16(&mut bus, 0x21).unwrap();

    assert_eq!(cpu.cs.get_selector(), 0x0100);
    assert_eq!(cpu.eip, 0x2000);
    assert_eq!(cpu.regs.get16(Gpr::Esp), 0xfefa);
    assert!(!cpu.interrupt_enable);
    assert!(!cpu.trap);
    assert!(!cpu.alignment_check);
    assert!(!cpu.resume);

    let pushed_flags = cpu.ss.get_word(&mut bus, 0xfefe).unwrap();
    let pushed_cs = cpu.ss.get_word(&mut bus, 0xfefc).unwrap();
    let pushed_ip = cpu.ss.get_word(&mut bus, 0xfefa).unwrap();
    assert_eq!(pushed_cs, 0xf000);
    assert_eq!(pushed_ip, 0x0200);
    assert_ne!(pushed_flags & 0x200, 0, "saved image keeps IF");
}

#[test]
fn real_mode_delivery_checks_ivt_limit() {
    let (mut cpu, mut bus, _ram) = real_machine(0x1_0000);
    // Truncate the IVT to vectors 0..=2: the requested vector, the #GP(0)
    // fallback (13) and the #DF escalation (8) are all out of bounds, so
    // the failure ladder runs to a triple fault.
    cpu.idtr = cpu.create_descriptor_table_segment(0, 0xb);
    let err = cpu
        .handle_hard_real_mode_interrupt(&mut bus, 0x40)
        .unwrap_err();
    assert_eq!(err, CpuExit::TripleFault);
}

#[test]
fn protected_mode_interrupt_gate_same_privilege() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    write_idt_entry(
        &ram,
        0x40,
        gate(KERNEL_CS, 0x0040_1000, seg_type::INTERRUPT_GATE_32, 0, true, 0),
    );

    cpu.eip = 0x1234;
    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.interrupt_enable = true;

    cpu.handle_hard_protected_mode_interrupt(&mut bus, 0x40)
        .unwrap();

    assert_eq!(cpu.eip, 0x0040_1000);
    assert_eq!(cpu.cs.get_selector(), KERNEL_CS);
    assert!(!cpu.interrupt_enable, "interrupt gate clears IF");
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x9000 - 12);
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0x1234);
    assert_eq!(
        cpu.ss.get_dword(&mut bus, esp + 4).unwrap() & 0xffff,
        u32::from(KERNEL_CS)
    );
    let pushed_flags = cpu.ss.get_dword(&mut bus, esp + 8).unwrap();
    assert_ne!(pushed_flags & 0x200, 0, "frame keeps the old IF");
}

#[test]
fn trap_gate_leaves_if_alone() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    write_idt_entry(
        &ram,
        0x41,
        gate(KERNEL_CS, 0x0040_2000, seg_type::TRAP_GATE_32, 0, true, 0),
    );

    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.interrupt_enable = true;
    cpu.trap = true;

    cpu.handle_hard_protected_mode_interrupt(&mut bus, 0x41)
        .unwrap();

    assert!(cpu.interrupt_enable, "trap gate preserves IF");
    assert!(!cpu.trap, "TF always clears on entry");
}

#[test]
fn software_interrupt_respects_gate_dpl() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    install_tss(&mut cpu, &mut bus, &ram, KERNEL_DS, 0x8000);
    // Ring-0 gate: INT from ring 3 must fault with #GP(vector*8 + 2).
    write_idt_entry(
        &ram,
        0x80,
        gate(KERNEL_CS, 0x0040_3000, seg_type::INTERRUPT_GATE_32, 0, true, 0),
    );
    enter_ring3(&mut cpu, &mut bus);
    cpu.regs.set32(Gpr::Esp, 0x7000);
    cpu.eip = 0x1000;

    // The denied INT delivers #GP instead; its gate is ring-0-reachable
    // only, so delivery of the #GP recurses into the DPL-0 #GP gate.
    write_idt_entry(
        &ram,
        13,
        gate(KERNEL_CS, 0x0040_5000, seg_type::INTERRUPT_GATE_32, 0, true, 0),
    );
    cpu.handle_soft_protected_mode_interrupt(&mut bus, 0x80, 2)
        .unwrap();
    assert_eq!(cpu.eip, 0x0040_5000, "denied INT lands in the #GP handler");
    assert_eq!(cpu.get_cpl(), 0);
    // The #GP error code names the offending IDT slot: vector*8 + 2.
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0x402);
}

#[test]
fn inter_privilege_interrupt_switches_to_tss_stack() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    install_tss(&mut cpu, &mut bus, &ram, KERNEL_DS, 0x8000);
    write_idt_entry(
        &ram,
        0x30,
        gate(KERNEL_CS, 0x0040_6000, seg_type::INTERRUPT_GATE_32, 3, true, 0),
    );
    enter_ring3(&mut cpu, &mut bus);
    cpu.regs.set32(Gpr::Esp, 0x7000);
    cpu.eip = 0x0012_3456;

    cpu.handle_soft_protected_mode_interrupt(&mut bus, 0x30, 2)
        .unwrap();

    assert_eq!(cpu.get_cpl(), 0);
    assert_eq!(cpu.cs.get_selector(), KERNEL_CS);
    assert_eq!(cpu.ss.get_selector(), KERNEL_DS);
    assert_eq!(cpu.eip, 0x0040_6000);

    // New stack: SS, ESP, EFLAGS, CS, EIP (no error code).
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(esp, 0x8000 - 20);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0x0012_3456);
    assert_eq!(
        cpu.ss.get_dword(&mut bus, esp + 4).unwrap() & 0xffff,
        u32::from(USER_CS)
    );
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 12).unwrap(), 0x7000);
    assert_eq!(
        cpu.ss.get_dword(&mut bus, esp + 16).unwrap() & 0xffff,
        u32::from(USER_DS)
    );
}

#[test]
fn page_fault_sets_cr2_and_pushes_error_code() {
    // Build the bus by hand so the linear space faults above 0x5_0000.
    let ram = FlatRam::new(0x10_0000);
    let mut linear = FlatLinear::new(ram.clone());
    linear.set_fault_floor(Some(0x5_0000));
    let mut bus = MemoryBus::new(Box::new(ram.clone()), Box::new(linear));
    let mut cpu = p5_cpu_core::Processor::new(Default::default());
    cpu.reset(&mut bus);

    write_gdt_entry(&ram, 0, 0);
    write_gdt_entry(&ram, 1, descriptor(0, 0xfffff, 0x9a, 0b1100));
    write_gdt_entry(&ram, 2, descriptor(0, 0xfffff, 0x92, 0b1100));
    cpu.gdtr = cpu.create_descriptor_table_segment(GDT_BASE, 3 * 8 - 1);
    cpu.idtr = cpu.create_descriptor_table_segment(IDT_BASE, 0xff);
    enable_protected_mode(&mut cpu, &mut bus);
    cpu.set_segment_selector(&mut bus, SegIndex::Cs, KERNEL_CS)
        .unwrap();
    cpu.set_segment_selector(&mut bus, SegIndex::Ss, KERNEL_DS)
        .unwrap();
    cpu.set_segment_selector(&mut bus, SegIndex::Ds, KERNEL_DS)
        .unwrap();
    // Sync the supervisor flag with the (ring 0) privilege level.
    cpu.set_cpl(&mut bus, 0);
    write_idt_entry(
        &ram,
        14,
        gate(KERNEL_CS, 0x0004_0100, seg_type::INTERRUPT_GATE_32, 0, true, 0),
    );

    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.eip = 0x4000;

    // A data write into the unmapped region faults; the walked address
    // must land in CR2 and the error code on the handler stack.
    let err = cpu.ds.set_dword(&mut bus, 0x6_0000, 1).unwrap_err();
    assert_eq!(err.vector, Vector::PageFault);
    assert_eq!(err.error_code(), 0x2, "supervisor write, not-present");

    cpu.handle_protected_mode_exception(&mut bus, err).unwrap();
    assert_eq!(cpu.get_cr2(), 0x6_0000);
    assert_eq!(cpu.eip, 0x0004_0100);

    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0x2);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 4).unwrap(), 0x4000);
    assert_eq!(
        cpu.ss.get_dword(&mut bus, esp + 8).unwrap() & 0xffff,
        u32::from(KERNEL_CS)
    );
}

#[test]
fn nested_fault_during_delivery_combines_to_double_fault() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    // IDT covers vectors 0..=13 only: delivering #PF (vector 14) fetches
    // past the limit and raises #GP, which combines to #DF(0).
    cpu.idtr = cpu.create_descriptor_table_segment(IDT_BASE, 14 * 8 - 1);
    write_idt_entry(
        &ram,
        8,
        gate(KERNEL_CS, 0x0040_8000, seg_type::INTERRUPT_GATE_32, 0, true, 0),
    );

    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.eip = 0x1111;

    cpu.handle_protected_mode_exception(&mut bus, ProcessorException::page_fault(0x2))
        .unwrap();

    assert_eq!(cpu.eip, 0x0040_8000, "resumed in the #DF handler");
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0, "#DF error code");
    // The frame reflects the rolled-back interruption point.
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 4).unwrap(), 0x1111);
}

#[test]
fn double_fault_failure_is_a_triple_fault() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    // An empty IDT: nothing can ever be delivered.
    cpu.idtr = cpu.create_descriptor_table_segment(IDT_BASE, 0);

    let saved_esp = 0x9000;
    cpu.regs.set32(Gpr::Esp, saved_esp);
    cpu.eip = 0x2222;
    let saved_cs = cpu.cs.get_selector();

    let exit = cpu
        .handle_protected_mode_exception(&mut bus, ProcessorException::page_fault(0x2))
        .unwrap_err();
    assert_eq!(exit, CpuExit::TripleFault);

    // Rollback left the interrupted context intact.
    assert_eq!(cpu.regs.get32(Gpr::Esp), saved_esp);
    assert_eq!(cpu.eip, 0x2222);
    assert_eq!(cpu.cs.get_selector(), saved_cs);
}

#[test]
fn hardware_interrupt_delivery_failure_escalates() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    // Vector 0x21 has no gate (type 0): delivery fails with
    // #GP(vector*8 + 2 + EXT), EXT=1 for hardware interrupts, and that
    // #GP cannot be delivered either through the empty slot 13.
    cpu.idtr = cpu.create_descriptor_table_segment(IDT_BASE, 0xff);
    let exit = cpu.handle_hard_protected_mode_interrupt(&mut bus, 0x21);
    // Eventually a triple fault: #GP -> #GP -> #DF -> #GP.
    assert_eq!(exit.unwrap_err(), CpuExit::TripleFault);
}
