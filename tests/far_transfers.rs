//! Far calls, returns and IRETs across privilege levels and into
//! virtual-8086 mode.

mod common;

use common::*;
use pretty_assertions::assert_eq;

use p5_cpu_core::exceptions::{ModeSwitch, ProcessorException};
use p5_cpu_core::msr;
use p5_cpu_core::processor::SegIndex;
use p5_cpu_core::regs::Gpr;
use p5_cpu_core::segments::seg_type;

#[test]
fn iret32_same_privilege_restores_cs_eip_eflags() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);

    // Frame: [EIP'=0x0040_1000, CS'=0x08, EFLAGS'=0x246].
    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.ss.set_dword(&mut bus, 0x9000, 0x0040_1000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9004, u32::from(KERNEL_CS)).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9008, 0x246).unwrap();

    let eflags = cpu.iret_pm_o32_a32(&mut bus).unwrap();
    cpu.set_eflags(eflags).unwrap();

    assert_eq!(cpu.cs.get_selector(), KERNEL_CS);
    assert_eq!(cpu.eip, 0x0040_1000);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x9000 + 12);
    assert_eq!(cpu.get_eflags(), 0x246);
    assert!(cpu.zf());
    assert!(cpu.pf());
    assert!(cpu.interrupt_enable);
}

#[test]
fn iret32_outer_privilege_reloads_stack_and_drops_privileged_segments() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    cpu.set_segment_selector(&mut bus, SegIndex::Ds, KERNEL_DS)
        .unwrap();

    // Frame for a return to ring 3: EIP, CS, EFLAGS, ESP, SS.
    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.ss.set_dword(&mut bus, 0x9000, 0x0010_2000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9004, u32::from(USER_CS)).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9008, 0x202).unwrap();
    cpu.ss.set_dword(&mut bus, 0x900c, 0x0007_f000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9010, u32::from(USER_DS)).unwrap();

    let eflags = cpu.iret_pm_o32_a32(&mut bus).unwrap();
    cpu.set_eflags(eflags).unwrap();

    assert_eq!(cpu.get_cpl(), 3);
    assert_eq!(cpu.cs.get_selector(), USER_CS);
    assert_eq!(cpu.ss.get_selector(), USER_DS);
    assert_eq!(cpu.eip, 0x0010_2000);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x0007_f000);
    // The kernel data segment may not survive into ring 3.
    assert!(cpu.ds.is_null());
}

#[test]
fn iret_keeps_iopl_below_cpl0_and_if_below_iopl() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);

    // Run the IRET at ring 3 with IOPL 0: neither IF nor IOPL may change.
    enter_ring3(&mut cpu, &mut bus);
    cpu.iopl = 0;
    cpu.interrupt_enable = false;

    cpu.regs.set32(Gpr::Esp, 0x7000);
    cpu.ss.set_dword(&mut bus, 0x7000, 0x0010_3000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x7004, u32::from(USER_CS)).unwrap();
    // Popped image asks for IF=1, IOPL=3.
    cpu.ss.set_dword(&mut bus, 0x7008, 0x3202).unwrap();

    let eflags = cpu.iret_pm_o32_a32(&mut bus).unwrap();
    cpu.set_eflags(eflags).unwrap();

    assert_eq!(cpu.iopl, 0, "IOPL only changes at CPL 0");
    assert!(!cpu.interrupt_enable, "IF only changes at CPL <= IOPL");
}

#[test]
fn call_gate_inner_privilege_copies_parameters() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    install_tss(&mut cpu, &mut bus, &ram, KERNEL_DS, 0x0002_0000);

    // 16-bit call gate at GDT slot 6 -> kernel code, offset 0x1234,
    // parameter count 2, DPL 3 so ring 3 may call through it.
    let gate_selector: u16 = (6 << 3) | 3;
    write_gdt_entry(
        &ram,
        6,
        gate(KERNEL_CS, 0x1234, seg_type::CALL_GATE_16, 3, true, 2),
    );
    cpu.gdtr = cpu.create_descriptor_table_segment(GDT_BASE, 7 * 8 - 1);

    enter_ring3(&mut cpu, &mut bus);
    // Old ring-3 stack with two parameters on top.
    cpu.regs.set32(Gpr::Esp, 0x1ff0);
    cpu.ss.set_word(&mut bus, 0x1ff0, 0xaaaa).unwrap();
    cpu.ss.set_word(&mut bus, 0x1ff2, 0xbbbb).unwrap();
    cpu.eip = 0x0400;

    cpu.call_far_pm_o16_a16(&mut bus, gate_selector, 0)
        .unwrap();

    assert_eq!(cpu.get_cpl(), 0);
    assert_eq!(cpu.cs.get_selector() & 0xfffc, KERNEL_CS);
    assert_eq!(cpu.cs.get_rpl(), 0);
    assert_eq!(cpu.eip, 0x1234);
    assert_eq!(cpu.ss.get_selector() & 0xfffc, KERNEL_DS);

    // Frame: SS, ESP, params (order preserved), CS, EIP -> 12 bytes.
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(esp, 0x0002_0000 - 12);
    assert_eq!(cpu.ss.get_word(&mut bus, esp).unwrap(), 0x0400, "old EIP on top");
    assert_eq!(
        cpu.ss.get_word(&mut bus, esp + 2).unwrap() & 0xfffc,
        USER_CS & 0xfffc
    );
    assert_eq!(cpu.ss.get_word(&mut bus, esp + 4).unwrap(), 0xaaaa);
    assert_eq!(cpu.ss.get_word(&mut bus, esp + 6).unwrap(), 0xbbbb);
    assert_eq!(cpu.ss.get_word(&mut bus, esp + 8).unwrap(), 0x1ff0, "old ESP");
    assert_eq!(
        cpu.ss.get_word(&mut bus, esp + 10).unwrap() & 0xfffc,
        USER_DS & 0xfffc
    );
}

#[test]
fn ret_far_same_privilege_o32() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.ss.set_dword(&mut bus, 0x9000, 0x0040_7000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9004, u32::from(KERNEL_CS)).unwrap();

    cpu.ret_far_o32_a32(&mut bus, 0).unwrap();

    assert_eq!(cpu.eip, 0x0040_7000);
    assert_eq!(cpu.cs.get_selector(), KERNEL_CS);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x9008);
}

#[test]
fn ret_far_pops_immediate_stack_delta() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    cpu.regs.set32(Gpr::Esp, 0x9000);
    cpu.ss.set_dword(&mut bus, 0x9000, 0x0040_7000).unwrap();
    cpu.ss.set_dword(&mut bus, 0x9004, u32::from(KERNEL_CS)).unwrap();

    // `ret 8`: the callee also discards 8 bytes of arguments.
    cpu.ret_far_o32_a32(&mut bus, 8).unwrap();
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x9010);
}

#[test]
fn far_transfer_fault_codes() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);

    // Null selector: #GP(0).
    assert_eq!(
        cpu.jump_far_pm(&mut bus, 0, 0x1000).unwrap_err(),
        ProcessorException::GENERAL_PROTECTION_0
    );
    assert_eq!(
        cpu.call_far_pm_o16_a16(&mut bus, 0, 0x1000).unwrap_err(),
        ProcessorException::GENERAL_PROTECTION_0
    );

    // Selector past the GDT limit: #GP(selector & !3).
    assert_eq!(
        cpu.jump_far_pm(&mut bus, 0x7b, 0x1000).unwrap_err(),
        ProcessorException::gp(0x78)
    );

    // Non-present call gate: #NP(selector).
    write_gdt_entry(
        &ram,
        6,
        gate(KERNEL_CS, 0x1234, seg_type::CALL_GATE_16, 3, false, 0),
    );
    cpu.gdtr = cpu.create_descriptor_table_segment(GDT_BASE, 7 * 8 - 1);
    assert_eq!(
        cpu.call_far_pm_o16_a16(&mut bus, 0x30, 0).unwrap_err(),
        ProcessorException::np(0x30)
    );
}

#[test]
fn jump_far_nonconforming_requires_matching_privilege() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    // RPL 3 on a ring-0 segment from ring 0: RPL != CPL fails.
    assert_eq!(
        cpu.jump_far_pm(&mut bus, KERNEL_CS | 3, 0x1000).unwrap_err(),
        ProcessorException::gp(KERNEL_CS | 3)
    );
    // Plain ring-0 jump works and renormalizes CS.RPL.
    cpu.jump_far_pm(&mut bus, KERNEL_CS, 0x0040_9000).unwrap();
    assert_eq!(cpu.eip, 0x0040_9000);
    assert_eq!(cpu.cs.get_rpl(), cpu.get_cpl());
}

#[test]
fn iret_to_vm86_rebuilds_segment_file() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);

    // Ring-0 stack frame for a VM86 resume: EIP, CS, EFLAGS(VM=1),
    // ESP, SS, ES, DS, FS, GS.
    cpu.regs.set32(Gpr::Esp, 0x9000);
    let frame: [u32; 9] = [
        0x0100, 0x1234, 0x2_0202, 0xfff0, 0x2000, 0x3000, 0x4000, 0x5000, 0x6000,
    ];
    for (i, v) in frame.iter().enumerate() {
        cpu.ss.set_dword(&mut bus, 0x9000 + 4 * i as u32, *v).unwrap();
    }

    let eflags = cpu.iret_pm_o32_a32(&mut bus).unwrap();
    assert_eq!(
        cpu.set_eflags(eflags).unwrap_err(),
        ModeSwitch::Virtual8086
    );

    assert!(cpu.is_virtual8086_mode());
    assert_eq!(cpu.get_cpl(), 3);
    assert_eq!(cpu.eip, 0x0100);
    assert_eq!(cpu.cs.get_selector(), 0x1234);
    assert_eq!(cpu.cs.get_base(), 0x1234 << 4);
    assert_eq!(cpu.ss.get_selector(), 0x2000);
    assert_eq!(cpu.es.get_selector(), 0x3000);
    assert_eq!(cpu.ds.get_selector(), 0x4000);
    assert_eq!(cpu.fs.get_selector(), 0x5000);
    assert_eq!(cpu.gs.get_selector(), 0x6000);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0xfff0);
    // VM86 rule: base = selector << 4, limit 0xffff, DPL 3.
    assert_eq!(cpu.ds.get_base(), 0x4000 << 4);
    assert_eq!(cpu.ds.get_limit(), 0xffff);
    assert_eq!(cpu.ds.get_dpl(), 3);
}

#[test]
fn vm86_iret_requires_iopl3() {
    let (mut cpu, mut bus, _ram) = real_machine(0x10_0000);
    cpu.iopl = 0;
    assert_eq!(
        cpu.iret_vm_o16_a16(&mut bus).unwrap_err(),
        ProcessorException::GENERAL_PROTECTION_0
    );
}

#[test]
fn vm86_software_interrupt_enters_protected_handler() {
    let (mut cpu, mut bus, ram) = protected_machine(0x10_0000);
    install_tss(&mut cpu, &mut bus, &ram, KERNEL_DS, 0x8000);
    // DPL-3 gate, ring-0 handler.
    write_idt_entry(
        &ram,
        0x21,
        gate(KERNEL_CS, 0x0004_2000, seg_type::INTERRUPT_GATE_32, 3, true, 0),
    );

    // Drop into VM86: all six segments become VM86 variants at CPL 3.
    assert_eq!(
        cpu.set_eflags(cpu.get_eflags() | 0x2_0000 | 0x3000)
            .unwrap_err(),
        ModeSwitch::Virtual8086
    );
    use p5_cpu_core::mem::SpaceKind;
    use p5_cpu_core::segments::Segment;
    cpu.set_cs(Segment::virtual8086(SpaceKind::Linear, 0x1000, true))
        .unwrap();
    cpu.set_ss(Segment::virtual8086(SpaceKind::Linear, 0x2000, false))
        .unwrap();
    cpu.set_ds(Segment::virtual8086(SpaceKind::Linear, 0x3000, false));
    cpu.set_es(Segment::virtual8086(SpaceKind::Linear, 0x4000, false));
    cpu.set_fs(Segment::virtual8086(SpaceKind::Linear, 0x5000, false));
    cpu.set_gs(Segment::virtual8086(SpaceKind::Linear, 0x6000, false));
    cpu.set_cpl(&mut bus, 3);
    cpu.eip = 0x0150;
    cpu.regs.set32(Gpr::Esp, 0x0ff0);

    cpu.check_vm86_soft_interrupt().unwrap();
    let switch = cpu
        .handle_soft_virtual8086_mode_interrupt(&mut bus, 0x21, 2)
        .unwrap();
    assert_eq!(switch, Some(ModeSwitch::Protected));

    assert!(!cpu.is_virtual8086_mode());
    assert_eq!(cpu.get_cpl(), 0);
    assert_eq!(cpu.cs.get_selector(), KERNEL_CS);
    assert_eq!(cpu.eip, 0x0004_2000);
    assert_eq!(cpu.ss.get_selector() & 0xfffc, KERNEL_DS);

    // Extended frame: GS FS DS ES SS ESP EFLAGS CS EIP, 9 dwords.
    let esp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(esp, 0x8000 - 36);
    assert_eq!(cpu.ss.get_dword(&mut bus, esp).unwrap(), 0x0150, "old EIP");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 4).unwrap(), 0x1000, "old CS");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 12).unwrap(), 0x0ff0, "old ESP");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 16).unwrap(), 0x2000, "old SS");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 20).unwrap(), 0x4000, "old ES");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 24).unwrap(), 0x3000, "old DS");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 28).unwrap(), 0x5000, "old FS");
    assert_eq!(cpu.ss.get_dword(&mut bus, esp + 32).unwrap(), 0x6000, "old GS");

    // The VM86 data segments are dead after the switch.
    assert!(cpu.ds.is_null());
    assert!(cpu.es.is_null());
    assert!(cpu.fs.is_null());
    assert!(cpu.gs.is_null());
}

#[test]
fn vm86_software_interrupt_blocked_below_iopl3() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    let _ = &mut bus;
    cpu.iopl = 1;
    assert_eq!(
        cpu.check_vm86_soft_interrupt().unwrap_err(),
        ProcessorException::GENERAL_PROTECTION_0
    );
}

#[test]
fn sysenter_sysexit_round_trip() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    cpu.set_msr(msr::SYSENTER_CS, u64::from(KERNEL_CS));
    cpu.set_msr(msr::SYSENTER_ESP, 0x9000);
    cpu.set_msr(msr::SYSENTER_EIP, 0x0040_a000);

    enter_ring3(&mut cpu, &mut bus);
    cpu.interrupt_enable = true;

    cpu.sysenter(&mut bus).unwrap();
    assert_eq!(cpu.get_cpl(), 0);
    assert_eq!(cpu.cs.get_selector(), KERNEL_CS & 0xfffc);
    assert_eq!(cpu.ss.get_selector(), (KERNEL_CS + 8) & 0xfffc);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x9000);
    assert_eq!(cpu.eip, 0x0040_a000);
    assert!(!cpu.interrupt_enable);

    cpu.regs.set32(Gpr::Ecx, 0x0007_0000);
    cpu.regs.set32(Gpr::Edx, 0x0010_4000);
    cpu.sysexit(&mut bus).unwrap();
    assert_eq!(cpu.get_cpl(), 3);
    assert_eq!(cpu.cs.get_selector(), (KERNEL_CS + 16) | 3);
    assert_eq!(cpu.ss.get_selector(), (KERNEL_CS + 24) | 3);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x0007_0000);
    assert_eq!(cpu.eip, 0x0010_4000);
}

#[test]
fn sysenter_with_unset_msr_faults() {
    let (mut cpu, mut bus, _ram) = protected_machine(0x10_0000);
    assert_eq!(
        cpu.sysenter(&mut bus).unwrap_err(),
        ProcessorException::GENERAL_PROTECTION_0
    );
}
