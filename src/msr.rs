//! Model-specific register indices recognized by this core.
//!
//! The MSR file itself is a plain map on the processor: unknown reads
//! return 0 (with a warning), writes always stick.

pub const SYSENTER_CS: u32 = 0x174;
pub const SYSENTER_ESP: u32 = 0x175;
pub const SYSENTER_EIP: u32 = 0x176;
