//! Contracts for the external collaborators the processor calls into.
//!
//! All of these are driven synchronously from the processor's thread; the
//! only cross-thread surface of the core is the atomic interrupt-flag word
//! on the processor itself.

use crate::snapshot::{Decoder, Encoder, SnapshotError};

/// External interrupt controller (PIC).
pub trait InterruptController {
    /// Acknowledge and return the highest-priority pending vector.
    fn cpu_get_interrupt(&mut self) -> u8;
    fn set_irq(&mut self, line: u8, level: bool);
}

/// The virtual clock driving timer devices.
pub trait Clock {
    /// Credit `instructions` executed instructions and run due callbacks.
    fn update_and_process(&mut self, instructions: u32);
    /// Re-sync to the present and run due callbacks; `sleep` allows the
    /// clock to yield the host thread while the CPU is halted.
    fn update_now_and_process(&mut self, sleep: bool);
    fn get_ticks(&self) -> u64;
    fn get_emulated_nanos(&self) -> u64;
}

/// The x87 unit. Only lifecycle and snapshot participation are visible to
/// this core; numeric behavior lives with the implementation.
pub trait Fpu {
    fn init(&mut self);
    fn save_state(&self, enc: &mut Encoder);
    fn load_state(&mut self, dec: &mut Decoder) -> Result<(), SnapshotError>;
}

/// FPU stand-in for machines configured without one and for tests.
#[derive(Debug, Default)]
pub struct NullFpu;

impl Fpu for NullFpu {
    fn init(&mut self) {}
    fn save_state(&self, _enc: &mut Encoder) {}
    fn load_state(&mut self, _dec: &mut Decoder) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// Test clock: counts calls, never sleeps.
#[derive(Debug, Default)]
pub struct CountingClock {
    pub ticks: u64,
}

impl Clock for CountingClock {
    fn update_and_process(&mut self, _instructions: u32) {
        self.ticks += 1;
    }

    fn update_now_and_process(&mut self, _sleep: bool) {
        self.ticks += 1;
    }

    fn get_ticks(&self) -> u64 {
        self.ticks
    }

    fn get_emulated_nanos(&self) -> u64 {
        self.ticks * 1_000
    }
}
