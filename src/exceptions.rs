//! Architectural fault taxonomy and the non-fault mode-switch events.
//!
//! Faults travel as [`ProcessorException`] values through instruction
//! handlers and the block interpreter into the mode-specific delivery
//! routines. Mode switches (real ↔ protected ↔ virtual-8086) are *not*
//! faults: they unwind to the execution driver as [`ModeSwitch`] so the
//! caller can re-dispatch into the right interpreter.

use core::fmt;

/// Exception vectors of the IA-32 architecture, as far as this core raises
/// or delivers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    NoFpu = 7,
    DoubleFault = 8,
    FpuSegmentOverrun = 9,
    TaskSwitch = 10,
    NotPresent = 11,
    StackSegment = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FloatingPoint = 16,
    AlignmentCheck = 17,
}

impl Vector {
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Whether delivery of this vector pushes an error code.
    pub const fn has_error_code(self) -> bool {
        matches!(
            self,
            Vector::DoubleFault
                | Vector::TaskSwitch
                | Vector::NotPresent
                | Vector::StackSegment
                | Vector::GeneralProtection
                | Vector::PageFault
                | Vector::AlignmentCheck
        )
    }

    /// Whether the saved EIP names the faulting instruction itself (faults)
    /// rather than the one after it (traps).
    pub const fn points_to_self(self) -> bool {
        !matches!(self, Vector::Debug | Vector::Breakpoint | Vector::Overflow)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Vector::DivideError => "#DE",
            Vector::Debug => "#DB",
            Vector::Nmi => "NMI",
            Vector::Breakpoint => "#BP",
            Vector::Overflow => "#OF",
            Vector::BoundRange => "#BR",
            Vector::InvalidOpcode => "#UD",
            Vector::NoFpu => "#NM",
            Vector::DoubleFault => "#DF",
            Vector::FpuSegmentOverrun => "#MF(overrun)",
            Vector::TaskSwitch => "#TS",
            Vector::NotPresent => "#NP",
            Vector::StackSegment => "#SS",
            Vector::GeneralProtection => "#GP",
            Vector::PageFault => "#PF",
            Vector::FloatingPoint => "#MF",
            Vector::AlignmentCheck => "#AC",
        }
    }

    /// Classic x86 fault classification used by the double-fault
    /// combination table.
    fn is_contributory(self) -> bool {
        matches!(
            self,
            Vector::DivideError
                | Vector::TaskSwitch
                | Vector::NotPresent
                | Vector::StackSegment
                | Vector::GeneralProtection
        )
    }
}

/// An architectural fault in flight: vector, optional error code, and the
/// points-to-self property that the block interpreter uses to re-point EIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorException {
    pub vector: Vector,
    error_code: Option<u16>,
    points_to_self: bool,
}

impl ProcessorException {
    pub const GENERAL_PROTECTION_0: ProcessorException = ProcessorException::gp(0);
    pub const STACK_SEGMENT_0: ProcessorException = ProcessorException::ss(0);
    pub const DOUBLE_FAULT_0: ProcessorException =
        ProcessorException::with_code(Vector::DoubleFault, 0);
    pub const FLOATING_POINT: ProcessorException = ProcessorException::plain(Vector::FloatingPoint);

    pub const fn plain(vector: Vector) -> Self {
        Self {
            vector,
            error_code: None,
            points_to_self: vector.points_to_self(),
        }
    }

    pub const fn with_code(vector: Vector, code: u16) -> Self {
        Self {
            vector,
            error_code: Some(code),
            points_to_self: vector.points_to_self(),
        }
    }

    pub const fn gp(code: u16) -> Self {
        Self::with_code(Vector::GeneralProtection, code)
    }

    pub const fn np(selector: u16) -> Self {
        Self::with_code(Vector::NotPresent, selector)
    }

    pub const fn ss(selector: u16) -> Self {
        Self::with_code(Vector::StackSegment, selector)
    }

    pub const fn ts(selector: u16) -> Self {
        Self::with_code(Vector::TaskSwitch, selector)
    }

    pub const fn page_fault(code: u16) -> Self {
        Self::with_code(Vector::PageFault, code)
    }

    pub fn has_error_code(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn error_code(&self) -> u16 {
        self.error_code.unwrap_or(0)
    }

    pub fn points_to_self(&self) -> bool {
        self.points_to_self
    }

    /// The x86 combination table: does this fault, raised while `first` was
    /// being delivered, escalate to a double fault?
    pub fn combines_to_double_fault(&self, first: &ProcessorException) -> bool {
        let (f, s) = (first.vector, self.vector);
        (f.is_contributory() && s.is_contributory())
            || (f == Vector::PageFault && (s.is_contributory() || s == Vector::PageFault))
    }
}

impl fmt::Display for ProcessorException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "{}({code:#x})", self.vector.mnemonic()),
            None => write!(f, "{}", self.vector.mnemonic()),
        }
    }
}

impl std::error::Error for ProcessorException {}

/// Execution-mode transition, propagated up to the execution driver so it
/// can resume in the matching interpreter. Not a fault: it never goes
/// through interrupt delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    Real,
    Protected,
    Virtual8086,
}

/// Everything an instruction handler may raise: a fault (delivered through
/// the interrupt machinery) or a mode switch (unwound to the driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    Fault(ProcessorException),
    Switch(ModeSwitch),
}

impl From<ProcessorException> for ExecEvent {
    fn from(e: ProcessorException) -> Self {
        ExecEvent::Fault(e)
    }
}

impl From<ModeSwitch> for ExecEvent {
    fn from(m: ModeSwitch) -> Self {
        ExecEvent::Switch(m)
    }
}

/// Terminal condition reported to the host. A triple fault means the
/// machine must be torn down and reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CpuExit {
    #[error("triple fault")]
    TripleFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_vectors() {
        assert!(Vector::DoubleFault.has_error_code());
        assert!(Vector::PageFault.has_error_code());
        assert!(!Vector::DivideError.has_error_code());
        assert!(!Vector::InvalidOpcode.has_error_code());
    }

    #[test]
    fn traps_point_past_themselves() {
        assert!(!Vector::Breakpoint.points_to_self());
        assert!(!Vector::Overflow.points_to_self());
        assert!(Vector::PageFault.points_to_self());
        assert!(Vector::GeneralProtection.points_to_self());
    }

    #[test]
    fn double_fault_combination_table() {
        let gp = ProcessorException::gp(0);
        let pf = ProcessorException::page_fault(2);
        let de = ProcessorException::plain(Vector::DivideError);
        let ud = ProcessorException::plain(Vector::InvalidOpcode);

        assert!(gp.combines_to_double_fault(&gp));
        assert!(de.combines_to_double_fault(&gp));
        assert!(gp.combines_to_double_fault(&pf));
        assert!(pf.combines_to_double_fault(&pf));
        // Page fault while delivering a contributory fault recurses instead.
        assert!(!pf.combines_to_double_fault(&gp));
        assert!(!ud.combines_to_double_fault(&gp));
        assert!(!gp.combines_to_double_fault(&ud));
    }
}
