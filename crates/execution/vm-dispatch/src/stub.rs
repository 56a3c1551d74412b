//! 已生成的分派桩

use std::fmt;

use vm_core::CodeRegion;

/// Dispatch kind; selects the lookup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StubKind {
    /// O(1) indexed load from the receiver's vtable.
    Vtable,
    /// Linear scan of the receiver's itable.
    Itable,
}

impl StubKind {
    pub const ALL: [StubKind; 2] = [StubKind::Vtable, StubKind::Itable];

    /// Name reported to code event listeners.
    pub fn code_name(self) -> &'static str {
        match self {
            StubKind::Vtable => "vtable stub",
            StubKind::Itable => "itable stub",
        }
    }
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubKind::Vtable => f.write_str("vtable"),
            StubKind::Itable => f.write_str("itable"),
        }
    }
}

/// Language-level error implied by a fault inside a stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFault {
    /// Receiver was null (fault while loading its klass).
    NullReceiver,
    /// Selected method has no implementation (fault on the final jump).
    AbstractMethod,
}

/// One generated trampoline. Lives until bulk teardown of its cache.
#[derive(Debug)]
pub struct DispatchStub {
    kind: StubKind,
    index: u32,
    npe_offset: u32,
    ame_offset: u32,
    code_len: u32,
    region: CodeRegion,
}

impl DispatchStub {
    pub(crate) fn new(
        kind: StubKind,
        index: u32,
        npe_offset: u32,
        ame_offset: u32,
        code_len: u32,
        region: CodeRegion,
    ) -> Self {
        Self {
            kind,
            index,
            npe_offset,
            ame_offset,
            code_len,
            region,
        }
    }

    pub fn kind(&self) -> StubKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn matches(&self, kind: StubKind, index: u32) -> bool {
        self.kind == kind && self.index == index
    }

    pub fn entry_point(&self) -> usize {
        self.region.begin()
    }

    pub fn code_end(&self) -> usize {
        self.entry_point() + self.code_len as usize
    }

    pub fn npe_offset(&self) -> u32 {
        self.npe_offset
    }

    pub fn ame_offset(&self) -> u32 {
        self.ame_offset
    }

    pub fn npe_pc(&self) -> usize {
        self.entry_point() + self.npe_offset as usize
    }

    pub fn ame_pc(&self) -> usize {
        self.entry_point() + self.ame_offset as usize
    }

    pub fn code_len(&self) -> usize {
        self.code_len as usize
    }

    /// Bytes reserved for the stub.
    pub fn reserved_len(&self) -> usize {
        self.region.len()
    }

    /// Unused reservation.
    pub fn slop(&self) -> usize {
        self.reserved_len() - self.code_len()
    }

    pub fn code(&self) -> &[u8] {
        &self.region.bytes()[..self.code_len()]
    }

    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.entry_point() && pc < self.code_end()
    }

    pub fn classify_fault(&self, pc: usize) -> Option<StubFault> {
        if pc == self.npe_pc() {
            Some(StubFault::NullReceiver)
        } else if pc == self.ame_pc() {
            Some(StubFault::AbstractMethod)
        } else {
            None
        }
    }
}

impl fmt::Display for DispatchStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stub #{} [{:#x}, {:#x}) npe+{} ame+{}",
            self.kind,
            self.index,
            self.entry_point(),
            self.code_end(),
            self.npe_offset,
            self.ame_offset
        )
    }
}
