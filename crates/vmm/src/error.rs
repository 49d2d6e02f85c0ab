//! Error and fault status types.
//!
//! Management operations fail with [`VmmError`]. Fault handlers never return an error in the
//! usual sense: they return a [`FaultStatus`], and the caller must either accept the result,
//! refault on [`FaultStatus::Retry`], or abort on [`FaultStatus::Fatal`].

use core::fmt;

/// A resource that could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The commit limit cannot absorb the charge.
    Commit,
    /// Not enough free frames.
    Frames,
}

/// Errors returned by memory management operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// A resource ran out. Waiting and retrying may succeed.
    ResourceExhaustion(Exhaustion),
    /// The address lies outside the range the operation accepts.
    InvalidAddress,
    /// The page is already mapped.
    AlreadyMapped,
    /// The page is not mapped.
    NotMapped,
    /// The frame is not suitable for the operation.
    InvalidFrame,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhaustion(Exhaustion::Commit) => write!(f, "commit limit exceeded"),
            Self::ResourceExhaustion(Exhaustion::Frames) => write!(f, "out of free frames"),
            Self::InvalidAddress => write!(f, "invalid address for this operation"),
            Self::AlreadyMapped => write!(f, "page is already mapped"),
            Self::NotMapped => write!(f, "page is not mapped"),
            Self::InvalidFrame => write!(f, "frame cannot be used for this operation"),
        }
    }
}

impl core::error::Error for VmmError {}

/// Why a fault must be retried from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// A structural duplication of the address space is in flight.
    DuplicationInProgress,
    /// Free frames are critically low; the faulting thread should wait for frames.
    FramesLow,
    /// The translation entry changed while the fault was being serviced.
    MappingInFlux,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicationInProgress => write!(f, "address space duplication in progress"),
            Self::FramesLow => write!(f, "free frames critically low"),
            Self::MappingInFlux => write!(f, "mapping changed during fault"),
        }
    }
}

/// A broken structural invariant. Continuing would corrupt the frame directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The handler was given an invalid translation entry.
    EntryNotValid,
    /// A copy-on-write fault hit an entry that is not copy-on-write.
    NotCopyOnWrite,
    /// A managed-only operation found a frame without a descriptor.
    UnmanagedFrame,
    /// The working-set tracker has no index for a resident page.
    UntrackedPage,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryNotValid => write!(f, "translation entry is not valid"),
            Self::NotCopyOnWrite => write!(f, "copy-on-write fault on a non-shared entry"),
            Self::UnmanagedFrame => write!(f, "frame has no descriptor"),
            Self::UntrackedPage => write!(f, "resident page missing from working set"),
        }
    }
}

impl core::error::Error for InvariantViolation {}

/// Result of servicing a fault.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus<T> {
    /// The fault was serviced.
    Handled(T),
    /// The faulting access must be restarted.
    Retry(RetryReason),
    /// A structural invariant was violated.
    Fatal(InvariantViolation),
}

impl<T> FaultStatus<T> {
    /// Maps the handled value, leaving retries and fatal results unchanged.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FaultStatus<U> {
        match self {
            Self::Handled(value) => FaultStatus::Handled(f(value)),
            Self::Retry(reason) => FaultStatus::Retry(reason),
            Self::Fatal(violation) => FaultStatus::Fatal(violation),
        }
    }

    /// Returns true if the fault must be retried.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Errors raised by emulated CPU accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The access is not permitted. Raised at the faulting access, never from a handler.
    AccessViolation,
    /// A fault handler reported a broken invariant.
    Fatal(InvariantViolation),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessViolation => write!(f, "access violation"),
            Self::Fatal(violation) => write!(f, "fatal fault: {violation}"),
        }
    }
}

impl core::error::Error for AccessError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_map_keeps_retry() {
        let status: FaultStatus<u32> = FaultStatus::Retry(RetryReason::FramesLow);
        assert_eq!(status.map(|v| v + 1), FaultStatus::Retry(RetryReason::FramesLow));
        assert_eq!(FaultStatus::Handled(1).map(|v| v + 1), FaultStatus::Handled(2));
        assert!(status.is_retry());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            VmmError::ResourceExhaustion(Exhaustion::Commit).to_string(),
            "commit limit exceeded"
        );
        assert_eq!(
            AccessError::Fatal(InvariantViolation::NotCopyOnWrite).to_string(),
            "fatal fault: copy-on-write fault on a non-shared entry"
        );
    }
}
