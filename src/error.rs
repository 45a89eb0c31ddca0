//! Status codes for the detour engine

use core::fmt;

/// NTSTATUS type alias
pub type NtStatus = i32;

/// all errors the detour engine can report
///
/// the set mirrors the transaction status codes: a transaction latches the
/// first of these and every later operation short-circuits to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetourError {
    /// no open transaction, or a transaction is owned by another thread
    InvalidOperation,

    /// null detour, or a detour that resolves to its own target
    InvalidParameter,

    /// null function-pointer slot, or a slot holding a null code pointer
    InvalidHandle,

    /// detach of something that is not a live trampoline, or a detour
    /// mismatch against the trampoline's recorded detour
    InvalidBlock,

    /// trampoline slot or writable-alias allocation failed
    InsufficientResources,

    /// the movable prefix is too short for the overwrite jump, or the
    /// relocated prefix overflowed the trampoline's code area
    OutOfMemory,
}

impl fmt::Display for DetourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOperation => {
                write!(f, "no transaction open on this thread")
            }
            Self::InvalidParameter => {
                write!(f, "invalid detour parameter")
            }
            Self::InvalidHandle => {
                write!(f, "invalid target function pointer")
            }
            Self::InvalidBlock => {
                write!(f, "pointer does not name a live trampoline")
            }
            Self::InsufficientResources => {
                write!(f, "trampoline or mapping allocation failed")
            }
            Self::OutOfMemory => {
                write!(f, "target prefix cannot hold the overwrite jump")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DetourError {}

/// result type alias using DetourError
pub type Result<T> = core::result::Result<T, DetourError>;

/// common NTSTATUS codes used by the kernel backend
pub mod status {
    use super::NtStatus;

    pub const STATUS_SUCCESS: NtStatus = 0;
    pub const STATUS_INVALID_PARAMETER: NtStatus = 0xC000000D_u32 as i32;
    pub const STATUS_INVALID_HANDLE: NtStatus = 0xC0000008_u32 as i32;
    pub const STATUS_NO_MEMORY: NtStatus = 0xC0000017_u32 as i32;
    pub const STATUS_CONFLICTING_ADDRESSES: NtStatus = 0xC0000018_u32 as i32;
    pub const STATUS_INVALID_DEVICE_STATE: NtStatus = 0xC0000184_u32 as i32;
    pub const STATUS_INSUFFICIENT_RESOURCES: NtStatus = 0xC000009A_u32 as i32;

    /// check if NTSTATUS indicates success
    #[inline]
    pub const fn nt_success(status: NtStatus) -> bool {
        status >= 0
    }
}

impl DetourError {
    /// convert to NTSTATUS for returning from driver dispatch functions
    pub fn to_ntstatus(&self) -> NtStatus {
        match self {
            Self::InvalidOperation => status::STATUS_INVALID_DEVICE_STATE,
            Self::InvalidParameter => status::STATUS_INVALID_PARAMETER,
            Self::InvalidHandle => status::STATUS_INVALID_HANDLE,
            Self::InvalidBlock => status::STATUS_CONFLICTING_ADDRESSES,
            Self::InsufficientResources => status::STATUS_INSUFFICIENT_RESOURCES,
            Self::OutOfMemory => status::STATUS_NO_MEMORY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntstatus_mapping_is_failure() {
        let all = [
            DetourError::InvalidOperation,
            DetourError::InvalidParameter,
            DetourError::InvalidHandle,
            DetourError::InvalidBlock,
            DetourError::InsufficientResources,
            DetourError::OutOfMemory,
        ];
        for e in all {
            assert!(!status::nt_success(e.to_ntstatus()));
        }
    }
}
