//! Operation kinds and their wire representation.

/// Kind of kernel operation a slot or completion refers to.
///
/// Discriminants are the io_uring opcodes so the kind can travel inside the
/// 64-bit user data of a submission and come back unchanged on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Nop = 0,
    /// Vectored read (readv)
    ReadVectored = 1,
    /// Vectored write (writev)
    WriteVectored = 2,
    Fsync = 3,
    /// Cancel one operation or every operation on a descriptor
    AsyncCancel = 14,
    OpenAt = 18,
    Close = 19,
    Read = 22,
    Write = 23,
    UnlinkAt = 36,
}

impl OpKind {
    /// Decode the opcode byte carried in a completion's user data.
    pub const fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0 => Self::Nop,
            1 => Self::ReadVectored,
            2 => Self::WriteVectored,
            3 => Self::Fsync,
            14 => Self::AsyncCancel,
            18 => Self::OpenAt,
            19 => Self::Close,
            22 => Self::Read,
            23 => Self::Write,
            36 => Self::UnlinkAt,
            _ => return None,
        })
    }

    #[inline]
    pub const fn opcode(self) -> u8 {
        self as u8
    }

    /// Operations that move bytes through caller-provided buffers.
    #[inline]
    pub const fn is_data_transfer(self) -> bool {
        matches!(
            self,
            Self::Read | Self::Write | Self::ReadVectored | Self::WriteVectored
        )
    }

    /// Operations that fill buffers from the file.
    #[inline]
    pub const fn is_read_like(self) -> bool {
        matches!(self, Self::Read | Self::ReadVectored)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::ReadVectored => "readv",
            Self::WriteVectored => "writev",
            Self::Fsync => "fsync",
            Self::AsyncCancel => "async_cancel",
            Self::OpenAt => "openat",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::UnlinkAt => "unlinkat",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips_for_every_kind() {
        let kinds = [
            OpKind::Nop,
            OpKind::ReadVectored,
            OpKind::WriteVectored,
            OpKind::Fsync,
            OpKind::AsyncCancel,
            OpKind::OpenAt,
            OpKind::Close,
            OpKind::Read,
            OpKind::Write,
            OpKind::UnlinkAt,
        ];
        for kind in kinds {
            assert_eq!(OpKind::from_opcode(kind.opcode()), Some(kind));
        }
        assert_eq!(OpKind::from_opcode(200), None);
    }

    #[test]
    fn opcodes_match_io_uring() {
        assert_eq!(OpKind::Read.opcode(), io_uring::opcode::Read::CODE);
        assert_eq!(OpKind::Write.opcode(), io_uring::opcode::Write::CODE);
        assert_eq!(OpKind::ReadVectored.opcode(), io_uring::opcode::Readv::CODE);
        assert_eq!(OpKind::WriteVectored.opcode(), io_uring::opcode::Writev::CODE);
        assert_eq!(OpKind::Fsync.opcode(), io_uring::opcode::Fsync::CODE);
        assert_eq!(OpKind::OpenAt.opcode(), io_uring::opcode::OpenAt::CODE);
        assert_eq!(OpKind::Close.opcode(), io_uring::opcode::Close::CODE);
        assert_eq!(OpKind::UnlinkAt.opcode(), io_uring::opcode::UnlinkAt::CODE);
        assert_eq!(
            OpKind::AsyncCancel.opcode(),
            io_uring::opcode::AsyncCancel::CODE
        );
    }

    #[test]
    fn classification() {
        assert!(OpKind::Read.is_read_like());
        assert!(OpKind::ReadVectored.is_data_transfer());
        assert!(!OpKind::Fsync.is_data_transfer());
        assert_eq!(OpKind::WriteVectored.to_string(), "writev");
    }
}
