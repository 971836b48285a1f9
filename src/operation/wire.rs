//! Packing of routing information into io_uring user data.
//!
//! ```text
//!  63            32 31      24 23     16 15             0
//! +----------------+----------+---------+----------------+
//! |  route token   | reserved |  opcode |    slot tag    |
//! +----------------+----------+---------+----------------+
//! ```

use super::OpKind;

/// User data reserved for the event loop's own wakeup read.
pub const WAKE_USER_DATA: u64 = u64::MAX;

/// Slot tag reserved for the single close submission of a handle.
///
/// Registry capacities top out at 65536 slots (tags `0..=65535`), but a tag
/// alone never identifies the close: it is only recognised together with
/// [`OpKind::Close`], which no registry slot ever carries.
pub const CLOSE_TAG: u16 = u16::MAX;

/// Slot tag of the close-time cancel-all.
///
/// Cancellations never hold a registry slot. A completion reporting
/// [`OpKind::AsyncCancel`] is therefore always a cancellation; per-operation
/// cancels carry the tag of the slot they target, the cancel-all this one.
pub const CANCEL_ALL_TAG: u16 = u16::MAX;

#[inline]
pub const fn encode(token: u32, op: OpKind, tag: u16) -> u64 {
    ((token as u64) << 32) | ((op.opcode() as u64) << 16) | tag as u64
}

#[inline]
pub const fn token(user_data: u64) -> u32 {
    (user_data >> 32) as u32
}

#[inline]
pub const fn opcode(user_data: u64) -> u8 {
    (user_data >> 16) as u8
}

#[inline]
pub const fn tag(user_data: u64) -> u16 {
    user_data as u16
}

/// A completion routed to the handle that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Slot tag, [`CLOSE_TAG`] for the close submission or
    /// [`CANCEL_ALL_TAG`] for the cancel-all
    pub tag: u16,
    pub op: OpKind,
    /// Raw kernel result: non-negative on success, negated errno on failure
    pub result: i32,
}

impl CompletionEvent {
    /// Decode a completion, dropping the route token.
    ///
    /// Returns `None` when the opcode byte does not name a known operation.
    pub fn decode(user_data: u64, result: i32) -> Option<Self> {
        let op = OpKind::from_opcode(opcode(user_data))?;
        Some(Self {
            tag: tag(user_data),
            op,
            result,
        })
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        self.tag == CLOSE_TAG && self.op == OpKind::Close
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.op == OpKind::AsyncCancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_survive_packing() {
        let user_data = encode(0xdead_beef, OpKind::WriteVectored, 0x1234);
        assert_eq!(token(user_data), 0xdead_beef);
        assert_eq!(opcode(user_data), OpKind::WriteVectored.opcode());
        assert_eq!(tag(user_data), 0x1234);
    }

    #[test]
    fn close_is_recognised_by_tag_and_kind() {
        let close = CompletionEvent::decode(encode(1, OpKind::Close, CLOSE_TAG), 0).unwrap();
        assert!(close.is_close());

        let read_on_last_slot =
            CompletionEvent::decode(encode(1, OpKind::Read, CLOSE_TAG), 16).unwrap();
        assert!(!read_on_last_slot.is_close());
    }

    #[test]
    fn cancellations_are_recognised_by_kind_alone() {
        let cancel_all =
            CompletionEvent::decode(encode(3, OpKind::AsyncCancel, CANCEL_ALL_TAG), 0).unwrap();
        assert!(cancel_all.is_cancel());
        assert!(!cancel_all.is_close());

        let targeted = CompletionEvent::decode(encode(3, OpKind::AsyncCancel, 12), -2).unwrap();
        assert!(targeted.is_cancel());
        assert_eq!(targeted.tag, 12);

        let write = CompletionEvent::decode(encode(3, OpKind::Write, CANCEL_ALL_TAG), 4).unwrap();
        assert!(!write.is_cancel());
    }

    #[test]
    fn wake_user_data_never_collides_with_routes() {
        assert_eq!(token(WAKE_USER_DATA), u32::MAX);
        assert!(CompletionEvent::decode(encode(7, OpKind::Nop, 0) | 0xff_0000, 0).is_none());
    }
}
