//! Kernel operation vocabulary shared by handles, reactors and drivers.
//!
//! - [`OpKind`]: what an operation is, encoded as its io_uring opcode
//! - [`OpDescriptor`]: everything needed to queue one operation
//! - [`wire`]: how a completion finds its way back to the slot that issued it

mod descriptor;
mod types;
pub mod wire;

pub use descriptor::OpDescriptor;
pub use types::OpKind;
pub use wire::{CompletionEvent, CANCEL_ALL_TAG, CLOSE_TAG};
