pub mod error;
pub mod frames;
pub mod opcodes;
pub mod wire;

pub use error::{EvqlError, Result};
pub use frames::{ErrorFrame, HelloFrame, ReadyFrame};
pub use opcodes::{frame_flags, hello_flags, opcode, PROTOCOL_VERSION};
