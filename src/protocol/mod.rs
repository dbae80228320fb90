//! Gateway wire protocol
//!
//! Opcode and close-code tables plus the payload framing shared by the
//! shard state machine and the runtime.

mod close_codes;
mod opcodes;
mod payloads;

pub use close_codes::{is_fatal, requires_new_session, requires_reshard, CloseCode, RESHARD_CODE};
pub use opcodes::OpCode;
pub use payloads::{
    heartbeat_frame, identify_frame, resume_frame, GatewayPayload, HelloData, API_VERSION,
    CLIENT_NAME,
};
