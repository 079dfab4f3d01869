mod header;
mod message;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{Message, MessageFlags, MessageSection},
};

/// Request id used for the handshake exchange on a new connection. The handshake and
/// authentication steps use fixed negative ids so their replies can be matched before the
/// connection's own counter starts handing out ids.
pub(crate) const HANDSHAKE_REQUEST_ID: i32 = -2;

/// Request id used for the first message of an authentication exchange.
pub(crate) const AUTH_FIRST_REQUEST_ID: i32 = -3;

/// Request id used for the continuation message of an authentication exchange.
pub(crate) const AUTH_CONTINUE_REQUEST_ID: i32 = -4;

/// Request id used for the final message of an authentication exchange.
pub(crate) const AUTH_FINAL_REQUEST_ID: i32 = -5;
