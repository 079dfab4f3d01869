#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

pub use ::bson;

mod bson_util;
mod change_stream;
mod client;
mod cmap;
mod cursor;
pub mod error;
pub mod event;
mod hello;
mod namespace;
mod operation;
pub mod options;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
#[cfg(test)]
mod test;

pub use crate::{
    change_stream::{ChangeStream, ResumeToken},
    client::{session::ClientSession, Client},
    cursor::Cursor,
    namespace::Namespace,
    operation::InsertResult,
};

pub use sdam::public::*;
