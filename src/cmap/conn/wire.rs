mod header;
mod message;
mod query;
mod reply;
mod util;

pub(crate) use self::{
    message::{DocumentSequence, Message, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
    query::Query,
    reply::Reply,
    util::next_request_id,
};
#[cfg(test)]
pub(crate) use self::{header::OpCode, reply::ResponseFlags, util::read_frame};
