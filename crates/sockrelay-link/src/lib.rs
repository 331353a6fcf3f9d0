//! Producer side of sockrelay.
//!
//! A [`ResilientLink`] keeps one WebSocket connection to the consumer. Work
//! packets queued through a [`LinkSender`] are written in order by a sender
//! thread, which redials once when a write finds the link broken. A receiver
//! thread decodes results and publishes them on a [`ResultFanout`].

pub mod error;
pub mod fanout;
pub mod link;

#[cfg(test)]
mod testing;

pub use error::{LinkError, Result};
pub use fanout::{ResultEvent, ResultFanout, DEFAULT_FANOUT_CAPACITY};
pub use link::{
    LinkConfig, LinkSender, LinkState, ResilientLink, DEFAULT_QUEUE_CAPACITY, DEFAULT_UPSTREAM_URL,
};
