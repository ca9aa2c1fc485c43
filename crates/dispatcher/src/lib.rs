//! Dispatcher - change notification broadcast for relevance models
//!
//! One well-known coordination node acts as an all-to-all bus for
//! low-frequency administrative events. See [`MessageDispatcher`].

pub mod dispatcher;
pub mod message;

pub use dispatcher::{DispatcherState, MessageDispatcher, MessageReceiver, MAX_REARM_BACKOFF};
pub use message::{model_payload, split_model_payload, Message};
