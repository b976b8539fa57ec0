//! The built-in pipeline steps
//!
//! Incoming, in assembly order: [`RetryStep`], [`HandleDeferredStep`],
//! [`DeferredMessagesStep`], [`DeserializeStep`], [`DispatchStep`].
//! Outgoing: [`SerializeStep`], [`SendStep`].
//!
//! The deferral pair is removed at assembly time for transports with
//! native future delivery.

mod deferral;
mod deserialize;
mod dispatch_incoming;
mod handle_deferred;
mod retry;
mod send;
mod serialize;

pub use deferral::DeferredMessagesStep;
pub use deserialize::DeserializeStep;
pub use dispatch_incoming::DispatchStep;
pub use handle_deferred::HandleDeferredStep;
pub use retry::RetryStep;
pub use send::SendStep;
pub use serialize::SerializeStep;
