//! In-process change propagation.
//!
//! - **`bus`**: topic-keyed synchronous publish/subscribe ([`EventBus`]).
//! - **`change`**: the [`ChangeEvent`] published on `<entity>.change` after
//!   every successful write or delete.

pub mod bus;
pub mod change;

pub use bus::{EventBus, ListenerId};
pub use change::{change_topic, ChangeEvent, ChangeMethod};
