//! Notification layer - ordering, rendering, queueing and delivery
//!
//! # Flow
//! 1. `AlarmDispatcher` groups alarms into `(type, destination)` batches with
//!    `DispatchOrderer` and renders each batch with its class template.
//! 2. Rendered messages go into the `DispatchQueue`, ordered by priority then
//!    enqueue sequence.
//! 3. A single `Sender` drains the queue through a `NotificationChannel`,
//!    retrying and escalating failures to an `OperatorGate`.
//!
//! # Example
//! ```ignore
//! use alarm_relay::notification::{ChannelBuilder, DispatchQueue, Priority};
//!
//! let channel = ChannelBuilder::new(settings.channel.clone()).dry_run(true).build()?;
//! let queue = DispatchQueue::new(1000);
//! queue.enqueue("MBU C1-LHR-02", "Low Voltage\t...", "Low Voltage", Priority::Normal)?;
//! ```

pub mod builder;
pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod formatter;
pub mod journal;
pub mod orderer;
pub mod priority;
pub mod queue;
pub mod sender;

pub use builder::ChannelBuilder;
pub use channel::{NotificationChannel, SendResult};
pub use dispatcher::{AlarmDispatcher, DispatchStats};
pub use journal::{DispatchJournal, DispatchRecord, Outcome};
pub use orderer::{Batch, DispatchOrderer, RenderedBatch, CANONICAL_TYPE_ORDER};
pub use priority::Priority;
pub use queue::{DispatchQueue, QueuedMessage, SentHistory, SentRecord};
pub use sender::{DeliveryFailure, LogAndContinueGate, ManualAckGate, OperatorGate, Sender};
