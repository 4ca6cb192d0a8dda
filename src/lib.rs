//! Alarm Relay - polls network alarm snapshots and relays them to operations groups

pub mod alarm;
pub mod config;
pub mod console;
pub mod events;
pub mod instant;
pub mod notification;
pub mod pipeline;
pub mod scheduler;
pub mod shutdown;
pub mod source;

pub use alarm::{
    Alarm, AlarmCategory, AlarmIngestor, DeduplicationCache, Destination, DestinationKind, RawRow,
    SiteInfo, TOGGLE_TYPE,
};
pub use console::OperatorCommand;
pub use config::{ChannelSettings, GroupMapping, MessageFormats, SendControl, SenderSettings, Settings};
pub use events::{EventBus, EventListener, PipelineEvent, TracingListener};
pub use instant::{InstantDiffTracker, InstantTrigger};
pub use notification::{
    AlarmDispatcher, ChannelBuilder, DispatchOrderer, DispatchQueue, DispatchStats,
    LogAndContinueGate, ManualAckGate, NotificationChannel, OperatorGate, Priority, SendResult,
    Sender,
};
pub use pipeline::{CycleReport, Pipeline, PipelineBuilder, PipelineHandle};
pub use scheduler::{BatchScheduler, FlushReason, FlushedBatch, SchedulePolicy};
pub use shutdown::Shutdown;
pub use source::{AlarmSource, Directory, SiteRecord, SnapshotDirSource, StaticDirectory};
