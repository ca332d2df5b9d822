pub mod event;
pub mod file_log;
pub mod log;
pub mod reader;

pub use event::{ClickEvent, Event, TelemetryEvent};
pub use file_log::FileLog;
pub use log::{LogEntry, LogError, MemoryLog, PartitionedLog};
pub use reader::{DataLossGap, PartitionReader, PollResult, PolledRecord, ReaderError};
