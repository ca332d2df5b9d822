pub mod rows;
pub mod writer;

pub use rows::{ClickRow, RawRows, SinkRow, TelemetryRow, WindowCountRow};
pub use writer::{PublishedFile, SinkError, SinkWriter, StagedFile};
