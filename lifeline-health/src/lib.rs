//! Health supervision: deadline, logic, and heartbeat monitors, aggregated
//! by a fixed-cycle supervisor that services a hardware watchdog and feeds
//! recovery requests back to the process group manager.
//!
//! The crate stands alone (applications link it through the C ABI in
//! [`ffi`]); the daemon composes it with the lifecycle core at `main`.

pub mod deadline;
pub mod ffi;
pub mod heartbeat;
pub mod logic;
pub mod status;
pub mod supervisor;
pub mod watchdog;

pub use deadline::{Deadline, DeadlineGuard, DeadlineMonitor, DeadlineMonitorBuilder};
pub use heartbeat::HeartbeatMonitor;
pub use logic::{LogicMonitor, LogicMonitorBuilder, LogicState};
pub use status::{HealthError, MonitorStatus, Tag, TimeRange};
pub use supervisor::{HealthMonitor, HealthMonitorBuilder, RecoverySink};
pub use watchdog::{SoftWatchdog, WatchdogConfig, WatchdogDevice};
