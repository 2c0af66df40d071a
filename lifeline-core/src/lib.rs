//! Process lifecycle management core.
//!
//! The daemon side of the lifecycle manager: configuration, the per-group
//! dependency graph executor, process launching and reaping, and the
//! shared-memory control channel used by state managers.
//!
//! The pieces wire together as follows: external clients post requests into a
//! [`channel::ControlChannel`] mailbox; the [`manager::ProcessGroupManager`]
//! loop routes them into a [`graph::Graph`]; the graph schedules
//! [`node::ProcessNode`] work onto the [`jobs`] worker pool; the
//! [`launcher::ProcessHost`] forks children which are registered in the
//! [`pidmap::ProcessMap`]; the [`reaper`] thread collects exits and feeds
//! them back to the owning node.

pub mod channel;
pub mod config;
pub mod error;
pub mod graph;
pub mod ident;
pub mod jobs;
pub mod launcher;
pub mod manager;
pub mod node;
pub mod osal;
pub mod pidmap;
pub mod reaper;
pub mod recovery;

pub use error::{CoreError, ExecError};
pub use ident::Identifier;
