//! fj-agent library
//!
//! Core of the bus-connected worker agent:
//! - Binary frame codec and the subject routing scheme
//! - Bus and executor capability contracts
//! - Worker lifecycle management and stdout streaming
//! - RPC connector and work-item dispatch

pub mod agent;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod executor;
pub mod subject;
pub mod taskgroup;
pub mod worker;
