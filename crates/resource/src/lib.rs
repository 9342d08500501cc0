//! Smart-card reader allocation
//!
//! This crate hands out exclusive access to smart-card readers, grouped into
//! pools by named profiles. A [`CardDriver`] reports plugins, readers and
//! card insertions; the [`CardResourceService`] keeps one pool per profile up
//! to date with what the driver reports and serves blocking allocations
//! against those pools.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use nexum_card_resource::{
//!     AllocationStrategy, CardDriver, CardResourceService, FilterSpec, ProfileConfig,
//!     ServiceConfig,
//! };
//!
//! fn run(driver: impl CardDriver + 'static) -> nexum_card_resource::Result<()> {
//!     let service = CardResourceService::new(driver);
//!     service.start(
//!         ServiceConfig::new().with_profile(
//!             ProfileConfig::new("sam")
//!                 .with_reader(FilterSpec::Regex("SAM.*".into()))
//!                 .with_strategy(AllocationStrategy::Cyclic),
//!         ),
//!     )?;
//!
//!     if let Some(resource) = service.allocate("sam", Duration::from_secs(5))? {
//!         println!("Using {resource}");
//!         service.release(&resource)?;
//!     }
//!
//!     service.stop();
//!     Ok(())
//! }
//! # fn main() {}
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod config;
mod coordinator;
mod driver;
mod error;
mod monitor;
mod pool;
mod profile;
mod reader;
mod registry;
mod resource;
mod service;

pub use config::{ProfileConfig, ServiceConfig};
pub use driver::{
    CardDriver, CardEvent, CardEventReceiver, CardEventSender, CardStatus, PoolReader,
    ReaderConfigurator, ReaderEvent, ReaderEventReceiver, ReaderEventSender, card_event_channel,
    reader_event_channel,
};
pub use error::{ConfigError, DriverError, Error, Result};
pub use monitor::MonitorState;
pub use pool::{AllocationStrategy, ResourceStatus};
pub use profile::{
    CardPresence, Filter, FilterSpec, MAX_AID_LEN, Profile, ProfileMatch, SW_SUCCESS,
    SelectionStep, matches,
};
pub use reader::ReaderDescriptor;
pub use registry::PoolStatus;
pub use resource::{CardResource, ResourceState};
pub use service::{CardResourceService, ServiceStatus};
