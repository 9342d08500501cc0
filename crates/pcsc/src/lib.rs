//! PC/SC driver for the card resource service
//!
//! This crate implements [`CardDriver`](nexum_card_resource::CardDriver) on
//! top of the PC/SC API. All local readers are exposed as a single plugin
//! named [`PLUGIN_NAME`].
//!
//! Reader connections are detected by polling the reader list; card
//! insertions are reported by one blocking `SCardGetStatusChange` loop per
//! observed reader. Worker threads end when the driver is asked to stop
//! monitoring or is dropped, and whenever they find their stream's receiver
//! gone.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use nexum_card_resource::{CardResourceService, ProfileConfig, ServiceConfig};
//! use nexum_card_resource_pcsc::PcscDriver;
//!
//! let service = CardResourceService::new(PcscDriver::new()?);
//! service.start(ServiceConfig::new().with_profile(ProfileConfig::new("any")))?;
//!
//! match service.allocate("any", Duration::from_secs(10))? {
//!     Some(resource) => {
//!         println!("Allocated {resource}");
//!         service.release(&resource)?;
//!     }
//!     None => println!("No card inserted"),
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod config;
mod driver;
mod error;
mod monitor;
mod reader;

pub use config::{PcscConfig, ShareMode};
pub use driver::{PLUGIN_NAME, PcscDriver};
pub use error::PcscError;
