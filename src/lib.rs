//! Atomic kernel mode-setting.
//!
//! Open a [`KmsDevice`], pick a connector, encoder and CRTC with
//! [`configure`](KmsDevice::configure), then light them up through an [`AtomicTransaction`]:
//!
//! ```no_run
//! use modeset::mode::pick_mode;
//! use modeset::{CommitFlags, DriverState, KmsDevice};
//!
//! # fn main() -> modeset::Result<()> {
//! let device = KmsDevice::open("/dev/dri/card0")?;
//! let connector = &device.catalog().connectors()[0];
//! let DriverState::Connector { modes, encoders, .. } = &connector.state else {
//!     unreachable!()
//! };
//! let (mode, _) = pick_mode(modes, None).unwrap();
//! let crtc = device.catalog().crtcs()[0].id;
//! device.configure(connector.id, encoders[0], crtc, &mode)?;
//!
//! let mut txn = device.new_transaction();
//! let mut flags = CommitFlags::empty();
//! txn.stage_modeset_properties(&mut flags)?;
//! txn.commit(flags, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod device;
pub mod driver;
pub mod error;
pub mod mode;
pub mod session;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use catalog::{DisplayObject, ResourceCatalog};
pub use device::KmsDevice;
pub use driver::{Card, Driver, DriverState, ObjectKind};
pub use error::{Error, Result};
pub use mode::ModeInfo;
pub use session::Selection;
pub use transaction::{AtomicRequest, AtomicTransaction, CommitFlags, TransactionState};
