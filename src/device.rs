//! An open mode-setting device.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::catalog::ResourceCatalog;
use crate::driver::{Card, ClientCapability, Driver};
use crate::error::{Error, Result};
use crate::mode::ModeInfo;
use crate::session::{DisplaySession, Selection};
use crate::transaction::AtomicTransaction;

/// A DRM device with its object catalog and display session.
///
/// The catalog is immutable and can be read without locking. The session sits behind a single
/// per-device lock, which is held for the whole of every configure and commit and whenever a
/// transaction resolves the selected objects.
#[derive(Debug)]
pub struct KmsDevice<D: Driver = Card> {
    session: Mutex<DisplaySession>,
    catalog: ResourceCatalog,
    /// Dropped last: everything above refers to objects of this driver.
    driver: D,
}

impl KmsDevice<Card> {
    /// Opens the DRM node at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let card = Card::open(path)
            .inspect_err(|err| warn!("error opening {path:?}: {err:?}"))
            .map_err(Error::driver("opening device"))?;

        let device = Self::new(card)?;
        debug!("opened {path:?}");
        Ok(device)
    }
}

impl<D: Driver> KmsDevice<D> {
    /// Sets up a device on an already-open driver: requests universal planes and atomic
    /// mode-setting, then fetches the catalog.
    ///
    /// Either the whole catalog is available or nothing is kept.
    pub fn new(driver: D) -> Result<Self> {
        let _span = tracy_client::span!("KmsDevice::new");

        driver
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .inspect_err(|err| warn!("error enabling universal planes: {err:?}"))
            .map_err(Error::driver("enabling universal planes"))?;
        driver
            .set_client_capability(ClientCapability::Atomic, true)
            .inspect_err(|err| warn!("error enabling atomic mode-setting: {err:?}"))
            .map_err(Error::driver("enabling atomic mode-setting"))?;

        let catalog = ResourceCatalog::fetch_all(&driver)?;

        Ok(Self {
            session: Mutex::new(DisplaySession::new()),
            catalog,
            driver,
        })
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The session is only ever replaced as a whole, so a panic while it was locked cannot
    /// have left it half-updated.
    pub(crate) fn lock_session(&self) -> MutexGuard<'_, DisplaySession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current selection, if the device was configured.
    pub fn selection(&self) -> Option<Selection> {
        self.lock_session().selection().copied()
    }

    /// Selects the connector, encoder and CRTC to drive and the mode to drive them with.
    ///
    /// Either the session switches to the new selection, or it stays exactly as it was.
    pub fn configure(&self, connector: u32, encoder: u32, crtc: u32, mode: &ModeInfo) -> Result<()> {
        let _span = tracy_client::span!("KmsDevice::configure");

        let mut session = self.lock_session();
        session.configure(&self.driver, &self.catalog, connector, encoder, crtc, mode)
    }

    /// Starts an empty transaction.
    pub fn new_transaction(&self) -> AtomicTransaction<'_, D> {
        AtomicTransaction::new(self)
    }

    /// Closes the device, reporting a failure to destroy the mode blob.
    ///
    /// Dropping the device does the same but can only log that failure.
    pub fn close(self) -> Result<()> {
        let mut session = self.lock_session();
        session.release(&self.driver)
    }
}

impl<D: Driver> Drop for KmsDevice<D> {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = session.release(&self.driver) {
            warn!("error releasing display session: {err:?}");
        }
    }
}
