//! The configured output pipeline of a device.
//!
//! The session itself lives inside its [`KmsDevice`](crate::KmsDevice) and is only reachable
//! through it; callers see copies of the [`Selection`].
//!
//! ```compile_fail
//! use modeset::session::DisplaySession;
//! ```

use tracing::{debug, warn};

use crate::catalog::ResourceCatalog;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::mode::ModeInfo;

/// The connector, encoder and CRTC picked by a successful configure, and the driver-side blob
/// holding the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub connector: u32,
    pub encoder: u32,
    pub crtc: u32,
    pub mode: ModeInfo,
    /// Blob holding `mode`. Owned by the session and alive for as long as the selection is.
    pub mode_blob_id: u32,
}

/// Mutable configuration state of a device. Lives behind the device lock.
///
/// A session without a selection is unconfigured. Once configured, it always holds exactly one
/// live mode blob.
#[derive(Debug, Default)]
pub(crate) struct DisplaySession {
    selection: Option<Selection>,
}

impl DisplaySession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Selects a pipeline and a mode.
    ///
    /// On any failure the session is left exactly as it was, and a newly created blob is
    /// destroyed again. The previous blob is destroyed before the new selection is adopted, so
    /// the session never holds two blobs.
    pub(crate) fn configure(
        &mut self,
        driver: &impl Driver,
        catalog: &ResourceCatalog,
        connector: u32,
        encoder: u32,
        crtc: u32,
        mode: &ModeInfo,
    ) -> Result<()> {
        catalog.connector(connector)?;
        catalog.encoder(encoder)?;
        catalog.crtc(crtc)?;

        let blob = driver
            .create_blob(mode.as_bytes())
            .inspect_err(|err| warn!("error creating mode blob: {err:?}"))
            .map_err(Error::driver("creating mode blob"))?;

        if let Some(previous) = &self.selection {
            if let Err(err) = driver.destroy_blob(previous.mode_blob_id) {
                warn!(
                    "error destroying previous mode blob {}: {err:?}",
                    previous.mode_blob_id
                );

                // Don't leak the blob we just created.
                if let Err(err) = driver.destroy_blob(blob) {
                    warn!("error destroying mode blob {blob}: {err:?}");
                }

                return Err(Error::Driver {
                    step: "destroying previous mode blob",
                    source: err,
                });
            }
        }

        self.selection = Some(Selection {
            connector,
            encoder,
            crtc,
            mode: *mode,
            mode_blob_id: blob,
        });

        debug!(
            "configured connector {connector}, encoder {encoder}, CRTC {crtc} \
             with mode {} (blob {blob})",
            mode.name()
        );

        Ok(())
    }

    /// Drops the selection and destroys its mode blob.
    pub(crate) fn release(&mut self, driver: &impl Driver) -> Result<()> {
        let Some(selection) = self.selection.take() else {
            return Ok(());
        };

        driver
            .destroy_blob(selection.mode_blob_id)
            .map_err(Error::driver("destroying mode blob"))
    }
}
