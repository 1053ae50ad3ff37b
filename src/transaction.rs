//! Atomic mode-setting transactions.
//!
//! An [`AtomicTransaction`] accumulates `(object, property, value)` writes, resolving property
//! names against the catalog, and hands them to the driver as one all-or-nothing commit.
//! Transactions are built per commit attempt and never reused afterwards.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::catalog::DisplayObject;
use crate::device::KmsDevice;
use crate::driver::{Driver, ObjectKind};
use crate::error::{Error, Result};
use crate::session::DisplaySession;

bitflags! {
    /// Flags for [`AtomicTransaction::commit`], with the kernel's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Send a completion event carrying the commit's completion token.
        const PAGE_FLIP_EVENT = 0x0001;
        /// Only check whether the configuration would be accepted.
        const TEST_ONLY = 0x0100;
        /// Return before the commit has been applied.
        const NONBLOCK = 0x0200;
        /// Allow a full modeset rather than only a property update.
        const ALLOW_MODESET = 0x0400;
    }
}

/// A single property write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PropertyEntry {
    pub object: u32,
    pub property: u32,
    pub value: u64,
}

/// Ordered list of property writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    entries: Vec<PropertyEntry>,
}

/// A request laid out the way the kernel's atomic ioctl expects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedRequest {
    pub objects: Vec<u32>,
    /// Number of properties for each entry of `objects`.
    pub counts: Vec<u32>,
    pub properties: Vec<u32>,
    pub values: Vec<u64>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(&mut self, object: u32, property: u32, value: u64) -> Result<()> {
        self.entries.try_reserve(1)?;
        self.entries.push(PropertyEntry {
            object,
            property,
            value,
        });
        Ok(())
    }

    /// Appends all of `other`'s writes, or none of them.
    pub fn merge(&mut self, other: AtomicRequest) -> Result<()> {
        self.entries.try_reserve(other.entries.len())?;
        self.entries.extend(other.entries);
        Ok(())
    }

    pub fn entries(&self) -> &[PropertyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups the writes by object, sorted by object then property id. When the same property
    /// of the same object is written more than once, the last write wins.
    pub fn grouped(&self) -> GroupedRequest {
        let mut sorted = BTreeMap::new();
        for entry in &self.entries {
            sorted.insert((entry.object, entry.property), entry.value);
        }

        let mut grouped = GroupedRequest::default();
        for ((object, property), value) in sorted {
            if grouped.objects.last() != Some(&object) {
                grouped.objects.push(object);
                grouped.counts.push(0);
            }
            if let Some(count) = grouped.counts.last_mut() {
                *count += 1;
            }
            grouped.properties.push(property);
            grouped.values.push(value);
        }

        grouped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Building,
    Committed,
    Failed,
}

/// Property writes for one commit attempt on a [`KmsDevice`].
///
/// The transaction borrows its device, so the device cannot be closed while one is alive.
/// After [`commit`](Self::commit), successful or not, the transaction only rejects further
/// use; build a fresh one to try again.
#[derive(Debug)]
pub struct AtomicTransaction<'dev, D: Driver> {
    device: &'dev KmsDevice<D>,
    request: AtomicRequest,
    state: TransactionState,
}

impl<'dev, D: Driver> AtomicTransaction<'dev, D> {
    pub(crate) fn new(device: &'dev KmsDevice<D>) -> Self {
        Self {
            device,
            request: AtomicRequest::new(),
            state: TransactionState::Building,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &AtomicRequest {
        &self.request
    }

    pub fn entries(&self) -> &[PropertyEntry] {
        self.request.entries()
    }

    pub fn len(&self) -> usize {
        self.request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }

    fn ensure_building(&self) -> Result<()> {
        match self.state {
            TransactionState::Building => Ok(()),
            TransactionState::Committed => {
                Err(Error::InvalidState("transaction was already committed"))
            }
            TransactionState::Failed => Err(Error::InvalidState("transaction failed to commit")),
        }
    }

    /// Sets a property of the selected connector.
    pub fn put_connector_property(&mut self, name: &str, value: u64) -> Result<()> {
        self.put_selected_property(ObjectKind::Connector, name, value)
    }

    /// Sets a property of the selected CRTC.
    pub fn put_crtc_property(&mut self, name: &str, value: u64) -> Result<()> {
        self.put_selected_property(ObjectKind::Crtc, name, value)
    }

    fn put_selected_property(&mut self, kind: ObjectKind, name: &str, value: u64) -> Result<()> {
        self.ensure_building()?;

        let session = self.device.lock_session();
        let object = selected_object(self.device, &session, kind)?;
        let prop = object.require_property(name)?;

        trace!("{kind} {}: {name} ({}) = {value}", object.id, prop.id);
        self.request.add_property(object.id, prop.id, value)
    }

    /// Sets a property of a plane. Planes are addressed directly rather than selected, so this
    /// does not touch the session.
    pub fn put_plane_property(&mut self, plane: u32, name: &str, value: u64) -> Result<()> {
        self.ensure_building()?;

        let object = self.device.catalog().plane(plane)?;
        let prop = object.require_property(name)?;

        trace!("plane {plane}: {name} ({}) = {value}", prop.id);
        self.request.add_property(plane, prop.id, value)
    }

    /// Adds the writes for a full modeset of the configured pipeline: the connector's
    /// `CRTC_ID`, and the CRTC's `MODE_ID` and `ACTIVE`. Also sets
    /// [`CommitFlags::ALLOW_MODESET`] in `flags`.
    ///
    /// The three writes are added together or not at all.
    pub fn stage_modeset_properties(&mut self, flags: &mut CommitFlags) -> Result<()> {
        self.ensure_building()?;

        let session = self.device.lock_session();
        let selection = session
            .selection()
            .ok_or(Error::InvalidState("modeset staged before configure"))?;

        let catalog = self.device.catalog();
        let connector = catalog.connector(selection.connector)?;
        let crtc = catalog.crtc(selection.crtc)?;

        let mut modeset = AtomicRequest::new();
        modeset.add_property(
            connector.id,
            connector.require_property("CRTC_ID")?.id,
            u64::from(crtc.id),
        )?;
        modeset.add_property(
            crtc.id,
            crtc.require_property("MODE_ID")?.id,
            u64::from(selection.mode_blob_id),
        )?;
        modeset.add_property(crtc.id, crtc.require_property("ACTIVE")?.id, 1)?;

        self.request.merge(modeset)?;
        *flags |= CommitFlags::ALLOW_MODESET;

        Ok(())
    }

    /// Submits every accumulated write to the driver as one atomic commit.
    ///
    /// `completion_token` is attached to the completion event requested with
    /// [`CommitFlags::PAGE_FLIP_EVENT`].
    pub fn commit(&mut self, flags: CommitFlags, completion_token: u64) -> Result<()> {
        let _span = tracy_client::span!("AtomicTransaction::commit");

        self.ensure_building()?;

        let _session = self.device.lock_session();
        let res = self
            .device
            .driver()
            .atomic_commit(flags, &self.request, completion_token);

        match res {
            Ok(()) => {
                debug!(
                    "committed {} properties with flags {flags:?}",
                    self.request.len()
                );
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(err) => {
                warn!("error committing atomic request: {err:?}");
                self.state = TransactionState::Failed;
                Err(Error::Driver {
                    step: "committing atomic request",
                    source: err,
                })
            }
        }
    }
}

fn selected_object<'a, D: Driver>(
    device: &'a KmsDevice<D>,
    session: &DisplaySession,
    kind: ObjectKind,
) -> Result<&'a DisplayObject> {
    let selection = session
        .selection()
        .ok_or(Error::NothingSelected { kind })?;

    let id = match kind {
        ObjectKind::Connector => selection.connector,
        ObjectKind::Encoder => selection.encoder,
        ObjectKind::Crtc => selection.crtc,
        ObjectKind::Plane => return Err(Error::NothingSelected { kind }),
    };

    device.catalog().lookup(kind, id)
}
