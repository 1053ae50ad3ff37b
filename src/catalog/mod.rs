//! Point-in-time snapshot of a device's mode-setting objects.
//!
//! The catalog is fetched once when the device is opened and never refreshed: observing
//! hot-plugged topology changes needs a fresh open. Every object is fetched together with its
//! properties and their metadata, and each object kind is fetched all-or-nothing.

mod property;

use std::mem;

use serde::Serialize;
use tracing::{debug, trace, warn};

pub use property::{EnumEntry, PropertyDescriptor, PropertyInfo, PropertyMetadata, PropertySet};

use crate::driver::{Driver, DriverState, ObjectKind};
use crate::error::{Error, Result};

/// A connector, encoder, CRTC or plane, with its properties.
///
/// The driver state and the properties are fetched as a unit: an object is either complete or
/// not in the catalog at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayObject {
    pub id: u32,
    pub state: DriverState,
    pub properties: PropertySet,
}

impl DisplayObject {
    pub fn kind(&self) -> ObjectKind {
        self.state.kind()
    }

    /// Finds a property by name, see [`PropertySet::find`].
    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.find(name)
    }

    /// Like [`Self::property`], but a miss is an error naming this object.
    pub fn require_property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.property(name).ok_or_else(|| Error::PropertyNotFound {
            kind: self.kind(),
            object: self.id,
            name: name.to_owned(),
        })
    }

    fn fetch(driver: &impl Driver, kind: ObjectKind, id: u32) -> Result<Self> {
        let state = driver
            .get_object(kind, id)
            .inspect_err(|err| warn!("error getting {kind} {id}: {err:?}"))
            .map_err(Error::driver(get_object_step(kind)))?;

        let properties = if kind.has_properties() {
            fetch_properties(driver, kind, id)?
        } else {
            PropertySet::default()
        };

        Ok(Self {
            id,
            state,
            properties,
        })
    }
}

fn fetch_properties(driver: &impl Driver, kind: ObjectKind, id: u32) -> Result<PropertySet> {
    let values = driver
        .get_properties(kind, id)
        .inspect_err(|err| warn!("error getting properties of {kind} {id}: {err:?}"))
        .map_err(Error::driver("getting object properties"))?;

    let mut properties = Vec::new();
    properties.try_reserve_exact(values.len())?;

    for (prop, value) in values {
        let info = driver
            .get_property_metadata(prop)
            .inspect_err(|err| warn!("error getting property {prop} of {kind} {id}: {err:?}"))
            .map_err(Error::driver("getting property metadata"))?;

        properties.push(PropertyDescriptor {
            id: prop,
            value,
            info,
        });
    }

    Ok(PropertySet::new(properties))
}

fn get_object_step(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Connector => "getting connector",
        ObjectKind::Encoder => "getting encoder",
        ObjectKind::Crtc => "getting CRTC",
        ObjectKind::Plane => "getting plane",
    }
}

fn list_step(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Connector => "listing connectors",
        ObjectKind::Encoder => "listing encoders",
        ObjectKind::Crtc => "listing CRTCs",
        ObjectKind::Plane => "listing planes",
    }
}

/// Every connector, encoder, CRTC and plane of a device.
///
/// Owns all objects and their properties. Dropping the catalog releases them in reverse
/// acquisition order: planes, CRTCs, encoders, connectors.
#[derive(Debug, Default, Serialize)]
pub struct ResourceCatalog {
    connectors: Vec<DisplayObject>,
    encoders: Vec<DisplayObject>,
    crtcs: Vec<DisplayObject>,
    planes: Vec<DisplayObject>,
}

impl ResourceCatalog {
    /// Fetches all objects from the driver.
    ///
    /// If anything fails, the objects already fetched are released before the error is
    /// returned: first those of the failing kind, then the earlier kinds in reverse order.
    pub fn fetch_all(driver: &impl Driver) -> Result<Self> {
        let _span = tracy_client::span!("ResourceCatalog::fetch_all");

        // Kinds are filled in acquisition order. On an early return, dropping the partial
        // catalog tears down whatever was fetched so far.
        let mut catalog = Self::default();
        for kind in ObjectKind::ALL {
            *catalog.objects_mut(kind) = fetch_kind(driver, kind)?;
        }

        debug!(
            "fetched {} connectors, {} encoders, {} CRTCs, {} planes",
            catalog.connectors.len(),
            catalog.encoders.len(),
            catalog.crtcs.len(),
            catalog.planes.len(),
        );

        Ok(catalog)
    }

    /// All objects of a kind, in driver order.
    pub fn objects(&self, kind: ObjectKind) -> &[DisplayObject] {
        match kind {
            ObjectKind::Connector => &self.connectors,
            ObjectKind::Encoder => &self.encoders,
            ObjectKind::Crtc => &self.crtcs,
            ObjectKind::Plane => &self.planes,
        }
    }

    fn objects_mut(&mut self, kind: ObjectKind) -> &mut Vec<DisplayObject> {
        match kind {
            ObjectKind::Connector => &mut self.connectors,
            ObjectKind::Encoder => &mut self.encoders,
            ObjectKind::Crtc => &mut self.crtcs,
            ObjectKind::Plane => &mut self.planes,
        }
    }

    /// Finds an object by kind and id. This is a linear scan; devices have tens of objects at
    /// most.
    pub fn lookup(&self, kind: ObjectKind, id: u32) -> Result<&DisplayObject> {
        self.objects(kind)
            .iter()
            .find(|obj| obj.id == id)
            .ok_or(Error::ObjectNotFound { kind, id })
    }

    pub fn connector(&self, id: u32) -> Result<&DisplayObject> {
        self.lookup(ObjectKind::Connector, id)
    }

    pub fn encoder(&self, id: u32) -> Result<&DisplayObject> {
        self.lookup(ObjectKind::Encoder, id)
    }

    pub fn crtc(&self, id: u32) -> Result<&DisplayObject> {
        self.lookup(ObjectKind::Crtc, id)
    }

    pub fn plane(&self, id: u32) -> Result<&DisplayObject> {
        self.lookup(ObjectKind::Plane, id)
    }

    pub fn connectors(&self) -> &[DisplayObject] {
        &self.connectors
    }

    pub fn encoders(&self) -> &[DisplayObject] {
        &self.encoders
    }

    pub fn crtcs(&self) -> &[DisplayObject] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[DisplayObject] {
        &self.planes
    }
}

impl Drop for ResourceCatalog {
    fn drop(&mut self) {
        for kind in ObjectKind::ALL.into_iter().rev() {
            let objects = mem::take(self.objects_mut(kind));
            release(kind, objects);
        }
    }
}

/// Fetches every object of one kind, all-or-nothing.
fn fetch_kind(driver: &impl Driver, kind: ObjectKind) -> Result<Vec<DisplayObject>> {
    let _span = tracy_client::span!("fetch_kind");

    let ids = driver
        .object_ids(kind)
        .inspect_err(|err| warn!("error {}: {err:?}", list_step(kind)))
        .map_err(Error::driver(list_step(kind)))?;

    let mut objects = Vec::new();
    objects.try_reserve_exact(ids.len())?;

    for id in ids {
        match DisplayObject::fetch(driver, kind, id) {
            Ok(object) => objects.push(object),
            Err(err) => {
                release(kind, objects);
                return Err(err);
            }
        }
    }

    Ok(objects)
}

/// The one release path for objects of a kind, used both when a fetch fails partway and when
/// the catalog is dropped. Objects go in reverse acquisition order.
fn release(kind: ObjectKind, mut objects: Vec<DisplayObject>) {
    while let Some(object) = objects.pop() {
        trace!("releasing {kind} {}", object.id);
        drop(object);
    }
}
