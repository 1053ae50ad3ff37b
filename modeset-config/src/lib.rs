//! Configuration for the `modeset` tool.
//!
//! The configuration is a KDL document describing which DRM device to open, which
//! connector/encoder/CRTC pipeline to light up with which mode, and any extra plane
//! properties to include in the commit.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use miette::{Context, IntoDiagnostic};
use tracing::debug;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, unwrap(argument))]
    pub device: Option<PathBuf>,
    #[knuffel(child)]
    pub output: Option<Output>,
    #[knuffel(children(name = "plane"))]
    pub planes: Vec<Plane>,
    #[knuffel(child, default)]
    pub commit: Commit,
}

/// The pipeline to configure.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Output {
    #[knuffel(child, unwrap(argument))]
    pub connector: u32,
    #[knuffel(child, unwrap(argument))]
    pub encoder: u32,
    #[knuffel(child, unwrap(argument))]
    pub crtc: u32,
    #[knuffel(child)]
    pub mode: Option<ModeSize>,
    #[knuffel(child)]
    pub modeline: Option<Modeline>,
}

/// A mode picked from the connector's advertised list.
#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct ModeSize {
    #[knuffel(argument)]
    pub width: u16,
    #[knuffel(argument)]
    pub height: u16,
    #[knuffel(property)]
    pub refresh: Option<f64>,
}

/// A custom mode in xorg modeline notation. The clock is in MHz.
#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Modeline {
    #[knuffel(argument)]
    pub clock: f64,
    #[knuffel(argument)]
    pub hdisplay: u16,
    #[knuffel(argument)]
    pub hsync_start: u16,
    #[knuffel(argument)]
    pub hsync_end: u16,
    #[knuffel(argument)]
    pub htotal: u16,
    #[knuffel(argument)]
    pub vdisplay: u16,
    #[knuffel(argument)]
    pub vsync_start: u16,
    #[knuffel(argument)]
    pub vsync_end: u16,
    #[knuffel(argument)]
    pub vtotal: u16,
    #[knuffel(argument, str)]
    pub hsync_polarity: HSyncPolarity,
    #[knuffel(argument, str)]
    pub vsync_polarity: VSyncPolarity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HSyncPolarity {
    PHSync,
    NHSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VSyncPolarity {
    PVSync,
    NVSync,
}

/// Extra properties to set on a plane, addressed by id.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Plane {
    #[knuffel(argument)]
    pub id: u32,
    #[knuffel(children(name = "property"))]
    pub properties: Vec<PropertyValue>,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct PropertyValue {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(argument)]
    pub value: u64,
}

#[derive(knuffel::Decode, Debug, Default, Clone, Copy, PartialEq)]
pub struct Commit {
    #[knuffel(child)]
    pub nonblock: bool,
    #[knuffel(child)]
    pub event: bool,
    #[knuffel(child)]
    pub test_only: bool,
}

/// Where the mode for the output comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeSource {
    /// The connector's preferred mode.
    Preferred,
    Size(ModeSize),
    Modeline(Modeline),
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("config.kdl");
        let config = Self::parse(filename, &contents).context("error parsing")?;
        config.validate()?;

        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    /// Checks constraints that the KDL schema alone cannot express.
    pub fn validate(&self) -> miette::Result<()> {
        if let Some(output) = &self.output {
            output.mode_source()?;
        }

        for plane in &self.planes {
            for (i, prop) in plane.properties.iter().enumerate() {
                miette::ensure!(
                    !plane.properties[..i].iter().any(|p| p.name == prop.name),
                    "plane {} sets property {:?} more than once",
                    plane.id,
                    prop.name
                );
            }
        }

        Ok(())
    }
}

impl Output {
    pub fn mode_source(&self) -> miette::Result<ModeSource> {
        match (self.mode, self.modeline) {
            (None, None) => Ok(ModeSource::Preferred),
            (Some(size), None) => Ok(ModeSource::Size(size)),
            (None, Some(modeline)) => Ok(ModeSource::Modeline(modeline)),
            (Some(_), Some(_)) => {
                miette::bail!("output can have either `mode` or `modeline`, not both")
            }
        }
    }
}

impl FromStr for HSyncPolarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+hsync" => Ok(Self::PHSync),
            "-hsync" => Ok(Self::NHSync),
            _ => Err(format!(
                r#"invalid horizontal sync polarity {s:?}, can be "+hsync" or "-hsync""#
            )),
        }
    }
}

impl FromStr for VSyncPolarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+vsync" => Ok(Self::PVSync),
            "-vsync" => Ok(Self::NVSync),
            _ => Err(format!(
                r#"invalid vertical sync polarity {s:?}, can be "+vsync" or "-vsync""#
            )),
        }
    }
}
