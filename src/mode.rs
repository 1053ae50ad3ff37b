//! Display timing descriptions.
//!
//! [`ModeInfo`] is laid out exactly like the kernel's `drm_mode_modeinfo`, so its bytes can be
//! handed to the driver as the contents of a `MODE_ID` property blob.

use std::fmt;
use std::iter::zip;
use std::time::Duration;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use modeset_config::{HSyncPolarity, ModeSize, Modeline, VSyncPolarity};
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
        const DBLSCAN = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeTypeFlags: u32 {
        const PREFERRED = 1 << 3;
        const USERDEF = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

const MODE_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize)]
pub struct ModeInfo {
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    #[serde(rename = "type")]
    pub type_: u32,
    #[serde(serialize_with = "serialize_name")]
    pub name: [u8; MODE_NAME_LEN],
}

impl ModeInfo {
    /// The raw bytes of the timing description, as stored in a mode blob.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MODE_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn flags(&self) -> ModeFlags {
        ModeFlags::from_bits_truncate(self.flags)
    }

    pub fn mode_type(&self) -> ModeTypeFlags {
        ModeTypeFlags::from_bits_truncate(self.type_)
    }

    /// Time between two vblanks for this mode, or zero when it cannot be computed.
    pub fn refresh_interval(&self) -> Duration {
        let clock = self.clock as u64;
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;

        let mut numerator = Some(htotal * vtotal * 1_000_000);
        let mut denominator = clock;

        if self.flags().contains(ModeFlags::INTERLACE) {
            denominator *= 2;
        }

        if self.flags().contains(ModeFlags::DBLSCAN) {
            numerator = numerator.and_then(|n| n.checked_mul(2));
        }

        if self.vscan > 1 {
            numerator = numerator.and_then(|n| n.checked_mul(self.vscan as u64));
        }

        // Driver-reported timings can be arbitrary.
        let Some(numerator) = numerator.and_then(|n| n.checked_add(denominator / 2)) else {
            return Duration::ZERO;
        };

        if denominator == 0 {
            return Duration::ZERO;
        }

        Duration::from_nanos(numerator / denominator)
    }

    /// Refresh rate in mHz, or 0 for a mode without a clock. Saturates at `u32::MAX`.
    pub fn refresh_millihertz(&self) -> u32 {
        let interval = self.refresh_interval().as_nanos();
        if interval == 0 {
            return 0;
        }

        u32::try_from((1_000_000_000_000 + interval / 2) / interval).unwrap_or(u32::MAX)
    }

    /// Builds a user-defined mode from an xorg-style modeline.
    pub fn from_modeline(modeline: &Modeline) -> Result<Self> {
        fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
            if cond {
                Ok(())
            } else {
                Err(Error::InvalidMode(msg()))
            }
        }

        ensure(modeline.hdisplay < modeline.hsync_start, || {
            format!(
                "hdisplay {} must be < hsync_start {}",
                modeline.hdisplay, modeline.hsync_start
            )
        })?;
        ensure(modeline.hsync_start < modeline.hsync_end, || {
            format!(
                "hsync_start {} must be < hsync_end {}",
                modeline.hsync_start, modeline.hsync_end
            )
        })?;
        ensure(modeline.hsync_end < modeline.htotal, || {
            format!(
                "hsync_end {} must be < htotal {}",
                modeline.hsync_end, modeline.htotal
            )
        })?;
        ensure(modeline.vdisplay < modeline.vsync_start, || {
            format!(
                "vdisplay {} must be < vsync_start {}",
                modeline.vdisplay, modeline.vsync_start
            )
        })?;
        ensure(modeline.vsync_start < modeline.vsync_end, || {
            format!(
                "vsync_start {} must be < vsync_end {}",
                modeline.vsync_start, modeline.vsync_end
            )
        })?;
        ensure(modeline.vsync_end < modeline.vtotal, || {
            format!(
                "vsync_end {} must be < vtotal {}",
                modeline.vsync_end, modeline.vtotal
            )
        })?;

        let pixel_clock_kilo_hertz = modeline.clock * 1000.0;
        // Calculated as documented in the CVT 1.2 standard.
        let vrefresh_hertz = (pixel_clock_kilo_hertz * 1000.0)
            / (modeline.htotal as u64 * modeline.vtotal as u64) as f64;
        ensure(vrefresh_hertz.is_finite() && vrefresh_hertz > 0., || {
            String::from("calculated refresh rate is not finite")
        })?;

        let flags = match modeline.hsync_polarity {
            HSyncPolarity::PHSync => ModeFlags::PHSYNC,
            HSyncPolarity::NHSync => ModeFlags::NHSYNC,
        } | match modeline.vsync_polarity {
            VSyncPolarity::PVSync => ModeFlags::PVSYNC,
            VSyncPolarity::NVSync => ModeFlags::NVSYNC,
        };

        let mode_name = format!(
            "{}x{}@{:.2}",
            modeline.hdisplay, modeline.vdisplay, vrefresh_hertz
        );

        Ok(Self {
            clock: pixel_clock_kilo_hertz.round() as u32,
            hdisplay: modeline.hdisplay,
            hsync_start: modeline.hsync_start,
            hsync_end: modeline.hsync_end,
            htotal: modeline.htotal,
            hskew: 0,
            vdisplay: modeline.vdisplay,
            vsync_start: modeline.vsync_start,
            vsync_end: modeline.vsync_end,
            vtotal: modeline.vtotal,
            vscan: 0,
            vrefresh: vrefresh_hertz.round() as u32,
            flags: flags.bits(),
            type_: ModeTypeFlags::USERDEF.bits(),
            name: name_from_str(&mode_name),
        })
    }
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeInfo")
            .field("name", &self.name())
            .field("clock", &self.clock)
            .field("hdisplay", &self.hdisplay)
            .field("hsync_start", &self.hsync_start)
            .field("hsync_end", &self.hsync_end)
            .field("htotal", &self.htotal)
            .field("vdisplay", &self.vdisplay)
            .field("vsync_start", &self.vsync_start)
            .field("vsync_end", &self.vsync_end)
            .field("vtotal", &self.vtotal)
            .field("vrefresh", &self.vrefresh)
            .field("flags", &self.flags)
            .field("type", &self.type_)
            .finish()
    }
}

/// Converts a string to a mode name (at most 31 bytes plus the nul terminator).
pub fn name_from_str(mode_name: &str) -> [u8; MODE_NAME_LEN] {
    let mut name = [0; MODE_NAME_LEN];

    for (a, b) in zip(&mut name[..MODE_NAME_LEN - 1], mode_name.as_bytes()) {
        *a = *b;
    }

    name
}

fn serialize_name<S: Serializer>(name: &[u8; MODE_NAME_LEN], serializer: S) -> Result<S::Ok, S::Error> {
    let len = name.iter().position(|&b| b == 0).unwrap_or(MODE_NAME_LEN);
    serializer.serialize_str(&String::from_utf8_lossy(&name[..len]))
}

/// Picks a mode out of a connector's mode list.
///
/// With a target size, the mode with that size and matching refresh rate (or the highest
/// refresh rate if the target has none) wins. Otherwise, or when nothing matches, the
/// preferred mode with the highest refresh rate is used, falling back to the first mode. The
/// returned flag is `true` when a target was given but could not be matched.
pub fn pick_mode(modes: &[ModeInfo], target: Option<ModeSize>) -> Option<(ModeInfo, bool)> {
    let mut mode: Option<&ModeInfo> = None;
    let mut fallback = false;

    if let Some(target) = target {
        let refresh = target.refresh.map(|r| (r * 1000.).round() as u32);
        for m in modes {
            if m.size() != (target.width, target.height) {
                continue;
            }

            // Interlaced modes don't appear to work.
            if m.flags().contains(ModeFlags::INTERLACE) {
                continue;
            }

            if let Some(refresh) = refresh {
                // If refresh is set, only pick modes with matching refresh.
                if m.refresh_millihertz() == refresh {
                    mode = Some(m);
                }
            } else if let Some(curr) = mode {
                // If refresh isn't set, pick the mode with the highest refresh.
                if curr.vrefresh < m.vrefresh {
                    mode = Some(m);
                }
            } else {
                mode = Some(m);
            }
        }

        if mode.is_none() {
            fallback = true;
        }
    }

    if mode.is_none() {
        // Pick a preferred mode.
        for m in modes {
            if !m.mode_type().contains(ModeTypeFlags::PREFERRED) {
                continue;
            }

            if let Some(curr) = mode {
                if curr.vrefresh < m.vrefresh {
                    mode = Some(m);
                }
            } else {
                mode = Some(m);
            }
        }
    }

    if mode.is_none() {
        // Last attempt.
        mode = modes.first();
    }

    mode.map(|m| (*m, fallback))
}

#[cfg(test)]
pub(crate) fn test_mode(width: u16, height: u16, vrefresh: u32, preferred: bool) -> ModeInfo {
    let htotal = width + 160;
    let vtotal = height + 40;
    let clock = (htotal as u64 * vtotal as u64 * vrefresh as u64 / 1000) as u32;
    let type_ = if preferred {
        ModeTypeFlags::PREFERRED | ModeTypeFlags::DRIVER
    } else {
        ModeTypeFlags::DRIVER
    };

    ModeInfo {
        clock,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal,
        vscan: 0,
        vrefresh,
        flags: (ModeFlags::PHSYNC | ModeFlags::NVSYNC).bits(),
        type_: type_.bits(),
        name: name_from_str(&format!("{width}x{height}")),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;
    use modeset_config::{HSyncPolarity, ModeSize, Modeline, VSyncPolarity};

    use super::*;

    fn modeline_1080p60() -> Modeline {
        Modeline {
            clock: 173.0,
            hdisplay: 1920,
            vdisplay: 1080,
            hsync_start: 2048,
            hsync_end: 2248,
            htotal: 2576,
            vsync_start: 1083,
            vsync_end: 1088,
            vtotal: 1120,
            hsync_polarity: HSyncPolarity::NHSync,
            vsync_polarity: VSyncPolarity::PVSync,
        }
    }

    #[test]
    fn layout_matches_kernel_modeinfo() {
        assert_eq!(std::mem::size_of::<ModeInfo>(), 68);
        assert_eq!(
            std::mem::size_of::<ModeInfo>(),
            std::mem::size_of::<drm_ffi::drm_mode_modeinfo>()
        );
    }

    #[test]
    fn test_mode_from_modeline() {
        assert_debug_snapshot!(ModeInfo::from_modeline(&modeline_1080p60()).unwrap(), @r#"
        ModeInfo {
            name: "1920x1080@59.96",
            clock: 173000,
            hdisplay: 1920,
            hsync_start: 2048,
            hsync_end: 2248,
            htotal: 2576,
            vdisplay: 1080,
            vsync_start: 1083,
            vsync_end: 1088,
            vtotal: 1120,
            vrefresh: 60,
            flags: 6,
            type: 32,
        }
        "#);

        let modeline = Modeline {
            clock: 452.5,
            hsync_start: 2088,
            hsync_end: 2296,
            htotal: 2672,
            vtotal: 1177,
            ..modeline_1080p60()
        };
        let mode = ModeInfo::from_modeline(&modeline).unwrap();
        assert_eq!(mode.name(), "1920x1080@143.88");
        assert_eq!(mode.clock, 452500);
        assert_eq!(mode.vrefresh, 144);
    }

    #[test]
    fn modeline_rejects_bad_timings() {
        let modeline = Modeline {
            hsync_start: 1900,
            ..modeline_1080p60()
        };
        let err = ModeInfo::from_modeline(&modeline).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));

        let modeline = Modeline {
            vsync_end: 1200,
            ..modeline_1080p60()
        };
        assert!(ModeInfo::from_modeline(&modeline).is_err());
    }

    #[test]
    fn refresh() {
        let mode = ModeInfo::from_modeline(&modeline_1080p60()).unwrap();
        assert_eq!(mode.refresh_interval(), Duration::from_nanos(16_676_994));
        assert_eq!(mode.refresh_millihertz(), 59963);

        let mut interlaced = mode;
        interlaced.flags |= ModeFlags::INTERLACE.bits();
        assert_eq!(interlaced.refresh_interval(), Duration::from_nanos(8_338_497));

        assert_eq!(ModeInfo::zeroed().refresh_millihertz(), 0);
    }

    #[test]
    fn refresh_of_extreme_timings() {
        let mut mode = ModeInfo::zeroed();
        mode.clock = 1;
        mode.htotal = u16::MAX;
        mode.vtotal = u16::MAX;
        mode.vscan = u16::MAX;
        mode.flags = ModeFlags::DBLSCAN.bits();
        assert_eq!(mode.refresh_interval(), Duration::ZERO);
        assert_eq!(mode.refresh_millihertz(), 0);

        // 100 ns per frame is 10^10 mHz, beyond u32.
        let mut mode = ModeInfo::zeroed();
        mode.clock = u32::MAX;
        mode.htotal = 655;
        mode.vtotal = 655;
        assert_eq!(mode.refresh_interval(), Duration::from_nanos(100));
        assert_eq!(mode.refresh_millihertz(), u32::MAX);
    }

    #[test]
    fn name_is_truncated() {
        let name = name_from_str("a-very-long-mode-name-that-does-not-fit");
        assert_eq!(name[31], 0);
        let mut mode = ModeInfo::zeroed();
        mode.name = name;
        assert_eq!(mode.name(), "a-very-long-mode-name-that-does");
    }

    #[test]
    fn pick_preferred() {
        let modes = [
            test_mode(1280, 720, 60, false),
            test_mode(1920, 1080, 60, true),
            test_mode(1920, 1080, 75, true),
        ];
        let (mode, fallback) = pick_mode(&modes, None).unwrap();
        assert_eq!(mode, modes[2]);
        assert!(!fallback);
    }

    #[test]
    fn pick_target_size() {
        let modes = [
            test_mode(1920, 1080, 60, true),
            test_mode(1280, 720, 50, false),
            test_mode(1280, 720, 60, false),
        ];
        let target = ModeSize {
            width: 1280,
            height: 720,
            refresh: None,
        };
        let (mode, fallback) = pick_mode(&modes, Some(target)).unwrap();
        assert_eq!(mode, modes[2]);
        assert!(!fallback);

        let target = ModeSize {
            width: 1280,
            height: 720,
            refresh: Some(modes[1].refresh_millihertz() as f64 / 1000.),
        };
        let (mode, _) = pick_mode(&modes, Some(target)).unwrap();
        assert_eq!(mode, modes[1]);
    }

    #[test]
    fn pick_falls_back() {
        let modes = [test_mode(1024, 768, 60, false), test_mode(800, 600, 60, false)];
        let target = ModeSize {
            width: 3840,
            height: 2160,
            refresh: None,
        };
        let (mode, fallback) = pick_mode(&modes, Some(target)).unwrap();
        assert_eq!(mode, modes[0]);
        assert!(fallback);

        assert_eq!(pick_mode(&[], None), None);
    }
}
