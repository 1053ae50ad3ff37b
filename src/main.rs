use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use modeset::catalog::PropertyMetadata;
use modeset::mode::pick_mode;
use modeset::{CommitFlags, DisplayObject, DriverState, KmsDevice, ModeInfo};
use modeset_config::{Config, ModeSize, ModeSource};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DEVICE: &str = "/dev/dri/card0";

#[derive(Parser)]
#[command(name = "modeset")]
#[command(about = "Inspect and drive kernel mode-setting devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every connector, encoder, CRTC and plane with its properties
    Info {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
        /// DRM device node to open
        #[arg(default_value = DEFAULT_DEVICE)]
        device: PathBuf,
    },
    /// Light up an output as described by a config file
    Apply {
        /// Path to the KDL config file
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modeset=debug"));
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Info { json, device } => print_info(&device, json),
        Command::Apply { config } => apply(&config),
    }
}

fn print_info(path: &Path, json: bool) -> anyhow::Result<()> {
    let device = KmsDevice::open(path).with_context(|| format!("error opening {path:?}"))?;
    let catalog = device.catalog();

    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, catalog).context("error serializing catalog")?;
        writeln!(out)?;
    } else {
        for object in catalog
            .connectors()
            .iter()
            .chain(catalog.encoders())
            .chain(catalog.crtcs())
            .chain(catalog.planes())
        {
            write_object(&mut out, object)?;
        }
    }

    device.close().context("error closing device")?;
    Ok(())
}

fn write_object(out: &mut impl Write, object: &DisplayObject) -> io::Result<()> {
    let id = object.id;
    match &object.state {
        DriverState::Connector {
            connection,
            modes,
            encoders,
            ..
        } => {
            writeln!(out, "connector {id}: {connection:?}, encoders {encoders:?}")?;
            for mode in modes {
                writeln!(out, "    mode {}", format_mode(mode))?;
            }
        }
        DriverState::Encoder {
            crtc,
            possible_crtcs,
        } => {
            writeln!(
                out,
                "encoder {id}: CRTC {crtc:?}, possible CRTCs {possible_crtcs:#b}"
            )?;
        }
        DriverState::Crtc { mode, framebuffer } => match mode {
            Some(mode) => writeln!(
                out,
                "CRTC {id}: {}, framebuffer {framebuffer:?}",
                format_mode(mode)
            )?,
            None => writeln!(out, "CRTC {id}: inactive")?,
        },
        DriverState::Plane {
            crtc,
            framebuffer,
            possible_crtcs,
            formats,
        } => {
            writeln!(
                out,
                "plane {id}: CRTC {crtc:?}, framebuffer {framebuffer:?}, \
                 possible CRTCs {possible_crtcs:#b}, {} formats",
                formats.len()
            )?;
        }
    }

    for prop in object.properties.iter() {
        let access = if prop.info.mutable { "" } else { " (immutable)" };
        match (prop.metadata(), prop.enum_value_name()) {
            (_, Some(name)) => {
                writeln!(out, "    {} = {name}{access}", prop.name())?;
            }
            (PropertyMetadata::Blob, None) if prop.value != 0 => {
                writeln!(out, "    {} = blob {}{access}", prop.name(), prop.value)?;
            }
            _ => writeln!(out, "    {} = {}{access}", prop.name(), prop.value)?,
        }
    }

    Ok(())
}

fn format_mode(mode: &ModeInfo) -> String {
    let (width, height) = mode.size();
    let refresh = mode.refresh_millihertz();
    format!(
        "{width}x{height}@{}.{:03}",
        refresh / 1000,
        refresh % 1000
    )
}

fn apply(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path).map_err(|err| anyhow!("{err:?}"))?;
    let Some(output) = &config.output else {
        bail!("{path:?} has no output section");
    };
    let mode_source = output.mode_source().map_err(|err| anyhow!("{err:?}"))?;

    let device_path = config
        .device
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));
    let device = KmsDevice::open(&device_path)
        .with_context(|| format!("error opening {device_path:?}"))?;

    let mode = match mode_source {
        ModeSource::Preferred => connector_mode(&device, output.connector, None)?,
        ModeSource::Size(size) => connector_mode(&device, output.connector, Some(size))?,
        ModeSource::Modeline(modeline) => {
            ModeInfo::from_modeline(&modeline).context("error computing mode from modeline")?
        }
    };

    device
        .configure(output.connector, output.encoder, output.crtc, &mode)
        .context("error configuring output")?;

    let mut txn = device.new_transaction();
    let mut flags = CommitFlags::empty();
    txn.stage_modeset_properties(&mut flags)
        .context("error staging modeset")?;

    for plane in &config.planes {
        for prop in &plane.properties {
            txn.put_plane_property(plane.id, &prop.name, prop.value)
                .with_context(|| format!("error setting {:?} on plane {}", prop.name, plane.id))?;
        }
    }

    let commit = config.commit;
    flags.set(CommitFlags::NONBLOCK, commit.nonblock);
    flags.set(CommitFlags::PAGE_FLIP_EVENT, commit.event);
    flags.set(CommitFlags::TEST_ONLY, commit.test_only);

    txn.commit(flags, 0).context("error committing")?;

    if commit.test_only {
        info!("configuration accepted by {device_path:?}");
    } else {
        info!(
            "connector {} is now driven by CRTC {} at {}",
            output.connector,
            output.crtc,
            format_mode(&mode)
        );
    }

    device.close().context("error closing device")?;
    Ok(())
}

fn connector_mode(
    device: &KmsDevice,
    connector: u32,
    target: Option<ModeSize>,
) -> anyhow::Result<ModeInfo> {
    let object = device.catalog().connector(connector)?;
    let DriverState::Connector { modes, .. } = &object.state else {
        bail!("object {connector} is not a connector");
    };

    let Some((mode, fallback)) = pick_mode(modes, target) else {
        bail!("connector {connector} has no modes");
    };

    if fallback {
        warn!(
            "configured mode not found on connector {connector}, using {}",
            format_mode(&mode)
        );
    }

    Ok(mode)
}
