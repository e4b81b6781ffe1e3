//! DFU package extraction.
//!
//! A DFU package is a ZIP with a `manifest.json` naming, per firmware
//! component, an init packet (`dat_file`) and a firmware image (`bin_file`).

use std::io::{Read, Seek};

use log::info;

use crate::error::DfuError;

/// The two byte buffers a transfer consumes.
pub struct FirmwareImage {
    pub init_data: Vec<u8>,
    pub firmware_data: Vec<u8>,
}

/// Components in preference order; the first one present in the manifest wins.
const COMPONENTS: [&str; 4] = ["application", "softdevice_bootloader", "bootloader", "softdevice"];

/// Extract init packet and firmware image from the package at `path`.
pub fn extract(path: &str) -> Result<FirmwareImage, DfuError> {
    let file = std::fs::File::open(path)
        .map_err(|err| DfuError::ArchiveInvalid(format!("cannot open {path}: {err}")))?;
    extract_from(file)
}

fn extract_from<R: Read + Seek>(reader: R) -> Result<FirmwareImage, DfuError> {
    let mut zip = zip::ZipArchive::new(reader)
        .map_err(|err| DfuError::ArchiveInvalid(format!("not a ZIP archive: {err}")))?;

    let manifest: serde_json::Value = {
        let raw = zip
            .by_name("manifest.json")
            .map_err(|_| DfuError::ArchiveInvalid("missing manifest.json".into()))?;
        serde_json::from_reader(raw)
            .map_err(|err| DfuError::ArchiveInvalid(format!("malformed manifest.json: {err}")))?
    };

    let component = COMPONENTS
        .iter()
        .find(|name| manifest["manifest"][**name].is_object())
        .ok_or_else(|| DfuError::ArchiveInvalid("no known firmware component in manifest".into()))?;
    info!("package component: {component}");

    let init_data = read_part(&mut zip, &manifest, component, "dat_file")?;
    let firmware_data = read_part(&mut zip, &manifest, component, "bin_file")?;
    Ok(FirmwareImage { init_data, firmware_data })
}

fn read_part<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
    manifest: &serde_json::Value,
    component: &str,
    part: &str,
) -> Result<Vec<u8>, DfuError> {
    let name = manifest["manifest"][component][part]
        .as_str()
        .ok_or_else(|| DfuError::ArchiveInvalid(format!("manifest lacks {part} for {component}")))?;
    let mut reader = zip
        .by_name(name)
        .map_err(|_| DfuError::ArchiveInvalid(format!("archive member {name} not found")))?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|err| DfuError::ArchiveInvalid(format!("cannot read {name}: {err}")))?;
    Ok(data)
}
