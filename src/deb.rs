// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading `.deb` binary package files.

A `.deb` is an `ar` archive with three members: `debian-binary` (format
version), `control.tar[.<ext>]` (package metadata), and `data.tar[.<ext>]`
(file content). Only the control member matters here: the composer needs the
`control` paragraph to build `Packages` stanzas.
*/

use {
    crate::{
        control::{parse_single_paragraph, ControlParagraph},
        error::{DebmillError, Result},
    },
    std::{
        io::Read,
        path::Path,
    },
};

fn member_reader(extension: &str, data: std::io::Cursor<Vec<u8>>) -> Result<Box<dyn Read>> {
    match extension {
        "" => Ok(Box::new(data)),
        ".gz" => Ok(Box::new(libflate::gzip::Decoder::new(data)?)),
        ".xz" => Ok(Box::new(xz2::read::XzDecoder::new(data))),
        ".zst" => Ok(Box::new(zstd::Decoder::new(data)?)),
        _ => Err(DebmillError::DebUnknownCompression(extension.to_string())),
    }
}

/// Extract the control paragraph from a `.deb` or `.ddeb` file on disk.
pub fn control_paragraph_from_deb(path: impl AsRef<Path>) -> Result<ControlParagraph> {
    let path = path.as_ref();
    let fh = std::fs::File::open(path)
        .map_err(|e| DebmillError::IoPath(path.display().to_string(), e))?;

    let mut archive = ar::Archive::new(fh);

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;

        // Member names should be ASCII, so a lossy conversion is safe.
        let member = String::from_utf8_lossy(entry.header().identifier()).to_string();

        let Some(extension) = member.strip_prefix("control.tar") else {
            continue;
        };
        let extension = extension.to_string();

        let mut data = vec![];
        entry.read_to_end(&mut data)?;

        let reader = member_reader(&extension, std::io::Cursor::new(data))?;
        return control_paragraph_from_control_tar(reader, path);
    }

    Err(DebmillError::DebUnknownEntry(format!(
        "{}: no control.tar member found",
        path.display()
    )))
}

fn control_paragraph_from_control_tar(
    reader: impl Read,
    source: &Path,
) -> Result<ControlParagraph> {
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?;

        let is_control = entry_path
            .file_name()
            .map(|name| name == "control")
            .unwrap_or(false)
            && entry_path.components().count() <= 2;

        if !is_control {
            continue;
        }

        let mut data = vec![];
        entry.read_to_end(&mut data)?;

        return parse_single_paragraph(&data);
    }

    Err(DebmillError::DebUnknownEntry(format!(
        "{}: control.tar lacks a control file",
        source.display()
    )))
}

/// Write a minimal `.deb` with the given control paragraph text. Test-only.
#[cfg(test)]
pub fn write_test_deb(path: &Path, control: &str) {
    use std::io::Write;

    let control_tar_gz = {
        let mut builder = tar::Builder::new(vec![]);

        let mut header = tar::Header::new_gnu();
        header.set_size(control.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "./control", control.as_bytes())
            .unwrap();

        let tar_data = builder.into_inner().unwrap();

        let mut encoder = libflate::gzip::Encoder::new(vec![]).unwrap();
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().into_result().unwrap()
    };

    let fh = std::fs::File::create(path).unwrap();
    let mut builder = ar::Builder::new(fh);

    let version = b"2.0\n";
    let header = ar::Header::new(b"debian-binary".to_vec(), version.len() as u64);
    builder.append(&header, &version[..]).unwrap();

    let header = ar::Header::new(b"control.tar.gz".to_vec(), control_tar_gz.len() as u64);
    builder.append(&header, &control_tar_gz[..]).unwrap();
}
