//! Cairn archive: one gzip stream wrapping a tar stream of named payloads.
//! Entry names are checked on the way in and on the way out, with the same rule.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use cairn_core::{CairnError, CairnResult, NamedPayload};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use metrics::{counter, histogram};
use tracing::debug;

/// Fixed mode for every entry; the container carries no other per-entry metadata.
pub const ENTRY_MODE: u32 = 0o644;

// Upper bound for the read buffer we reserve from a (possibly hostile) declared size.
const MAX_PREALLOC: u64 = 1 << 20;

/// Reject names that could escape an extraction directory or break line-oriented tooling.
pub fn validate_name(name: &str) -> CairnResult<()> {
    if name.is_empty() {
        return Err(CairnError::Validation("empty entry name".to_string()));
    }
    if name.starts_with('/') || name.starts_with('\\') || Path::new(name).is_absolute() {
        return Err(CairnError::Validation(format!("absolute entry name: {:?}", name)));
    }
    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(CairnError::Validation(format!("entry name {:?} contains control character {:?}", name, c)));
    }
    if name.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(CairnError::Validation(format!("entry name {:?} contains a parent-directory segment", name)));
    }
    // tar would silently normalize these away, breaking the name round trip.
    if name.split('/').any(|seg| seg.is_empty() || seg == ".") {
        return Err(CairnError::Validation(format!("entry name {:?} has an empty or `.` segment", name)));
    }
    Ok(())
}

/// Write `payloads` in order into `writer` and return it once the gzip trailer is flushed.
///
/// A bad name aborts the encode; whatever was already written stays in `writer`.
pub fn encode<W: Write>(writer: W, payloads: &[NamedPayload]) -> CairnResult<W> {
    let started = std::time::Instant::now();
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    for p in payloads {
        validate_name(&p.name)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(p.data.len() as u64);
        builder
            .append_data(&mut header, &p.name, p.data.as_slice())
            .map_err(|e| CairnError::io(format!("write entry {}", p.name), e))?;
        counter!("archive_entries_written_total", 1u64);
    }
    let gz = builder.into_inner().map_err(|e| CairnError::io("finish tar stream", e))?;
    let writer = gz.finish().map_err(|e| CairnError::io("finish gzip stream", e))?;
    histogram!("archive_encode_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(entries = payloads.len(), "archive encoded");
    Ok(writer)
}

/// Read every entry in stored order until end of stream.
pub fn decode<R: Read>(reader: R) -> CairnResult<Vec<NamedPayload>> {
    let started = std::time::Instant::now();
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| CairnError::Format(format!("open entry stream: {}", e)))?;
    let mut out = Vec::new();
    for (idx, entry) in entries.enumerate() {
        let mut entry = entry.map_err(|e| CairnError::Format(format!("entry #{}: {}", idx, e)))?;
        let name = String::from_utf8(entry.path_bytes().into_owned())
            .map_err(|_| CairnError::Format(format!("entry #{}: name is not valid UTF-8", idx)))?;
        validate_name(&name)?;
        let kind = entry.header().entry_type();
        if kind != tar::EntryType::Regular {
            return Err(CairnError::Format(format!("entry {}: unsupported entry type {:?}", name, kind)));
        }
        let declared = entry.size();
        let mut data = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| CairnError::Format(format!("entry {}: {}", name, e)))?;
        if data.len() as u64 != declared {
            return Err(CairnError::Format(format!(
                "entry {}: truncated payload ({} of {} bytes)",
                name,
                data.len(),
                declared
            )));
        }
        counter!("archive_entries_read_total", 1u64);
        out.push(NamedPayload { name, data });
    }
    histogram!("archive_decode_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(entries = out.len(), "archive decoded");
    Ok(out)
}

/// Create (or truncate) the file at `path` and encode `payloads` into it.
/// No cleanup on failure: a partial file may be left behind.
pub fn write_archive(path: &Path, payloads: &[NamedPayload]) -> CairnResult<()> {
    let file = File::create(path).map_err(|e| CairnError::io(format!("create archive {}", path.display()), e))?;
    let mut w = encode(BufWriter::new(file), payloads)?;
    w.flush().map_err(|e| CairnError::io(format!("flush archive {}", path.display()), e))?;
    Ok(())
}

pub fn read_archive(path: &Path) -> CairnResult<Vec<NamedPayload>> {
    let file = File::open(path).map_err(|e| CairnError::io(format!("open archive {}", path.display()), e))?;
    decode(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_nested_names() {
        for ok in ["configmap-foo.yaml", "team-a/secret-b.yaml", "a..b.yaml", ".hidden"] {
            assert!(validate_name(ok).is_ok(), "{} should pass", ok);
        }
    }

    #[test]
    fn rejects_unsafe_names() {
        for bad in ["", "../etc/passwd", "a/../../b", "/abs/path", "\\abs", "a\nb", "a\rb", "nul\0byte", "..\\win", "./x.yaml", "a//b", "dir/"] {
            let err = validate_name(bad).unwrap_err();
            assert!(matches!(err, CairnError::Validation(_)), "{:?} -> {}", bad, err);
        }
    }
}
