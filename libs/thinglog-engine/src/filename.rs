//! Entity id → log file name.
//!
//! Ids come from the bus and are not trusted. Bytes outside
//! `[A-Za-z0-9_.-]` are percent-escaped, so the mapping is injective and
//! the result never contains a path separator. A leading dot is escaped
//! as well, which rules out `.`, `..` and hidden files, and so is the first
//! byte of a Windows device name (`CON`, `nul.x`, `COM1`, ...).
//!
//! Case is preserved. On a case-insensitive filesystem `ThingA` and
//! `thinga` map to the same file through two handles; the sink's single
//! lock still keeps their records whole.

use crate::error::SinkError;

pub const LOG_FILE_EXTENSION: &str = "log";

/// Common file-name limit (ext4, xfs, apfs, ntfs).
const MAX_FILE_NAME_LEN: usize = 255;

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

/// `CON`, `PRN`, `AUX`, `NUL`, `COM1`-`COM9`, `LPT1`-`LPT9`, any case,
/// compared on the part before the first dot.
fn is_device_name(entity_id: &str) -> bool {
    let stem = entity_id.split('.').next().unwrap_or_default().to_ascii_uppercase();
    match stem.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => {
            let bytes = stem.as_bytes();
            bytes.len() == 4
                && (stem.starts_with("COM") || stem.starts_with("LPT"))
                && matches!(bytes[3], b'1'..=b'9')
        }
    }
}

/// Escape an entity id into a single path component (no extension).
pub fn escape_entity_id(entity_id: &str) -> String {
    let device = is_device_name(entity_id);
    let mut out = String::with_capacity(entity_id.len());
    for (i, byte) in entity_id.bytes().enumerate() {
        let first = i == 0;
        if is_plain(byte) && !(first && (byte == b'.' || device)) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// File name for an entity's log, e.g. `urn%3Azone1%3Athing2.log`.
pub fn log_file_name(entity_id: &str) -> Result<String, SinkError> {
    if entity_id.is_empty() {
        return Err(SinkError::InvalidEntity {
            entity: String::new(),
            reason: "empty id",
        });
    }
    let name = format!("{}.{LOG_FILE_EXTENSION}", escape_entity_id(entity_id));
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(SinkError::InvalidEntity {
            entity: entity_id.to_string(),
            reason: "id too long for a file name",
        });
    }
    Ok(name)
}
