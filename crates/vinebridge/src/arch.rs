//! PE image classification.
//!
//! Windows plugin binaries are PE32/PE32+ images; the machine-type field in
//! the PE header decides which runner variant must host the plugin.

use crate::error::{BridgeError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Target word size of a Windows plugin image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginArchitecture {
    Win32,
    Win64,
}

/// The linker stores the PE header offset at the end of the MS-DOS stub.
const PE_OFFSET_FIELD: u64 = 0x3c;
const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];

// Machine-type constants from the PE format specification.
const IMAGE_FILE_MACHINE_UNKNOWN: u16 = 0x0000;
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

/// Classify a plugin image by its PE machine type.
///
/// A missing or truncated file surfaces as an I/O error, a bad signature as
/// [`BridgeError::InvalidImage`], and a machine type outside the known set as
/// [`BridgeError::UnsupportedArchitecture`] — never a silent default.
pub fn detect_architecture(path: &Path) -> Result<PluginArchitecture> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BridgeError::PluginNotFound(path.to_path_buf())
        } else {
            BridgeError::Io(e)
        }
    })?;

    let mut offset = [0u8; 4];
    file.seek(SeekFrom::Start(PE_OFFSET_FIELD))?;
    file.read_exact(&mut offset)?;
    let header_offset = u64::from(u32::from_le_bytes(offset));

    let mut signature = [0u8; 4];
    let mut machine = [0u8; 2];
    file.seek(SeekFrom::Start(header_offset))?;
    file.read_exact(&mut signature)?;
    if signature != PE_SIGNATURE {
        return Err(BridgeError::InvalidImage {
            path: path.to_path_buf(),
            reason: "missing PE signature".to_string(),
        });
    }
    file.read_exact(&mut machine)?;

    match u16::from_le_bytes(machine) {
        IMAGE_FILE_MACHINE_I386 => Ok(PluginArchitecture::Win32),
        // Some plugins leave the machine type unset; treat those as 64-bit
        // like the PE loader itself does on a 64-bit system.
        IMAGE_FILE_MACHINE_AMD64 | IMAGE_FILE_MACHINE_UNKNOWN => Ok(PluginArchitecture::Win64),
        machine => Err(BridgeError::UnsupportedArchitecture {
            path: path.to_path_buf(),
            machine,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal image: MS-DOS stub up to 0x40, PE header right after it.
    fn write_image(machine: u16, signature: &[u8; 4]) -> tempfile::NamedTempFile {
        let mut bytes = vec![0u8; 0x40];
        bytes[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        bytes.extend_from_slice(signature);
        bytes.extend_from_slice(&machine.to_le_bytes());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_detects_32_bit_image() {
        let file = write_image(IMAGE_FILE_MACHINE_I386, b"PE\0\0");
        assert_eq!(
            detect_architecture(file.path()).unwrap(),
            PluginArchitecture::Win32
        );
    }

    #[test]
    fn test_detects_64_bit_image() {
        let file = write_image(IMAGE_FILE_MACHINE_AMD64, b"PE\0\0");
        assert_eq!(
            detect_architecture(file.path()).unwrap(),
            PluginArchitecture::Win64
        );
    }

    #[test]
    fn test_unknown_machine_type_maps_to_64_bit() {
        let file = write_image(IMAGE_FILE_MACHINE_UNKNOWN, b"PE\0\0");
        assert_eq!(
            detect_architecture(file.path()).unwrap(),
            PluginArchitecture::Win64
        );
    }

    #[test]
    fn test_rejects_unsupported_machine_type() {
        let file = write_image(0x01c4, b"PE\0\0"); // ARMNT
        match detect_architecture(file.path()) {
            Err(BridgeError::UnsupportedArchitecture { machine, .. }) => {
                assert_eq!(machine, 0x01c4)
            }
            other => panic!("expected UnsupportedArchitecture, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_bad_signature() {
        let file = write_image(IMAGE_FILE_MACHINE_AMD64, b"NE\0\0");
        assert!(matches!(
            detect_architecture(file.path()),
            Err(BridgeError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_short_file_is_a_read_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MZ").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            detect_architecture(file.path()),
            Err(BridgeError::Io(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.dll");
        assert!(matches!(
            detect_architecture(&path),
            Err(BridgeError::PluginNotFound(_))
        ));
    }
}
