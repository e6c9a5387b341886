//! ZIP file format records.
//!
//! Binary layouts for the subset of PKZIP APPNOTE 6.3 the pipeline consumes:
//! local file header, central directory entry, End of Central Directory
//! (plain and ZIP64) and the ZIP64 locator. All fields are little-endian.
//!
//! ## Archive layout
//!
//! ```text
//! [Local File Header 1][Member Data 1]
//! [Local File Header 2][Member Data 2]
//! ...
//! [Central Directory Entry 1]
//! [Central Directory Entry 2]
//! ...
//! [ZIP64 End of Central Directory] (optional)
//! [ZIP64 EOCD Locator]             (optional)
//! [End of Central Directory]
//! ```
//!
//! Unsupported and rejected: spanned archives, encryption, archive comments,
//! entries requiring an extract version above 6.3.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use crate::error::{NdsError, Result};

const MODULE: &str = "zip.records";

/// UTF-8 filename flag, APPNOTE general purpose bit 11.
pub const FLAG_UTF8_NAME: u16 = 1 << 11;

/// Highest supported `extract_version` (6.3, encoded as 63).
pub const MAX_EXTRACT_VERSION: u16 = 63;

/// ZIP compression methods the worker can inflate.
///
/// Only `Stored` (0) and `Deflate` (8) appear in vendor MRO/MDT archives;
/// anything else is carried through as `Unknown` and rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression (method 0)
    Stored,
    /// DEFLATE compression (method 8)
    Deflate,
    /// Unknown or unsupported compression method
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Metadata of one archive member, as recorded by the central directory.
///
/// `header_offset` is the *payload* offset: the absolute byte position at
/// which the member's compressed bytes begin, i.e. the central directory's
/// local-header offset plus the archive-wide first-member payload distance.
/// Reading exactly `[header_offset, header_offset + compress_size)` yields
/// bytes ready to feed to an inflater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member name inside the archive, decoded per flag bit 11.
    pub sub_file_name: String,
    /// Absolute offset of the compressed payload within the archive.
    pub header_offset: u64,
    /// Compressed size in bytes.
    pub compress_size: u64,
    /// Uncompressed size in bytes.
    pub file_size: u64,
    /// General purpose flag bits.
    pub flag_bits: u16,
    /// Raw compression method id.
    pub compress_type: u16,
    /// LTE base-station id extracted from the member name, `0` when absent.
    pub enodebid: u64,
}

/// Local File Header signature: "PK\x03\x04"
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";

/// Fixed size of the local file header (before name and extra field).
pub const LFH_SIZE: usize = 30;

/// Distance from the start of an archive's first local header to the start
/// of its payload: the fixed header plus that header's name and extra field.
///
/// The central directory records *local header* offsets; adding this
/// constant translates them into payload offsets, which holds for every
/// member of archives whose local headers share one shape, the case for
/// the vendor writers this pipeline ingests.
///
/// # Errors
///
/// `CorruptZip` when the prefix is short or the magic does not match.
pub fn first_member_payload_start(prefix: &[u8]) -> Result<u64> {
    if prefix.len() < LFH_SIZE || &prefix[0..4] != LFH_SIGNATURE {
        return Err(NdsError::corrupt_zip(MODULE, "bad local file header"));
    }
    let name_len = u16::from_le_bytes([prefix[26], prefix[27]]) as u64;
    let extra_len = u16::from_le_bytes([prefix[28], prefix[29]]) as u64;
    Ok(LFH_SIZE as u64 + name_len + extra_len)
}

/// End of Central Directory record.
///
/// Appears at the very end of the archive. Archives with a non-empty
/// comment are rejected, so the record always occupies the trailing
/// [`EndOfCentralDirectory::SIZE`] bytes.
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    /// EOCD signature bytes: "PK\x05\x06"
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    /// Size of the EOCD record without a comment.
    pub const SIZE: usize = 22;

    /// Parse the EOCD from its raw bytes.
    ///
    /// # Errors
    ///
    /// `CorruptZip` when the data is short, the signature is wrong, or the
    /// record declares a comment (unsupported).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(NdsError::corrupt_zip(MODULE, "bad end-of-central-directory record"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let record = Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        };

        if record.comment_len != 0 {
            return Err(NdsError::unsupported_zip(MODULE, "archive comments are not supported"));
        }
        Ok(record)
    }

    /// Whether any field overflowed into the ZIP64 EOCD.
    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFF_FFFF
            || self.cd_offset == 0xFFFF_FFFF
    }
}

/// ZIP64 End of Central Directory Locator, immediately before the EOCD.
#[derive(Debug)]
pub struct Zip64EocdLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EocdLocator {
    /// Locator signature: "PK\x06\x07"
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    /// Parse the locator; returns `None` when the bytes are not a locator
    /// (the archive is plainly 32-bit).
    pub fn from_bytes(data: &[u8]) -> Option<Result<Self>> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return None;
        }
        let disk_with_eocd64 = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let eocd64_offset = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let total_disks = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);

        if disk_with_eocd64 != 0 || total_disks > 1 {
            return Some(Err(NdsError::unsupported_zip(
                MODULE,
                "archives spanning multiple disks are not supported",
            )));
        }
        Some(Ok(Self { disk_with_eocd64, eocd64_offset, total_disks }))
    }
}

/// ZIP64 End of Central Directory record.
#[derive(Debug)]
pub struct Zip64Eocd {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64Eocd {
    /// ZIP64 EOCD signature: "PK\x06\x06"
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(NdsError::corrupt_zip(MODULE, "bad ZIP64 end-of-central-directory record"));
        }
        let mut cursor = Cursor::new(&data[4..]);
        let _eocd64_size = cursor.read_u64::<LittleEndian>()?;
        Ok(Self {
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Central Directory entry signature: "PK\x01\x02"
pub const CD_ENTRY_SIGNATURE: &[u8] = b"PK\x01\x02";

/// Fixed size of a central directory entry before its variable tail.
pub const CD_ENTRY_SIZE: usize = 46;

/// One parsed central directory entry.
///
/// `local_header_offset` still points at the member's *local header*; the
/// parser adds the archive's first-member payload distance to produce the
/// payload offset published in [`MemberInfo`].
#[derive(Debug)]
pub struct CentralDirEntry {
    pub name: String,
    pub flag_bits: u16,
    pub compress_type: u16,
    pub compress_size: u64,
    pub file_size: u64,
    pub local_header_offset: u64,
}

impl CentralDirEntry {
    /// Read one entry from a cursor positioned at its signature.
    ///
    /// Handles the ZIP64 extended-information extra field (id `0x0001`):
    /// 32-bit fields stored as `0xFFFFFFFF` are replaced by their 64-bit
    /// values in the order APPNOTE prescribes.
    ///
    /// # Errors
    ///
    /// `CorruptZip` on a short read or wrong magic, `UnsupportedZip` when
    /// the entry requires an extract version above 6.3.
    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        if cursor.position() + CD_ENTRY_SIZE as u64 > cursor.get_ref().len() as u64 {
            return Err(NdsError::corrupt_zip(MODULE, "truncated central directory"));
        }
        let mut sig = [0u8; 4];
        cursor
            .read_exact(&mut sig)
            .map_err(|_| NdsError::corrupt_zip(MODULE, "truncated central directory"))?;
        if sig != CD_ENTRY_SIGNATURE {
            return Err(NdsError::corrupt_zip(MODULE, "bad central directory entry magic"));
        }

        let _version_made_by = cursor.read_u16::<LittleEndian>()?;
        let extract_version = cursor.read_u16::<LittleEndian>()?;
        let flag_bits = cursor.read_u16::<LittleEndian>()?;
        let compress_type = cursor.read_u16::<LittleEndian>()?;
        let _mod_time = cursor.read_u16::<LittleEndian>()?;
        let _mod_date = cursor.read_u16::<LittleEndian>()?;
        let _crc32 = cursor.read_u32::<LittleEndian>()?;
        let mut compress_size = cursor.read_u32::<LittleEndian>()? as u64;
        let mut file_size = cursor.read_u32::<LittleEndian>()? as u64;
        let name_len = cursor.read_u16::<LittleEndian>()?;
        let extra_len = cursor.read_u16::<LittleEndian>()?;
        let comment_len = cursor.read_u16::<LittleEndian>()?;
        let _disk_start = cursor.read_u16::<LittleEndian>()?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
        let _external_attrs = cursor.read_u32::<LittleEndian>()?;
        let mut local_header_offset = cursor.read_u32::<LittleEndian>()? as u64;

        // extract_version is encoded as major*10 + minor; 6.3 == 63.
        if extract_version > MAX_EXTRACT_VERSION {
            return Err(NdsError::unsupported_zip(
                MODULE,
                format!("zip version {}.{} not supported", extract_version / 10, extract_version % 10),
            ));
        }

        let mut name_bytes = vec![0u8; name_len as usize];
        cursor
            .read_exact(&mut name_bytes)
            .map_err(|_| NdsError::corrupt_zip(MODULE, "truncated central directory"))?;
        let name = decode_member_name(&name_bytes, flag_bits);

        // ZIP64 extended information, extra field id 0x0001. Substituted
        // fields appear only for values stored as all-ones, in file-size,
        // compress-size, offset order.
        let extra_end = cursor.position() + extra_len as u64;
        if extra_end > cursor.get_ref().len() as u64 {
            return Err(NdsError::corrupt_zip(MODULE, "truncated central directory"));
        }
        while cursor.position() + 4 <= extra_end {
            let header_id = cursor.read_u16::<LittleEndian>()?;
            let field_size = cursor.read_u16::<LittleEndian>()? as u64;
            if header_id == 0x0001 {
                let field_end = (cursor.position() + field_size).min(extra_end);
                if file_size == 0xFFFF_FFFF && cursor.position() + 8 <= field_end {
                    file_size = cursor.read_u64::<LittleEndian>()?;
                }
                if compress_size == 0xFFFF_FFFF && cursor.position() + 8 <= field_end {
                    compress_size = cursor.read_u64::<LittleEndian>()?;
                }
                if local_header_offset == 0xFFFF_FFFF && cursor.position() + 8 <= field_end {
                    local_header_offset = cursor.read_u64::<LittleEndian>()?;
                }
                cursor.set_position(field_end);
            } else {
                cursor.set_position(cursor.position() + field_size);
            }
        }
        cursor.set_position(extra_end);

        // The comment is not consumed by anything downstream.
        cursor.set_position(cursor.position() + comment_len as u64);
        if cursor.position() > cursor.get_ref().len() as u64 {
            return Err(NdsError::corrupt_zip(MODULE, "truncated central directory"));
        }

        Ok(Self { name, flag_bits, compress_type, compress_size, file_size, local_header_offset })
    }
}

/// Decode a member name: UTF-8 when flag bit 11 is set, CP437 otherwise.
pub fn decode_member_name(bytes: &[u8], flag_bits: u16) -> String {
    if flag_bits & FLAG_UTF8_NAME != 0 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        oem_cp::decode_string_complete_table(bytes, &oem_cp::code_table::DECODING_TABLE_CP437)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn eocd_bytes(entries: u16, cd_size: u32, cd_offset: u32, comment_len: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&entries.to_le_bytes());
        data.extend_from_slice(&entries.to_le_bytes());
        data.extend_from_slice(&cd_size.to_le_bytes());
        data.extend_from_slice(&cd_offset.to_le_bytes());
        data.extend_from_slice(&comment_len.to_le_bytes());
        data
    }

    #[test]
    fn eocd_roundtrip() {
        let eocd = EndOfCentralDirectory::from_bytes(&eocd_bytes(3, 150, 900, 0)).unwrap();
        assert_eq!(eocd.total_entries, 3);
        assert_eq!(eocd.cd_size, 150);
        assert_eq!(eocd.cd_offset, 900);
        assert!(!eocd.is_zip64());
    }

    #[test]
    fn eocd_rejects_comment() {
        let err = EndOfCentralDirectory::from_bytes(&eocd_bytes(0, 0, 0, 5)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedZip);
    }

    #[test]
    fn eocd_rejects_bad_magic() {
        let mut data = eocd_bytes(0, 0, 0, 0);
        data[1] = b'X';
        let err = EndOfCentralDirectory::from_bytes(&data).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorruptZip);
    }

    #[test]
    fn eocd_all_ones_flags_zip64() {
        let eocd = EndOfCentralDirectory::from_bytes(&eocd_bytes(0xFFFF, 10, 10, 0)).unwrap();
        assert!(eocd.is_zip64());
    }

    #[test]
    fn locator_absent_on_plain_archive() {
        assert!(Zip64EocdLocator::from_bytes(&[0u8; 20]).is_none());
    }

    #[test]
    fn locator_rejects_multi_disk() {
        let mut data = Vec::new();
        data.extend_from_slice(Zip64EocdLocator::SIGNATURE);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&100u64.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        let err = Zip64EocdLocator::from_bytes(&data).unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedZip);
    }

    #[test]
    fn payload_start_counts_name_and_extra() {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(LFH_SIGNATURE);
        prefix.extend_from_slice(&[0u8; 22]);
        prefix.extend_from_slice(&7u16.to_le_bytes());
        prefix.extend_from_slice(&4u16.to_le_bytes());
        assert_eq!(first_member_payload_start(&prefix).unwrap(), 30 + 7 + 4);
    }

    #[test]
    fn member_name_decoding_follows_flag_bit() {
        // 0x82 is é in CP437
        assert_eq!(decode_member_name(&[0x82], 0), "é");
        assert_eq!(decode_member_name("é".as_bytes(), FLAG_UTF8_NAME), "é");
    }
}
