//! Streaming ZIP central-directory parser.
//!
//! Extracts member metadata from an archive using only offset-addressable
//! reads, without downloading the payload:
//!
//! 1. Read the trailing End of Central Directory record (archives with
//!    comments are rejected, so its position is fixed)
//! 2. If a ZIP64 locator precedes it, switch to the 64-bit directory fields
//! 3. Read the first local file header to learn the archive-wide distance
//!    from a recorded local-header offset to the member payload
//! 4. Fetch the central directory in one read and walk its entries
//!
//! The published `header_offset` of every member is a *payload* offset:
//! reading `[header_offset, header_offset + compress_size)` yields exactly
//! the raw compressed bytes, ready for an inflater. This relies on all local
//! headers of an archive sharing one shape, which holds for the vendor
//! writers the pipeline ingests.

use std::io::Cursor;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{NdsError, Result};

use super::records::{
    CentralDirEntry, EndOfCentralDirectory, MemberInfo, Zip64Eocd, Zip64EocdLocator,
    first_member_payload_start,
};

const MODULE: &str = "zip.parser";

/// Random access reads over one remote archive.
///
/// The seam between the parser and the transports: FTP and SFTP sessions
/// implement it over one opened file, tests implement it over a byte slice.
#[async_trait]
pub trait RangeRead: Send {
    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is less than the buffer size
    /// only at end of file.
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the archive in bytes.
    fn size(&self) -> u64;
}

/// Central-directory parser over any [`RangeRead`] source.
pub struct ZipParser<R: RangeRead> {
    reader: R,
    size: u64,
}

impl<R: RangeRead> ZipParser<R> {
    pub fn new(reader: R) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    /// Parse the central directory and return one [`MemberInfo`] per entry.
    ///
    /// # Errors
    ///
    /// `CorruptZip` for truncated or bad-magic structures, `UnsupportedZip`
    /// for multi-disk archives, archive comments, or entries requiring an
    /// extract version above 6.3.
    pub async fn members(mut self) -> Result<Vec<MemberInfo>> {
        let (eocd, eocd_offset) = self.read_eocd().await?;

        let (mut cd_offset, mut cd_size) = (eocd.cd_offset as u64, eocd.cd_size as u64);
        if let Some(eocd64) = self.read_zip64_eocd(eocd_offset).await? {
            cd_offset = eocd64.cd_offset;
            cd_size = eocd64.cd_size;
        }

        // An EOCD-only archive (22 bytes, no members) is valid and empty.
        if cd_size == 0 {
            return Ok(Vec::new());
        }

        // Distance from recorded local-header offsets to payload offsets,
        // taken from the first member's local header.
        let mut prefix = [0u8; super::records::LFH_SIZE];
        self.read_exact_at(0, &mut prefix).await?;
        let payload_start = first_member_payload_start(&prefix)?;

        if cd_offset + cd_size > self.size {
            return Err(NdsError::corrupt_zip(MODULE, "central directory exceeds archive"));
        }
        let mut cd_data = vec![0u8; cd_size as usize];
        self.read_exact_at(cd_offset, &mut cd_data).await?;

        let mut members = Vec::new();
        let mut cursor = Cursor::new(cd_data.as_slice());
        while cursor.position() < cd_size {
            let entry = CentralDirEntry::read(&mut cursor)?;
            members.push(MemberInfo {
                enodebid: extract_enodebid(&entry.name),
                sub_file_name: entry.name,
                header_offset: entry.local_header_offset + payload_start,
                compress_size: entry.compress_size,
                file_size: entry.file_size,
                flag_bits: entry.flag_bits,
                compress_type: entry.compress_type,
            });
        }
        Ok(members)
    }

    /// Read and validate the trailing EOCD; returns it with its absolute offset.
    async fn read_eocd(&mut self) -> Result<(EndOfCentralDirectory, u64)> {
        if self.size < EndOfCentralDirectory::SIZE as u64 {
            return Err(NdsError::corrupt_zip(MODULE, "archive too small for a ZIP"));
        }
        let offset = self.size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = [0u8; EndOfCentralDirectory::SIZE];
        self.read_exact_at(offset, &mut buf).await?;
        Ok((EndOfCentralDirectory::from_bytes(&buf)?, offset))
    }

    /// Probe for a ZIP64 locator immediately before the EOCD and, when
    /// present, read the ZIP64 EOCD it points at.
    async fn read_zip64_eocd(&mut self, eocd_offset: u64) -> Result<Option<Zip64Eocd>> {
        if eocd_offset < Zip64EocdLocator::SIZE as u64 {
            return Ok(None);
        }
        let locator_offset = eocd_offset - Zip64EocdLocator::SIZE as u64;
        let mut buf = [0u8; Zip64EocdLocator::SIZE];
        self.read_exact_at(locator_offset, &mut buf).await?;

        let locator = match Zip64EocdLocator::from_bytes(&buf) {
            None => return Ok(None),
            Some(locator) => locator?,
        };

        if locator.eocd64_offset + Zip64Eocd::MIN_SIZE as u64 > self.size {
            return Err(NdsError::corrupt_zip(MODULE, "ZIP64 record outside archive"));
        }
        let mut buf = [0u8; Zip64Eocd::MIN_SIZE];
        self.read_exact_at(locator.eocd64_offset, &mut buf).await?;
        Ok(Some(Zip64Eocd::from_bytes(&buf)?))
    }

    async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.reader.read_at(offset, buf).await?;
        if n != buf.len() {
            return Err(NdsError::corrupt_zip(MODULE, "short read inside archive structures"));
        }
        Ok(())
    }
}

/// Extract the eNodeB id embedded in a member name, `0` when absent.
///
/// Vendor MRO/MDT members carry the base-station id as a 6-8 digit group
/// between underscores, e.g. `FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.xml`.
pub fn extract_enodebid(name: &str) -> u64 {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"_(\d{6,8})_").expect("static pattern"));
    pattern
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|id| id.as_str().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::zip::records::{FLAG_UTF8_NAME, LFH_SIGNATURE};

    /// In-memory archive for parser tests.
    pub(crate) struct SliceReader(pub Vec<u8>);

    #[async_trait]
    impl RangeRead for SliceReader {
        async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let start = (offset as usize).min(self.0.len());
            let end = (start + buf.len()).min(self.0.len());
            buf[..end - start].copy_from_slice(&self.0[start..end]);
            Ok(end - start)
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    pub(crate) struct FixtureMember {
        pub name: &'static [u8],
        pub data: &'static [u8],
        pub flags: u16,
        pub extract_version: u16,
    }

    impl FixtureMember {
        pub fn stored(name: &'static [u8], data: &'static [u8]) -> Self {
            Self { name, data, flags: 0, extract_version: 20 }
        }
    }

    /// Assemble a stored-members archive byte-for-byte: local headers with
    /// payloads, then the central directory, then the EOCD.
    pub(crate) fn build_archive(members: &[FixtureMember]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut locals = Vec::new();

        for member in members {
            locals.push(data.len() as u32);
            data.extend_from_slice(LFH_SIGNATURE);
            data.extend_from_slice(&member.extract_version.to_le_bytes());
            data.extend_from_slice(&member.flags.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // stored
            data.extend_from_slice(&[0u8; 8]); // mod time/date, crc
            data.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            data.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            data.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // extra
            data.extend_from_slice(member.name);
            data.extend_from_slice(member.data);
        }

        let cd_offset = data.len() as u32;
        for (member, lfh_offset) in members.iter().zip(&locals) {
            data.extend_from_slice(super::super::records::CD_ENTRY_SIGNATURE);
            data.extend_from_slice(&20u16.to_le_bytes()); // version made by
            data.extend_from_slice(&member.extract_version.to_le_bytes());
            data.extend_from_slice(&member.flags.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // stored
            data.extend_from_slice(&[0u8; 8]); // mod time/date, crc
            data.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            data.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            data.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes()); // extra
            data.extend_from_slice(&0u16.to_le_bytes()); // comment
            data.extend_from_slice(&0u16.to_le_bytes()); // disk start
            data.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            data.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            data.extend_from_slice(&lfh_offset.to_le_bytes());
            data.extend_from_slice(member.name);
        }

        let cd_size = data.len() as u32 - cd_offset;
        data.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        data.extend_from_slice(&[0u8; 4]); // disk numbers
        data.extend_from_slice(&(members.len() as u16).to_le_bytes());
        data.extend_from_slice(&(members.len() as u16).to_le_bytes());
        data.extend_from_slice(&cd_size.to_le_bytes());
        data.extend_from_slice(&cd_offset.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // comment length
        data
    }

    async fn parse(archive: Vec<u8>) -> Result<Vec<MemberInfo>> {
        ZipParser::new(SliceReader(archive)).members().await
    }

    #[tokio::test]
    async fn member_offsets_address_the_payload() {
        // Vendor writers emit uniform local headers; the payload-start
        // constant holds across members.
        let members = [
            FixtureMember::stored(b"FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.xml", b"mro-payload"),
            FixtureMember::stored(b"FDD-LTE_MRO_ZTE_OMC1_292552_20241220023000.xml", b"tail"),
        ];
        let archive = build_archive(&members);
        let parsed = parse(archive.clone()).await.unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].sub_file_name, "FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.xml");
        assert_eq!(parsed[0].enodebid, 292551);
        assert_eq!(parsed[1].enodebid, 292552);

        for (member, info) in members.iter().zip(&parsed) {
            let start = info.header_offset as usize;
            let end = start + info.compress_size as usize;
            assert!(end <= archive.len());
            assert_eq!(&archive[start..end], member.data);
        }
    }

    #[tokio::test]
    async fn utf8_flag_selects_name_encoding() {
        let archive = build_archive(&[FixtureMember {
            name: "caf\u{e9}.xml".as_bytes(),
            data: b"x",
            flags: FLAG_UTF8_NAME,
            extract_version: 20,
        }]);
        let parsed = parse(archive).await.unwrap();
        assert_eq!(parsed[0].sub_file_name, "café.xml");
    }

    #[tokio::test]
    async fn eocd_only_archive_is_empty() {
        let archive = build_archive(&[]);
        assert_eq!(archive.len(), 22);
        assert!(parse(archive).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_64_is_rejected_63_is_accepted() {
        let ok = build_archive(&[FixtureMember {
            name: b"a.xml",
            data: b"x",
            flags: 0,
            extract_version: 63,
        }]);
        assert_eq!(parse(ok).await.unwrap().len(), 1);

        let bad = build_archive(&[FixtureMember {
            name: b"a.xml",
            data: b"x",
            flags: 0,
            extract_version: 64,
        }]);
        assert_eq!(parse(bad).await.unwrap_err().kind, ErrorKind::UnsupportedZip);
    }

    #[tokio::test]
    async fn bad_entry_magic_is_corrupt() {
        let mut archive = build_archive(&[FixtureMember::stored(b"a.xml", b"x")]);
        let eocd_start = archive.len() - 22;
        let cd_offset = u32::from_le_bytes([
            archive[eocd_start + 16],
            archive[eocd_start + 17],
            archive[eocd_start + 18],
            archive[eocd_start + 19],
        ]) as usize;
        archive[cd_offset + 1] = b'X';
        let err = parse(archive).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorruptZip);
    }

    #[tokio::test]
    async fn overstated_directory_size_is_corrupt() {
        let mut archive = build_archive(&[FixtureMember::stored(b"a.xml", b"x")]);
        let eocd_start = archive.len() - 22;
        let oversized = (archive.len() as u32) * 2;
        archive[eocd_start + 12..eocd_start + 16].copy_from_slice(&oversized.to_le_bytes());
        let err = parse(archive).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorruptZip);
    }

    #[tokio::test]
    async fn archive_comment_is_unsupported() {
        let mut archive = build_archive(&[FixtureMember::stored(b"a.xml", b"x")]);
        let len = archive.len();
        archive[len - 2] = 4; // comment length field
        archive.extend_from_slice(b"note");
        // EOCD is no longer at the fixed trailing position.
        assert!(parse(archive).await.is_err());
    }

    /// Build a ZIP64 variant: all-ones 32-bit directory fields in the EOCD,
    /// real values in a ZIP64 EOCD reached through the locator.
    fn build_zip64_archive(members: &[FixtureMember]) -> Vec<u8> {
        let plain = build_archive(members);
        let eocd_start = plain.len() - 22;
        let cd_size = u32::from_le_bytes([
            plain[eocd_start + 12],
            plain[eocd_start + 13],
            plain[eocd_start + 14],
            plain[eocd_start + 15],
        ]) as u64;
        let cd_offset = u32::from_le_bytes([
            plain[eocd_start + 16],
            plain[eocd_start + 17],
            plain[eocd_start + 18],
            plain[eocd_start + 19],
        ]) as u64;

        let mut data = plain[..eocd_start].to_vec();

        let eocd64_offset = data.len() as u64;
        data.extend_from_slice(Zip64Eocd::SIGNATURE);
        data.extend_from_slice(&44u64.to_le_bytes()); // record size
        data.extend_from_slice(&45u16.to_le_bytes()); // version made by
        data.extend_from_slice(&45u16.to_le_bytes()); // version needed
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(members.len() as u64).to_le_bytes());
        data.extend_from_slice(&(members.len() as u64).to_le_bytes());
        data.extend_from_slice(&cd_size.to_le_bytes());
        data.extend_from_slice(&cd_offset.to_le_bytes());

        data.extend_from_slice(Zip64EocdLocator::SIGNATURE);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&eocd64_offset.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());

        data.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&0xFFFFu16.to_le_bytes());
        data.extend_from_slice(&0xFFFFu16.to_le_bytes());
        data.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        data.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data
    }

    #[tokio::test]
    async fn zip64_locator_path_resolves_members() {
        let members = [FixtureMember::stored(
            b"FDD-LTE_MDT_HW_OMC2_10435721_20241220024500.csv",
            b"mdt-rows",
        )];
        let archive = build_zip64_archive(&members);
        let parsed = parse(archive.clone()).await.unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].enodebid, 10435721);
        let start = parsed[0].header_offset as usize;
        let end = start + parsed[0].compress_size as usize;
        assert_eq!(&archive[start..end], members[0].data);
    }

    #[test]
    fn enodebid_requires_six_to_eight_digits() {
        assert_eq!(extract_enodebid("A_12345_B"), 0);
        assert_eq!(extract_enodebid("A_123456_B"), 123456);
        assert_eq!(extract_enodebid("A_12345678_B"), 12345678);
        assert_eq!(extract_enodebid("plain.xml"), 0);
    }
}
