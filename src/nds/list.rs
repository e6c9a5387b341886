//! Directory-listing helpers shared by both transports.
//!
//! FTP servers answer LIST with Unix-style text lines; SFTP hands back typed
//! entries. Both are normalized into [`ListEntry`] so the recursive walk in
//! the client facade stays protocol-agnostic.

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct ListEntry {
    /// Entry name (file or directory name, no path).
    pub name: String,
    /// Whether this is a directory.
    pub is_directory: bool,
    /// File size in bytes when the listing provides it.
    pub size: Option<u64>,
}

impl ListEntry {
    /// Parse a Unix-style FTP LIST line.
    ///
    /// Typical shapes:
    /// `drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 dirname`
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 file.zip`
    ///
    /// Returns `None` for blank or unrecognizable lines and for the `.` and
    /// `..` pseudo-entries.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }

        let is_directory = parts[0].starts_with('d');
        let name = parts.last()?.to_string();
        if name == "." || name == ".." {
            return None;
        }

        // Size is usually the 5th field of Unix-style listings.
        let size = if parts.len() >= 5 { parts[4].parse().ok() } else { None };

        Some(Self { name, is_directory, size })
    }
}

/// Join a directory and an entry name into a full remote path.
pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directory_entry() {
        let entry = ListEntry::parse("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 omc1").unwrap();
        assert_eq!(entry.name, "omc1");
        assert!(entry.is_directory);
        assert_eq!(entry.size, Some(4096));
    }

    #[test]
    fn parses_file_entry() {
        let entry = ListEntry::parse(
            "-rw-r--r--   1 ftp ftp  123456 Dec 20 02:30 FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.zip",
        )
        .unwrap();
        assert_eq!(entry.name, "FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.zip");
        assert!(!entry.is_directory);
        assert_eq!(entry.size, Some(123456));
    }

    #[test]
    fn skips_dot_entries_and_noise() {
        assert!(ListEntry::parse("").is_none());
        assert!(ListEntry::parse("   ").is_none());
        assert!(ListEntry::parse("drwxr-xr-x 2 ftp ftp 4096 Jan 15 12:00 .").is_none());
        assert!(ListEntry::parse("drwxr-xr-x 2 ftp ftp 4096 Jan 15 12:00 ..").is_none());
    }

    #[test]
    fn join_remote_normalizes_slashes() {
        assert_eq!(join_remote("/mro/", "a.zip"), "/mro/a.zip");
        assert_eq!(join_remote("/mro", "a.zip"), "/mro/a.zip");
    }
}
