//! Synchronous path helpers used by the configuration layer. These sit
//! outside the async writer; nothing here is called from the hot path.

use std::fs;
use std::io;
use std::io::Read;
use std::path::Path;

/// Returns true if a filesystem node of any kind exists at the path.
pub fn file_exists<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).is_ok()
}

/// Returns true if the path exists and is a directory.
pub fn directory_exists<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Reads the entire file into a string.
pub fn file_read_to_end<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut contents = String::new();
    fs::File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn file_exists_accepts_any_node() {
        assert!(file_exists("/dev/null"));
        assert!(file_exists("/dev"));
        assert!(!file_exists("/dev/blahblahblah"));
    }

    #[test]
    fn directory_exists_requires_a_directory() {
        assert!(directory_exists("/dev"));
        assert!(!directory_exists("/dev/null"));
        assert!(!directory_exists("/dev/blahblah"));
    }

    #[test]
    fn read_to_end() {
        let tdir = TempDir::new("accesslog").unwrap();
        let path = tdir.path().join("data");

        let data = "test string\ntest";
        fs::File::create(&path)
            .unwrap()
            .write_all(data.as_bytes())
            .unwrap();

        assert_eq!(file_read_to_end(&path).unwrap(), data);
    }

    #[test]
    fn read_to_end_missing_file() {
        let tdir = TempDir::new("accesslog").unwrap();

        assert!(file_read_to_end(tdir.path().join("this_does_not_exist")).is_err());
    }
}
