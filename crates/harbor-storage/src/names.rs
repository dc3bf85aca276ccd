//! Archive name normalization.
//!
//! Names are always relative, `/`-separated, and may not contain dot-prefixed
//! components; the store's own reserved entries (`.version`,
//! `.transaction_*`, `.redirection_*`) all start with a dot, so valid names
//! can never collide with them. Unless the caller explicitly allows it, a
//! name must also carry at least one directory component.

use harbor_types::ArchiveError;

/// Validates an archive file name. Returns the name unchanged on success.
pub fn normalize(name: &str, require_directory: bool) -> Result<&str, ArchiveError> {
    let invalid = || ArchiveError::InvalidName(name.to_string());

    if name.is_empty() || name.starts_with('/') {
        return Err(invalid());
    }
    let mut components = 0usize;
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') {
            return Err(invalid());
        }
        components += 1;
    }
    if require_directory && components < 2 {
        return Err(invalid());
    }
    Ok(name)
}

/// Validates a directory path for listing. The empty string addresses the
/// store root; otherwise the same component rules apply, without the
/// directory-component requirement.
pub fn normalize_dir(path: &str) -> Result<&str, ArchiveError> {
    if path.is_empty() {
        return Ok(path);
    }
    normalize(path, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_nested_relative_names() {
        assert!(normalize("mooring/ctd-7/2024.dat", true).is_ok());
        assert!(normalize("a/b", true).is_ok());
    }

    #[test]
    fn rejects_reserved_and_malformed() {
        for bad in [
            "",
            "/abs/path",
            "flat-name",
            ".version",
            ".transaction_3/x",
            "dir/.hidden",
            "dir/..",
            "dir//double",
            "trailing/",
        ] {
            assert!(normalize(bad, true).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn flat_names_allowed_when_requested() {
        assert!(normalize("flat-name", false).is_ok());
        assert!(normalize(".version", false).is_err());
    }

    #[test]
    fn dir_paths() {
        assert!(normalize_dir("").is_ok());
        assert!(normalize_dir("mooring").is_ok());
        assert!(normalize_dir(".redirection_4").is_err());
    }
}
