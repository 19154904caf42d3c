//! Mandatory entry-name validation.
//!
//! The gate runs before any configured criteria and nothing downstream can
//! re-admit a name it rejects.

use thiserror::Error;

/// Why the security gate refused a name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameViolation {
    #[error("name is empty")]
    Empty,

    #[error("name is {length} characters long, limit is {max}")]
    TooLong { length: usize, max: usize },

    #[error("name contains control character U+{0:04X}")]
    ControlCharacter(u32),

    #[error("name contains bidirectional override U+{0:04X}")]
    BidiOverride(u32),

    #[error("name is a network path")]
    NetworkPath,

    #[error("name is an absolute path")]
    AbsolutePath,

    #[error("name starts with a drive letter")]
    DriveLetter,

    #[error("name contains a parent-directory segment")]
    ParentTraversal,

    #[error("name uses a reserved filesystem name")]
    ReservedName,
}

/// Code points that reorder displayed text (embeddings, overrides, isolates
/// and directional marks)
const BIDI_CONTROLS: &[char] = &[
    '\u{061C}', '\u{200E}', '\u{200F}', '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}',
    '\u{202E}', '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Validates entry names against path traversal and other unsafe forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityGate {
    max_name_length: usize,
}

impl SecurityGate {
    pub fn new(max_name_length: usize) -> Self {
        Self { max_name_length }
    }

    pub fn max_name_length(&self) -> usize {
        self.max_name_length
    }

    pub fn check(&self, name: &str) -> Result<(), NameViolation> {
        if name.is_empty() {
            return Err(NameViolation::Empty);
        }

        let length = name.chars().count();
        if length > self.max_name_length {
            return Err(NameViolation::TooLong {
                length,
                max: self.max_name_length,
            });
        }

        if let Some(c) = name.chars().find(|c| c.is_control()) {
            return Err(NameViolation::ControlCharacter(c as u32));
        }
        if let Some(c) = name.chars().find(|c| BIDI_CONTROLS.contains(c)) {
            return Err(NameViolation::BidiOverride(c as u32));
        }

        if name.starts_with("//") || name.starts_with("\\\\") {
            return Err(NameViolation::NetworkPath);
        }
        if name.starts_with('/') || name.starts_with('\\') {
            return Err(NameViolation::AbsolutePath);
        }
        let mut chars = name.chars();
        if let (Some(letter), Some(':')) = (chars.next(), chars.next()) {
            if letter.is_ascii_alphabetic() {
                return Err(NameViolation::DriveLetter);
            }
        }

        if name.contains("../") || name.contains("..\\") {
            return Err(NameViolation::ParentTraversal);
        }

        let mut components = name.split(['/', '\\']).filter(|c| !c.is_empty()).peekable();
        if components.peek().is_none() {
            return Err(NameViolation::ReservedName);
        }
        for component in components {
            if component == ".." {
                return Err(NameViolation::ParentTraversal);
            }
            if component == "." || is_device_name(component) {
                return Err(NameViolation::ReservedName);
            }
        }

        Ok(())
    }
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Windows device names stay reserved with any extension (`nul.txt`)
fn is_device_name(component: &str) -> bool {
    let stem = component.split('.').next().unwrap_or(component).trim_end();
    RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str) -> Result<(), NameViolation> {
        SecurityGate::default().check(name)
    }

    #[test]
    fn test_ordinary_names_pass() {
        for name in [
            "a.txt",
            "dir/",
            "docs/guide/readme.md",
            "weird..name.txt",
            "..hidden",
            "console.log",
            "résumé.pdf",
        ] {
            assert_eq!(check(name), Ok(()), "{name}");
        }
    }

    #[test]
    fn test_traversal() {
        for name in ["../../etc/passwd", "a/../b", "a\\..\\b", "..\\x", "a/..", "x../y"] {
            assert_eq!(check(name), Err(NameViolation::ParentTraversal), "{name}");
        }
    }

    #[test]
    fn test_absolute_and_network_paths() {
        assert_eq!(check("/etc/passwd"), Err(NameViolation::AbsolutePath));
        assert_eq!(check("\\windows"), Err(NameViolation::AbsolutePath));
        assert_eq!(check("C:\\boot.ini"), Err(NameViolation::DriveLetter));
        assert_eq!(check("c:relative"), Err(NameViolation::DriveLetter));
        assert_eq!(check("//server/share"), Err(NameViolation::NetworkPath));
        assert_eq!(check("\\\\server\\share"), Err(NameViolation::NetworkPath));
    }

    #[test]
    fn test_control_and_bidi_characters() {
        assert_eq!(check("a\0b"), Err(NameViolation::ControlCharacter(0)));
        assert_eq!(check("line\nbreak"), Err(NameViolation::ControlCharacter(10)));
        assert_eq!(
            check("invoice\u{202E}fdp.exe"),
            Err(NameViolation::BidiOverride(0x202E))
        );
    }

    #[test]
    fn test_reserved_names() {
        for name in [".", "./", "./.", "a/./b", "/"] {
            assert!(check(name).is_err(), "{name}");
        }
        assert_eq!(check("NUL"), Err(NameViolation::ReservedName));
        assert_eq!(check("logs/com1.txt"), Err(NameViolation::ReservedName));
        assert_eq!(check(".."), Err(NameViolation::ParentTraversal));
    }

    #[test]
    fn test_length_limit() {
        let gate = SecurityGate::new(8);
        assert_eq!(gate.check("12345678"), Ok(()));
        assert_eq!(
            gate.check("123456789"),
            Err(NameViolation::TooLong { length: 9, max: 8 })
        );
        assert_eq!(check(""), Err(NameViolation::Empty));
    }
}
