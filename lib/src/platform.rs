//! Platform triple (`os-distro/arch/toolchain`) parsing and matching.
//!
//! Matching is tuple-wise; an empty section in either operand acts as a
//! wildcard (GLOSSARY). A builder's `name` carries its platform as the
//! suffix after the first dot (spec.md §4.C).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os_distro: String,
    pub arch: String,
    pub toolchain: String,
}

impl Platform {
    pub fn parse(s: &str) -> Platform {
        let mut parts = s.splitn(3, '/');
        Platform {
            os_distro: parts.next().unwrap_or("").to_string(),
            arch: parts.next().unwrap_or("").to_string(),
            toolchain: parts.next().unwrap_or("").to_string(),
        }
    }

    /// Tuple-wise match with empty-section wildcards on either side.
    pub fn matches(&self, other: &Platform) -> bool {
        fn section_matches(a: &str, b: &str) -> bool {
            a.is_empty() || b.is_empty() || a == b
        }
        section_matches(&self.os_distro, &other.os_distro)
            && section_matches(&self.arch, &other.arch)
            && section_matches(&self.toolchain, &other.toolchain)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.os_distro, self.arch, self.toolchain)
    }
}

/// Recover the platform suffix from a builder name of the form
/// `<instance-name>.<platform>`.
pub fn platform_from_builder_name(name: &str) -> Option<Platform> {
    let (_, rest) = name.split_once('.')?;
    Some(Platform::parse(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let a = Platform::parse("linux-deb12/x86_64/gcc12");
        let b = Platform::parse("linux-deb12/x86_64/gcc12");
        assert!(a.matches(&b));
    }

    #[test]
    fn wildcard_toolchain_matches() {
        let wanted = Platform::parse("linux-deb12/x86_64/");
        let offered = Platform::parse("linux-deb12/x86_64/gcc12");
        assert!(wanted.matches(&offered));
        assert!(offered.matches(&wanted));
    }

    #[test]
    fn mismatched_arch_rejected() {
        let a = Platform::parse("linux-deb12/x86_64/gcc12");
        let b = Platform::parse("linux-deb12/armv7/gcc12");
        assert!(!a.matches(&b));
    }

    #[test]
    fn builder_name_suffix_is_platform() {
        let p = platform_from_builder_name("builder3.linux-deb12/x86_64/gcc12").unwrap();
        assert_eq!(p.to_string(), "linux-deb12/x86_64/gcc12");
    }
}
