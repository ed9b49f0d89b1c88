//! Typed Message Surface
//!
//! The engine itself treats every payload as opaque bytes plus three
//! descriptor strings. Callers that work with concrete message types adapt
//! them through [`BagMessage`]: the trait supplies the descriptors and the
//! byte codec, and the read side checks the recorded md5sum against the
//! type's before decoding (`"*"` acts as a wildcard on either side).

use crate::error::Result;

/// The three descriptor strings recorded with every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDescriptor<'a> {
    pub datatype: &'a str,
    pub md5sum: &'a str,
    pub definition: &'a str,
}

/// A payload type that can be recorded into and recovered from a bag.
pub trait BagMessage: Sized {
    fn datatype() -> &'static str;
    fn md5sum() -> &'static str;
    fn definition() -> &'static str;

    fn descriptor() -> MessageDescriptor<'static> {
        MessageDescriptor {
            datatype: Self::datatype(),
            md5sum: Self::md5sum(),
            definition: Self::definition(),
        }
    }

    /// Whether a payload recorded with `recorded_md5sum` can decode as `Self`.
    fn matches(recorded_md5sum: &str) -> bool {
        Self::md5sum() == "*" || recorded_md5sum == "*" || Self::md5sum() == recorded_md5sum
    }

    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(data: &[u8]) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(Vec<u8>);

    impl BagMessage for Plain {
        fn datatype() -> &'static str {
            "test/Plain"
        }
        fn md5sum() -> &'static str {
            "0123456789abcdef0123456789abcdef"
        }
        fn definition() -> &'static str {
            "bytes data\n"
        }
        fn encode(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
        fn decode(data: &[u8]) -> Result<Self> {
            Ok(Plain(data.to_vec()))
        }
    }

    struct Wildcard;

    impl BagMessage for Wildcard {
        fn datatype() -> &'static str {
            "*"
        }
        fn md5sum() -> &'static str {
            "*"
        }
        fn definition() -> &'static str {
            ""
        }
        fn encode(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn decode(_: &[u8]) -> Result<Self> {
            Ok(Wildcard)
        }
    }

    #[test]
    fn test_descriptor_mirrors_trait() {
        let d = Plain::descriptor();
        assert_eq!(d.datatype, "test/Plain");
        assert_eq!(d.md5sum, Plain::md5sum());
        assert_eq!(d.definition, "bytes data\n");
    }

    #[test]
    fn test_matches_exact_and_wildcard() {
        assert!(Plain::matches(Plain::md5sum()));
        assert!(!Plain::matches("ffffffffffffffffffffffffffffffff"));
        assert!(Plain::matches("*"));
        assert!(Wildcard::matches("anything"));
    }
}
