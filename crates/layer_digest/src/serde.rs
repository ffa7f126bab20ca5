//! [`serde_with`] adapters for digests.
//!
//! [`OciDigest`] writes a SHA-256 digest as `sha256:<hex>` the way image manifests and configs
//! spell layer identities.
//!
//! # Example:
//!
//! ```
//! use layer_digest::{serde::OciDigest, Sha256Hash};
//! use serde_with::serde_as;
//!
//! #[serde_as]
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Layer {
//!     #[serde_as(as = "OciDigest")]
//!     diff_id: Sha256Hash,
//! }
//!
//! let layer = Layer {
//!     diff_id: layer_digest::compute_bytes_digest::<layer_digest::Sha256>("layer"),
//! };
//! let json = serde_json::to_string(&layer).unwrap();
//! assert!(json.contains("\"sha256:"));
//! let _: Layer = serde_json::from_str(&json).unwrap();
//! ```

use crate::{parse_digest_from_hex, Sha256, Sha256Hash};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};
use std::borrow::Cow;

/// Serializes a SHA-256 digest as `sha256:<hex>`.
pub struct OciDigest;

impl SerializeAs<Sha256Hash> for OciDigest {
    fn serialize_as<S: Serializer>(source: &Sha256Hash, serializer: S) -> Result<S::Ok, S::Error> {
        crate::oci_digest(source).serialize(serializer)
    }
}

impl<'de> DeserializeAs<'de, Sha256Hash> for OciDigest {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Sha256Hash, D::Error> {
        let str = Cow::<'de, str>::deserialize(deserializer)?;
        let hex = str
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::custom("expected a digest starting with 'sha256:'"))?;
        parse_digest_from_hex::<Sha256>(hex).ok_or_else(|| Error::custom("failed to parse digest"))
    }
}

#[cfg(test)]
mod test {
    use super::OciDigest;
    use crate::{compute_bytes_digest, Sha256, Sha256Hash};
    use serde_with::serde_as;

    #[serde_as]
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Identity {
        #[serde_as(as = "OciDigest")]
        diff_id: Sha256Hash,
    }

    #[test]
    fn test_roundtrip_identity() {
        let identity = Identity {
            diff_id: compute_bytes_digest::<Sha256>("Hello, world!"),
        };
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(
            json,
            r#"{"diff_id":"sha256:315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"}"#
        );
        let parsed: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
    }

    #[test]
    fn test_oci_digest_requires_prefix() {
        let json = r#"{"diff_id":"315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"}"#;
        assert!(serde_json::from_str::<Identity>(json).is_err());
    }
}
