//! Kafka protocol knowledge: api-key constants and the whitelist of
//! address-bearing responses the proxy rewrites.

pub mod rewrite;

pub use rewrite::{rewrite_response, AddressMapper};

/// API keys the proxy refers to by name.
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const METADATA: i16 = 3;
    pub const FIND_COORDINATOR: i16 = 10;
    pub const SASL_HANDSHAKE: i16 = 17;
    pub const API_VERSIONS: i16 = 18;
    pub const SASL_AUTHENTICATE: i16 = 36;
    pub const DESCRIBE_CLUSTER: i16 = 60;
}

/// Whether responses for this api_key carry broker `host:port` endpoints.
#[must_use]
pub fn is_address_bearing(api_key: i16) -> bool {
    matches!(
        api_key,
        api_keys::METADATA | api_keys::FIND_COORDINATOR | api_keys::DESCRIBE_CLUSTER
    )
}

/// The version range of an address-bearing API whose schema we can walk.
///
/// Responses outside these ranges are forwarded unchanged (and logged by
/// the caller): Metadata v0-v12, FindCoordinator v0-v4, DescribeCluster
/// v0-v1.
#[must_use]
pub fn rewrite_supported(api_key: i16, api_version: i16) -> bool {
    match api_key {
        api_keys::METADATA => (0..=12).contains(&api_version),
        api_keys::FIND_COORDINATOR => (0..=4).contains(&api_version),
        api_keys::DESCRIBE_CLUSTER => (0..=1).contains(&api_version),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bearing_whitelist() {
        assert!(is_address_bearing(api_keys::METADATA));
        assert!(is_address_bearing(api_keys::FIND_COORDINATOR));
        assert!(is_address_bearing(api_keys::DESCRIBE_CLUSTER));
        assert!(!is_address_bearing(api_keys::PRODUCE));
        assert!(!is_address_bearing(api_keys::API_VERSIONS));
    }

    #[test]
    fn test_version_matrix() {
        assert!(rewrite_supported(api_keys::METADATA, 0));
        assert!(rewrite_supported(api_keys::METADATA, 12));
        assert!(!rewrite_supported(api_keys::METADATA, 13));
        assert!(rewrite_supported(api_keys::FIND_COORDINATOR, 4));
        assert!(!rewrite_supported(api_keys::FIND_COORDINATOR, 5));
        assert!(rewrite_supported(api_keys::DESCRIBE_CLUSTER, 1));
        assert!(!rewrite_supported(api_keys::DESCRIBE_CLUSTER, 2));
    }
}
