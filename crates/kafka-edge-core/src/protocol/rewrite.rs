//! Address-rewriting response filter.
//!
//! Kafka brokers advertise their own `host:port` in Metadata,
//! FindCoordinator and DescribeCluster responses. When the proxy fronts a
//! fleet behind NAT, those endpoints must be rewritten so clients connect
//! back through the proxy. The mapper is caller-supplied, total and
//! side-effect-free; the filter decodes the response at the recorded
//! api_version, maps every advertised endpoint, and re-encodes with a
//! recomputed length prefix. All other responses pass through untouched.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, DescribeClusterResponse, FindCoordinatorResponse, MetadataResponse, ResponseHeader,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tracing::warn;

use crate::error::{ProxyError, Result};

use super::{api_keys, rewrite_supported};

/// Maps an advertised broker endpoint to the address clients should use.
pub type AddressMapper = Arc<dyn Fn(&str, u16) -> (String, u16) + Send + Sync>;

/// Rewrite advertised endpoints in a response frame.
///
/// `payload` is the complete frame after the length prefix (response header
/// included). Returns `Ok(None)` when the frame is not address-bearing or
/// its version is outside the supported matrix, `Ok(Some(frame))` with the
/// rewritten bytes otherwise.
///
/// # Errors
///
/// Returns a protocol error when an address-bearing response within the
/// supported matrix fails to decode or re-encode.
pub fn rewrite_response(
    api_key: i16,
    api_version: i16,
    payload: &[u8],
    mapper: &AddressMapper,
) -> Result<Option<BytesMut>> {
    if !super::is_address_bearing(api_key) {
        return Ok(None);
    }
    if !rewrite_supported(api_key, api_version) {
        warn!(
            api_key,
            api_version, "address-bearing response version not supported, forwarding unchanged"
        );
        return Ok(None);
    }

    let key = ApiKey::try_from(api_key).map_err(|_| ProxyError::ProtocolDecode {
        message: format!("unknown api key {api_key}"),
    })?;
    let header_version = key.response_header_version(api_version);

    let rewritten = match api_key {
        api_keys::METADATA => reencode::<MetadataResponse>(
            payload,
            api_version,
            header_version,
            |response| {
                for broker in &mut response.brokers {
                    map_endpoint(mapper, &mut broker.host, &mut broker.port);
                }
            },
        )?,
        api_keys::FIND_COORDINATOR => reencode::<FindCoordinatorResponse>(
            payload,
            api_version,
            header_version,
            |response| {
                if api_version >= 4 {
                    for coordinator in &mut response.coordinators {
                        map_endpoint(mapper, &mut coordinator.host, &mut coordinator.port);
                    }
                } else {
                    map_endpoint(mapper, &mut response.host, &mut response.port);
                }
            },
        )?,
        api_keys::DESCRIBE_CLUSTER => reencode::<DescribeClusterResponse>(
            payload,
            api_version,
            header_version,
            |response| {
                for broker in &mut response.brokers {
                    map_endpoint(mapper, &mut broker.host, &mut broker.port);
                }
            },
        )?,
        _ => unreachable!("checked by is_address_bearing"),
    };

    Ok(Some(rewritten))
}

/// Decode header and body, apply `mutate`, encode both back.
fn reencode<T: Decodable + Encodable>(
    payload: &[u8],
    api_version: i16,
    header_version: i16,
    mutate: impl FnOnce(&mut T),
) -> Result<BytesMut> {
    let mut buf = Bytes::copy_from_slice(payload);

    let header =
        ResponseHeader::decode(&mut buf, header_version).map_err(|e| ProxyError::ProtocolDecode {
            message: format!("response header: {e}"),
        })?;
    let mut body = T::decode(&mut buf, api_version).map_err(|e| ProxyError::ProtocolDecode {
        message: format!("response body: {e}"),
    })?;

    mutate(&mut body);

    let mut out = BytesMut::with_capacity(payload.len() + 64);
    header
        .encode(&mut out, header_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response header: {e}"),
        })?;
    body.encode(&mut out, api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response body: {e}"),
        })?;
    Ok(out)
}

/// Run one advertised endpoint through the mapper.
fn map_endpoint(mapper: &AddressMapper, host: &mut StrBytes, port: &mut i32) {
    let Ok(port_u16) = u16::try_from(*port) else {
        // Negative ports show up in error responses (node_id -1); leave
        // them alone.
        return;
    };
    let current = host.to_string();
    let (new_host, new_port) = mapper(&current, port_u16);
    *host = StrBytes::from_string(new_host);
    *port = i32::from(new_port);
}
