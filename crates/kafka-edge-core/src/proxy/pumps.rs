//! The two per-connection frame pumps.
//!
//! The request pump drives downstream-to-upstream traffic: frame in,
//! forbidden-key check, correlation slot, frame out verbatim. The response
//! pump drives the other direction: frame in, correlation lookup, optional
//! address rewrite, frame out. Neither pump buffers more than one frame;
//! byte order within each direction is preserved by construction. Pumps
//! run without I/O deadlines because Kafka sessions may idle indefinitely.

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::network::codec::{write_frame, RequestCodec, ResponseCodec};
use crate::protocol::rewrite_response;

use super::pending::{PendingRequest, PendingRequests};
use super::ProcessorConfig;

/// Frame length prefix size, counted into byte metrics.
const PREFIX_LEN: u64 = 4;

fn codec_error(e: io::Error) -> ProxyError {
    if e.kind() == io::ErrorKind::InvalidData {
        ProxyError::ProtocolDecode {
            message: e.to_string(),
        }
    } else {
        ProxyError::Connection(e)
    }
}

/// Downstream-to-upstream pump.
///
/// Returns `Ok(())` on clean downstream EOF.
///
/// # Errors
///
/// Fails on forbidden api_keys, duplicate correlation ids, malformed
/// frames, and I/O errors; the caller tears the connection down.
pub async fn run_request_pump<R, W>(
    downstream: R,
    mut upstream: W,
    pending: Arc<PendingRequests>,
    config: Arc<ProcessorConfig>,
    metrics: Arc<ProxyMetrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::with_capacity(
        downstream,
        RequestCodec::new(),
        config.request_buffer_size,
    );

    while let Some(result) = frames.next().await {
        let frame = result.map_err(codec_error)?;
        trace!(
            api_key = frame.api_key,
            api_version = frame.api_version,
            correlation_id = frame.correlation_id,
            client_id = frame.client_id.as_deref(),
            "request frame"
        );

        if config.forbidden_api_keys.contains(&frame.api_key) {
            metrics.record_forbidden_request();
            return Err(ProxyError::ForbiddenApiKey(frame.api_key));
        }

        pending
            .reserve(
                frame.correlation_id,
                PendingRequest {
                    api_key: frame.api_key,
                    api_version: frame.api_version,
                },
            )
            .await?;

        write_frame(&mut upstream, &frame.payload).await?;
        metrics.record_request(frame.api_key);
        metrics.record_bytes_client_to_broker(PREFIX_LEN + frame.payload.len() as u64);
    }

    debug!("downstream closed");
    Ok(())
}

/// Upstream-to-downstream pump.
///
/// Returns `Ok(())` on clean upstream EOF.
///
/// # Errors
///
/// Fails on responses without a matching request, rewrite failures, and
/// I/O errors; the caller tears the connection down.
pub async fn run_response_pump<R, W>(
    upstream: R,
    mut downstream: W,
    pending: Arc<PendingRequests>,
    config: Arc<ProcessorConfig>,
    metrics: Arc<ProxyMetrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::with_capacity(
        upstream,
        ResponseCodec::new(),
        config.response_buffer_size,
    );

    while let Some(result) = frames.next().await {
        let frame = result.map_err(codec_error)?;
        let request = pending.complete(frame.correlation_id)?;
        trace!(
            api_key = request.api_key,
            api_version = request.api_version,
            correlation_id = frame.correlation_id,
            "response frame"
        );

        let rewritten = match &config.address_mapper {
            Some(mapper) => rewrite_response(
                request.api_key,
                request.api_version,
                &frame.payload,
                mapper,
            )?,
            None => None,
        };

        let body: &[u8] = rewritten.as_deref().unwrap_or(&frame.payload);
        write_frame(&mut downstream, body).await?;
        metrics.record_bytes_broker_to_client(PREFIX_LEN + body.len() as u64);
    }

    debug!("upstream closed");
    Ok(())
}
