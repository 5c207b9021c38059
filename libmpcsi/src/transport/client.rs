//! Node agent side of the transport.
//!
//! [`NodeClient`] keeps one QUIC connection to a node plugin and exposes the
//! node and identity RPCs as typed calls.  Error replies come back as the
//! plugin's own [`CsiError`], so the agent can tell an invalid request from a
//! retryable failure through [`CsiError::code`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::transport::server::MAX_MESSAGE_SIZE;
use crate::types::{NodeCapability, NodeInfo, NodePublishVolumeRequest, PluginInfo, VolumeId};

/// Publish may wait for a Mountpoint Pod and then for its mount, so the
/// default leaves room for both plugin-side timeouts.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection from the node agent to one node plugin.
pub struct NodeClient {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    request_timeout: Duration,
}

impl NodeClient {
    /// Connect to the plugin at `addr`. `server_name` must match a SAN of
    /// the plugin's certificate.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;

        let mut endpoint = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "connected to node plugin");
        Ok(Self {
            endpoint,
            connection,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound every later call by `timeout` instead of
    /// [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        match self.call(CsiMessage::PublishVolume(req)).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected("PublishVolume", other)),
        }
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let msg = CsiMessage::UnpublishVolume {
            volume_id: volume_id.clone(),
            target_path: target_path.to_owned(),
        };
        match self.call(msg).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected("UnpublishVolume", other)),
        }
    }

    pub async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        match self.call(CsiMessage::GetNodeCapabilities).await? {
            CsiMessage::NodeCapabilitiesResponse(caps) => Ok(caps),
            other => Err(unexpected("GetNodeCapabilities", other)),
        }
    }

    pub async fn node_info(&self) -> Result<NodeInfo, CsiError> {
        match self.call(CsiMessage::GetNodeInfo).await? {
            CsiMessage::NodeInfoResponse(info) => Ok(info),
            other => Err(unexpected("GetNodeInfo", other)),
        }
    }

    pub async fn plugin_info(&self) -> Result<PluginInfo, CsiError> {
        match self.call(CsiMessage::GetPluginInfo).await? {
            CsiMessage::PluginInfoResponse(info) => Ok(info),
            other => Err(unexpected("GetPluginInfo", other)),
        }
    }

    pub async fn probe(&self) -> Result<bool, CsiError> {
        match self.call(CsiMessage::Probe).await? {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(unexpected("Probe", other)),
        }
    }

    /// Close the connection and wait for the peer to acknowledge it.
    pub async fn close(self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"agent shutdown");
        self.endpoint.wait_idle().await;
    }

    /// One request per bi-stream, bounded by the request timeout. An
    /// `Error` reply is turned back into the plugin's error.
    #[instrument(skip(self), fields(msg = %msg))]
    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        let exchange = async {
            let (mut send, mut recv) = self
                .connection
                .open_bi()
                .await
                .map_err(CsiError::transport)?;

            let payload = serde_json::to_vec(&msg).map_err(CsiError::internal)?;
            send.write_all(&payload)
                .await
                .map_err(CsiError::transport)?;
            send.finish().map_err(CsiError::transport)?;

            let buf = recv
                .read_to_end(MAX_MESSAGE_SIZE)
                .await
                .map_err(CsiError::transport)?;
            serde_json::from_slice::<CsiMessage>(&buf).map_err(CsiError::transport)
        };

        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                CsiError::TransportError(format!(
                    "no reply to {msg} within {:?}",
                    self.request_timeout
                ))
            })??;
        debug!(%response, "node plugin replied");
        into_result(response)
    }
}

fn into_result(response: CsiMessage) -> Result<CsiMessage, CsiError> {
    match response {
        CsiMessage::Error(e) => Err(e),
        other => Ok(other),
    }
}

fn unexpected(rpc: &str, response: CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected reply to {rpc}: {response}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn error_reply_keeps_its_code() {
        let err = into_result(CsiMessage::Error(CsiError::InvalidArgument(
            "target path missing".into(),
        )))
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = into_result(CsiMessage::Error(CsiError::MountFailed {
            path: "/t".into(),
            reason: "busy".into(),
        }))
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn other_replies_pass_through() {
        assert!(matches!(into_result(CsiMessage::Ok), Ok(CsiMessage::Ok)));
        assert!(matches!(
            into_result(CsiMessage::ProbeResult(true)),
            Ok(CsiMessage::ProbeResult(true))
        ));
    }

    #[test]
    fn mismatched_reply_is_a_transport_error() {
        let err = unexpected("Probe", CsiMessage::Ok);
        assert!(matches!(&err, CsiError::TransportError(m) if m.contains("Probe")));
    }
}
