use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libmpcsi::credential::{FileCredentialProvider, MountCredentials};
use libmpcsi::mount::MountArgs;
use libmpcsi::node::DRIVER_NAME;
use libmpcsi::transport::{CsiServer, NodeClient};
use libmpcsi::{CsiError, ErrorCode, Mounter, NodePublishVolumeRequest, NodeServer, VolumeId};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Mounter with nothing mounted anywhere.
struct NothingMounted;

#[async_trait]
impl Mounter for NothingMounted {
    async fn mount(
        &self,
        _bucket_name: &str,
        _target: &str,
        _credentials: &MountCredentials,
        _args: &MountArgs,
    ) -> Result<(), CsiError> {
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        Err(CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: "not mounted".into(),
        })
    }

    async fn is_mount_point(&self, _target: &str) -> io::Result<bool> {
        Err(io::Error::from(io::ErrorKind::NotFound))
    }
}

fn tls_configs() -> (rustls::ServerConfig, rustls::ClientConfig) {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], PrivateKeyDer::Pkcs8(key))
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (server, client)
}

#[tokio::test]
async fn node_rpcs_over_quic() {
    let (server_tls, client_tls) = tls_configs();
    let tmp = tempfile::tempdir().unwrap();
    let credentials = Arc::new(FileCredentialProvider::new(
        tmp.path(),
        Arc::new(|| None::<String>),
    ));
    let node = Arc::new(NodeServer::new(
        "node-1",
        Arc::new(NothingMounted),
        credentials,
    ));

    let server = Arc::new(
        CsiServer::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), server_tls, node).unwrap(),
    );
    let addr = server.endpoint().local_addr().unwrap();
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };

    let client = NodeClient::connect(addr, "localhost", client_tls)
        .await
        .unwrap()
        .with_request_timeout(Duration::from_secs(10));

    assert_eq!(client.plugin_info().await.unwrap().name, DRIVER_NAME);
    assert!(client.probe().await.unwrap());
    assert!(client.node_capabilities().await.unwrap().is_empty());
    assert_eq!(client.node_info().await.unwrap().node_id, "node-1");

    // Already torn down: success.
    client
        .unpublish_volume(
            &VolumeId::from("vol1"),
            "/var/lib/kubelet/pods/p1/volumes/kubernetes.io~csi/vol1/mount",
        )
        .await
        .unwrap();

    let err = client
        .publish_volume(NodePublishVolumeRequest {
            volume_id: VolumeId::from("vol1"),
            target_path: "/target/path".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(err.to_string().contains("capability"), "{err}");

    client.close().await;
    server.close();
    serving.await.unwrap().unwrap();
}
