//! Ephemeral endpoint handing certificates to image builds.
//!
//! Builds fetch the CA and entitlement certificates over HTTP so the
//! material never lands in an image layer or build history. The listener
//! binds an ephemeral port and lives until the batch token is cancelled.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Bytes served by the endpoint.
#[derive(Clone, Default)]
pub struct SecretMaterial {
    pub ca_certificate: Vec<u8>,
    pub entitlement: Vec<u8>,
}

async fn cacert(State(secrets): State<Arc<SecretMaterial>>) -> Vec<u8> {
    secrets.ca_certificate.clone()
}

async fn entitlement(State(secrets): State<Arc<SecretMaterial>>) -> Vec<u8> {
    secrets.entitlement.clone()
}

/// Router exposing `/cacert/` and `/entitlement/`.
pub fn router(secrets: Arc<SecretMaterial>) -> Router {
    Router::new()
        .route("/cacert", get(cacert))
        .route("/cacert/", get(cacert))
        .route("/entitlement", get(entitlement))
        .route("/entitlement/", get(entitlement))
        .layer(TraceLayer::new_for_http())
        .with_state(secrets)
}

/// A running secret endpoint.
#[derive(Debug)]
pub struct SecretServer {
    pub local_addr: SocketAddr,
    /// URL injected into builds as `CERT_BASE_URL`.
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl SecretServer {
    /// Bind an ephemeral port on all interfaces and start serving.
    ///
    /// `advertise_host` is the host builds use to reach this machine.
    pub async fn start(
        secrets: SecretMaterial,
        advertise_host: &str,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        Self::start_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), secrets, advertise_host, shutdown).await
    }

    pub async fn start_on(
        bind_ip: IpAddr,
        secrets: SecretMaterial,
        advertise_host: &str,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(bind_ip, 0)).await?;
        let local_addr = listener.local_addr()?;
        let base_url = format!("http://{advertise_host}:{}", local_addr.port());
        let app = router(Arc::new(secrets));

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "Secret endpoint stopped with error");
            }
        });

        tracing::info!(%local_addr, base_url = %base_url, "Serving license and entitlement");
        Ok(Self {
            local_addr,
            base_url,
            handle,
        })
    }

    /// Wait for the server task after its shutdown token fired.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Secret endpoint task did not exit cleanly");
        }
    }
}

/// This machine's outbound IPv4 address.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address routes to the target.
pub fn detect_host_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 80))?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "No IP found for serving the license and entitlement",
        ));
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn secrets() -> Arc<SecretMaterial> {
        Arc::new(SecretMaterial {
            ca_certificate: b"CA-PEM".to_vec(),
            entitlement: b"ENT-PEM".to_vec(),
        })
    }

    async fn get_body(uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(secrets())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn serves_ca_certificate() {
        assert_eq!(get_body("/cacert/").await, (StatusCode::OK, b"CA-PEM".to_vec()));
        assert_eq!(get_body("/cacert").await, (StatusCode::OK, b"CA-PEM".to_vec()));
    }

    #[tokio::test]
    async fn serves_entitlement() {
        assert_eq!(
            get_body("/entitlement/").await,
            (StatusCode::OK, b"ENT-PEM".to_vec())
        );
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let (status, _) = get_body("/license/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_stops_on_cancel() {
        let token = CancellationToken::new();
        let server = SecretServer::start_on(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            SecretMaterial::default(),
            "127.0.0.1",
            token.clone(),
        )
        .await
        .expect("bind");
        assert!(server.base_url.starts_with("http://127.0.0.1:"));
        assert_ne!(server.local_addr.port(), 0);

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.join())
            .await
            .expect("server exits after cancel");
    }
}
