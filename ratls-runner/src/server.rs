use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::map_request_body::MapRequestBodyLayer;
use tracing::{debug, info, warn};

use crate::state::CertificateIssuer;

/// Accepts TCP connections, upgrades each to RA-TLS with its own freshly
/// issued key and evidence, and serves `app` on it.
///
/// Material is never shared between connections: every handshake presents a
/// new SPKI and evidence whose nonce is bound to it.
pub async fn serve_ratls_https(
    listener: TcpListener,
    app: Router,
    issuer: Arc<CertificateIssuer>,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "RA-TLS server listening"),
        Err(_) => info!("RA-TLS server listening"),
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown: stop accepting RA-TLS connections");
                break;
            }
            res = listener.accept() => {
                match res {
                    Ok((io, peer)) => {
                        debug!(%peer, "tcp accept (ra-tls)");

                        let issuer = issuer.clone();
                        let app = app.clone();
                        let conn_cancel = shutdown.child_token();

                        tokio::spawn(async move {
                            let served = tokio::select! {
                                res = issuer.issue() => match res {
                                    Ok(served) => Arc::new(served),
                                    Err(e) => {
                                        warn!(%peer, error = ?e, "cannot issue RA-TLS material; dropping connection");
                                        return;
                                    }
                                },
                                _ = conn_cancel.cancelled() => return,
                            };
                            debug!(%peer, binding = %served.material.binding, "issued per-connection RA-TLS material");

                            let acceptor = TlsAcceptor::from(served.server_config.clone());
                            let tls_io = match acceptor.accept(io).await {
                                Ok(tls_io) => tls_io,
                                Err(e) => {
                                    warn!(%peer, error = ?e, "ra-tls accept failed");
                                    return;
                                }
                            };
                            let svc = app
                                .layer(Extension(served))
                                .into_service();
                            let svc = ServiceBuilder::new()
                                .layer(MapRequestBodyLayer::new(|body: Incoming| {
                                    AxumBody::from_stream(body.into_data_stream())
                                }))
                                .service(svc);
                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls_io), TowerToHyperService::new(svc));
                            tokio::pin!(conn);
                            tokio::select! {
                                res = conn.as_mut() => {
                                    if let Err(e) = res {
                                        warn!(%peer, error = ?e, "http1 connection error");
                                    }
                                }
                                _ = conn_cancel.cancelled() => {
                                    conn.as_mut().graceful_shutdown();
                                    if let Err(e) = conn.await {
                                        debug!(%peer, error = ?e, "connection closed during shutdown");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!(error = ?e, "listener.accept error; continuing"),
                }
            }
        }
    }
    info!("RA-TLS listener loop exited");
}
