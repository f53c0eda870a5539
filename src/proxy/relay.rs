//! Connection hijacking and byte relays.
//!
//! The CONNECT tunnel and the WebSocket relay both take over the underlying
//! duplex stream once the HTTP exchange that sets them up completes, then tie
//! the client and upstream together with a pair of one-directional copies.
//! The relay is the single release point: both endpoints are dropped (and so
//! closed) on every exit path, whichever direction finishes first.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::{header, HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::engine::{self, text_response, BoxBody, DIAL_TIMEOUT};
use crate::logging::EngineLogs;

/// True when the request asks for a WebSocket upgrade: `Upgrade: websocket`
/// with `upgrade` listed in the `Connection` header, both case-insensitive.
pub fn wants_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    upgrade.eq_ignore_ascii_case("websocket") && connection.to_ascii_lowercase().contains("upgrade")
}

/// The `host:port` a hijacking request targets, from the request target's
/// authority or the `Host` header. `default_port` fills in a missing port.
fn request_target<B>(req: &Request<B>, default_port: u16) -> Option<String> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority)
    } else {
        Some(format!("{authority}:{default_port}"))
    }
}

/// Tie two duplex streams together until either direction sees EOF or an
/// error. One task per direction; the loser is torn down as soon as the
/// winner finishes, which closes all four halves.
pub async fn join_streams<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let mut directions: JoinSet<()> = JoinSet::new();
    directions.spawn(async move {
        let _ = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
    });
    directions.spawn(async move {
        let _ = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
    });

    directions.join_next().await;
    directions.shutdown().await;
}

/// Handle a CONNECT request: answer 200, take over the client connection,
/// dial the requested host and relay opaque bytes in both directions. A dial
/// failure closes the client side without writing a further response.
pub fn tunnel(req: Request<Incoming>, logs: &EngineLogs) -> Response<BoxBody> {
    if req.extensions().get::<OnUpgrade>().is_none() {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server does not support connection hijacking",
        );
    }
    let Some(target) = request_target(&req, 443) else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "tunnel request is missing a host");
    };

    let logs = logs.clone();
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                logs.error(format!("hijacking client connection failed: {e}"));
                return;
            }
        };
        let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                logs.error(format!("error connecting to {target}: {e}"));
                return;
            }
            Err(_) => {
                logs.error(format!("timed out connecting to {target}"));
                return;
            }
        };
        join_streams(TokioIo::new(upgraded), upstream).await;
    });

    Response::builder().status(StatusCode::OK).body(engine::empty_body()).unwrap()
}

/// Handle a WebSocket upgrade request: replay it to the upstream over a
/// dedicated HTTP/1.1 connection, hand the upstream's handshake response
/// back to the client as-is, and on 101 relay bytes between the two upgraded
/// streams. Handshake failures answer 500 and release both sides.
pub async fn websocket(mut req: Request<Incoming>, logs: &EngineLogs, peer: SocketAddr) -> Response<BoxBody> {
    if req.extensions().get::<OnUpgrade>().is_none() {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server does not support connection hijacking",
        );
    }
    let Some(target) = request_target(&req, 80) else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "websocket request is missing a host");
    };

    let client_upgrade = hyper::upgrade::on(&mut req);

    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            logs.error(format!("error connecting to {target}: {e}"));
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to reach the websocket destination server",
            );
        }
        Err(_) => {
            logs.error(format!("timed out connecting to {target}"));
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to reach the websocket destination server",
            );
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
        Ok(pair) => pair,
        Err(e) => {
            logs.error(format!("websocket handshake with {target} failed: {e}"));
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to send websocket upgrade request to the destination server",
            );
        }
    };
    let conn_logs = logs.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            conn_logs.error(format!("websocket upstream connection error: {e}"));
        }
    });

    // replay the original upgrade request in origin form
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut upstream_req = Request::builder()
        .method(req.method().clone())
        .uri(path)
        .body(Empty::<Bytes>::new())
        .unwrap();
    *upstream_req.headers_mut() = req.headers().clone();

    let mut upstream_resp = match sender.send_request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            logs.error(format!("websocket upgrade against {target} failed: {e}"));
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read websocket upgrade response from the destination server",
            );
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // the destination declined the upgrade; hand its answer through unchanged
        return upstream_resp.map(|body| body.boxed());
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
    let relay_logs = logs.clone();
    tokio::spawn(async move {
        let upstream = match upstream_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                relay_logs.error(format!("websocket upstream upgrade failed: {e}"));
                return;
            }
        };
        let client = match client_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                relay_logs.error(format!("websocket client upgrade from {peer} failed: {e}"));
                return;
            }
        };
        join_streams(TokioIo::new(client), TokioIo::new(upstream)).await;
    });

    let mut response = Response::new(engine::empty_body());
    *response.status_mut() = upstream_resp.status();
    *response.headers_mut() = upstream_resp.headers().clone();
    response
}
