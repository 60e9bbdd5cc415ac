//! HTTP service run by each group member on the connections routed to it.
//!
//! The only real endpoint is `GET /hello`, which reports which member
//! answered. That makes failover visible from the outside: stop the primary
//! and the same request starts answering from the standby.

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::member::{GroupMember, Role, RoutedConnection};

/// Serve HTTP on every connection routed to `member` until its queue closes.
pub async fn serve_member(mut member: GroupMember) {
    let role = member.role();
    info!(role = %role, slot = %role.slot(), "Member serving");

    while let Some(conn) = member.accept().await {
        tokio::spawn(serve_connection(role, conn));
    }

    info!(role = %role, "Member queue closed");
}

/// Spawn [`serve_member`] on the current runtime.
pub fn spawn_member(member: GroupMember) -> JoinHandle<()> {
    tokio::spawn(serve_member(member))
}

async fn serve_connection(role: Role, conn: RoutedConnection) {
    let RoutedConnection { stream, peer, slot } = conn;
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| async move {
        Ok::<_, hyper::Error>(handle_member_request(role, &req))
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!(peer = %peer, slot = %slot, error = %e, "Member connection error");
    }
}

fn handle_member_request(role: Role, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/hello") => {
            debug!(role = %role, "got /hello request");
            text_response(StatusCode::OK, hello_body(role))
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found\n".to_owned()),
    }
}

fn hello_body(role: Role) -> String {
    format!("Hello from {}!\n", role)
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
