//! HTTP front end of a render worker.

mod middleware;
mod render;

use std::{io, net::SocketAddr, sync::Arc};

use axum::{Router, middleware as axum_middleware};
use tokio::net::{TcpListener, TcpSocket};

use crate::application::mediator::JobMediator;

pub use middleware::RequestContext;

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Clone)]
pub struct HttpState {
    pub mediator: Arc<JobMediator>,
}

/// Every path is served by the render handler; only the query string matters.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .fallback(render::render)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::set_request_context,
        ))
        .with_state(state)
}

/// Bind `addr` so that several worker processes can accept on the same port.
pub fn bind_shared_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
