//! Handlers the gateway answers by itself.

use crate::library::{
    error::GatewayResult,
    handlers::{BackendId, Handler, HandlerContext, HandlerId},
    protocol::{http::HeaderField, responses, ws},
    session::Protocol,
};
use bytes::BufMut;
use std::net::SocketAddr;
use tracing::trace;

/// `POST /echo`: the body comes back as a `text/plain` reply.
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn run(&self, ctx: &mut HandlerContext<'_>, _id: HandlerId) -> GatewayResult<bool> {
        let body = ctx.body();
        responses::write_echo(ctx.reply, &body);
        ctx.respond();
        Ok(true)
    }
}

/// `GET /pong`.
pub struct PongHandler;

impl Handler for PongHandler {
    fn run(&self, ctx: &mut HandlerContext<'_>, _id: HandlerId) -> GatewayResult<bool> {
        ctx.reply.put_slice(responses::PONG);
        ctx.respond();
        Ok(true)
    }
}

/// `GET /gwstats`: JSON report of ports, URIs and worker counters.
pub struct StatsHandler;

impl Handler for StatsHandler {
    fn run(&self, ctx: &mut HandlerContext<'_>, _id: HandlerId) -> GatewayResult<bool> {
        let report = ctx.gateway.stats_report()?;
        responses::write_with_length(ctx.reply, responses::STATS_HEADER, responses::STATS_LENGTH_AT, &report);
        ctx.respond();
        Ok(true)
    }
}

/// Attached on behalf of a backend: sends requests through its channel.
/// Upgrade requests are answered here and later frames forwarded.
pub struct BackendForwarder {
    pub backend: BackendId,
}

impl Handler for BackendForwarder {
    fn run(&self, ctx: &mut HandlerContext<'_>, id: HandlerId) -> GatewayResult<bool> {
        if !ctx.gateway.backend_active(self.backend) {
            // Let the next list in the chain take it.
            return Ok(false);
        }
        if let (Protocol::Http1, Some(request)) = (ctx.protocol, ctx.request)
            && request.ws_upgrade
        {
            let head = ctx.message.slice(0, request.header_len);
            ws::upgrade_response(request, &head, ctx.reply)?;
            ctx.upgrade(Some(self.backend));
            return Ok(true);
        }
        trace!("Forwarding {} bytes to backend {} via {:?}", ctx.message.len(), self.backend, id);
        ctx.forward(self.backend);
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Only requests whose `Host` header equals this take the route.
    pub host: Option<String>,
    pub destination: SocketAddr,
}

/// Relays requests to a proxied server. Routes sharing a URI are tried in
/// configuration order.
pub struct ReverseProxyHandler {
    routes: Vec<ProxyRoute>,
}

impl ReverseProxyHandler {
    pub fn new(routes: Vec<ProxyRoute>) -> ReverseProxyHandler {
        ReverseProxyHandler { routes }
    }

    pub fn destination_for(&self, host: Option<&[u8]>) -> Option<SocketAddr> {
        self.routes
            .iter()
            .find(|route| match (&route.host, host) {
                (None, _) => true,
                (Some(wanted), Some(host)) => wanted.as_bytes().eq_ignore_ascii_case(host),
                (Some(_), None) => false,
            })
            .map(|route| route.destination)
    }
}

impl Handler for ReverseProxyHandler {
    fn run(&self, ctx: &mut HandlerContext<'_>, id: HandlerId) -> GatewayResult<bool> {
        let Some(request) = ctx.request else {
            return Ok(false);
        };
        let host = request.header(HeaderField::Host).map(|header| ctx.message.span(header.value));
        let Some(destination) = self.destination_for(host.as_deref()) else {
            return Ok(false);
        };
        trace!("Proxying {} to {} via {:?}", ctx.session, destination, id);
        ctx.proxy(destination);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(host: Option<&str>, destination: &str) -> ProxyRoute {
        ProxyRoute {
            host: host.map(str::to_string),
            destination: destination.parse().unwrap(),
        }
    }

    #[test]
    fn proxy_routes_match_host_first_come() {
        let handler = ReverseProxyHandler::new(vec![
            route(Some("api.example.org"), "10.0.0.1:80"),
            route(None, "10.0.0.2:80"),
        ]);
        assert_eq!(handler.destination_for(Some(&b"API.example.org"[..])), Some("10.0.0.1:80".parse().unwrap()));
        assert_eq!(handler.destination_for(Some(&b"other.org"[..])), Some("10.0.0.2:80".parse().unwrap()));
        assert_eq!(handler.destination_for(None), Some("10.0.0.2:80".parse().unwrap()));

        let strict = ReverseProxyHandler::new(vec![route(Some("a.org"), "10.0.0.1:80")]);
        assert_eq!(strict.destination_for(Some(&b"b.org"[..])), None);
        assert_eq!(strict.destination_for(None), None);
    }
}
