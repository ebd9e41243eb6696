use crate::library::{
    config::MAX_WORKER_THREADS,
    error::{GatewayError, GatewayResult},
    handlers::{
        BackendId, HandlerId,
        uri::{RegisteredUris, UriMatch},
    },
    protocol::http::Method,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Rewrites one exact `method uri` to another URI before lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriAlias {
    pub method: Method,
    pub from: String,
    pub to: String,
}

/// How incoming bytes on a port are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Nothing registered yet.
    Unbound,
    Http,
    /// First four bytes of each message pick the sub-port.
    SubPorts,
    Raw,
}

/// Routing state for one listening port.
pub struct ServerPort {
    port: u16,
    port_lists: Vec<(BackendId, HandlerId)>,
    subports: Vec<(u32, Vec<(BackendId, HandlerId)>)>,
    uris: RegisteredUris,
    aliases: Vec<UriAlias>,
    active_sockets: [AtomicUsize; MAX_WORKER_THREADS],
    accepted: AtomicU64,
}

impl ServerPort {
    pub fn new(port: u16, case_insensitive: bool, strict_boundaries: bool) -> ServerPort {
        ServerPort {
            port,
            port_lists: Vec::new(),
            subports: Vec::new(),
            uris: RegisteredUris::new(case_insensitive, strict_boundaries),
            aliases: Vec::new(),
            active_sockets: std::array::from_fn(|_| AtomicUsize::new(0)),
            accepted: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline(always)]
    pub fn uris(&self) -> &RegisteredUris {
        &self.uris
    }

    pub fn mode(&self) -> PortMode {
        if !self.uris.is_empty() {
            PortMode::Http
        } else if !self.subports.is_empty() {
            PortMode::SubPorts
        } else if !self.port_lists.is_empty() {
            PortMode::Raw
        } else {
            PortMode::Unbound
        }
    }

    pub fn attach_port(&mut self, backend: BackendId, id: HandlerId) -> GatewayResult<()> {
        if self.port_lists.iter().any(|(b, _)| *b == backend) {
            return Err(GatewayError::UriAlreadyRegistered(format!(":{}", self.port), backend));
        }
        self.port_lists.push((backend, id));
        Ok(())
    }

    pub fn attach_subport(&mut self, subport: u32, backend: BackendId, id: HandlerId) -> GatewayResult<()> {
        match self.subports.iter_mut().find(|(s, _)| *s == subport) {
            Some((_, lists)) => {
                if lists.iter().any(|(b, _)| *b == backend) {
                    return Err(GatewayError::UriAlreadyRegistered(
                        format!(":{}/{}", self.port, subport),
                        backend,
                    ));
                }
                lists.push((backend, id));
            }
            None => self.subports.push((subport, vec![(backend, id)])),
        }
        Ok(())
    }

    pub fn attach_uri(
        &mut self,
        method: Option<Method>,
        uri: &str,
        backend: BackendId,
        id: HandlerId,
    ) -> GatewayResult<()> {
        self.uris.attach(method, uri, backend, id)
    }

    pub fn add_alias(&mut self, alias: UriAlias) {
        self.aliases.retain(|a| !(a.method == alias.method && a.from == alias.from));
        self.aliases.push(alias);
    }

    pub fn detach(&mut self, id: HandlerId) -> bool {
        let before = self.port_lists.len() + self.subports.iter().map(|(_, l)| l.len()).sum::<usize>();
        self.port_lists.retain(|(_, list)| *list != id);
        for (_, lists) in self.subports.iter_mut() {
            lists.retain(|(_, list)| *list != id);
        }
        self.subports.retain(|(_, lists)| !lists.is_empty());
        let after = self.port_lists.len() + self.subports.iter().map(|(_, l)| l.len()).sum::<usize>();
        self.uris.detach(id) || before != after
    }

    pub fn detach_backend(&mut self, backend: BackendId) -> Vec<HandlerId> {
        let mut removed: Vec<HandlerId> = self
            .port_lists
            .iter()
            .filter(|(b, _)| *b == backend)
            .map(|(_, id)| *id)
            .collect();
        self.port_lists.retain(|(b, _)| *b != backend);
        for (_, lists) in self.subports.iter_mut() {
            removed.extend(lists.iter().filter(|(b, _)| *b == backend).map(|(_, id)| *id));
            lists.retain(|(b, _)| *b != backend);
        }
        self.subports.retain(|(_, lists)| !lists.is_empty());
        removed.extend(self.uris.detach_backend(backend));
        removed
    }

    #[inline(always)]
    pub fn port_lists(&self) -> &[(BackendId, HandlerId)] {
        &self.port_lists
    }

    pub fn subport_lists(&self, subport: u32) -> Option<&[(BackendId, HandlerId)]> {
        self.subports
            .iter()
            .find(|(s, _)| *s == subport)
            .map(|(_, lists)| lists.as_slice())
    }

    /// Applies aliases, then the longest-prefix lookup.
    pub fn resolve_uri(&self, method: Method, uri: &[u8]) -> Option<UriMatch<'_>> {
        let target = self
            .aliases
            .iter()
            .find(|a| a.method == method && a.from.as_bytes() == uri)
            .map_or(uri, |a| a.to.as_bytes());
        self.uris.resolve(method, target)
    }

    pub fn socket_opened(&self, worker: u8) {
        self.active_sockets[worker as usize].fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self, worker: u8) {
        let _ = self.active_sockets[worker as usize].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    pub fn active_sockets(&self, worker: u8) -> usize {
        self.active_sockets[worker as usize].load(Ordering::Relaxed)
    }

    pub fn total_active_sockets(&self) -> usize {
        self.active_sockets.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Worker among the first `workers` with the fewest sockets on this port.
    pub fn least_busy_worker(&self, workers: usize) -> u8 {
        (0..workers.clamp(1, MAX_WORKER_THREADS))
            .min_by_key(|w| self.active_sockets[*w].load(Ordering::Relaxed))
            .unwrap_or(0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_registrations() {
        let mut port = ServerPort::new(8080, false, false);
        assert_eq!(port.mode(), PortMode::Unbound);
        port.attach_port(1, HandlerId::from_u32(1)).unwrap();
        assert_eq!(port.mode(), PortMode::Raw);
        port.attach_subport(7, 1, HandlerId::from_u32(2)).unwrap();
        assert_eq!(port.mode(), PortMode::SubPorts);
        port.attach_uri(Some(Method::Get), "/", 1, HandlerId::from_u32(3)).unwrap();
        assert_eq!(port.mode(), PortMode::Http);
        let removed = port.detach_backend(1);
        assert_eq!(removed.len(), 3);
        assert_eq!(port.mode(), PortMode::Unbound);
    }

    #[test]
    fn alias_rewrites_exact_uri() {
        let mut port = ServerPort::new(80, false, false);
        port.attach_uri(Some(Method::Get), "/index.html", 1, HandlerId::from_u32(1)).unwrap();
        port.add_alias(UriAlias {
            method: Method::Get,
            from: "/".to_string(),
            to: "/index.html".to_string(),
        });
        assert_eq!(port.resolve_uri(Method::Get, b"/").unwrap().uri, "/index.html");
        assert!(port.resolve_uri(Method::Get, b"/other").is_none());
    }

    #[test]
    fn least_busy_worker_balances() {
        let port = ServerPort::new(80, false, false);
        port.socket_opened(0);
        port.socket_opened(0);
        port.socket_opened(1);
        assert_eq!(port.least_busy_worker(3), 2);
        assert_eq!(port.least_busy_worker(2), 1);
        port.socket_closed(0);
        port.socket_closed(0);
        assert_eq!(port.least_busy_worker(2), 0);
        assert_eq!(port.accepted(), 3);
    }
}
