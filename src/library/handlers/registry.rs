use crate::library::{
    error::{GatewayError, GatewayResult},
    handlers::{
        BackendId, Handler, HandlerId, HandlerKind, HandlersList, HandlersTable,
        port::{ServerPort, UriAlias},
    },
    protocol::http::Method,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Ports plus the handler lists attached to them.
pub struct Registry {
    table: HandlersTable,
    ports: Vec<ServerPort>,
    case_insensitive: bool,
    strict_boundaries: bool,
}

impl Registry {
    pub fn new(case_insensitive: bool, strict_boundaries: bool) -> Registry {
        Registry {
            table: HandlersTable::default(),
            ports: Vec::new(),
            case_insensitive,
            strict_boundaries,
        }
    }

    #[inline(always)]
    pub fn table(&self) -> &HandlersTable {
        &self.table
    }

    #[inline(always)]
    pub fn ports(&self) -> &[ServerPort] {
        &self.ports
    }

    pub fn port(&self, port: u16) -> Option<&ServerPort> {
        self.ports.iter().find(|p| p.port() == port)
    }

    fn port_mut(&mut self, port: u16) -> &mut ServerPort {
        let at = match self.ports.iter().position(|p| p.port() == port) {
            Some(at) => at,
            None => {
                self.ports
                    .push(ServerPort::new(port, self.case_insensitive, self.strict_boundaries));
                self.ports.len() - 1
            }
        };
        &mut self.ports[at]
    }

    pub fn add_port(&mut self, port: u16) {
        self.port_mut(port);
    }

    pub fn add_alias(&mut self, port: u16, alias: UriAlias) {
        self.port_mut(port).add_alias(alias);
    }

    fn register(
        &mut self,
        kind: HandlerKind,
        port: u16,
        backend: BackendId,
        app_name: &str,
        handler: Arc<dyn Handler>,
        attach: impl FnOnce(&mut ServerPort, HandlerId) -> GatewayResult<()>,
    ) -> GatewayResult<HandlerId> {
        let id = self.table.register(kind, port, backend, app_name, handler)?;
        if let Err(err) = attach(self.port_mut(port), id) {
            let _ = self.table.unregister(id);
            return Err(err);
        }
        Ok(id)
    }

    pub fn register_port_handler(
        &mut self,
        port: u16,
        backend: BackendId,
        app_name: &str,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<HandlerId> {
        self.register(HandlerKind::Port, port, backend, app_name, handler, |p, id| {
            p.attach_port(backend, id)
        })
    }

    pub fn register_subport_handler(
        &mut self,
        port: u16,
        subport: u32,
        backend: BackendId,
        app_name: &str,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<HandlerId> {
        self.register(HandlerKind::SubPort(subport), port, backend, app_name, handler, |p, id| {
            p.attach_subport(subport, backend, id)
        })
    }

    /// `method == None` registers the URI for every method.
    pub fn register_uri_handler(
        &mut self,
        port: u16,
        method: Option<Method>,
        uri: &str,
        backend: BackendId,
        app_name: &str,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<HandlerId> {
        let kind = HandlerKind::Uri {
            method,
            uri: uri.to_string(),
        };
        let id = self.register(kind, port, backend, app_name, handler, |p, id| {
            p.attach_uri(method, uri, backend, id)
        })?;
        debug!("URI {:?} {} on port {} -> {:?} (backend {})", method, uri, port, id, backend);
        Ok(id)
    }

    /// Adds another handler to an existing list.
    pub fn add_handler(&mut self, id: HandlerId, handler: Arc<dyn Handler>) -> GatewayResult<()> {
        self.table
            .get_mut(id)
            .ok_or(GatewayError::HandlerNotFound(id.to_u32()))?
            .add_handler(handler)
    }

    pub fn unregister(&mut self, id: HandlerId) -> GatewayResult<()> {
        let list: HandlersList = self.table.unregister(id)?;
        if let Some(port) = self.ports.iter_mut().find(|p| p.port() == list.port()) {
            port.detach(id);
        }
        Ok(())
    }

    /// Removes every list `backend` owns. Returns how many went away.
    pub fn unregister_backend(&mut self, backend: BackendId) -> usize {
        let mut removed = 0;
        for port in self.ports.iter_mut() {
            for id in port.detach_backend(backend) {
                if self.table.unregister(id).is_ok() {
                    removed += 1;
                }
            }
        }
        // Lists registered but never attached to a port.
        for id in self.table.ids_for_backend(backend) {
            if self.table.unregister(id).is_ok() {
                removed += 1;
            }
        }
        info!("Unregistered {} handler lists of backend {}", removed, backend);
        removed
    }

    #[inline(always)]
    pub fn list(&self, id: HandlerId) -> Option<&HandlersList> {
        self.table.get(id)
    }
}
