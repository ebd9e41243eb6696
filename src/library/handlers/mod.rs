//! Handler lists and the table that owns them.
//!
//! A handler list is what a backend (or the gateway itself) attaches to a
//! port, a sub-port or a URI. Lists live in a fixed-capacity
//! [`HandlersTable`] and are referenced everywhere else by [`HandlerId`].

pub mod builtin;
mod context;
pub mod port;
pub mod registry;
pub mod uri;

pub use context::{Action, HandlerContext, MessageView};

use crate::library::{
    error::{GatewayError, GatewayResult},
    protocol::http::Method,
};
use std::{fmt, sync::Arc};
use tracing::debug;

pub type BackendId = u8;

/// Owner id used for handlers the gateway serves itself.
pub const GATEWAY_BACKEND: BackendId = u8::MAX;

pub const MAX_HANDLER_LISTS: usize = 512;
pub const MAX_HANDLERS_IN_LIST: usize = 16;

/// Slot plus generation, so an id kept after `unregister` never reaches
/// whatever reuses the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    slot: u16,
    generation: u16,
}

impl HandlerId {
    #[inline(always)]
    pub fn slot(&self) -> u16 {
        self.slot
    }

    #[inline(always)]
    pub fn to_u32(self) -> u32 {
        ((self.generation as u32) << 16) | self.slot as u32
    }

    #[inline(always)]
    pub fn from_u32(raw: u32) -> HandlerId {
        HandlerId {
            slot: raw as u16,
            generation: (raw >> 16) as u16,
        }
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}@{}", self.slot, self.generation)
    }
}

/// Callback contract: `Ok(true)` handled, `Ok(false)` try the next one,
/// `Err` drops the connection.
pub trait Handler: Send + Sync {
    fn run(&self, ctx: &mut HandlerContext<'_>, id: HandlerId) -> GatewayResult<bool>;
}

impl<F> Handler for F
where
    F: Fn(&mut HandlerContext<'_>, HandlerId) -> GatewayResult<bool> + Send + Sync,
{
    fn run(&self, ctx: &mut HandlerContext<'_>, id: HandlerId) -> GatewayResult<bool> {
        self(ctx, id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    Port,
    SubPort(u32),
    /// `None` method matches any method.
    Uri { method: Option<Method>, uri: String },
}

pub struct HandlersList {
    kind: HandlerKind,
    port: u16,
    backend: BackendId,
    app_name: String,
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlersList {
    #[inline(always)]
    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }
    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }
    #[inline(always)]
    pub fn backend(&self) -> BackendId {
        self.backend
    }
    #[inline(always)]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }
    #[inline(always)]
    pub fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn Handler>) -> GatewayResult<()> {
        if self.handlers.len() >= MAX_HANDLERS_IN_LIST {
            return Err(GatewayError::HandlerTableFull);
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Runs handlers in order until one reports handled or fails.
    pub fn run(&self, ctx: &mut HandlerContext<'_>, id: HandlerId) -> GatewayResult<bool> {
        for handler in &self.handlers {
            if handler.run(ctx, id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct Slot {
    generation: u16,
    list: Option<HandlersList>,
}

pub struct HandlersTable {
    slots: Vec<Slot>,
    capacity: usize,
}

impl Default for HandlersTable {
    fn default() -> Self {
        HandlersTable::with_capacity(MAX_HANDLER_LISTS)
    }
}

impl HandlersTable {
    pub fn with_capacity(capacity: usize) -> HandlersTable {
        HandlersTable {
            slots: Vec::new(),
            capacity: capacity.min(u16::MAX as usize),
        }
    }

    pub fn register(
        &mut self,
        kind: HandlerKind,
        port: u16,
        backend: BackendId,
        app_name: &str,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<HandlerId> {
        let list = HandlersList {
            kind,
            port,
            backend,
            app_name: app_name.to_string(),
            handlers: vec![handler],
        };
        let slot = match self.slots.iter().position(|s| s.list.is_none()) {
            Some(slot) => slot,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    list: None,
                });
                self.slots.len() - 1
            }
            None => return Err(GatewayError::HandlerTableFull),
        };
        let entry = &mut self.slots[slot];
        entry.list = Some(list);
        let id = HandlerId {
            slot: slot as u16,
            generation: entry.generation,
        };
        debug!("Registered {:?} for backend {} on port {}", id, backend, port);
        Ok(id)
    }

    pub fn get(&self, id: HandlerId) -> Option<&HandlersList> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.list.as_ref()
    }

    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut HandlersList> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.list.as_mut()
    }

    /// Frees the slot; a later `register` may reuse it under a new generation.
    pub fn unregister(&mut self, id: HandlerId) -> GatewayResult<HandlersList> {
        let slot = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(GatewayError::HandlerNotFound(id.to_u32()))?;
        let list = slot.list.take().ok_or(GatewayError::HandlerNotFound(id.to_u32()))?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(list)
    }

    pub fn ids_for_backend(&self, backend: BackendId) -> Vec<HandlerId> {
        self.iter()
            .filter(|(_, list)| list.backend == backend)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandlerId, &HandlersList)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.list.as_ref().map(|list| {
                (
                    HandlerId {
                        slot: i as u16,
                        generation: slot.generation,
                    },
                    list,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
