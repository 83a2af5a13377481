// SPDX-License-Identifier: GPL-3.0-only

//! Port/connection graph
//!
//! Tracks what each port carries. A port is bound to at most one thing:
//! a software buffer pool or a hardware connection.

use crate::backends::HardwareBackend;
use crate::backends::types::{ComponentId, ConnectionFlags, ConnectionId, PoolId, PortId};
use crate::errors::SetupError;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What a port is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortBinding {
    Pool(PoolId),
    Connection(ConnectionId),
}

/// A directed output → input edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub output: PortId,
    pub input: PortId,
    pub flags: ConnectionFlags,
}

/// Flags used for every camera edge
pub fn tunnel_flags() -> ConnectionFlags {
    ConnectionFlags::TUNNELLING | ConnectionFlags::ALLOCATION_ON_INPUT
}

#[derive(Debug, Default)]
pub struct ConnectionGraph {
    /// Live connections in creation order
    connections: Vec<Connection>,
    bindings: HashMap<PortId, PortBinding>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_unbound(&self, port: PortId) -> Result<(), SetupError> {
        if self.bindings.contains_key(&port) {
            return Err(SetupError::PortBound(port));
        }
        Ok(())
    }

    /// Create and enable a connection
    ///
    /// If enabling fails the connection is destroyed again and the error
    /// returned.
    pub fn connect(
        &mut self,
        backend: &dyn HardwareBackend,
        output: PortId,
        input: PortId,
        flags: ConnectionFlags,
    ) -> Result<ConnectionId, SetupError> {
        self.ensure_unbound(output)?;
        self.ensure_unbound(input)?;

        let connection_error = |source| SetupError::Connection {
            output,
            input,
            source,
        };

        let id = backend
            .create_connection(output, input, flags)
            .map_err(connection_error)?;

        if let Err(e) = backend.enable_connection(id) {
            if let Err(destroy_err) = backend.destroy_connection(id) {
                warn!(%id, error = %destroy_err, "Failed to destroy connection after enable failure");
            }
            return Err(connection_error(e));
        }

        self.connections.push(Connection {
            id,
            output,
            input,
            flags,
        });
        self.bindings.insert(output, PortBinding::Connection(id));
        self.bindings.insert(input, PortBinding::Connection(id));

        info!(%id, %output, %input, "Connected ports");
        Ok(id)
    }

    /// Disable and destroy a connection
    pub fn disconnect(
        &mut self,
        backend: &dyn HardwareBackend,
        id: ConnectionId,
    ) -> Result<(), SetupError> {
        let Some(index) = self.connections.iter().position(|c| c.id == id) else {
            return Err(SetupError::Backend(
                crate::backends::types::BackendError::InvalidConnection(id),
            ));
        };

        if let Err(e) = backend.disable_connection(id) {
            warn!(%id, error = %e, "Failed to disable connection");
        }
        backend.destroy_connection(id)?;

        let connection = self.connections.remove(index);
        self.bindings.remove(&connection.output);
        self.bindings.remove(&connection.input);
        debug!(%id, "Disconnected ports");
        Ok(())
    }

    /// Record that `port` is fed from a software pool
    pub fn bind_pool(&mut self, port: PortId, pool: PoolId) -> Result<(), SetupError> {
        self.ensure_unbound(port)?;
        self.bindings.insert(port, PortBinding::Pool(pool));
        Ok(())
    }

    pub fn unbind_pool(&mut self, port: PortId) {
        if let Some(PortBinding::Pool(_)) = self.bindings.get(&port) {
            self.bindings.remove(&port);
        }
    }

    pub fn binding(&self, port: PortId) -> Option<PortBinding> {
        self.bindings.get(&port).copied()
    }

    /// Whether any port of `component` carries a pool or a connection
    pub fn is_component_bound(&self, component: ComponentId) -> bool {
        self.bindings.keys().any(|p| p.component == component)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Disconnect everything, newest first
    ///
    /// Keeps going after a failure and reports the first error.
    pub fn teardown(&mut self, backend: &dyn HardwareBackend) -> Result<(), SetupError> {
        let mut first_error = None;
        while let Some(connection) = self.connections.last().copied() {
            if let Err(e) = self.disconnect(backend, connection.id) {
                warn!(id = %connection.id, error = %e, "Failed to tear down connection");
                // Forget it so teardown can make progress
                self.connections.pop();
                self.bindings.remove(&connection.output);
                self.bindings.remove(&connection.input);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
