use std::{collections::HashSet, io::ErrorKind, ops::RangeInclusive, sync::Arc};

use tokio::net::TcpListener;

use crate::error::ConsoleError;
use crate::process_table::{ProcessTable, find_console_processes};
use crate::session_store::SessionStore;
use crate::signature::ConsoleSignature;

/// Picks console ports from a fixed range.
///
/// A port is handed out only if no console process is listening on it, no
/// active session record claims it, and a bind test on it succeeds.
#[derive(Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    bind_address: String,
    table: Arc<dyn ProcessTable>,
    signature: ConsoleSignature,
    store: SessionStore,
}

async fn bind_test(bind_address: &str, port: u16) -> bool {
    match TcpListener::bind((bind_address, port)).await {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(err) => {
            tracing::debug!(%err, port, "console port bind test failed");
            false
        }
    }
}

impl PortAllocator {
    pub fn new(
        range: RangeInclusive<u16>,
        bind_address: impl Into<String>,
        table: Arc<dyn ProcessTable>,
        signature: ConsoleSignature,
        store: SessionStore,
    ) -> Self {
        Self {
            range,
            bind_address: bind_address.into(),
            table,
            signature,
            store,
        }
    }

    async fn process_ports(&self) -> HashSet<u16> {
        match find_console_processes(self.table.as_ref(), &self.signature).await {
            Ok(found) => found.into_iter().map(|m| m.port).collect(),
            Err(err) => {
                tracing::warn!(%err, "process listing failed; allocating without it");
                HashSet::new()
            }
        }
    }

    pub async fn find_available_port(&self) -> Result<u16, ConsoleError> {
        let by_process = self.process_ports().await;
        let by_record = self.store.active_ports().await?;

        for port in self.range.clone() {
            if by_process.contains(&port) || by_record.contains(&port) {
                continue;
            }
            if bind_test(&self.bind_address, port).await {
                return Ok(port);
            }
        }

        Err(ConsoleError::PortExhausted {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }
}
