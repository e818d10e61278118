use std::collections::VecDeque;

use crate::error::{PoolError, PoolResult};
use crate::pool::WorkerPoolOptions;

pub trait PortProbe: Send + 'static {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes a port by binding a local TCP listener. A port that was handed to
/// a worker which then crashed may linger in TIME_WAIT; the probe keeps such
/// ports out of circulation until the OS releases them.
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Hands out the gRPC ports that workers listen on. When no port range is
/// configured, workers choose their own ports and the allocator degenerates
/// to the sentinel value zero.
pub struct PortAllocator {
    free_ports: Option<VecDeque<u16>>,
    probe: Box<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(options: &WorkerPoolOptions, probe: Box<dyn PortProbe>) -> Self {
        let free_ports = if !options.worker_ports.is_empty() {
            Some(options.worker_ports.iter().copied().collect())
        } else if options.min_worker_port != 0 {
            let max_worker_port = if options.max_worker_port == 0 {
                u16::MAX
            } else {
                options.max_worker_port
            };
            Some((options.min_worker_port..=max_worker_port).collect())
        } else {
            None
        };
        Self { free_ports, probe }
    }

    /// Pop the first free port, rotating ports that fail the probe to the
    /// back of the queue. Each call tries at most the current queue length.
    /// Returns 0 when no port range is configured.
    pub fn next_free(&mut self) -> PoolResult<u16> {
        let Some(free_ports) = self.free_ports.as_mut() else {
            return Ok(0);
        };
        for _ in 0..free_ports.len() {
            let Some(port) = free_ports.pop_front() else {
                break;
            };
            if self.probe.is_free(port) {
                return Ok(port);
            }
            free_ports.push_back(port);
        }
        Err(PoolError::OutOfPorts)
    }

    pub fn release(&mut self, port: u16) {
        if let Some(free_ports) = self.free_ports.as_mut() {
            if port != 0 {
                free_ports.push_back(port);
            }
        }
    }
}
