//! Network link collaborator.
//!
//! On the device this is the radio association; the hand-off only needs to
//! start it, ask whether it is up, and tear it down.

use crate::error::LinkError;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub trait Link: Send {
    /// Begin bringing the link up. Returns immediately.
    fn begin(&mut self) -> Result<(), LinkError>;

    /// Non-blocking (or briefly bounded) check that the link carries traffic
    fn is_up(&mut self) -> bool;

    fn shutdown(&mut self);
}

/// Treats the link as up once the broker endpoint accepts a TCP connection.
pub struct ReachabilityLink {
    host: String,
    port: u16,
    check_timeout: Duration,
    up: bool,
}

impl ReachabilityLink {
    pub fn new(host: impl Into<String>, port: u16, check_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            check_timeout,
            up: false,
        }
    }
}

impl Link for ReachabilityLink {
    fn begin(&mut self) -> Result<(), LinkError> {
        if self.host.is_empty() {
            return Err(LinkError::Driver("no endpoint configured".into()));
        }
        log::info!("Bringing up link towards {}:{}", self.host, self.port);
        self.up = false;
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        if self.up {
            return true;
        }

        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("Resolving {} failed: {}", self.host, e);
                return false;
            }
        };

        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.check_timeout).is_ok() {
                log::info!("Link up ({} reachable)", addr);
                self.up = true;
                return true;
            }
        }
        false
    }

    fn shutdown(&mut self) {
        if self.up {
            log::info!("Link released");
        }
        self.up = false;
    }
}
