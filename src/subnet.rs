//! Private subnet allocation for the isolated container network.
//!
//! Candidate `/16` ranges are probed in ascending order by creating a
//! throwaway network with that subnet. The runtime refuses overlapping
//! ranges, so the first successful creation identifies a free block. The
//! probe network is removed straight away. Another process could claim the
//! range between the probe and the real deployment; that window is accepted
//! since allocation runs once per deploy under operator control.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::NetworkSettings;
use crate::error::{HubError, HubResult};
use crate::runtime::ContainerRuntime;

/// An allocated `/16` block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    first_octet: u8,
    octet: u8,
}

impl Subnet {
    pub fn new(first_octet: u8, octet: u8) -> Self {
        Self { first_octet, octet }
    }

    /// Second octet, from which the deployment's static addresses derive
    pub fn octet(&self) -> u8 {
        self.octet
    }

    pub fn cidr(&self) -> String {
        format!("{}.{}.0.0/16", self.first_octet, self.octet)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.first_octet, self.octet, 0, 0)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.host(1)
    }

    /// Static address `<first>.<octet>.0.<n>`
    pub fn host(&self, n: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.first_octet, self.octet, 0, n)
    }
}

/// Finds an unused private `/16`
pub struct SubnetAllocator {
    runtime: Arc<dyn ContainerRuntime>,
    first_octet: u8,
    candidates: Vec<u8>,
    probe_prefix: String,
}

impl SubnetAllocator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: &NetworkSettings, probe_prefix: &str) -> Self {
        Self {
            runtime,
            first_octet: settings.first_octet,
            candidates: (settings.second_octet_min..=settings.second_octet_max).collect(),
            probe_prefix: probe_prefix.to_string(),
        }
    }

    /// Candidate second octets, in probe order
    pub fn candidates(&self) -> &[u8] {
        &self.candidates
    }

    /// Probe candidates in order and return the first free block.
    ///
    /// Exhausting the candidates is fatal (`HubError::SubnetExhausted`).
    pub async fn allocate(&self) -> HubResult<Subnet> {
        for &octet in &self.candidates {
            let subnet = Subnet::new(self.first_octet, octet);
            let probe = format!("{}probe-{}", self.probe_prefix, uuid::Uuid::new_v4().simple());

            match self.runtime.create_network(&probe, &subnet.cidr()).await {
                Ok(()) => {
                    if let Err(e) = self.runtime.remove_network(&probe).await {
                        warn!("Failed to remove probe network {}: {}", probe, e);
                    }
                    info!("Allocated subnet {}", subnet.cidr());
                    return Ok(subnet);
                }
                Err(e) => {
                    debug!("Subnet {} unavailable: {}", subnet.cidr(), e);
                }
            }
        }

        Err(HubError::SubnetExhausted {
            probed: self.candidates.len(),
        })
    }
}
