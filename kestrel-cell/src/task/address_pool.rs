//! Address-pool change handler.
//!
//! The cluster may repartition guest addresses while reservations are
//! live; the network module revalidates every reservation and each guest
//! whose address no longer fits is surfaced as a reconfigure event.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tracing::{info, warn};

use crate::network::{AddressPool, AddressRange};
use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::CellModules;
use crate::transaction::Executor;

pub struct HandleAddressPoolChangedExecutor {
    modules: CellModules,
}

impl HandleAddressPoolChangedExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }

    /// Ranges arrive as `start-end` strings.
    fn parse_ranges(raw: &[String]) -> Result<Vec<AddressRange>> {
        raw.iter()
            .map(|entry| {
                let (start, end) = entry.split_once('-').ok_or_else(|| {
                    CellError::InvalidInput(format!("invalid address range '{entry}'"))
                })?;
                let start: Ipv4Addr = start.trim().parse().map_err(|_| {
                    CellError::InvalidInput(format!("invalid range start '{start}'"))
                })?;
                let end: Ipv4Addr = end.trim().parse().map_err(|_| {
                    CellError::InvalidInput(format!("invalid range end '{end}'"))
                })?;
                if u32::from(start) > u32::from(end) {
                    return Err(CellError::InvalidInput(format!(
                        "descending address range '{entry}'"
                    )));
                }
                Ok(AddressRange { start, end })
            })
            .collect()
    }
}

#[async_trait]
impl Executor for HandleAddressPoolChangedExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let ranges = Self::parse_ranges(&request.get_string_array(ParamKey::Address)?)?;
        let mode = request.get_string(ParamKey::Mode).unwrap_or_default();

        let invalidated = self
            .modules
            .network
            .change_address_pool(AddressPool { ranges, mode })
            .await?;
        info!(
            session = format_args!("{session:08X}"),
            invalidated = invalidated.len(),
            "address pool changed"
        );

        for guest in invalidated {
            let mut event = Message::event(MessageKind::GuestReconfigureEvent, session);
            event.set_string(ParamKey::Instance, guest.to_string());
            if let Err(err) = self.modules.sender.send(event, &request.sender) {
                warn!(session = format_args!("{session:08X}"), guest = %guest, error = %err, "notify reconfigure failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_parse_from_dashed_pairs() {
        let ranges = HandleAddressPoolChangedExecutor::parse_ranges(&[
            "10.0.0.10-10.0.0.20".to_string(),
            "172.16.0.1 - 172.16.0.9".to_string(),
        ])
        .unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(ranges[1].end, Ipv4Addr::new(172, 16, 0, 9));
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(HandleAddressPoolChangedExecutor::parse_ranges(&["10.0.0.1".to_string()]).is_err());
        assert!(HandleAddressPoolChangedExecutor::parse_ranges(&[
            "10.0.0.20-10.0.0.10".to_string()
        ])
        .is_err());
    }
}
