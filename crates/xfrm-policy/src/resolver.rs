//! Template resolution
//!
//! Templates are resolved strictly in order. Each resolved association's
//! endpoints become the outer endpoints for the next template, which is how
//! nested tunnels are expressed.

use std::net::IpAddr;
use std::sync::Arc;

use xfrm_common::{FlowDescriptor, ResolveError};

use crate::state::{StateLookup, StateStore, XfrmState};
use crate::template::{Mode, Template};

/// Resolve `templates` for `flow` starting from `peer` (remote, local).
///
/// Optional templates without a usable association are skipped. On failure
/// every association resolved so far is dropped before returning.
pub fn resolve(
    states: &dyn StateStore,
    templates: &[Template],
    flow: &FlowDescriptor,
    peer: (IpAddr, IpAddr),
) -> Result<Vec<Arc<XfrmState>>, ResolveError> {
    let (mut daddr, mut saddr) = peer;
    let mut resolved = Vec::with_capacity(templates.len());

    for template in templates {
        let (remote, local) = match template.mode {
            Mode::Tunnel => (
                template.daddr.unwrap_or(daddr),
                template.saddr.unwrap_or(saddr),
            ),
            Mode::Transport => (daddr, saddr),
        };

        match states.find_instance(remote, local, flow, template) {
            StateLookup::Valid(state) => {
                tracing::trace!(spi = state.id.spi, proto = template.proto, "template resolved");
                resolved.push(state);
                daddr = remote;
                saddr = local;
            }
            StateLookup::Pending(_) if !template.optional => return Err(ResolveError::Pending),
            StateLookup::Absent if !template.optional => return Err(ResolveError::NoMatch),
            StateLookup::Pending(_) | StateLookup::Absent => {
                tracing::trace!(proto = template.proto, "optional template skipped");
            }
        }
    }

    Ok(resolved)
}
