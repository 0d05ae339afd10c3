// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Path discovery from traceroutes.
//!
//! Hop IPs are resolved to ports through [`IpResolver`] (built from the
//! `ipports` collection and optional Junos router configuration). A pair of
//! opposite traceroutes is fused by [`fuse`] into one outbound and one
//! inbound [`PathPlan`]; the [`PathFusion`] service writes those plans as
//! `links` and `paths` records.
#![forbid(unsafe_code)]

mod error;
mod fusion;
mod junos;
mod resolver;
mod service;

pub use error::PathError;
pub use fusion::{fuse, Direction, LinkKey, PathPlan, PortRef, Traceroute, Usage};
pub use junos::{parse_router_config, ConfigParseError, InterfaceAddress};
pub use resolver::{Endpoint, IpResolver};
pub use service::{FusedPaths, PathFusion, HOPIP_EVENT_SUFFIX};
