//! State manager for MoCA (coax networking) interfaces.
//!
//! This crate sits between a chipset driver and management consumers
//! (TR-181 style agents, CLIs, telemetry exporters):
//!
//! - **[`Controller`]**: entry point for the whole platform. Lazily opens one
//!   [`InterfaceManager`] per interface index, routes the driver's device
//!   events to them in arrival order, and refreshes topology periodically.
//!
//! - **[`InterfaceManager`]**: façade for one interface. Validated
//!   configuration get/set, link status and counters, plus the three
//!   stateful components below.
//!
//! - **[`TopologyCache`]**: associated-device table built on `DashMap` and
//!   `tokio::sync::watch`. Every entry carries the gateway sequence number
//!   of its last writer, so refresh listings and events merge by gateway
//!   order. Subscribers get whole snapshots through [`DeviceStream`].
//!
//! - **[`AcaController`]**: single-flight Automated Channel Assessment.
//!   One session at a time; state and result change together and are read
//!   as one consistent [`AcaStatus`].
//!
//! - **[`EventDispatcher`]**: applies activation events to the cache, then
//!   fans them out to [`DeviceObserver`]s under a per-call timeout.
//!
//! - **[`DriverGateway`]**: the async trait a driver binding implements.
//!   [`sim::SimGateway`] is an in-memory implementation for tests and
//!   benches.

pub mod aca;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod model;
pub mod sim;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use aca::AcaController;
pub use config::{ChannelRange, ControllerConfig};
pub use controller::{Controller, ControllerState};
pub use dispatch::{DeviceObserver, DispatchOutcome, EventDispatcher, ObserverError, ObserverId};
pub use error::{CoreError, InvalidArgument};
pub use gateway::{DeviceEventSink, DriverError, DriverGateway};
pub use manager::InterfaceManager;
pub use store::{ListingOutcome, TopologyCache};
pub use stream::{DeviceFilter, DeviceStream, DeviceWatchStream};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Channel assessment
    AcaConfig,
    AcaFailure,
    AcaProgress,
    AcaReport,
    AcaState,
    AcaStatus,
    // Interface
    AggregateCounters,
    // Topology
    AssociatedDevice,
    DeviceEvent,
    DeviceListing,
    DynamicInfo,
    FlowEntry,
    // Identity
    IfIndex,
    InterfaceConfig,
    InterfaceStats,
    LinkStatus,
    MacAddress,
    MacCounters,
    MeshRate,
    NodeId,
    PowerProfile,
    ProbeType,
    Profile,
    ScModKey,
    ScModStats,
    StaticInfo,
    SubcarrierProfile,
};
