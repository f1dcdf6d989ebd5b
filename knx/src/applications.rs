//! Reusable pieces for scenarios and tooling.

mod bus_monitor;
pub use bus_monitor::{describe_frame, BusMonitor};

mod management_server;
pub use management_server::{DeviceConfig, ManagementServer};
