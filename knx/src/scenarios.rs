//! End-to-end scenarios wiring client stacks and devices onto a shared
//! in-memory bus. The integration tests run each one; they double as
//! executable documentation of the stack's behaviour.

mod support;

mod transport_basics;
pub use transport_basics::{
    connect_roundtrip, duplicate_data_filter, group_and_broadcast_passthrough, idle_timeout,
    keep_alive_connection, nack_then_ack, retransmit_exhaust,
};

mod management_services;
pub use management_services::{
    adc_and_authorization, concurrent_requests_queue, device_descriptor, master_reset,
    network_parameter, property_denied, property_description, property_read, property_scan,
    read_single_programming_device, restart_basic,
};

mod scans;
pub use scans::{address_occupancy, scan_devices, scan_routers, scan_serials};

mod addressing;
pub use addressing::{
    assign_address, domain_addressing, occupied_address_not_reassigned,
    programming_mode_memory_fallback, programming_mode_property, reset_address,
    serial_number_addressing,
};

mod memory;
pub use memory::{
    chunked_memory_roundtrip, memory_requires_connection, verify_by_server, verify_mode_write,
    verify_write,
};

mod lifecycle;
pub use lifecycle::{destroy_aborts_send, detach_is_terminal, link_close_detaches};
