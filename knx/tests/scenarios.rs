//! Runs every scenario. Virtual time (`start_paused`) makes the protocol
//! timers (3 s acknowledgement, 6 s idle disconnect, scan pacing) fire
//! instantly and deterministically.

#[tokio::test(start_paused = true)]
async fn connect_roundtrip() {
    knx::scenarios::connect_roundtrip().await
}

#[tokio::test(start_paused = true)]
async fn nack_then_ack() {
    knx::scenarios::nack_then_ack().await
}

#[tokio::test(start_paused = true)]
async fn duplicate_data_filter() {
    knx::scenarios::duplicate_data_filter().await
}

#[tokio::test(start_paused = true)]
async fn retransmit_exhaust() {
    knx::scenarios::retransmit_exhaust().await
}

#[tokio::test(start_paused = true)]
async fn idle_timeout() {
    knx::scenarios::idle_timeout().await
}

#[tokio::test(start_paused = true)]
async fn keep_alive_connection() {
    knx::scenarios::keep_alive_connection().await
}

#[tokio::test(start_paused = true)]
async fn group_and_broadcast_passthrough() {
    knx::scenarios::group_and_broadcast_passthrough().await
}

#[tokio::test(start_paused = true)]
async fn property_read() {
    knx::scenarios::property_read().await
}

#[tokio::test(start_paused = true)]
async fn property_denied() {
    knx::scenarios::property_denied().await
}

#[tokio::test(start_paused = true)]
async fn property_description() {
    knx::scenarios::property_description().await
}

#[tokio::test(start_paused = true)]
async fn property_scan() {
    knx::scenarios::property_scan().await
}

#[tokio::test(start_paused = true)]
async fn read_single_programming_device() {
    knx::scenarios::read_single_programming_device().await
}

#[tokio::test(start_paused = true)]
async fn device_descriptor() {
    knx::scenarios::device_descriptor().await
}

#[tokio::test(start_paused = true)]
async fn adc_and_authorization() {
    knx::scenarios::adc_and_authorization().await
}

#[tokio::test(start_paused = true)]
async fn restart_basic() {
    knx::scenarios::restart_basic().await
}

#[tokio::test(start_paused = true)]
async fn master_reset() {
    knx::scenarios::master_reset().await
}

#[tokio::test(start_paused = true)]
async fn network_parameter() {
    knx::scenarios::network_parameter().await
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_queue() {
    knx::scenarios::concurrent_requests_queue().await
}

#[tokio::test(start_paused = true)]
async fn scan_routers() {
    knx::scenarios::scan_routers().await
}

#[tokio::test(start_paused = true)]
async fn scan_devices() {
    knx::scenarios::scan_devices().await
}

#[tokio::test(start_paused = true)]
async fn scan_serials() {
    knx::scenarios::scan_serials().await
}

#[tokio::test(start_paused = true)]
async fn address_occupancy() {
    knx::scenarios::address_occupancy().await
}

#[tokio::test(start_paused = true)]
async fn assign_address() {
    knx::scenarios::assign_address().await
}

#[tokio::test(start_paused = true)]
async fn occupied_address_not_reassigned() {
    knx::scenarios::occupied_address_not_reassigned().await
}

#[tokio::test(start_paused = true)]
async fn reset_address() {
    knx::scenarios::reset_address().await
}

#[tokio::test(start_paused = true)]
async fn serial_number_addressing() {
    knx::scenarios::serial_number_addressing().await
}

#[tokio::test(start_paused = true)]
async fn programming_mode_property() {
    knx::scenarios::programming_mode_property().await
}

#[tokio::test(start_paused = true)]
async fn programming_mode_memory_fallback() {
    knx::scenarios::programming_mode_memory_fallback().await
}

#[tokio::test(start_paused = true)]
async fn domain_addressing() {
    knx::scenarios::domain_addressing().await
}

#[tokio::test(start_paused = true)]
async fn chunked_memory_roundtrip() {
    knx::scenarios::chunked_memory_roundtrip().await
}

#[tokio::test(start_paused = true)]
async fn verify_write() {
    knx::scenarios::verify_write().await
}

#[tokio::test(start_paused = true)]
async fn verify_by_server() {
    knx::scenarios::verify_by_server().await
}

#[tokio::test(start_paused = true)]
async fn verify_mode_write() {
    knx::scenarios::verify_mode_write().await
}

#[tokio::test(start_paused = true)]
async fn memory_requires_connection() {
    knx::scenarios::memory_requires_connection().await
}

#[tokio::test(start_paused = true)]
async fn detach_is_terminal() {
    knx::scenarios::detach_is_terminal().await
}

#[tokio::test(start_paused = true)]
async fn link_close_detaches() {
    knx::scenarios::link_close_detaches().await
}

#[tokio::test(start_paused = true)]
async fn destroy_aborts_send() {
    knx::scenarios::destroy_aborts_send().await
}
