//! Higher-level management workflows composed from client primitives:
//! installation scans, address assignment, programming mode, and chunked
//! memory transfers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::address::IndividualAddress;
use crate::error::Error;
use crate::management::{ManagementClient, SerialNumber};
use crate::property::pid;
use crate::transport::{Destination, DisconnectedBy};

/// Wait between connect attempts while scanning, so the outgoing queue of
/// the link never floods.
const SCAN_PACING: Duration = Duration::from_millis(100);

/// Extra settle time after the last scan probe, on top of the disconnect
/// timeout.
const SCAN_SETTLE_SLACK: Duration = Duration::from_secs(1);

/// Window for one broadcast address read.
const ADDRESS_READ_WINDOW: Duration = Duration::from_secs(3);

/// Window and retry budget while waiting for exactly one device in
/// programming mode.
const PROGMODE_PROBE_WINDOW: Duration = Duration::from_secs(1);
const PROGMODE_ATTEMPTS: usize = 20;

/// Collection window of a serial-number scan.
const SERIAL_SCAN_WINDOW: Duration = Duration::from_secs(7);

/// Device memory location of the programming-mode flag.
const PROGMODE_MEMORY: u16 = 0x60;

/// Grace period for a device to apply a freshly written address before it
/// is spoken to under that address.
const ADDRESS_APPLY_DELAY: Duration = Duration::from_secs(1);

/// Chunk size for memory transfers when the device does not tell its
/// maximum APDU length.
const DEFAULT_MEMORY_CHUNK: usize = 12;

/// Management procedures over one [`ManagementClient`].
pub struct ManagementProcedures {
    client: Arc<ManagementClient>,
}

impl ManagementProcedures {
    pub fn new(client: Arc<ManagementClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ManagementClient> {
        &self.client
    }

    /// Reads the addresses of all devices currently in programming mode.
    /// An empty installation yields an empty list, not an error.
    pub async fn read_address(&self) -> Result<Vec<IndividualAddress>, Error> {
        self.client
            .read_address_within(false, ADDRESS_READ_WINDOW)
            .await
    }

    /// Assigns `address` to the one device in programming mode.
    ///
    /// Probes whether the address is already taken, waits until exactly
    /// one device reports programming mode, writes the address, verifies
    /// it with a descriptor read, and restarts the device. Returns
    /// `false` without touching anything when a device outside
    /// programming mode already owns the address.
    pub async fn write_address(&self, address: IndividualAddress) -> Result<bool, Error> {
        let occupied = self.is_address_occupied(address).await?;
        let current = self.await_single_programming_device().await?;
        if occupied && current != address {
            tracing::warn!(
                %address,
                "address belongs to a device outside programming mode"
            );
            return Ok(false);
        }

        self.client.write_address(address).await?;
        sleep(ADDRESS_APPLY_DELAY).await;

        let (destination, created) = self.get_or_create(address, true)?;
        let result = async {
            self.client.read_device_descriptor(&destination, 0).await?;
            self.client.restart(&destination).await
        }
        .await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        result.map(|()| true)
    }

    /// Assigns an address to the device with the given serial number and
    /// verifies the device took it. Works without programming mode.
    pub async fn write_address_by_serial(
        &self,
        serial: SerialNumber,
        address: IndividualAddress,
    ) -> Result<(), Error> {
        self.client.write_address_by_serial(serial, address).await?;
        sleep(ADDRESS_APPLY_DELAY).await;
        let assigned = self.client.read_address_by_serial(serial).await?;
        if assigned != address {
            return Err(Error::remote("device kept its previous address"));
        }
        Ok(())
    }

    /// Writes a domain address to the single device in programming mode
    /// and verifies it by reading it back.
    pub async fn write_domain_address(&self, domain: &[u8]) -> Result<(), Error> {
        if domain.len() != 2 && domain.len() != 6 {
            return Err(Error::IllegalArgument("domain address must be 2 or 6 bytes"));
        }
        self.await_single_programming_device().await?;
        self.client.write_domain_address(domain).await?;
        let taken = self.client.read_domain_addresses().await?;
        if !taken.iter().any(|(_, d)| d == domain) {
            return Err(Error::remote("device did not take the domain address"));
        }
        Ok(())
    }

    /// Drives every device in programming mode back to the default
    /// individual address, restarting them until none answer.
    pub async fn reset_address(&self) -> Result<(), Error> {
        for _ in 0..PROGMODE_ATTEMPTS {
            let devices = self
                .client
                .read_address_within(false, PROGMODE_PROBE_WINDOW)
                .await?;
            if devices.is_empty() {
                return Ok(());
            }
            self.client
                .write_address(IndividualAddress::DEFAULT_DEVICE)
                .await?;
            sleep(ADDRESS_APPLY_DELAY).await;
            let (destination, created) =
                self.get_or_create(IndividualAddress::DEFAULT_DEVICE, true)?;
            let _ = self.client.restart(&destination).await;
            if created {
                self.client
                    .transport()
                    .destroy_destination(&destination)
                    .await;
            }
        }
        Err(Error::Timeout("devices to leave programming mode"))
    }

    /// Whether a device answers under `address`. A device that exists but
    /// only speaks connectionless shows up as a remote-initiated
    /// disconnect, which counts as occupied.
    pub async fn is_address_occupied(
        &self,
        address: IndividualAddress,
    ) -> Result<bool, Error> {
        let (destination, created) = self.get_or_create(address, true)?;
        let probe = self.client.read_device_descriptor(&destination, 0).await;
        let _ = self.client.transport().disconnect(&destination).await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        match probe {
            Ok(_) => Ok(true),
            Err(Error::Disconnect {
                initiator: DisconnectedBy::Remote,
                ..
            }) => Ok(true),
            Err(Error::Disconnect {
                initiator: DisconnectedBy::Local,
                ..
            })
            | Err(Error::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Scans for line couplers: probes `a.l.0` for every area/line pair.
    pub async fn scan_network_routers(&self) -> Result<Vec<IndividualAddress>, Error> {
        let routers = (0u16..256).map(|raw| IndividualAddress::from_raw(raw << 8));
        self.probe_connections(routers).await
    }

    /// Scans one line for devices: probes every address on `area.line`.
    pub async fn scan_network_devices(
        &self,
        area: u8,
        line: u8,
    ) -> Result<Vec<IndividualAddress>, Error> {
        if area > 15 || line > 15 {
            return Err(Error::IllegalArgument("area and line must be 4-bit values"));
        }
        let devices = (0u16..256).map(move |d| IndividualAddress::new(area, line, d as u8));
        self.probe_connections(devices).await
    }

    /// Collects the serial numbers of devices answering on the medium's
    /// default device address `0.line.255`.
    pub async fn scan_serial_numbers(
        &self,
        line: u8,
    ) -> Result<Vec<(IndividualAddress, SerialNumber)>, Error> {
        if line > 15 {
            return Err(Error::IllegalArgument("line must be a 4-bit value"));
        }
        let medium = self.client.transport().medium().medium;
        let (destination, created) = self.get_or_create(medium.default_device(line), true)?;
        let result = self
            .client
            .read_serial_numbers(&destination, SERIAL_SCAN_WINDOW)
            .await;
        let _ = self.client.transport().disconnect(&destination).await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        result
    }

    /// Switches a device's programming mode. Prefers the programming-mode
    /// property; devices without it are driven through the memory
    /// location, keeping bit 7 the even parity of the mode bits.
    pub async fn set_programming_mode(
        &self,
        address: IndividualAddress,
        on: bool,
    ) -> Result<(), Error> {
        let (destination, created) = self.get_or_create(address, true)?;
        let result = async {
            let by_property = self
                .client
                .write_property(&destination, 0, pid::PROGMODE, 1, 1, &[on as u8])
                .await;
            match by_property {
                Ok(_) => Ok(()),
                Err(e @ Error::LinkClosed) | Err(e @ Error::Interrupted) => Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, "programming mode via memory fallback");
                    let current =
                        self.client.read_memory(&destination, PROGMODE_MEMORY, 1).await?[0];
                    let mode = if on { current | 0x01 } else { current & !0x01 };
                    self.client
                        .write_memory(&destination, PROGMODE_MEMORY, &[with_even_parity(mode)])
                        .await
                }
            }
        }
        .await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        result
    }

    /// Writes a block of device memory in chunks sized to the remote's
    /// maximum APDU length. `verify_write` reads every chunk back;
    /// `verify_by_server` makes the device echo written bytes instead.
    /// The two verification modes are mutually exclusive.
    pub async fn write_memory(
        &self,
        address: IndividualAddress,
        start: u16,
        data: &[u8],
        verify_write: bool,
        verify_by_server: bool,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::IllegalArgument("no memory data given"));
        }
        if verify_write && verify_by_server {
            return Err(Error::IllegalArgument(
                "verify-write and verify-by-server are mutually exclusive",
            ));
        }
        check_memory_range(start, data.len())?;
        let (destination, created) =
            self.get_or_create_with(address, true, false, verify_by_server)?;
        let result = async {
            if verify_by_server {
                self.enable_server_verify(&destination).await?;
            }
            let chunk = self.memory_chunk_size(&destination).await;
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + chunk).min(data.len());
                let at = start + offset as u16;
                let piece = &data[offset..end];
                self.client.write_memory(&destination, at, piece).await?;
                if verify_write {
                    let readback = self.client.read_memory(&destination, at, piece.len()).await?;
                    if readback != piece {
                        return Err(Error::remote("memory write verification failed"));
                    }
                }
                offset = end;
            }
            Ok(())
        }
        .await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        result
    }

    /// Reads a block of device memory in chunks sized to the remote's
    /// maximum APDU length.
    pub async fn read_memory(
        &self,
        address: IndividualAddress,
        start: u16,
        count: usize,
    ) -> Result<Vec<u8>, Error> {
        if count == 0 {
            return Err(Error::IllegalArgument("no memory bytes requested"));
        }
        check_memory_range(start, count)?;
        let (destination, created) = self.get_or_create(address, true)?;
        let result = async {
            let chunk = self.memory_chunk_size(&destination).await;
            let mut data = Vec::with_capacity(count);
            let mut offset = 0;
            while offset < count {
                let piece = chunk.min(count - offset);
                let at = start + offset as u16;
                data.extend_from_slice(&self.client.read_memory(&destination, at, piece).await?);
                offset += piece;
            }
            Ok(data)
        }
        .await;
        if created {
            self.client
                .transport()
                .destroy_destination(&destination)
                .await;
        }
        result
    }

    /// Polls the broadcast address read until exactly one device reports
    /// programming mode, returning its current address.
    async fn await_single_programming_device(&self) -> Result<IndividualAddress, Error> {
        for _ in 0..PROGMODE_ATTEMPTS {
            let devices = self
                .client
                .read_address_within(false, PROGMODE_PROBE_WINDOW)
                .await?;
            match devices.len() {
                0 => continue,
                1 => return Ok(devices[0]),
                count => {
                    tracing::warn!(count, "waiting for a single device in programming mode");
                }
            }
        }
        Err(Error::Timeout("a single device in programming mode"))
    }

    /// Connect-probes the given addresses with pacing, then reports the
    /// ones whose connection the remote endpoint terminated, the standard
    /// presence check. Collection waits out a full disconnect timeout
    /// after the last probe.
    async fn probe_connections(
        &self,
        addresses: impl Iterator<Item = IndividualAddress>,
    ) -> Result<Vec<IndividualAddress>, Error> {
        let transport = self.client.transport();
        let mut probes: Vec<Arc<Destination>> = Vec::new();
        let mut failure = None;
        for address in addresses {
            // Keep-alive probes: only the remote endpoint may terminate
            // the connection, which is the presence signal collected
            // below.
            let destination = match transport.create_destination_with(address, true, true, false) {
                Ok(destination) => destination,
                Err(_) => {
                    tracing::debug!(%address, "address already has a destination, skipping");
                    continue;
                }
            };
            let connect = transport.connect(&destination).await;
            probes.push(destination);
            if let Err(e) = connect {
                failure = Some(e);
                break;
            }
            sleep(SCAN_PACING).await;
        }

        let mut present = Vec::new();
        if failure.is_none() {
            sleep(transport.config().idle_timeout + SCAN_SETTLE_SLACK).await;
            for destination in &probes {
                if destination.disconnected_by() == Some(DisconnectedBy::Remote) {
                    present.push(destination.address());
                }
            }
        }
        for destination in probes {
            transport.destroy_destination(&destination).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(present),
        }
    }

    /// Turns on the device-control bit that makes the server echo written
    /// memory in its responses.
    async fn enable_server_verify(&self, destination: &Arc<Destination>) -> Result<(), Error> {
        let control = self
            .client
            .read_property(destination, 0, pid::DEVICE_CONTROL, 1, 1)
            .await?;
        if control.len() != 1 {
            return Err(Error::invalid("device control must be one byte"));
        }
        self.client
            .write_property(destination, 0, pid::DEVICE_CONTROL, 1, 1, &[control[0] | 0x04])
            .await
            .map(|_| ())
    }

    /// The memory payload per request: the device's maximum APDU length
    /// less the service overhead, or the conservative default when the
    /// device does not answer the query.
    async fn memory_chunk_size(&self, destination: &Arc<Destination>) -> usize {
        match self
            .client
            .read_property(destination, 0, pid::MAX_APDULENGTH, 1, 1)
            .await
        {
            Ok(data) if data.len() == 2 => {
                let max_apdu = u16::from_be_bytes([data[0], data[1]]) as usize;
                max_apdu.saturating_sub(3).clamp(1, 63)
            }
            Ok(_) | Err(_) => DEFAULT_MEMORY_CHUNK,
        }
    }

    fn get_or_create(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
    ) -> Result<(Arc<Destination>, bool), Error> {
        self.get_or_create_with(address, connection_oriented, false, false)
    }

    fn get_or_create_with(
        &self,
        address: IndividualAddress,
        connection_oriented: bool,
        keep_alive: bool,
        verify_mode: bool,
    ) -> Result<(Arc<Destination>, bool), Error> {
        let transport = self.client.transport();
        if let Some(existing) = transport.get_destination(address) {
            if !existing.is_destroyed()
                && existing.is_connection_oriented() == connection_oriented
                && existing.keep_alive() == keep_alive
                && existing.verify_mode() == verify_mode
            {
                return Ok((existing, false));
            }
            return Err(Error::IllegalState(
                "destination exists with different settings",
            ));
        }
        transport
            .create_destination_with(address, connection_oriented, keep_alive, verify_mode)
            .map(|destination| (destination, true))
    }
}

impl std::fmt::Debug for ManagementProcedures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementProcedures")
            .field("client", &self.client)
            .finish()
    }
}

fn check_memory_range(start: u16, len: usize) -> Result<(), Error> {
    if start as usize + len > 0x1_0000 {
        return Err(Error::IllegalArgument("memory range exceeds the address space"));
    }
    Ok(())
}

/// Bit 7 becomes the even parity of bits 0..=6.
fn with_even_parity(byte: u8) -> u8 {
    let low = byte & 0x7F;
    low | ((low.count_ones() as u8 & 1) << 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_bit_follows_mode_bits() {
        assert_eq!(with_even_parity(0x00), 0x00);
        assert_eq!(with_even_parity(0x01), 0x81);
        assert_eq!(with_even_parity(0x03), 0x03);
        assert_eq!(with_even_parity(0x7F), 0xFF);
        // An existing parity bit is recomputed, not kept.
        assert_eq!(with_even_parity(0x80), 0x00);
    }

    #[test]
    fn memory_range_checks() {
        assert!(check_memory_range(0xFFFF, 1).is_ok());
        assert!(check_memory_range(0xFFFF, 2).is_err());
        assert!(check_memory_range(0x0000, 0x1_0000).is_ok());
    }
}
