//! Command handlers for the gattlink CLI

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattlink_btleplug::BtlePlatform;
use gattlink_core::{
    Characteristic, Connection, ConnectionStream, DelayedAck, Device, GattClient, GattServices, LinkState,
    RetryAttempts,
};

use crate::cli::{Cli, Commands, HexBytes, PriorityArg};
use crate::config::CliConfig;
use crate::error::Result;

/// How long a connection-priority request holds the link
const PRIORITY_SETTLE_DELAY: Duration = Duration::from_millis(100);
const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        let platform = BtlePlatform::new().await?;

        match cli.command {
            Commands::Scan { duration } => {
                let duration = duration.map(Duration::from_secs).unwrap_or(config.scan_duration());
                Self::handle_scan_command(&platform, duration).await
            }
            Commands::Services { address, json } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = Self::handle_services_command(&session.connection, json).await;
                session.close().await;
                result
            }
            Commands::Read { address, characteristic } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = Self::handle_read_command(&session.connection, characteristic).await;
                session.close().await;
                result
            }
            Commands::Write {
                address,
                characteristic,
                value,
            } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = Self::handle_write_command(&session.connection, characteristic, value).await;
                session.close().await;
                result
            }
            Commands::LongWrite {
                address,
                characteristic,
                value,
                batch_size,
                retries,
            } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = Self::handle_long_write_command(
                    &session.connection,
                    &config,
                    characteristic,
                    value,
                    batch_size,
                    retries,
                )
                .await;
                session.close().await;
                result
            }
            Commands::Notify {
                address,
                characteristic,
                indicate,
                count,
            } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result =
                    Self::handle_notify_command(&session.connection, &config, characteristic, indicate, count).await;
                session.close().await;
                result
            }
            Commands::Rssi { address } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = session.connection.read_rssi().await;
                session.close().await;
                println!("{} dBm", result?);
                Ok(())
            }
            Commands::Mtu { address, mtu } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = session.connection.request_mtu(mtu).await;
                session.close().await;
                println!("MTU {}", result?);
                Ok(())
            }
            Commands::Priority { address, priority } => {
                let session = Session::open(&platform, &config, &address).await?;
                let result = Self::handle_priority_command(&session.connection, priority).await;
                session.close().await;
                result
            }
        }
    }

    /// List nearby peripherals
    async fn handle_scan_command(platform: &BtlePlatform, duration: Duration) -> Result<()> {
        info!("Scanning for {:?}...", duration);
        let found = platform.scan(duration).await?;
        if found.is_empty() {
            println!("No peripherals found");
        }
        for peripheral in found {
            println!("{peripheral}");
        }
        Ok(())
    }

    /// Print the discovered service tree
    async fn handle_services_command(connection: &Connection, json: bool) -> Result<()> {
        let services = connection.services().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&services)?);
        } else {
            print!("{}", describe_services(&services));
        }
        Ok(())
    }

    async fn handle_read_command(connection: &Connection, uuid: Uuid) -> Result<()> {
        let characteristic = connection.characteristic(uuid).await?;
        let value = connection.read_characteristic(&characteristic).await?;
        println!("{}", hex::encode(value));
        Ok(())
    }

    async fn handle_write_command(connection: &Connection, uuid: Uuid, value: HexBytes) -> Result<()> {
        let characteristic = connection.characteristic(uuid).await?;
        connection.write_characteristic(&characteristic, &value.0).await?;
        info!("Wrote {} bytes to {}", value.0.len(), uuid);
        Ok(())
    }

    async fn handle_long_write_command(
        connection: &Connection,
        config: &CliConfig,
        uuid: Uuid,
        value: HexBytes,
        batch_size: Option<usize>,
        retries: Option<u32>,
    ) -> Result<()> {
        let characteristic = connection.characteristic(uuid).await?;
        let mut builder = connection
            .long_write()
            .with_characteristic(characteristic)
            .with_bytes(value.0)
            .with_retry_policy(RetryAttempts::new(
                retries.unwrap_or(config.long_write.retry_attempts),
            ));
        if let Some(size) = batch_size.or(config.long_write.max_batch_size) {
            builder = builder.with_max_batch_size(size);
        }
        if let Some(delay) = config.long_write.ack_delay_ms {
            builder = builder.with_ack_policy(DelayedAck(Duration::from_millis(delay)));
        }

        let written = builder.execute().await?;
        info!("Wrote {} bytes to {}", written.len(), uuid);
        Ok(())
    }

    /// Print values until `count` arrived, the link breaks or Ctrl+C
    async fn handle_notify_command(
        connection: &Connection,
        config: &CliConfig,
        uuid: Uuid,
        indicate: bool,
        count: Option<usize>,
    ) -> Result<()> {
        let characteristic: Characteristic = connection.characteristic(uuid).await?;
        let mode = config.notifications.setup_mode;
        let values = if indicate {
            connection.setup_indication(&characteristic, mode).await?
        } else {
            connection.setup_notification(&characteristic, mode).await?
        };
        info!("Listening on {} (Ctrl+C to stop)", uuid);

        let mut values = values.take(count.unwrap_or(usize::MAX));
        loop {
            tokio::select! {
                value = values.next() => match value {
                    Some(value) => println!("{}", hex::encode(value?)),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupted");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_priority_command(connection: &Connection, priority: PriorityArg) -> Result<()> {
        connection
            .request_connection_priority(priority.into(), PRIORITY_SETTLE_DELAY)
            .await?;
        info!("Requested {:?} connection priority", priority);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Session
// ----------------------------------------------------------------------------

/// A connection held open for the duration of one command
struct Session {
    device: Device,
    stream: ConnectionStream,
    connection: Connection,
    disconnect_timeout: Duration,
}

impl Session {
    async fn open(platform: &BtlePlatform, config: &CliConfig, address: &str) -> Result<Self> {
        let client = GattClient::new(Arc::new(platform.clone()));
        let device = client.device(address);
        let setup = config.connection_setup();
        let disconnect_timeout = setup.disconnect_timeout;

        info!("Connecting to {}...", device.address());
        let mut stream = device.establish_connection(setup);
        let connection = stream.connected().await?;
        info!("Connected to {}", device.address());

        Ok(Self {
            device,
            stream,
            connection,
            disconnect_timeout,
        })
    }

    /// Release the link and wait for the platform to confirm
    async fn close(self) {
        let Self {
            device,
            stream,
            connection,
            disconnect_timeout,
        } = self;
        drop(connection);
        drop(stream);

        let confirmed = tokio::time::timeout(disconnect_timeout, async {
            while device.state() != LinkState::Disconnected {
                tokio::time::sleep(TEARDOWN_POLL_INTERVAL).await;
            }
        })
        .await;
        if confirmed.is_err() {
            warn!("{} did not confirm the disconnect", device.address());
        }
    }
}

// ----------------------------------------------------------------------------
// Output Formatting
// ----------------------------------------------------------------------------

/// Human-readable service tree
pub fn describe_services(services: &GattServices) -> String {
    let mut out = String::new();
    for service in services.services() {
        let kind = if service.primary { "primary" } else { "secondary" };
        out.push_str(&format!("{} ({kind})\n", service.uuid));
        for characteristic in &service.characteristics {
            out.push_str(&format!(
                "  {} [{}]\n",
                characteristic.id(),
                characteristic.properties
            ));
            for descriptor in &characteristic.descriptors {
                out.push_str(&format!("    {}\n", descriptor.uuid));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_core::config::CLIENT_CHARACTERISTIC_CONFIG_UUID;
    use gattlink_core::{CharacteristicProperties, Service};

    #[test]
    fn test_describe_services() {
        let service_uuid = Uuid::from_u128(0x180d);
        let measurement = Uuid::from_u128(0x2a37);
        let services = GattServices::new(vec![Service::new(service_uuid).with_characteristic(
            Characteristic::new(measurement, 4, CharacteristicProperties::NOTIFY)
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID),
        )]);

        let text = describe_services(&services);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], format!("{service_uuid} (primary)"));
        assert!(lines[1].starts_with(&format!("  {measurement}#4 [")));
        assert_eq!(lines[2], format!("    {CLIENT_CHARACTERISTIC_CONFIG_UUID}"));
    }
}
