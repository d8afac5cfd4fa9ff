//! A library for passively monitoring a Modbus RTU heating controller bus.
//!
//! The bus is reached through a serial-to-TCP gateway that forwards every
//! byte on the RS485 line without framing. This crate listens to the traffic
//! produced by the existing bus master, recovers RTU frames, pairs requests
//! with responses and keeps the last known state of every slave (room
//! temperature, humidity, coils and a set of holding registers). The only
//! frame it ever originates is a Write Single Register for a zone setpoint.
//!
//! The crate is layered like this:
//!
//! 1.  **[`protocol`]**: CRC-16, frame decoding, register constants and value
//!     conversions. Pure functions, no I/O.
//! 2.  **[`reframer`]**: Recovers frame boundaries from the raw byte stream.
//! 3.  **[`correlator`]** and **[`store`]**: Pair requests with responses and
//!     keep per-slave records.
//! 4.  **[`tokio_monitor`]**: The `async` runtime around it all, with
//!     reconnection, availability tracking and change notifications.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rtu_monitor_lib::{
//!     protocol as proto,
//!     tokio_common::MonitorConfig,
//!     tokio_monitor::Monitor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let monitor = Monitor::connect_tcp("192.168.1.50:502", MonitorConfig::default());
//!
//!     // Wait until the gateway is connected, then change the setpoint of zone 5.
//!     monitor.connection().wait_for(|connected| *connected).await?;
//!     monitor
//!         .write_setpoint(proto::check_unicast_slave(5)?, 21.5)
//!         .await?;
//!
//!     let snapshot = monitor.snapshot().await;
//!     println!("Known slaves: {:?}", snapshot.keys().collect::<Vec<_>>());
//!
//!     monitor.close().await;
//!     Ok(())
//! }
//! ```

pub mod correlator;
pub mod protocol;
pub mod reframer;
pub mod store;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-tcp")))]
#[cfg(feature = "tokio-tcp")]
pub mod tokio_common;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-tcp")))]
#[cfg(feature = "tokio-tcp")]
pub mod tokio_monitor;
