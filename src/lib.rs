//! # lambda_daq
//!
//! Polls holding registers of a Lambda heat pump over Modbus TCP, decodes
//! them into typed values and writes them to InfluxDB 2 as time-series
//! points. A per-field change gate suppresses writes of values that did not
//! change, so the database receives transitions and periodic refreshes instead
//! of one copy of every register every few seconds.
//!
//! ## Crate Structure
//!
//! Leaves first:
//!
//! - **`lookup`**: fixed code-to-label tables of the controller's enumerations.
//! - **`decoder`**: binary layouts and register block decoding.
//! - **`transform`**: the closed set of per-field transforms.
//! - **`point`**: points and their line protocol form.
//! - **`gate`**: change detection with tolerance and staleness refresh.
//! - **`assembler`**: builds the main point and the tag companion points of a cycle.
//! - **`transport`**: `RegisterReader` and the Modbus TCP client.
//! - **`sink`**: `PointSink` and the InfluxDB writer.
//! - **`poll`**: the per-group read, decode, gate, write, sleep loop.
//! - **`health`**: loop heartbeats, failures and the aggregate status.
//! - **`daemon`**: spawns and supervises the poll loops.
//! - **`config`**, **`error`**, **`logging`**: configuration, errors, log setup.
//! - **`mock`**: in-memory reader and sink for running loops without hardware.

pub mod assembler;
pub mod config;
pub mod daemon;
pub mod decoder;
pub mod error;
pub mod gate;
pub mod health;
pub mod logging;
pub mod lookup;
pub mod mock;
pub mod point;
pub mod poll;
pub mod sink;
pub mod transform;
pub mod transport;
