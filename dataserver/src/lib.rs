//! Consumer side of the wheel telemetry channel.
//!
//! A [`ReadLoop`] copies the latest sample out of the channel at a fixed rate and hands it to
//! its [`Sink`]s: a [`ConsoleReport`] and a [`LatestSnapshot`] that the [`QueryServer`] answers
//! HTTP queries from.
mod http;
mod read_loop;
mod sink;

pub use http::{QueryServer, DATA_PATH};
pub use read_loop::ReadLoop;
pub use sink::{ConsoleReport, LatestSnapshot, Sink, SinkError, Snapshot};
