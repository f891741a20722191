// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging layer: severity ladder, per-component facilities, and a
// cloneable logger handle in front of a pluggable sink.

mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::{LogSink, Logger, MemorySink, StderrSink, SyslogSink};
pub use severity::Severity;
