// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros for convenient logging

/// Log a message with critical severity
#[macro_export]
macro_rules! log_critical {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.critical($facility, &format!($($arg)*))
    };
}

/// Log a message with error severity
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.error($facility, &format!($($arg)*))
    };
}

/// Log a message with warning severity
#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.warning($facility, &format!($($arg)*))
    };
}

/// Log a message with notice severity
#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.notice($facility, &format!($($arg)*))
    };
}

/// Log a message with info severity
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.info($facility, &format!($($arg)*))
    };
}

/// Log a message with debug severity
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $($arg:tt)*) => {
        $logger.debug($facility, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use crate::logging::{Facility, Logger};

    #[test]
    fn test_log_macros() {
        let logger = Logger::discard();

        log_critical!(logger, Facility::Test, "critical {}", 1);
        log_error!(logger, Facility::Test, "error");
        log_warning!(logger, Facility::Test, "warning");
        log_notice!(logger, Facility::Test, "notice");
        log_info!(logger, Facility::Test, "info {}", "message");
        log_debug!(logger, Facility::Test, "debug");
    }
}
