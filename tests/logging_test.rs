//! Global subscriber installation, kept in its own test binary so it does not
//! interfere with log capture in the library's unit tests.

use gse_daq::config::{ApplicationConfig, LogFormat};
use gse_daq::logging;

#[test]
fn test_init_twice_is_harmless() {
    let config = ApplicationConfig {
        log_format: LogFormat::Json,
        ..ApplicationConfig::default()
    };
    logging::init(&config);
    logging::init(&config);
    tracing::info!("still logging after a second init");
}
