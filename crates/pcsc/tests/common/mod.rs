//! Common test utilities

use pcsc::{Context, Scope};

use nexum_card_resource_pcsc::PcscDriver;

/// Whether a PC/SC service is reachable
pub fn pcsc_available() -> bool {
    Context::establish(Scope::User).is_ok()
}

/// Try to get a driver on the local PC/SC service
pub fn get_test_driver() -> Option<PcscDriver> {
    if !pcsc_available() {
        return None;
    }
    PcscDriver::new().ok()
}
