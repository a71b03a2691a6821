//! Peripheral-data plugin contract.
//!
//! Some instruments produce companion data (physiological logs and the like)
//! that belongs with an acquisition but travels outside the imaging series.
//! The network backend calls every registered plugin once per acquisition,
//! fire-and-forget: a plugin failure is logged and never affects the reap.

use reaper_dicom::DicomHeader;
use std::path::Path;
use tracing::warn;

pub trait PeripheralReaper {
    fn name(&self) -> &str;

    /// Capture peripheral data for one acquisition. `prefix` names the
    /// acquisition's working files; `label` is the human-readable id used in
    /// the plugin's own logging.
    fn handle(
        &self,
        workspace: &Path,
        header: &DicomHeader,
        prefix: &str,
        label: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Invoke every plugin, swallowing (but logging) individual failures.
pub fn run_all(
    plugins: &[Box<dyn PeripheralReaper>],
    workspace: &Path,
    header: &DicomHeader,
    prefix: &str,
    label: &str,
) {
    for plugin in plugins {
        if let Err(error) = plugin.handle(workspace, header, prefix, label) {
            warn!(plugin = plugin.name(), %label, %error, "peripheral reaper failed");
        }
    }
}
