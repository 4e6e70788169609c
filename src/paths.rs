use std::path::PathBuf;

use crate::provider::ProviderKind;

/// Data directory: `~/.local/share/podlift/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("podlift")
}

/// Log directory: `~/.local/state/podlift/`, falling back to the data dir on
/// platforms without a state dir.
pub fn logs_dir() -> PathBuf {
    dirs::state_dir()
        .map(|d| d.join("podlift"))
        .unwrap_or_else(data_dir)
}

/// Marker holding the id of the last instance created on `provider`.
pub fn marker_path(provider: ProviderKind) -> PathBuf {
    data_dir().join(format!("last-instance-{}", provider.as_str()))
}
