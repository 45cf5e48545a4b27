//! Firmware catalog.
//!
//! Static mapping from (device model, board version) to the factory
//! firmware image for that board. Locators are relative paths resolved
//! against the configured firmware base.

use std::fmt;

use clap::ValueEnum;

use crate::error::SessionError;

/// Supported Bitaxe device families.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Debug)]
pub enum DeviceModel {
    Max,
    Ultra,
    Supra,
    Gamma,
    #[value(name = "ultrahex")]
    UltraHex,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 5] = [
        DeviceModel::Max,
        DeviceModel::Ultra,
        DeviceModel::Supra,
        DeviceModel::Gamma,
        DeviceModel::UltraHex,
    ];

    /// Short key used in the catalog and on the command line.
    pub fn key(self) -> &'static str {
        match self {
            DeviceModel::Max => "max",
            DeviceModel::Ultra => "ultra",
            DeviceModel::Supra => "supra",
            DeviceModel::Gamma => "gamma",
            DeviceModel::UltraHex => "ultrahex",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            DeviceModel::Max => "Bitaxe Max",
            DeviceModel::Ultra => "Bitaxe Ultra",
            DeviceModel::Supra => "Bitaxe Supra",
            DeviceModel::Gamma => "Bitaxe Gamma",
            DeviceModel::UltraHex => "Bitaxe UltraHex",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

struct CatalogEntry {
    model: DeviceModel,
    board_version: &'static str,
    locator: &'static str,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        model: DeviceModel::Max,
        board_version: "102",
        locator: "firmware/esp-miner-factory-102-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Ultra,
        board_version: "201",
        locator: "firmware/esp-miner-factory-201-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Ultra,
        board_version: "202",
        locator: "firmware/esp-miner-factory-202-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Ultra,
        board_version: "203",
        locator: "firmware/esp-miner-factory-203-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Ultra,
        board_version: "204",
        locator: "firmware/esp-miner-factory-204-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Ultra,
        board_version: "205",
        locator: "firmware/esp-miner-factory-205-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Supra,
        board_version: "401",
        locator: "firmware/esp-miner-factory-401-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Supra,
        board_version: "402",
        locator: "firmware/esp-miner-factory-402-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::Gamma,
        board_version: "601",
        locator: "firmware/esp-miner-factory-601-v2.3.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::UltraHex,
        board_version: "302",
        locator: "firmware/esp-miner-factory-302-v2.1.0.bin",
    },
    CatalogEntry {
        model: DeviceModel::UltraHex,
        board_version: "303",
        locator: "firmware/esp-miner-factory-303-v2.1.0.bin",
    },
];

/// Look up the firmware locator for a board.
pub fn resolve(model: DeviceModel, board_version: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|e| e.model == model && e.board_version == board_version)
        .map(|e| e.locator)
}

/// Board versions known for a model, in catalog order.
pub fn board_versions(model: DeviceModel) -> Vec<&'static str> {
    CATALOG
        .iter()
        .filter(|e| e.model == model)
        .map(|e| e.board_version)
        .collect()
}

/// Firmware release encoded in a locator's file name, e.g. `v2.3.0`.
pub fn firmware_version(locator: &str) -> Option<&str> {
    let file = locator.rsplit('/').next()?;
    let stem = file.strip_suffix(".bin")?;
    stem.rsplit('-').next().filter(|v| v.starts_with('v'))
}

/// The user's current model/board choice.
///
/// Changing the model always clears the board version, so a stale board
/// from another family can never be flashed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    model: Option<DeviceModel>,
    board_version: Option<String>,
}

impl DeviceSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selection taken as given, e.g. from command-line flags. Whether the
    /// pair exists is decided when it is resolved.
    pub fn from_parts(model: DeviceModel, board_version: impl Into<String>) -> Self {
        Self {
            model: Some(model),
            board_version: Some(board_version.into()),
        }
    }

    pub fn model(&self) -> Option<DeviceModel> {
        self.model
    }

    pub fn board_version(&self) -> Option<&str> {
        self.board_version.as_deref()
    }

    pub fn set_model(&mut self, model: DeviceModel) {
        self.model = Some(model);
        self.board_version = None;
    }

    pub fn set_board_version(&mut self, board_version: &str) -> Result<(), SessionError> {
        let model = self
            .model
            .ok_or_else(|| SessionError::precondition("Please select a device model first"))?;
        if resolve(model, board_version).is_none() {
            return Err(SessionError::precondition(format!(
                "Board version {board_version} is not available for {}",
                model.display_name()
            )));
        }
        self.board_version = Some(board_version.to_string());
        Ok(())
    }

    /// Both fields set.
    pub fn is_complete(&self) -> bool {
        self.model.is_some() && self.board_version.is_some()
    }

    /// Locator for the selection, if complete and catalogued.
    pub fn locator(&self) -> Option<&'static str> {
        resolve(self.model?, self.board_version.as_deref()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ultra_203() {
        assert_eq!(
            resolve(DeviceModel::Ultra, "203"),
            Some("firmware/esp-miner-factory-203-v2.3.0.bin")
        );
    }

    #[test]
    fn test_resolve_unknown_pair() {
        assert_eq!(resolve(DeviceModel::Max, "203"), None);
        assert_eq!(resolve(DeviceModel::Gamma, ""), None);
    }

    #[test]
    fn test_every_model_has_boards() {
        for model in DeviceModel::ALL {
            assert!(!board_versions(model).is_empty(), "{model} has no boards");
        }
        assert_eq!(
            board_versions(DeviceModel::Ultra),
            vec!["201", "202", "203", "204", "205"]
        );
    }

    #[test]
    fn test_firmware_version() {
        assert_eq!(
            firmware_version("firmware/esp-miner-factory-302-v2.1.0.bin"),
            Some("v2.1.0")
        );
        assert_eq!(firmware_version("firmware/readme.txt"), None);
    }

    #[test]
    fn test_model_change_resets_board_version() {
        let mut sel = DeviceSelection::new();
        sel.set_model(DeviceModel::Ultra);
        sel.set_board_version("203").unwrap();
        assert_eq!(
            sel.locator(),
            Some("firmware/esp-miner-factory-203-v2.3.0.bin")
        );
        assert!(sel.is_complete());

        sel.set_model(DeviceModel::Supra);
        assert_eq!(sel.board_version(), None);
        assert!(!sel.is_complete());
        assert_eq!(sel.locator(), None);
    }

    #[test]
    fn test_board_version_must_match_model() {
        let mut sel = DeviceSelection::new();
        assert!(sel.set_board_version("203").is_err());
        sel.set_model(DeviceModel::Gamma);
        assert!(sel.set_board_version("203").is_err());
        assert_eq!(sel.board_version(), None);
        sel.set_board_version("601").unwrap();
        assert_eq!(sel.board_version(), Some("601"));
    }
}
