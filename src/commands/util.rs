//! Utility commands

use anyhow::Result;

use crate::catalog::{self, DeviceModel};
use crate::serial;

/// List available serial ports
pub fn cmd_list_ports() -> Result<()> {
    println!("Available serial ports:\n");

    let ports = serial::list_ports()?;

    if ports.is_empty() {
        println!("  No serial ports found");
        return Ok(());
    }

    for port in &ports {
        let marker = if port.is_esp_candidate() { "*" } else { " " };
        println!(" {marker} {}", port.label());
    }

    if ports.iter().any(|p| p.is_esp_candidate()) {
        println!("\n  * likely Bitaxe (ESP32-S3 or USB-UART bridge)");
    }

    Ok(())
}

/// Print supported boards and their factory images
pub fn cmd_catalog(model: Option<DeviceModel>) -> Result<()> {
    let models: Vec<DeviceModel> = match model {
        Some(m) => vec![m],
        None => DeviceModel::ALL.to_vec(),
    };

    for model in models {
        println!("{} ({})", model.display_name(), model.key());
        for board in catalog::board_versions(model) {
            let Some(locator) = catalog::resolve(model, board) else {
                continue;
            };
            let version = catalog::firmware_version(locator).unwrap_or("?");
            println!("  board {board:<5} {version:<8} {locator}");
        }
        println!();
    }

    Ok(())
}
