//! Serial port discovery and the async log stream.
//!
//! Bitaxe boards enumerate as ESP32-S3 native USB or behind a common
//! USB-UART bridge.

use crate::error::SessionError;

/// A serial port with its USB identity, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub name: String,
    pub usb: Option<(u16, u16)>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

impl PortEntry {
    /// Whether the USB identity belongs to hardware a Bitaxe ships with.
    pub fn is_esp_candidate(&self) -> bool {
        match self.usb {
            // ESP32-S3 native USB
            Some((0x303a, _)) => true,
            // Silicon Labs CP210x
            Some((0x10c4, 0xea60)) => true,
            // CH340 / CH9102
            Some((0x1a86, 0x7523)) | Some((0x1a86, 0x55d4)) => true,
            // FTDI
            Some((0x0403, _)) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> String {
        match self.usb {
            Some((vid, pid)) => {
                let mut label = format!("{} (USB {vid:04x}:{pid:04x}", self.name);
                if let Some(m) = &self.manufacturer {
                    label.push_str(&format!(" - {m}"));
                }
                if let Some(p) = &self.product {
                    label.push_str(&format!(" {p}"));
                }
                label.push(')');
                label
            }
            None => self.name.clone(),
        }
    }
}

/// All serial ports the OS reports.
pub fn list_ports() -> Result<Vec<PortEntry>, SessionError> {
    let ports = serialport::available_ports()
        .map_err(|e| SessionError::Connect(format!("Failed to enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(info) => PortEntry {
                name: port.port_name,
                usb: Some((info.vid, info.pid)),
                product: info.product,
                manufacturer: info.manufacturer,
            },
            _ => PortEntry {
                name: port.port_name,
                usb: None,
                product: None,
                manufacturer: None,
            },
        })
        .collect())
}

/// Pick the endpoint to connect to.
///
/// An explicit name always wins. Otherwise a single ESP candidate is taken
/// as-is; with several, the user is asked when `interactive`, and it is an
/// error when not. Cancelling the prompt is a connect failure.
pub fn select_port(
    ports: &[PortEntry],
    hint: Option<&str>,
    interactive: bool,
) -> Result<String, SessionError> {
    if let Some(name) = hint {
        return Ok(name.to_string());
    }

    let candidates: Vec<&PortEntry> = ports.iter().filter(|p| p.is_esp_candidate()).collect();
    match candidates.as_slice() {
        [] => Err(SessionError::Connect(
            "No compatible serial port found. Connect the device via USB or pass --port".into(),
        )),
        [only] => {
            tracing::info!("Auto-selected serial port {}", only.name);
            Ok(only.name.clone())
        }
        many if interactive => {
            let labels: Vec<String> = many.iter().map(|p| p.label()).collect();
            let choice = dialoguer::Select::new()
                .with_prompt("Select the serial port of your device")
                .items(&labels)
                .default(0)
                .interact_opt()
                .map_err(|e| SessionError::Connect(format!("Port selection failed: {e}")))?;
            match choice {
                Some(i) => Ok(many[i].name.clone()),
                None => Err(SessionError::Connect("No port selected".into())),
            }
        }
        many => Err(SessionError::Connect(format!(
            "Multiple serial ports found ({}); choose one explicitly",
            many.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Async reader over a second handle to an open port.
///
/// The clone shares the device with `port`. Dropping the stream closes only
/// the clone's descriptor.
#[cfg(unix)]
pub fn log_stream(port: &serialport::TTYPort) -> Result<tokio_serial::SerialStream, SessionError> {
    let open_err =
        |e: serialport::Error| SessionError::Read(format!("Failed to open serial stream: {e}"));
    let clone = port.try_clone_native().map_err(open_err)?;
    tokio_serial::SerialStream::try_from(clone).map_err(open_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> PortEntry {
        PortEntry {
            name: name.into(),
            usb: Some((vid, pid)),
            product: None,
            manufacturer: None,
        }
    }

    #[test]
    fn test_list_ports_no_panic() {
        // Should not panic even if no devices connected
        let _ = list_ports();
    }

    #[test]
    fn test_esp_candidates() {
        assert!(usb("/dev/ttyACM0", 0x303a, 0x1001).is_esp_candidate());
        assert!(usb("/dev/ttyUSB0", 0x10c4, 0xea60).is_esp_candidate());
        assert!(!usb("/dev/ttyUSB1", 0x2e8a, 0x000a).is_esp_candidate());
    }

    #[test]
    fn test_select_port_hint_wins() {
        let ports = vec![usb("/dev/ttyACM0", 0x303a, 0x1001)];
        assert_eq!(
            select_port(&ports, Some("/dev/ttyUSB9"), false).unwrap(),
            "/dev/ttyUSB9"
        );
    }

    #[test]
    fn test_select_port_single_candidate() {
        let ports = vec![
            usb("/dev/ttyUSB1", 0x2e8a, 0x000a),
            usb("/dev/ttyACM0", 0x303a, 0x1001),
        ];
        assert_eq!(select_port(&ports, None, false).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_select_port_ambiguous_or_missing() {
        assert!(matches!(
            select_port(&[], None, false),
            Err(SessionError::Connect(_))
        ));
        let ports = vec![
            usb("/dev/ttyACM0", 0x303a, 0x1001),
            usb("/dev/ttyACM1", 0x303a, 0x1001),
        ];
        let err = select_port(&ports, None, false).unwrap_err();
        assert!(err.to_string().contains("/dev/ttyACM1"));
    }

    #[test]
    fn test_label() {
        let mut p = usb("/dev/ttyACM0", 0x303a, 0x1001);
        p.manufacturer = Some("Espressif".into());
        assert_eq!(p.label(), "/dev/ttyACM0 (USB 303a:1001 - Espressif)");
    }
}
