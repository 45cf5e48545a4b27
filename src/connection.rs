//! Connection lifecycle.
//!
//! At most one [`Connection`] exists per manager. It is created by
//! `connect` and released by `disconnect`.

use std::sync::{Arc, Mutex};

use crate::device::{Connector, LogStream, Programmer};
use crate::error::SessionError;
use crate::status::Gate;

/// Shared handle to the device's programming session.
pub type ProgrammerHandle = Arc<Mutex<Box<dyn Programmer>>>;

/// An open, handshaken device.
pub struct Connection {
    endpoint: String,
    description: String,
    programmer: ProgrammerHandle,
}

impl Connection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn programmer(&self) -> ProgrammerHandle {
        self.programmer.clone()
    }

    pub fn open_log_stream(&self) -> Result<LogStream, SessionError> {
        let mut programmer = self
            .programmer
            .lock()
            .map_err(|_| SessionError::Read("Device handle is unusable".into()))?;
        programmer.open_log_stream()
    }
}

pub struct ConnectionManager<C> {
    connector: Arc<C>,
    endpoint_hint: Option<String>,
    connection: Option<Connection>,
    connecting: Gate,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            endpoint_hint: None,
            connection: None,
            connecting: Gate::new(),
        }
    }

    /// Endpoint to prefer on the next `connect`.
    pub fn set_endpoint_hint(&mut self, endpoint: Option<String>) {
        self.endpoint_hint = endpoint;
    }

    pub fn endpoint_hint(&self) -> Option<&str> {
        self.endpoint_hint.as_deref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connecting_gate(&self) -> Gate {
        self.connecting.clone()
    }

    /// Select an endpoint, open it and perform the handshake.
    ///
    /// On failure nothing is retained and the manager stays disconnected.
    pub async fn connect(&mut self) -> Result<&Connection, SessionError> {
        if self.connection.is_some() {
            return Err(SessionError::precondition("Already connected to a device"));
        }
        let _busy = self.connecting.try_enter().ok_or_else(|| {
            SessionError::precondition("A connection attempt is already in progress")
        })?;

        let connector = self.connector.clone();
        let hint = self.endpoint_hint.clone();
        let (endpoint, opened) = tokio::task::spawn_blocking(move || {
            let endpoint = connector.select_endpoint(hint.as_deref())?;
            let opened = connector.open(&endpoint)?;
            Ok::<_, SessionError>((endpoint, opened))
        })
        .await??;

        tracing::info!("Connected to {}", opened.description);
        Ok(self.connection.insert(Connection {
            endpoint,
            description: opened.description,
            programmer: Arc::new(Mutex::new(opened.programmer)),
        }))
    }

    /// Release the transport. A no-op when not connected.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        tracing::info!("Disconnecting from {}", connection.endpoint);

        let programmer = match Arc::try_unwrap(connection.programmer) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(_) => {
                // A blocking write still holds a clone; dropping ours is all
                // that can be done.
                tracing::warn!("Device handle still in use; releasing on last drop");
                return Ok(());
            }
        };
        tokio::task::spawn_blocking(move || programmer.close()).await?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connector and programmer shared by the session tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::DuplexStream;

    use super::*;
    use crate::device::{Opened, WriteJob};

    /// What the fake device saw.
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub writes: AtomicUsize,
        pub resets: AtomicUsize,
        pub closes: AtomicUsize,
        pub written: Mutex<Vec<(u32, Vec<u8>)>>,
        /// Device-side halves of every log stream handed out.
        pub log_devices: Mutex<Vec<DuplexStream>>,
    }

    #[derive(Clone, Default)]
    pub struct FakeConnector {
        pub recorder: Arc<Recorder>,
        pub refuse: Option<String>,
        pub fail_write: Option<String>,
        /// Progress steps reported per write, as (written, total).
        pub steps: Vec<(usize, usize)>,
    }

    impl Connector for FakeConnector {
        fn select_endpoint(&self, hint: Option<&str>) -> Result<String, SessionError> {
            match &self.refuse {
                Some(msg) => Err(SessionError::Connect(msg.clone())),
                None => Ok(hint.unwrap_or("/dev/ttyACM0").to_string()),
            }
        }

        fn open(&self, endpoint: &str) -> Result<Opened, SessionError> {
            Ok(Opened {
                programmer: Box::new(FakeProgrammer {
                    recorder: self.recorder.clone(),
                    fail_write: self.fail_write.clone(),
                    steps: self.steps.clone(),
                }),
                description: format!("ESP32-S3 on {endpoint}"),
            })
        }
    }

    struct FakeProgrammer {
        recorder: Arc<Recorder>,
        fail_write: Option<String>,
        steps: Vec<(usize, usize)>,
    }

    impl Programmer for FakeProgrammer {
        fn write_flash(
            &mut self,
            job: &WriteJob,
            progress: &mut dyn FnMut(usize, usize),
        ) -> Result<(), SessionError> {
            self.recorder.writes.fetch_add(1, Ordering::SeqCst);
            for &(w, t) in &self.steps {
                progress(w, t);
            }
            if let Some(msg) = &self.fail_write {
                return Err(SessionError::Write(msg.clone()));
            }
            let mut written = self.recorder.written.lock().unwrap();
            for s in &job.segments {
                written.push((s.address, s.image.as_bytes().to_vec()));
            }
            Ok(())
        }

        fn hard_reset(&mut self) -> Result<(), SessionError> {
            self.recorder.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn open_log_stream(&mut self) -> Result<LogStream, SessionError> {
            let (device, host) = tokio::io::duplex(256);
            self.recorder.log_devices.lock().unwrap().push(device);
            Ok(Box::new(host))
        }

        fn close(self: Box<Self>) -> Result<(), SessionError> {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
