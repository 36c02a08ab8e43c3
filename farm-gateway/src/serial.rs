/**
 * PORTS SÉRIE - Accès aux microcontrôleurs
 *
 * RÔLE :
 * Découverte et ouverture des ports série au démarrage, puis accès octet par
 * octet pour le relais (écriture) et l'ingesteur (lecture).
 *
 * FONCTIONNEMENT :
 * - SerialLink = trait minimal (disponible / lire / écrire) derrière lequel
 *   se cachent le vrai port (`serialport`) et le double de test
 * - SerialPorts = ensemble figé des ports ouverts, partagé entre tâches
 * - Chaque port est protégé par un `tokio::sync::Mutex` tenu pendant tout un
 *   envoi cadencé, pour qu'aucune trame ne soit entrelacée
 * - Les appels bloquants de `serialport` tournent sur le pool bloquant de
 *   tokio (spawn_blocking), jamais sur les threads de l'exécuteur
 *
 * RÈGLE : un seul écrivain (le relais), un seul lecteur (l'ingesteur).
 */

use crate::config::SerialConf;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("cannot enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("cannot open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("I/O failure on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("serial worker aborted: {0}")]
    Worker(#[source] tokio::task::JoinError),
}

/// Byte-level access to one serial line.
pub trait SerialLink: Send {
    fn name(&self) -> &str;

    /// Bytes waiting in the input buffer.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// `None` when the read timed out.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hardware port opened through `serialport`.
pub struct SerialDevice {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialDevice {
    pub fn open(name: &str, baudrate: u32) -> Result<Self, SerialError> {
        let open_err = |source| SerialError::Open { port: name.to_string(), source };
        let port = serialport::new(name, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(open_err)?;
        port.clear(serialport::ClearBuffer::All).map_err(open_err)?;
        Ok(Self { name: name.to_string(), port })
    }
}

impl SerialLink for SerialDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.port.write_all(&[byte])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

pub type PortHandle = Arc<Mutex<Box<dyn SerialLink>>>;

/// Fixed set of open ports, keyed by name.
#[derive(Clone, Default)]
pub struct SerialPorts {
    ports: Arc<Vec<(String, PortHandle)>>,
}

impl SerialPorts {
    pub fn new(links: Vec<Box<dyn SerialLink>>) -> Self {
        let ports = links
            .into_iter()
            .map(|link| (link.name().to_string(), Arc::new(Mutex::new(link))))
            .collect();
        Self { ports: Arc::new(ports) }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.ports.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PortHandle)> {
        self.ports.iter().map(|(name, handle)| (name.as_str(), handle))
    }
}

fn is_excluded(info: &serialport::SerialPortInfo, excluded: &[String]) -> bool {
    match &info.port_type {
        serialport::SerialPortType::UsbPort(usb) => usb
            .serial_number
            .as_deref()
            .is_some_and(|sn| excluded.iter().any(|ex| ex.trim().eq_ignore_ascii_case(sn.trim()))),
        _ => false,
    }
}

/// Opens every port whose name starts with the configured prefix.
pub fn open_matching(conf: &SerialConf) -> Result<SerialPorts, SerialError> {
    let available = serialport::available_ports().map_err(SerialError::Enumerate)?;
    let mut links: Vec<Box<dyn SerialLink>> = Vec::new();

    for info in available {
        if !info.port_name.starts_with(&conf.ports_prefix) {
            continue;
        }
        if is_excluded(&info, &conf.excluded_serial_numbers) {
            info!(port = %info.port_name, "skipping excluded serial device");
            continue;
        }
        let device = SerialDevice::open(&info.port_name, conf.baudrate)?;
        info!(port = %info.port_name, baudrate = conf.baudrate, "serial port initialized");
        links.push(Box::new(device));
    }

    if links.is_empty() {
        warn!(prefix = %conf.ports_prefix, "no serial port matched");
    }
    Ok(SerialPorts::new(links))
}

/// Runs `op` on the blocking pool with the port locked for its whole duration.
async fn with_link<T, F>(port: &PortHandle, op: F) -> Result<T, SerialError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn SerialLink) -> Result<T, SerialError> + Send + 'static,
{
    let mut link = port.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || op(&mut **link))
        .await
        .map_err(SerialError::Worker)?
}

fn io_err(link: &dyn SerialLink, source: io::Error) -> SerialError {
    SerialError::Io { port: link.name().to_string(), source }
}

/// Writes `frame` one byte at a time with `pacing` between bytes.
pub async fn write_paced(port: &PortHandle, frame: &[u8], pacing: Duration) -> Result<(), SerialError> {
    let frame = frame.to_vec();
    with_link(port, move |link| {
        for byte in frame {
            link.write_byte(byte).map_err(|e| io_err(&*link, e))?;
            std::thread::sleep(pacing);
        }
        link.flush().map_err(|e| io_err(&*link, e))
    })
    .await
}

/// Drains every buffered byte, pausing `pacing` between reads.
/// Returns `None` when nothing was waiting.
pub async fn drain_available(port: &PortHandle, pacing: Duration) -> Result<Option<Vec<u8>>, SerialError> {
    with_link(port, move |link| {
        let mut pending = link.bytes_available().map_err(|e| io_err(&*link, e))?;
        if pending == 0 {
            return Ok(None);
        }

        let mut raw = Vec::with_capacity(pending);
        while pending > 0 {
            match link.read_byte().map_err(|e| io_err(&*link, e))? {
                Some(byte) => raw.push(byte),
                None => break,
            }
            std::thread::sleep(pacing);
            pending = link.bytes_available().map_err(|e| io_err(&*link, e))?;
        }
        Ok(Some(raw))
    })
    .await
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    //! In-memory serial line for tests.

    use super::SerialLink;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    #[derive(Default)]
    struct Inner {
        inbound: VecDeque<u8>,
        written: Vec<u8>,
        fail_writes: bool,
    }

    /// Cloneable handle: the test keeps one clone, the gateway owns another.
    #[derive(Clone)]
    pub struct MockSerialPort {
        name: String,
        inner: Arc<Mutex<Inner>>,
    }

    impl MockSerialPort {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                inner: Arc::new(Mutex::new(Inner::default())),
            }
        }

        /// Queues bytes as if sent by the microcontroller.
        pub fn inject_read(&self, data: &[u8]) {
            self.inner.lock().inbound.extend(data);
        }

        pub fn written(&self) -> Vec<u8> {
            self.inner.lock().written.clone()
        }

        /// Makes every following write fail, like an unplugged device.
        pub fn fail_writes(&self, fail: bool) {
            self.inner.lock().fail_writes = fail;
        }

        pub fn boxed(&self) -> Box<dyn SerialLink> {
            Box::new(self.clone())
        }
    }

    impl SerialLink for MockSerialPort {
        fn name(&self) -> &str {
            &self.name
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.inner.lock().inbound.len())
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(self.inner.lock().inbound.pop_front())
        }

        fn write_byte(&mut self, byte: u8) -> io::Result<()> {
            let mut inner = self.inner.lock();
            if inner.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
            }
            inner.written.push(byte);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSerialPort;
    use super::*;

    #[tokio::test]
    async fn drain_returns_none_when_idle() {
        let mock = MockSerialPort::new("/dev/ttyACM0");
        let ports = SerialPorts::new(vec![mock.boxed()]);
        let (_, handle) = ports.iter().next().unwrap();
        assert_eq!(drain_available(handle, Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drain_collects_everything_buffered() {
        let mock = MockSerialPort::new("/dev/ttyACM0");
        mock.inject_read(&[1, 2, 3, 4]);
        let ports = SerialPorts::new(vec![mock.boxed()]);
        let (name, handle) = ports.iter().next().unwrap();
        assert_eq!(name, "/dev/ttyACM0");
        assert_eq!(drain_available(handle, Duration::ZERO).await.unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(drain_available(handle, Duration::ZERO).await.unwrap(), None);
    }

    struct SlowLink;

    impl SerialLink for SlowLink {
        fn name(&self) -> &str {
            "/dev/ttySLOW"
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(0)
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(None)
        }

        fn write_byte(&mut self, _byte: u8) -> io::Result<()> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }
    }

    // single-threaded runtime: the ticker only advances if the write is off it
    #[tokio::test]
    async fn slow_port_does_not_stall_the_runtime() {
        let ports = SerialPorts::new(vec![Box::new(SlowLink) as Box<dyn SerialLink>]);
        let (_, handle) = ports.iter().next().unwrap();
        let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        });

        write_paced(handle, &[1, 2, 3], Duration::ZERO).await.unwrap();
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
        ticker.abort();
    }

    #[tokio::test]
    async fn paced_write_reports_port_on_failure() {
        let mock = MockSerialPort::new("/dev/ttyACM1");
        let ports = SerialPorts::new(vec![mock.boxed()]);
        let (_, handle) = ports.iter().next().unwrap();

        write_paced(handle, &[0xAA, 0xBB], Duration::ZERO).await.unwrap();
        assert_eq!(mock.written(), vec![0xAA, 0xBB]);

        mock.fail_writes(true);
        let err = write_paced(handle, &[0xCC], Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SerialError::Io { ref port, .. } if port == "/dev/ttyACM1"));
    }
}
