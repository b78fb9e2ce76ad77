//! NTP clock offset service.
//!
//! # Responsibilities
//! - Query an NTP server over SNTP on an interval
//! - Record the local clock offset for time-sensitive protocols
//!
//! # Design Decisions
//! - `recreate` replaces the running service; there is never more than one
//! - Writing the offset to the system clock is not supported and only logged

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;
const PACKET_LEN: usize = 48;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NtpError {
    #[error("ntp io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ntp query timed out")]
    Timeout,
    #[error("malformed ntp response: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpSettings {
    pub server: String,
    pub port: u16,
    pub interval: Duration,
    pub dialer_proxy: String,
    pub write_to_system: bool,
}

pub trait NtpControl: Send + Sync {
    /// Stop any running service and start a new one.
    fn recreate(&self, settings: NtpSettings);
    fn stop(&self);
    fn is_running(&self) -> bool;
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct NtpService {
    running: Mutex<Option<Running>>,
    offset_ms: Arc<AtomicI64>,
    synced: Arc<AtomicBool>,
}

impl NtpService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last measured offset in milliseconds (server minus local), if a sync succeeded.
    pub fn offset_millis(&self) -> Option<i64> {
        if !self.synced.load(Ordering::Relaxed) {
            return None;
        }
        Some(self.offset_ms.load(Ordering::Relaxed))
    }
}

impl NtpControl for NtpService {
    fn recreate(&self, settings: NtpSettings) {
        self.stop();

        if settings.write_to_system {
            tracing::warn!("[NTP] writing to the system clock is not supported, offset is kept in process");
        }
        if !settings.dialer_proxy.is_empty() {
            tracing::debug!(proxy = %settings.dialer_proxy, "[NTP] dialer proxy is not used for NTP queries");
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let offset_ms = self.offset_ms.clone();
        let synced = self.synced.clone();
        let interval = settings.interval.max(Duration::from_secs(60));

        let task = tokio::spawn(async move {
            tracing::info!(server = %settings.server, port = settings.port, "[NTP] service started");
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match query(&settings.server, settings.port).await {
                            Ok(offset) => {
                                offset_ms.store((offset * 1000.0) as i64, Ordering::Relaxed);
                                synced.store(true, Ordering::Relaxed);
                                tracing::debug!(offset_secs = offset, "[NTP] clock offset updated");
                            }
                            Err(e) => {
                                tracing::warn!(server = %settings.server, error = %e, "[NTP] sync failed");
                            }
                        }
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }
        });

        *self.running.lock() = Some(Running {
            stop: stop_tx,
            task,
        });
    }

    fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.stop.send(());
            running.task.abort();
            tracing::info!("[NTP] service stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn build_request() -> [u8; PACKET_LEN] {
    let mut buf = [0u8; PACKET_LEN];
    // LI = 0, VN = 4, Mode = 3 (client)
    buf[0] = 0x23;
    buf
}

fn read_timestamp(buf: &[u8]) -> f64 {
    let secs = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64;
    let frac = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as f64 / 4_294_967_296.0;
    secs + frac - NTP_UNIX_DELTA
}

/// Clock offset in seconds from a server reply.
/// `sent` and `received` are local Unix times around the exchange.
fn parse_response(buf: &[u8], sent: f64, received: f64) -> Result<f64, NtpError> {
    if buf.len() < PACKET_LEN {
        return Err(NtpError::Malformed("short packet"));
    }
    if buf[0] & 0x07 != 4 {
        return Err(NtpError::Malformed("not a server reply"));
    }
    if buf[1] == 0 {
        return Err(NtpError::Malformed("kiss-o'-death"));
    }
    let server_rx = read_timestamp(&buf[32..40]);
    let server_tx = read_timestamp(&buf[40..48]);
    Ok(((server_rx - sent) + (server_tx - received)) / 2.0)
}

async fn query(server: &str, port: u16) -> Result<f64, NtpError> {
    let addr: SocketAddr = tokio::net::lookup_host((server, port))
        .await?
        .next()
        .ok_or(NtpError::Malformed("server did not resolve"))?;
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;

    let sent = unix_now();
    socket.send_to(&build_request(), addr).await?;

    let mut buf = [0u8; 512];
    let n = match time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(res) => res?,
        Err(_) => return Err(NtpError::Timeout),
    };
    parse_response(&buf[..n], sent, unix_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_timestamp(buf: &mut [u8], unix: f64) {
        let ntp = unix + NTP_UNIX_DELTA;
        let secs = ntp.trunc() as u32;
        let frac = (ntp.fract() * 4_294_967_296.0) as u32;
        buf[..4].copy_from_slice(&secs.to_be_bytes());
        buf[4..8].copy_from_slice(&frac.to_be_bytes());
    }

    fn reply(rx: f64, tx: f64) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[0] = 0x24;
        buf[1] = 2;
        write_timestamp(&mut buf[32..40], rx);
        write_timestamp(&mut buf[40..48], tx);
        buf
    }

    #[test]
    fn test_offset_from_reply() {
        // Server clock runs 10s ahead, 1s round trip.
        let sent = 1_700_000_000.0;
        let received = sent + 1.0;
        let buf = reply(sent + 10.5, sent + 10.5);
        let offset = parse_response(&buf, sent, received).unwrap();
        assert!((offset - 10.0).abs() < 0.001, "offset = {offset}");
    }

    #[test]
    fn test_rejects_bad_replies() {
        assert!(parse_response(&[0u8; 10], 0.0, 0.0).is_err());

        let mut client_mode = reply(0.0, 0.0);
        client_mode[0] = 0x23;
        assert!(parse_response(&client_mode, 0.0, 0.0).is_err());

        let mut kod = reply(0.0, 0.0);
        kod[1] = 0;
        assert!(parse_response(&kod, 0.0, 0.0).is_err());
    }

    #[tokio::test]
    async fn test_recreate_and_stop() {
        let svc = NtpService::new();
        svc.recreate(NtpSettings {
            server: "127.0.0.1".into(),
            port: 9,
            interval: Duration::from_secs(3600),
            dialer_proxy: String::new(),
            write_to_system: false,
        });
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
        assert_eq!(svc.offset_millis(), None);
    }
}
