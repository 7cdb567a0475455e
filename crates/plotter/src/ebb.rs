//! EiBotBoard driver.
//!
//! Commands are CR-terminated ASCII lines; most are acknowledged with `OK`,
//! queries answer with a single line. A single I/O task owns the port and
//! serves requests one at a time, so transactions never interleave.

use std::time::Duration;

use async_trait::async_trait;
use shared::domain::{Motion, PenMotion};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::{DeviceError, Plotter};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Servo output used for the pen lift on the EBB.
const PEN_SERVO_PIN: u8 = 4;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const REQUEST_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    /// Read until the board acknowledges with `OK`.
    Ack,
    /// Return the first line the board sends back.
    Line,
}

struct Request {
    command: String,
    reply: Reply,
    /// Time this command keeps the motion FIFO busy once accepted.
    motion: Duration,
    respond: oneshot::Sender<Result<String, DeviceError>>,
}

pub struct EbbPlotter {
    requests: mpsc::Sender<Request>,
    closed: watch::Receiver<bool>,
}

impl EbbPlotter {
    /// Opens the serial port and starts its I/O task. Must be called from
    /// within a tokio runtime.
    pub fn open(path: &str, settings: &SerialSettings) -> Result<Self, DeviceError> {
        let port = tokio_serial::new(path, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DeviceError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        info!(%path, baud_rate = settings.baud_rate, "opened plotter serial port");
        Ok(Self::with_stream(path, port, settings.timeout))
    }

    /// Drives an already-open byte stream as an EBB link.
    pub fn with_stream<S>(path: &str, stream: S, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let (closed_tx, closed) = watch::channel(false);
        let link_path = path.to_string();
        tokio::spawn(async move {
            serve_link(stream, rx, timeout).await;
            info!(path = %link_path, "plotter link closed");
            closed_tx.send_replace(true);
        });
        Self {
            requests,
            closed,
        }
    }

    async fn request(
        &self,
        command: String,
        reply: Reply,
        motion: Duration,
    ) -> Result<String, DeviceError> {
        let (respond, response) = oneshot::channel();
        self.requests
            .send(Request {
                command,
                reply,
                motion,
                respond,
            })
            .await
            .map_err(|_| DeviceError::Disconnected)?;
        response.await.map_err(|_| DeviceError::Disconnected)?
    }

    async fn command(&self, command: String) -> Result<(), DeviceError> {
        self.motion_command(command, Duration::ZERO).await
    }

    async fn motion_command(&self, command: String, motion: Duration) -> Result<(), DeviceError> {
        self.request(command, Reply::Ack, motion).await.map(|_| ())
    }

    async fn query(&self, command: &str) -> Result<String, DeviceError> {
        self.request(command.to_string(), Reply::Line, Duration::ZERO)
            .await
    }

    async fn execute_pen_motion(&self, pen: &PenMotion) -> Result<(), DeviceError> {
        let delay_ms = duration_ms(pen.duration);
        self.motion_command(
            format!(
                "S2,{},{PEN_SERVO_PIN},{},{delay_ms}",
                pen.final_pos,
                pen_rate(pen)
            ),
            Duration::from_millis(delay_ms.into()),
        )
        .await
    }
}

#[async_trait]
impl Plotter for EbbPlotter {
    async fn enable_motors(&self, microstepping_mode: u8) -> Result<(), DeviceError> {
        self.command(format!("EM,{microstepping_mode},{microstepping_mode}"))
            .await
    }

    async fn disable_motors(&self) -> Result<(), DeviceError> {
        self.command("EM,0,0".to_string()).await
    }

    async fn set_pen_height(&self, height: u16, rate: u16) -> Result<(), DeviceError> {
        self.command(format!("S2,{height},{PEN_SERVO_PIN},{rate}"))
            .await
    }

    async fn execute_motion(&self, motion: &Motion) -> Result<(), DeviceError> {
        match motion {
            Motion::Pen(pen) => self.execute_pen_motion(pen).await,
            Motion::Xy(xy) => {
                for segment in &xy.segments {
                    let [axis1, axis2] = segment.steps;
                    let ms = duration_ms(segment.duration).max(1);
                    self.motion_command(
                        format!("SM,{ms},{axis1},{axis2}"),
                        Duration::from_millis(ms.into()),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn wait_until_motors_idle(&self) -> Result<(), DeviceError> {
        loop {
            let status = self.query("QM").await?;
            if motors_idle(&status) {
                return Ok(());
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// The board acknowledges a command only once the move ahead of it has left
/// its one-deep FIFO, so each deadline is `timeout` plus whatever remains of
/// the last accepted move.
async fn serve_link<S>(mut stream: S, mut requests: mpsc::Receiver<Request>, timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    let mut scratch = [0u8; 256];
    let mut fifo_busy_until = Instant::now();
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    debug!("plotter handle dropped; closing link");
                    return;
                };
                let queued = fifo_busy_until.saturating_duration_since(Instant::now());
                let window = timeout + queued;
                let result = transact(&mut stream, &mut pending, &request.command, request.reply, window).await;
                let fatal = matches!(result, Err(DeviceError::Io(_) | DeviceError::Disconnected));
                let timed_out = matches!(result, Err(DeviceError::Timeout { .. }));
                match &result {
                    Ok(_) if !request.motion.is_zero() => {
                        fifo_busy_until = Instant::now() + request.motion;
                    }
                    Ok(_) => {}
                    Err(error) => warn!(command = %request.command, %error, "plotter command failed"),
                }
                let _ = request.respond.send(result);
                if fatal {
                    return;
                }
                if timed_out && !drain_late_replies(&mut stream, window).await {
                    return;
                }
            }
            read = stream.read(&mut scratch) => match read {
                Ok(0) => return,
                Ok(n) => debug!(bytes = n, "discarding unsolicited plotter output"),
                Err(error) => {
                    warn!(%error, "plotter link read failed");
                    return;
                }
            },
        }
    }
}

/// Discards input until the link stays quiet for `quiet`, so a late reply to a
/// timed-out command is never read as the answer to the next one. Returns
/// `false` once the link has closed.
async fn drain_late_replies<S>(stream: &mut S, quiet: Duration) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    loop {
        match tokio::time::timeout(quiet, stream.read(&mut scratch)).await {
            Err(_) => return true,
            Ok(Ok(0)) => return false,
            Ok(Ok(n)) => debug!(bytes = n, "discarding late plotter reply"),
            Ok(Err(error)) => {
                warn!(%error, "plotter link read failed");
                return false;
            }
        }
    }
}

async fn transact<S>(
    stream: &mut S,
    pending: &mut Vec<u8>,
    command: &str,
    reply: Reply,
    timeout: Duration,
) -> Result<String, DeviceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pending.clear();
    stream.write_all(format!("{command}\r").as_bytes()).await?;
    stream.flush().await?;

    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    loop {
        while let Some(line) = take_line(pending) {
            if line.starts_with('!') {
                return Err(DeviceError::Rejected {
                    command: command.to_string(),
                    response: line,
                });
            }
            match reply {
                Reply::Line => return Ok(line),
                Reply::Ack if line == "OK" => return Ok(lines.join("\n")),
                Reply::Ack => lines.push(line),
            }
        }

        let mut scratch = [0u8; 256];
        let read = tokio::time::timeout_at(deadline, stream.read(&mut scratch))
            .await
            .map_err(|_| DeviceError::Timeout {
                command: command.to_string(),
                timeout,
            })??;
        if read == 0 {
            return Err(DeviceError::Disconnected);
        }
        pending.extend_from_slice(&scratch[..read]);
    }
}

/// Pops the next non-empty line; the EBB ends lines with `\r\n` or `\n\r`.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    loop {
        let end = pending.iter().position(|b| *b == b'\r' || *b == b'\n')?;
        let line: Vec<u8> = pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&line).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
}

/// `QM,<command>,<motor1>,<motor2>[,<fifo>]`; idle when every flag is zero.
fn motors_idle(status: &str) -> bool {
    let mut fields = status.split(',');
    fields.next() == Some("QM") && fields.all(|flag| flag.trim() == "0")
}

fn duration_ms(seconds: f64) -> u32 {
    (seconds * 1000.0).round().clamp(0.0, u32::MAX as f64) as u32
}

/// Servo slew rate in position units per 24 ms; 0 lets the servo move at full speed.
fn pen_rate(pen: &PenMotion) -> u16 {
    if pen.duration <= 0.0 {
        return 0;
    }
    let distance = f64::from(pen.initial_pos.abs_diff(pen.final_pos));
    let per_tick = distance / (pen.duration / 0.024);
    per_tick.round().clamp(1.0, f64::from(u16::MAX)) as u16
}

#[cfg(test)]
#[path = "tests/ebb_tests.rs"]
mod tests;
