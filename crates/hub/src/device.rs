//! Byte-level link to the sensor/actuator board.
//!
//! A [`DeviceLink`] is a pair of channels: inbound lines and outbound command
//! lines. It can be backed by a serial port (the `serial` feature), by the
//! stdio of a child process such as the board emulator, or by any async
//! reader/writer pair.

#[cfg(test)]
use parking_lot::Mutex;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const LINE_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 16;

// ---------------------------------------------------------------------------
// Link halves
// ---------------------------------------------------------------------------

pub struct DeviceLink {
    pub lines: LineStream,
    pub commands: CommandSink,
}

/// Inbound records, one per line, newline included. `None` means the device
/// closed the stream.
pub struct LineStream {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    /// Background work tied to this link; aborted when the stream is dropped.
    tasks: Vec<JoinHandle<()>>,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct Outgoing {
    line: String,
    ack: oneshot::Sender<io::Result<()>>,
}

#[derive(Clone)]
pub struct CommandSink {
    tx: mpsc::Sender<Outgoing>,
}

impl CommandSink {
    /// Write one line and wait for the writer to report the outcome.
    pub async fn send(&self, line: String) -> io::Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outgoing { line, ack })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device link closed")
}

// ---------------------------------------------------------------------------
// Async stream backend
// ---------------------------------------------------------------------------

impl DeviceLink {
    /// Build a link over an async reader/writer pair. Must be called inside a
    /// tokio runtime.
    pub fn from_stream<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Outgoing>(COMMAND_QUEUE);

        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line_tx.send(Ok(buf)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = line_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(out) = cmd_rx.recv().await {
                let res = async {
                    writer.write_all(out.line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                let _ = out.ack.send(res);
            }
        });

        Self {
            lines: LineStream {
                rx: line_rx,
                tasks: vec![reader_task],
            },
            commands: CommandSink { tx: cmd_tx },
        }
    }
}

// ---------------------------------------------------------------------------
// Serial backend
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
impl DeviceLink {
    /// Open a serial port and pump it from two plain threads. Blocking; run
    /// it under `spawn_blocking`.
    pub fn open_serial(path: &str, baud_rate: u32) -> io::Result<Self> {
        use std::io::{BufRead, Write};
        use std::time::Duration;

        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(250))
            .open()?;
        let mut out_port = port.try_clone()?;

        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Outgoing>(COMMAND_QUEUE);

        std::thread::spawn(move || {
            let mut reader = std::io::BufReader::new(port);
            let mut buf = Vec::new();
            loop {
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = std::mem::take(&mut buf);
                        if line_tx.blocking_send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    // partial line stays in buf until the rest arrives
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        if line_tx.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = line_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        std::thread::spawn(move || {
            while let Some(out) = cmd_rx.blocking_recv() {
                let res = out_port
                    .write_all(out.line.as_bytes())
                    .and_then(|_| out_port.flush());
                let _ = out.ack.send(res);
            }
        });

        Ok(Self {
            lines: LineStream {
                rx: line_rx,
                tasks: Vec::new(),
            },
            commands: CommandSink { tx: cmd_tx },
        })
    }
}

// ---------------------------------------------------------------------------
// Child process backend
// ---------------------------------------------------------------------------

impl DeviceLink {
    /// Spawn `program` and use its stdout/stdin as the link. The process is
    /// killed when the link's line stream is dropped.
    pub fn spawn_process(program: &str, args: &[String]) -> io::Result<Self> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;

        let mut link = Self::from_stream(stdout, stdin);
        let program = program.to_string();
        link.lines.tasks.push(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(%program, %status, "device process exited"),
                Err(e) => warn!(%program, error = %e, "failed to wait on device process"),
            }
        }));
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Source selection
// ---------------------------------------------------------------------------

/// Where the pipeline gets its device link from.
pub enum DeviceSource {
    /// No device configured; the pipeline runs on synthetic data.
    Absent,
    Serial { path: String, baud_rate: u32 },
    /// A child process speaking the protocol over stdio.
    Process { program: String, args: Vec<String> },
    /// A pre-built link, handed out once.
    #[cfg(test)]
    Link(Mutex<Option<DeviceLink>>),
}

impl DeviceSource {
    #[cfg(test)]
    pub fn link(link: DeviceLink) -> Self {
        Self::Link(Mutex::new(Some(link)))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Absent => "none".to_string(),
            Self::Serial { path, baud_rate } => format!("{path}@{baud_rate}"),
            Self::Process { program, .. } => format!("process {program}"),
            #[cfg(test)]
            Self::Link(_) => "in-process link".to_string(),
        }
    }

    pub async fn connect(&self) -> io::Result<DeviceLink> {
        match self {
            Self::Absent => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no device configured",
            )),
            Self::Serial { path, baud_rate } => open_serial(path.clone(), *baud_rate).await,
            Self::Process { program, args } => DeviceLink::spawn_process(program, args),
            #[cfg(test)]
            Self::Link(slot) => slot.lock().take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "device link already used")
            }),
        }
    }
}

#[cfg(feature = "serial")]
async fn open_serial(path: String, baud_rate: u32) -> io::Result<DeviceLink> {
    tokio::task::spawn_blocking(move || DeviceLink::open_serial(&path, baud_rate))
        .await
        .map_err(io::Error::other)?
}

#[cfg(not(feature = "serial"))]
async fn open_serial(path: String, _baud_rate: u32) -> io::Result<DeviceLink> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("built without serial support, cannot open {path}"),
    ))
}

// ===========================================================================
// Tests
// ===========================================================================
