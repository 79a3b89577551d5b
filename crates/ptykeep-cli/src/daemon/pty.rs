//! PTY process plumbing on portable-pty.
//!
//! Blocking reader/writer threads bridge the PTY to tokio channels so the
//! registry's per-session pump stays event-driven.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Map a signal name ("TERM", "SIGKILL", "int") to its POSIX number.
pub fn signal_by_name(name: &str) -> Option<i32> {
    let upper = name.trim().to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    match short {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "KILL" => Some(libc::SIGKILL),
        "TERM" => Some(libc::SIGTERM),
        "USR1" => Some(libc::SIGUSR1),
        "USR2" => Some(libc::SIGUSR2),
        "STOP" => Some(libc::SIGSTOP),
        "CONT" => Some(libc::SIGCONT),
        "WINCH" => Some(libc::SIGWINCH),
        _ => None,
    }
}

/// A freshly spawned PTY child, not yet wired for async I/O.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    size: TermSize,
}

impl PtyProcess {
    /// Spawn a command in a new PTY. An empty command runs the default
    /// shell (`$SHELL`, falling back to `/bin/sh`).
    pub fn spawn(command: &[String], size: TermSize, cwd: Option<&str>) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("Failed to open PTY")?;

        let mut cmd = if command.is_empty() {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            CommandBuilder::new(shell)
        } else {
            let mut cmd = CommandBuilder::new(&command[0]);
            if command.len() > 1 {
                cmd.args(&command[1..]);
            }
            cmd
        };

        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn command")?;

        Ok(Self {
            master: pair.master,
            child,
            size,
        })
    }

    fn reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
    }

    fn writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master
            .take_writer()
            .context("Failed to take PTY writer")
    }
}

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Async handle over a PTY child process.
///
/// Output arrives on the receiver returned by [`AsyncPtyHandle::new`];
/// the channel closing means the PTY reached EOF (the process exited or
/// closed its terminal).
pub struct AsyncPtyHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    child: std::sync::Mutex<Box<dyn Child + Send + Sync>>,
    size: std::sync::Mutex<TermSize>,
    /// OS process id of the child, for signal delivery.
    pid: Option<u32>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
    writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl AsyncPtyHandle {
    /// Wire a spawned PTY for async I/O.
    ///
    /// Returns the handle and the output receiver. The receiver is handed
    /// to exactly one consumer (the registry's pump task).
    pub fn new(process: PtyProcess) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let reader = process.reader()?;
        let writer = process.writer()?;
        let initial_size = process.size;
        let pid = process.child.process_id();

        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_tx, read_rx) = mpsc::channel::<Vec<u8>>(64);

        let reader_shutdown = shutdown.clone();
        let reader_thread = std::thread::spawn(move || {
            Self::reader_loop(reader, read_tx, reader_shutdown);
        });

        let writer_thread = std::thread::spawn(move || {
            Self::writer_loop(writer, write_rx);
        });

        let handle = Self {
            write_tx,
            shutdown,
            master: std::sync::Mutex::new(process.master),
            child: std::sync::Mutex::new(process.child),
            size: std::sync::Mutex::new(initial_size),
            pid,
            reader_thread: Some(reader_thread),
            writer_thread: Some(writer_thread),
        };

        Ok((handle, read_rx))
    }

    /// Resize the PTY; the kernel delivers SIGWINCH to the child.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .map_err(|_| anyhow::anyhow!("Master PTY mutex poisoned"))?
            .resize(size.into())
            .context("Failed to resize PTY")?;
        *self
            .size
            .lock()
            .map_err(|_| anyhow::anyhow!("Size mutex poisoned"))? = size;
        Ok(())
    }

    pub fn size(&self) -> TermSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    /// Send bytes to the PTY stdin.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_tx
            .send(data.to_vec())
            .await
            .context("Failed to send to PTY input channel")
    }

    /// Deliver a POSIX signal to the child process.
    pub fn send_signal(&self, signal: i32) -> Result<()> {
        let pid = self
            .pid
            .context("Child process id unavailable")?;
        // SAFETY: kill(2) with a validated pid and signal number only
        // delivers the signal; no memory is touched.
        let rc = unsafe { libc::kill(pid as i32, signal) };
        if rc != 0 {
            // ESRCH means the process is already gone, which callers
            // treat as success.
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err).context("kill failed");
        }
        Ok(())
    }

    /// Check if the child process has exited without blocking.
    pub fn has_exited(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .map(|status| status.is_some())
            .unwrap_or(false)
    }

    /// Exit code of the child, if it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .flatten()
            .map(|status| status.exit_code() as i32)
    }

    /// Kill the child and stop the I/O threads.
    pub fn shutdown(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!("Failed to kill child (may have already exited): {}", e);
            }
            // Reap the exit status to prevent a zombie.
            if let Err(e) = child.try_wait() {
                debug!("Failed to collect child exit status: {}", e);
            }
        }

        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        read_tx: mpsc::Sender<Vec<u8>>,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                debug!("PTY reader shutdown");
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if read_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!("PTY read channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => {
                    warn!("PTY read error: {}", e);
                    break;
                }
            }
        }
    }

    fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                error!("PTY write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush() {
                error!("PTY flush error: {}", e);
                break;
            }
        }
        debug!("PTY writer exiting");
    }
}

impl Drop for AsyncPtyHandle {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!("Failed to kill child on drop (may have already exited): {}", e);
            }
            if let Err(e) = child.try_wait() {
                debug!("Failed to collect child exit status on drop: {}", e);
            }
        }

        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);

        // The reader thread may be blocked in a synchronous read; it
        // terminates when the PTY fd closes, so we don't join here.
        if let Some(ref handle) = self.reader_thread {
            if !handle.is_finished() {
                debug!("PTY reader thread still running on drop, will terminate on PTY close");
            }
        }
        if let Some(ref handle) = self.writer_thread {
            if !handle.is_finished() {
                debug!("PTY writer thread still running on drop, will terminate on channel close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn spawn_echo_and_read_output() {
        let process = PtyProcess::spawn(
            &["echo".to_string(), "hello".to_string()],
            TermSize::default(),
            None,
        )
        .expect("Failed to spawn echo");

        let (_handle, mut output) = AsyncPtyHandle::new(process).expect("async handle");

        let mut collected = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while let Some(chunk) = output.recv().await {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains("hello") {
                    break;
                }
            }
        })
        .await;

        assert!(
            collected.contains("hello"),
            "Expected 'hello' in output, got: {:?}",
            collected
        );
    }

    #[tokio::test]
    async fn spawn_with_cwd() {
        let dir = std::env::temp_dir();
        let process = PtyProcess::spawn(
            &["pwd".to_string()],
            TermSize::default(),
            Some(dir.to_str().unwrap()),
        )
        .expect("Failed to spawn pwd");

        let (_handle, mut output) = AsyncPtyHandle::new(process).expect("async handle");

        let mut collected = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while let Some(chunk) = output.recv().await {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains('\n') {
                    break;
                }
            }
        })
        .await;

        // Temp dir may resolve through symlinks; just check a path came back.
        assert!(collected.contains('/'), "Expected a path, got: {:?}", collected);
    }

    #[tokio::test]
    async fn write_reaches_child() {
        let process = PtyProcess::spawn(&["cat".to_string()], TermSize::default(), None)
            .expect("Failed to spawn cat");
        let (handle, mut output) = AsyncPtyHandle::new(process).expect("async handle");

        handle.write(b"test input\n").await.expect("write");

        let mut collected = String::new();
        let _ = timeout(Duration::from_secs(2), async {
            while let Some(chunk) = output.recv().await {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains("test input") {
                    break;
                }
            }
        })
        .await;

        assert!(
            collected.contains("test input"),
            "Expected echo of input, got: {:?}",
            collected
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn signal_terminates_child() {
        let process = PtyProcess::spawn(&["cat".to_string()], TermSize::default(), None)
            .expect("Failed to spawn cat");
        let (handle, _output) = AsyncPtyHandle::new(process).expect("async handle");

        assert!(!handle.has_exited());
        handle.send_signal(libc::SIGKILL).expect("signal");

        // Give the kernel a moment to deliver and the reaper to observe.
        for _ in 0..50 {
            if handle.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.has_exited(), "child should be gone after SIGKILL");
    }

    #[tokio::test]
    async fn signal_after_exit_is_ok() {
        let process = PtyProcess::spawn(
            &["echo".to_string(), "bye".to_string()],
            TermSize::default(),
            None,
        )
        .expect("spawn");
        let (handle, _output) = AsyncPtyHandle::new(process).expect("async handle");

        for _ in 0..50 {
            if handle.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // ESRCH maps to Ok: signaling a dead session is a race, not a bug.
        assert!(handle.send_signal(libc::SIGTERM).is_ok());
    }

    #[test]
    fn signal_names_resolve() {
        assert_eq!(signal_by_name("TERM"), Some(libc::SIGTERM));
        assert_eq!(signal_by_name("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(signal_by_name("sigint"), Some(libc::SIGINT));
        assert_eq!(signal_by_name("KILL"), Some(libc::SIGKILL));
        assert_eq!(signal_by_name("NOPE"), None);
    }

    #[tokio::test]
    async fn resize_succeeds() {
        let process = PtyProcess::spawn(&["sh".to_string()], TermSize { cols: 80, rows: 24 }, None)
            .expect("spawn");
        let (handle, _output) = AsyncPtyHandle::new(process).expect("async handle");

        handle
            .resize(TermSize {
                cols: 120,
                rows: 40,
            })
            .expect("resize");
        assert_eq!(handle.size(), TermSize { cols: 120, rows: 40 });

        handle.shutdown();
    }
}
