//! Pseudo terminal transport
//!
//! A reader thread blocks on the pty master and hands chunks to the main loop through a
//! [`Mailbox`]; the console task feeds them to the protocol engine. Responses are written to the
//! master directly from whichever context sends them.
use crate::{State, KEEL_ENGINE, SCHED};
use anyhow::{Context as _, Result};
use keel::mailbox::{Receiver, Sender};
use keel::*;
use nix::errno::Errno;
use nix::sys::termios::{self, SetArg};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, Thread};
use std::time::Duration;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64;
const RX_BUFFER_SIZE: usize = 8 * CHUNK_SIZE;

/// Bytes read from the pty in one call
pub(crate) struct Chunk {
    data: [u8; CHUNK_SIZE],
    len: usize,
}

impl Chunk {
    fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

pub(crate) struct SerialEmulator {
    master: RawFd,
    slave: RawFd,
}

impl SerialEmulator {
    pub(crate) fn new() -> Result<Self> {
        let ptys = nix::pty::openpty(None, None).context("Could not allocate pty")?;
        let mut attrs = termios::tcgetattr(ptys.slave)?;
        termios::cfmakeraw(&mut attrs);
        termios::tcsetattr(ptys.slave, SetArg::TCSANOW, &attrs)?;
        Ok(SerialEmulator {
            master: ptys.master,
            slave: ptys.slave,
        })
    }

    pub(crate) fn ttyname(&self) -> Result<PathBuf> {
        Ok(nix::unistd::ttyname(self.slave)?)
    }

    /// Points `link` at the slave side, replacing a stale link from a previous run
    pub(crate) fn link(&self, link: &Path) -> Result<()> {
        let target = self.ttyname()?;
        match std::fs::remove_file(link) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).with_context(|| format!("Could not remove {}", link.display()))
            }
            _ => {}
        }
        std::os::unix::fs::symlink(&target, link)
            .with_context(|| format!("Could not link {}", link.display()))?;
        info!("serial port {} linked at {}", target.display(), link.display());
        Ok(())
    }

    pub(crate) fn master(&self) -> RawFd {
        self.master
    }
}

impl Drop for SerialEmulator {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.master);
        let _ = nix::unistd::close(self.slave);
    }
}

/// Starts the thread reading host bytes, waking `main` for every chunk
pub(crate) fn spawn_reader(
    fd: RawFd,
    mut tx: Sender<'static, Chunk>,
    main: Thread,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || loop {
            let mut chunk = Chunk {
                data: [0; CHUNK_SIZE],
                len: 0,
            };
            match nix::unistd::read(fd, &mut chunk.data) {
                Ok(0) | Err(Errno::EIO) => {
                    // No host attached to the slave side yet
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => {
                    warn!("pty read failed: {}", e);
                    return;
                }
                Ok(n) => chunk.len = n,
            }
            while let Err(back) = tx.try_send(chunk) {
                chunk = back;
                main.unpark();
                thread::sleep(Duration::from_micros(100));
            }
            SCHED.wake_tasks();
            main.unpark();
        })?;
    Ok(handle)
}

/// Receive side of the console, owned by the main loop
pub(crate) struct Console {
    rx: Receiver<'static, Chunk>,
    buffer: FifoBuffer<RX_BUFFER_SIZE>,
}

impl Console {
    pub(crate) fn new(rx: Receiver<'static, Chunk>) -> Self {
        Console {
            rx,
            buffer: FifoBuffer::new(),
        }
    }

    /// Moves waiting chunks into the receive buffer while a whole chunk fits
    fn fill(&mut self) {
        while RX_BUFFER_SIZE - self.buffer.len() >= CHUNK_SIZE {
            match self.rx.try_recv() {
                Some(chunk) => {
                    self.buffer.extend(chunk.data());
                }
                None => break,
            }
        }
    }
}

/// Main loop task: decode and dispatch whatever the host sent
pub(crate) fn console_task(state: &mut State) -> Result<(), Shutdown> {
    state.console.fill();
    if state.console.buffer.is_empty() {
        return Ok(());
    }
    let mut buffer = std::mem::take(&mut state.console.buffer);
    let result = KEEL_ENGINE.receive(&mut buffer, state);
    state.console.buffer = buffer;
    if state.console.rx.is_full() {
        SCHED.wake_tasks();
    }
    result
}

static OUTPUT_FD: Mutex<Option<RawFd>> = Mutex::new(None);

pub(crate) fn set_output(fd: RawFd) {
    if let Ok(mut out) = OUTPUT_FD.lock() {
        *out = Some(fd);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PtyOutput;

impl TransportOutput for PtyOutput {
    type Output = ScratchOutput;

    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        let mut scratch = ScratchOutput::new();
        f(&mut scratch);
        let fd = match OUTPUT_FD.lock() {
            Ok(fd) => *fd,
            Err(_) => None,
        };
        let (fd, mut data) = match fd {
            Some(fd) => (fd, scratch.result()),
            None => return,
        };
        while !data.is_empty() {
            match nix::unistd::write(fd, data) {
                Ok(n) => data = &data[n..],
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => {
                    warn!("pty write failed: {}", e);
                    return;
                }
            }
        }
        debug!("sent {} byte frame", scratch.result().len());
    }
}

pub(crate) const TRANSPORT_OUTPUT: PtyOutput = PtyOutput;
