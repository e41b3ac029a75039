//! In-process display server
//!
//! Runs on its own thread and talks to the client the way a real server
//! would: RPC calls arrive as commands, buffers go back as records with a
//! shared-memory descriptor over a Unix socket.

use crate::config::{Config, Protocol};
use nix::sys::memfd::{memfd_create, MFdFlags};
use sluice::{Completion, DisplayServer, StreamError};
use sluice_ipc::{
    write_record, BufferAllocation, BufferRecord, BufferRelease, BufferRequest, BufferStreamId,
    BufferStreamReply, ChannelError, PixelFormat, ScreencastId, Size, StreamConfiguration,
};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

const STREAM_ID: BufferStreamId = BufferStreamId(1);

enum Command {
    Submit(BufferRequest, Completion<()>),
    Allocate(BufferAllocation, Completion<()>),
    Release(BufferRelease, Completion<()>),
    Configure(StreamConfiguration, Completion<()>),
    Screencast(ScreencastId, Completion<BufferRecord>),
}

impl Command {
    /// Complete the call without running it
    fn fail(self) {
        match self {
            Self::Submit(_, done)
            | Self::Allocate(_, done)
            | Self::Release(_, done)
            | Self::Configure(_, done) => done(Err(StreamError::Disconnected)),
            Self::Screencast(_, done) => done(Err(StreamError::Disconnected)),
        }
    }
}

/// Client handle of the loopback server
pub struct LoopbackServer {
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl LoopbackServer {
    /// Start the server thread and create one stream on it.
    ///
    /// Returns the creation reply and the client end of the buffer socket.
    pub fn start(config: &Config) -> io::Result<(Arc<Self>, BufferStreamReply, UnixStream)> {
        let (server_end, client_end) = UnixStream::pair()?;
        let mut compositor = Compositor {
            socket: server_end,
            protocol: config.demo.protocol,
            latency: Duration::from_millis(config.demo.server_latency_ms),
            size: config.stream.ideal_size,
            format: config.demo.pixel_format,
            next_id: 1,
            buffers: HashMap::new(),
            held: VecDeque::new(),
        };

        let first = match config.demo.protocol {
            Protocol::PingPong => {
                for _ in 0..config.stream.buffer_count.max(2) {
                    let id = compositor.allocate(compositor.size)?;
                    compositor.held.push_back(id);
                }
                let first = compositor.held.pop_front();
                first.map(|id| compositor.record_for(id)).transpose()?
            }
            Protocol::Vault => None,
        };

        let reply = BufferStreamReply {
            id: Some(STREAM_ID),
            pixel_format: config.demo.pixel_format,
            usage: config.stream.usage,
            buffer: first,
            error: None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("sluice-loopback".into())
            .spawn(move || compositor.run(rx))?;

        info!(
            "Loopback server started ({:?}, {:?})",
            config.demo.protocol, config.stream.ideal_size
        );
        Ok((
            Arc::new(Self {
                commands: Mutex::new(Some(tx)),
            }),
            reply,
            client_end,
        ))
    }

    /// Stop the server thread; the client sees the buffer socket close
    pub fn shutdown(&self) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn send(&self, command: Command) {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let rejected = match commands.as_ref() {
            Some(tx) => tx.send(command).err().map(|e| e.0),
            None => Some(command),
        };
        drop(commands);
        if let Some(command) = rejected {
            command.fail();
        }
    }
}

impl DisplayServer for LoopbackServer {
    fn submit_buffer(&self, request: BufferRequest, done: Completion<()>) {
        self.send(Command::Submit(request, done));
    }

    fn allocate_buffers(&self, request: BufferAllocation, done: Completion<()>) {
        self.send(Command::Allocate(request, done));
    }

    fn release_buffers(&self, request: BufferRelease, done: Completion<()>) {
        self.send(Command::Release(request, done));
    }

    fn configure_buffer_stream(&self, configuration: StreamConfiguration, done: Completion<()>) {
        self.send(Command::Configure(configuration, done));
    }

    fn screencast_buffer(&self, id: ScreencastId, done: Completion<BufferRecord>) {
        self.send(Command::Screencast(id, done));
    }
}

// ============================================================================
// Server thread
// ============================================================================

fn memfd() -> io::Result<File> {
    let fd = memfd_create(c"sluice-buffer", MFdFlags::MFD_CLOEXEC)?;
    Ok(File::from(fd))
}

struct Compositor {
    socket: UnixStream,
    protocol: Protocol,
    latency: Duration,
    size: Size,
    format: PixelFormat,
    next_id: u32,
    buffers: HashMap<u32, (File, Size)>,
    /// Ping-pong buffers the server holds, oldest first
    held: VecDeque<u32>,
}

impl Compositor {
    fn allocate(&mut self, size: Size) -> io::Result<u32> {
        let file = memfd()?;
        let len = size.width as u64 * self.format.bytes_per_pixel() as u64 * size.height as u64;
        nix::unistd::ftruncate(&file, len as libc::off_t)?;

        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, (file, size));
        debug!("Allocated buffer {} ({:?}, {} bytes)", id, size, len);
        Ok(id)
    }

    fn record_for(&self, id: u32) -> io::Result<BufferRecord> {
        let (file, size) = self.buffers.get(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown buffer {id}"))
        })?;
        let stride = size.width * self.format.bytes_per_pixel();
        Ok(BufferRecord::new(id, *size, stride, self.format)
            .with_fds(vec![OwnedFd::from(file.try_clone()?)]))
    }

    fn send_buffer(&self, id: u32) -> Result<(), ChannelError> {
        let record = self.record_for(id)?;
        trace!("Sending buffer {}", id);
        write_record(&self.socket, &record)
    }

    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.blocking_recv() {
            if let Err(e) = self.handle(command) {
                error!("Loopback server failed: {}", e);
                break;
            }
        }
        info!("Loopback server stopped");
    }

    fn handle(&mut self, command: Command) -> Result<(), ChannelError> {
        match command {
            Command::Submit(request, done) => {
                done(Ok(()));
                // composition
                thread::sleep(self.latency);
                let returned = match self.protocol {
                    Protocol::PingPong => {
                        self.held.push_back(request.buffer_id);
                        self.held.pop_front().unwrap_or(request.buffer_id)
                    }
                    Protocol::Vault => request.buffer_id,
                };
                self.send_buffer(returned)?;
            }
            Command::Allocate(request, done) => {
                done(Ok(()));
                for params in request.buffer_requests {
                    let id = self.allocate(Size::new(params.width, params.height))?;
                    self.send_buffer(id)?;
                }
            }
            Command::Release(request, done) => {
                for id in &request.buffer_ids {
                    self.buffers.remove(id);
                }
                debug!("Released buffers {:?}", request.buffer_ids);
                done(Ok(()));
            }
            Command::Configure(configuration, done) => {
                debug!("Configured stream: {:?}", configuration);
                done(Ok(()));
            }
            Command::Screencast(id, done) => {
                let frame = self.allocate(self.size)?;
                let record = self.record_for(frame)?;
                debug!("Captured frame {} for screencast {:?}", frame, id);
                done(Ok(record));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_ipc::read_record;
    use std::sync::mpsc as std_mpsc;

    fn config(protocol: Protocol) -> Config {
        let mut config = Config::default();
        config.demo.protocol = protocol;
        config.demo.server_latency_ms = 0;
        config.stream.ideal_size = Size::new(8, 4);
        config
    }

    #[test]
    fn test_memfd_is_close_on_exec() {
        let file = memfd().unwrap();
        let flags = nix::fcntl::fcntl(&file, nix::fcntl::FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        nix::unistd::ftruncate(&file, 64).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 64);
    }

    #[test]
    fn test_ping_pong_reply_carries_first_buffer() {
        let (server, reply, socket) = LoopbackServer::start(&config(Protocol::PingPong)).unwrap();
        let first = reply.buffer.unwrap();
        assert_eq!(first.fd_count(), 1);
        assert_eq!(first.size(), Some(Size::new(8, 4)));

        server.submit_buffer(
            BufferRequest {
                id: STREAM_ID,
                buffer_id: first.buffer_id,
            },
            Box::new(|result| assert!(result.is_ok())),
        );
        let returned = read_record(&socket).unwrap();
        assert_ne!(returned.buffer_id, first.buffer_id);
        assert_eq!(returned.fd_count(), 1);
    }

    #[test]
    fn test_vault_allocations_are_pushed() {
        let (server, reply, socket) = LoopbackServer::start(&config(Protocol::Vault)).unwrap();
        assert!(reply.buffer.is_none());

        let (tx, rx) = std_mpsc::channel();
        server.allocate_buffers(
            BufferAllocation {
                id: STREAM_ID,
                buffer_requests: vec![sluice_ipc::BufferParameters {
                    width: 2,
                    height: 2,
                    pixel_format: PixelFormat::Argb8888,
                    usage: Default::default(),
                }],
            },
            Box::new(move |result| tx.send(result.is_ok()).unwrap()),
        );
        assert!(rx.recv().unwrap());
        let record = read_record(&socket).unwrap();
        assert_eq!(record.size(), Some(Size::new(2, 2)));
        assert_eq!(record.stride, 8);
    }

    #[test]
    fn test_shutdown_closes_socket_and_fails_calls() {
        let (server, _, socket) = LoopbackServer::start(&config(Protocol::Vault)).unwrap();
        server.shutdown();
        assert!(matches!(read_record(&socket), Err(ChannelError::Closed)));

        let (tx, rx) = std_mpsc::channel();
        server.configure_buffer_stream(
            StreamConfiguration::swap_interval(STREAM_ID, 0),
            Box::new(move |result| {
                tx.send(matches!(result, Err(StreamError::Disconnected))).unwrap()
            }),
        );
        assert!(rx.recv().unwrap());
    }
}
