//! Descriptor passing over Unix stream sockets.
//!
//! # Wire contract
//!
//! One `sendmsg` per descriptor set:
//! - Payload: a single dummy byte (`b'M'`)
//! - Ancillary data: one `SCM_RIGHTS` block carrying every descriptor
//!
//! The receiver rebuilds the set from the ancillary data of the one read that
//! returns the dummy byte.

use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use thiserror::Error;

/// Payload byte that carries the ancillary data
const DUMMY_BYTE: u8 = b'M';

/// Descriptor count that fits the inline control buffer
pub const INLINE_FDS: usize = 5;

const INLINE_SPACE: usize = rustix::cmsg_space!(ScmRights(INLINE_FDS));

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to send fds: {0}")]
    Send(Errno),

    #[error("failed to receive fds: {0}")]
    Recv(Errno),

    #[error("short write while sending fds ({sent} bytes sent)")]
    ShortWrite { sent: usize },

    #[error("control data truncated, descriptors were dropped")]
    Truncated,

    #[error("expected {expected} descriptors, received {received}")]
    FdCountMismatch { expected: usize, received: usize },

    #[error("peer closed the socket")]
    Closed,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ancillary storage for `fd_count` descriptors, on the stack up to
/// [`INLINE_FDS`].
enum ControlSpace {
    Inline([MaybeUninit<u8>; INLINE_SPACE]),
    Heap(Vec<MaybeUninit<u8>>),
}

impl ControlSpace {
    fn for_fds(fd_count: usize) -> Self {
        if fd_count <= INLINE_FDS {
            Self::Inline([MaybeUninit::uninit(); INLINE_SPACE])
        } else {
            Self::Heap(vec![
                MaybeUninit::uninit();
                rustix::cmsg_space!(ScmRights(fd_count))
            ])
        }
    }

    fn as_mut_slice(&mut self) -> &mut [MaybeUninit<u8>] {
        match self {
            Self::Inline(space) => &mut space[..],
            Self::Heap(space) => &mut space[..],
        }
    }

    #[cfg(test)]
    fn is_inline(&self) -> bool {
        matches!(self, Self::Inline(_))
    }
}

/// Send `fds` as a single `SCM_RIGHTS` message.
///
/// Sending nothing performs no write at all. The descriptors are only
/// borrowed; the caller decides whether to close its copies afterwards.
pub fn send_fds<S: AsFd, F: AsFd>(socket: &S, fds: &[F]) -> Result<(), ChannelError> {
    if fds.is_empty() {
        return Ok(());
    }

    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
    let mut space = ControlSpace::for_fds(borrowed.len());
    let mut control = SendAncillaryBuffer::new(space.as_mut_slice());
    if !control.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(ChannelError::Send(Errno::NOBUFS));
    }

    let dummy = [DUMMY_BYTE];
    let sent = sendmsg(
        socket,
        &[IoSlice::new(&dummy)],
        &mut control,
        SendFlags::NOSIGNAL,
    )
    .map_err(ChannelError::Send)?;

    if sent != dummy.len() {
        return Err(ChannelError::ShortWrite { sent });
    }
    Ok(())
}

/// Receive one descriptor set of at most `max_fds` entries.
///
/// Descriptors arrive close-on-exec. A truncated control block is an error;
/// whatever did arrive is closed before returning it.
pub fn recv_fds<S: AsFd>(socket: &S, max_fds: usize) -> Result<Vec<OwnedFd>, ChannelError> {
    let mut space = ControlSpace::for_fds(max_fds.max(1));
    let mut control = RecvAncillaryBuffer::new(space.as_mut_slice());

    let mut byte = [0u8; 1];
    let received = recvmsg(
        socket,
        &mut [IoSliceMut::new(&mut byte)],
        &mut control,
        RecvFlags::CMSG_CLOEXEC,
    )
    .map_err(ChannelError::Recv)?;

    if received.bytes == 0 {
        return Err(ChannelError::Closed);
    }

    let fds: Vec<OwnedFd> = control
        .drain()
        .filter_map(|message| match message {
            RecvAncillaryMessage::ScmRights(rights) => Some(rights),
            _ => None,
        })
        .flatten()
        .collect();

    if received.flags.contains(ReturnFlags::CTRUNC) {
        return Err(ChannelError::Truncated);
    }
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
    use std::os::unix::net::UnixStream;

    fn stream_pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn test_inline_buffer_covers_common_counts() {
        assert!(ControlSpace::for_fds(1).is_inline());
        assert!(ControlSpace::for_fds(INLINE_FDS).is_inline());
        assert!(!ControlSpace::for_fds(INLINE_FDS + 1).is_inline());
        assert_eq!(
            ControlSpace::for_fds(64).as_mut_slice().len(),
            rustix::cmsg_space!(ScmRights(64))
        );
    }

    #[test]
    fn test_no_fds_means_no_write() {
        let (sender, receiver) = stream_pair();
        let none: &[OwnedFd] = &[];
        send_fds(&sender, none).unwrap();

        receiver.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        let err = (&receiver).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_all_fds_arrive_in_one_read() {
        let (sender, receiver) = stream_pair();

        let mut marked = tempfile::tempfile().unwrap();
        marked.write_all(b"front").unwrap();
        let mut fds = vec![OwnedFd::from(marked)];
        for _ in 0..6 {
            fds.push(OwnedFd::from(File::open("/dev/null").unwrap()));
        }

        send_fds(&sender, &fds).unwrap();
        let received = recv_fds(&receiver, fds.len()).unwrap();
        assert_eq!(received.len(), 7);

        let mut first = File::from(received.into_iter().next().unwrap());
        first.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        first.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "front");
    }

    #[test]
    fn test_small_set_uses_single_message() {
        let (sender, receiver) = stream_pair();
        let fds = vec![
            OwnedFd::from(File::open("/dev/null").unwrap()),
            OwnedFd::from(File::open("/dev/null").unwrap()),
        ];

        send_fds(&sender, &fds).unwrap();
        assert_eq!(recv_fds(&receiver, 2).unwrap().len(), 2);

        // nothing but the one dummy byte was written
        receiver.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert!((&receiver).read(&mut buf).is_err());
    }

    #[test]
    fn test_too_small_receive_buffer_is_truncation() {
        let (sender, receiver) = stream_pair();
        let fds: Vec<OwnedFd> = (0..8)
            .map(|_| OwnedFd::from(File::open("/dev/null").unwrap()))
            .collect();

        send_fds(&sender, &fds).unwrap();
        assert!(matches!(
            recv_fds(&receiver, 1),
            Err(ChannelError::Truncated)
        ));
    }

    #[test]
    fn test_closed_peer_is_reported() {
        let (sender, receiver) = stream_pair();
        drop(sender);
        assert!(matches!(recv_fds(&receiver, 1), Err(ChannelError::Closed)));
    }
}
