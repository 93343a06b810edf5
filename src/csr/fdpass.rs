//! Descriptor Passing
//!
//! Frame transport for the per-thread channel. Payload bytes travel on the
//! stream; kernel object descriptors (eventfds) ride alongside as
//! `SCM_RIGHTS` ancillary data, so a readiness primitive is handed to the
//! peer as an open descriptor rather than serialized into the reply.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::status::{NtResult, NtStatus};

/// Most descriptors attached to one frame (alert + suspend + ack).
pub const MAX_FDS_PER_MESSAGE: usize = 3;

const HEADER_LEN: usize = 8;

fn io_status(err: &io::Error) -> NtStatus {
    NtStatus::from_os_error(err.raw_os_error().unwrap_or(0))
}

/// Send one frame (`[len][code][payload]`) with optional descriptors.
///
/// The descriptors are attached to the first byte of the frame; partial
/// writes retransmit the remainder without re-attaching them.
pub fn send_frame(
    stream: &UnixStream,
    code: u32,
    payload: &[u8],
    fds: &[RawFd],
) -> NtResult<()> {
    debug_assert!(fds.len() <= MAX_FDS_PER_MESSAGE);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(payload);

    let mut sent = sendmsg_fds(stream.as_raw_fd(), &frame, fds)
        .map_err(|e| io_status(&e))?;
    while sent < frame.len() {
        let n = sendmsg_fds(stream.as_raw_fd(), &frame[sent..], &[])
            .map_err(|e| io_status(&e))?;
        if n == 0 {
            return Err(NtStatus::Unsuccessful);
        }
        sent += n;
    }
    Ok(())
}

/// Receive one frame, collecting any descriptors delivered with it.
///
/// Returns `(code, payload, fds)`. A closed peer is `Unsuccessful`: from
/// the client's point of view a vanished supervisor is indistinguishable
/// from any other supervisor-reported failure.
pub fn recv_frame(stream: &UnixStream) -> NtResult<(u32, Vec<u8>, Vec<OwnedFd>)> {
    let mut fds = Vec::new();

    let mut header = [0u8; HEADER_LEN];
    recv_exact(stream, &mut header, &mut fds)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let code = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > super::message::MAX_PAYLOAD_SIZE {
        return Err(NtStatus::InvalidParameter);
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        recv_exact(stream, &mut payload, &mut fds)?;
    }
    Ok((code, payload, fds))
}

fn recv_exact(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> NtResult<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = recvmsg_fds(stream.as_raw_fd(), &mut buf[read..], fds)
            .map_err(|e| io_status(&e))?;
        if n == 0 {
            return Err(NtStatus::Unsuccessful);
        }
        read += n;
    }
    Ok(())
}

fn sendmsg_fds(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let cmsg_space =
            libc::CMSG_SPACE((mem::size_of::<RawFd>() * MAX_FDS_PER_MESSAGE) as u32) as usize;
        let mut control = vec![0u8; cmsg_space];
        if !fds.is_empty() {
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen =
                libc::CMSG_SPACE((mem::size_of::<RawFd>() * fds.len()) as u32) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN((mem::size_of::<RawFd>() * fds.len()) as u32) as _;
            let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                data.add(i).write_unaligned(*fd);
            }
        }

        loop {
            let n = libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL);
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

fn recvmsg_fds(socket: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let cmsg_space =
            libc::CMSG_SPACE((mem::size_of::<RawFd>() * MAX_FDS_PER_MESSAGE) as u32) as usize;
        let mut control = vec![0u8; cmsg_space];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        let n = loop {
            let n = libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_frame_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(&a, 7, b"hello", &[]).unwrap();
        let (code, payload, fds) = recv_frame(&b).unwrap();
        assert_eq!(code, 7);
        assert_eq!(payload, b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(&a, 42, &[], &[]).unwrap();
        let (code, payload, _) = recv_frame(&b).unwrap();
        assert_eq!(code, 42);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_descriptor_transfer() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile();
        file.write_all(b"payload-adjacent").unwrap();
        file.flush().unwrap();

        send_frame(&a, 1, b"obj", &[file.as_raw_fd()]).unwrap();
        let (_, _, fds) = recv_frame(&b).unwrap();
        assert_eq!(fds.len(), 1);

        // The received descriptor names the same open file description.
        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        received.read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload-adjacent");
    }

    #[test]
    fn test_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(recv_frame(&b).is_err());
    }

    fn tempfile() -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "rewind-fdpass-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        f
    }
}
