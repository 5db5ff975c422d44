//! Pseudo-terminal and pipe plumbing for executions.
//!
//! The daemon's side of every child fd (PTY master, pipe ends we keep) is
//! wrapped in [`AsyncFdIo`] so the mirrors can drive it from the tokio
//! reactor. The child's side stays a plain blocking [`OwnedFd`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::Winsize;
use nix::sys::termios::{SpecialCharacterIndices, tcgetattr};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) struct Pty {
	pub master: AsyncFdIo,
	pub slave: OwnedFd,
	/// The tty's end-of-file control character (usually ^D). Written to the
	/// master instead of closing it when an interactive client ends stdin.
	pub eof_char: u8,
}

fn winsize(width: u16, height: u16) -> Winsize {
	Winsize {
		ws_row: height,
		ws_col: width,
		ws_xpixel: 0,
		ws_ypixel: 0,
	}
}

pub(crate) fn open(width: u16, height: u16) -> io::Result<Pty> {
	let pty = nix::pty::openpty(Some(&winsize(width, height)), None).map_err(io::Error::from)?;
	let termios = tcgetattr(pty.slave.as_fd()).map_err(io::Error::from)?;
	let eof_char = termios.control_chars[SpecialCharacterIndices::VEOF as usize];
	Ok(Pty {
		master: AsyncFdIo::new(pty.master)?,
		slave: pty.slave,
		eof_char,
	})
}

pub(crate) fn resize(fd: RawFd, width: u16, height: u16) -> io::Result<()> {
	let ws = winsize(width, height);
	let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
	if rc < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

/// Close-on-exec pipe; (read end, write end).
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
	nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

/// Duplicates a descriptor so its lifetime decouples from the original.
pub(crate) fn dup(fd: RawFd) -> io::Result<OwnedFd> {
	let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
	if duped < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

pub(crate) fn dup_owned(fd: &OwnedFd) -> io::Result<OwnedFd> {
	dup(fd.as_raw_fd())
}

/// Async adapter over a raw descriptor (PTY master or pipe end).
///
/// Reads treat EIO as end-of-file: on Linux the PTY master raises EIO once
/// the child has exited and the slave side is closed, which for the mirror
/// is just "no more output".
pub(crate) struct AsyncFdIo {
	fd: AsyncFd<OwnedFd>,
}

impl AsyncFdIo {
	pub fn new(fd: OwnedFd) -> io::Result<Self> {
		let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
		let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
		fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
		Ok(AsyncFdIo {
			fd: AsyncFd::new(fd)?,
		})
	}

	pub fn as_raw_fd(&self) -> RawFd {
		self.fd.get_ref().as_raw_fd()
	}
}

impl AsyncRead for AsyncFdIo {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			let mut guard = match this.fd.poll_read_ready(cx) {
				Poll::Ready(ready) => ready?,
				Poll::Pending => return Poll::Pending,
			};
			let unfilled = buf.initialize_unfilled();
			let result = guard.try_io(|inner| {
				let n = unsafe {
					libc::read(
						inner.get_ref().as_raw_fd(),
						unfilled.as_mut_ptr().cast(),
						unfilled.len(),
					)
				};
				if n < 0 {
					Err(io::Error::last_os_error())
				} else {
					Ok(n as usize)
				}
			});
			match result {
				Ok(Ok(n)) => {
					buf.advance(n);
					return Poll::Ready(Ok(()));
				},
				Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
					// Child gone, slave closed: end of stream.
					return Poll::Ready(Ok(()));
				},
				Ok(Err(e)) => return Poll::Ready(Err(e)),
				Err(_would_block) => continue,
			}
		}
	}
}

impl AsyncWrite for AsyncFdIo {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		loop {
			let mut guard = match this.fd.poll_write_ready(cx) {
				Poll::Ready(ready) => ready?,
				Poll::Pending => return Poll::Pending,
			};
			let result = guard.try_io(|inner| {
				let n = unsafe {
					libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len())
				};
				if n < 0 {
					Err(io::Error::last_os_error())
				} else {
					Ok(n as usize)
				}
			});
			match result {
				Ok(res) => return Poll::Ready(res),
				Err(_would_block) => continue,
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn pipe_round_trip() {
		let (r, w) = pipe().unwrap();
		let mut reader = AsyncFdIo::new(r).unwrap();
		let mut writer = AsyncFdIo::new(w).unwrap();

		writer.write_all(b"hello").await.unwrap();
		drop(writer);

		let mut out = Vec::new();
		reader.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"hello");
	}

	#[tokio::test]
	async fn pty_echo_and_eio_is_eof() {
		let pty = open(80, 24).unwrap();
		let mut master = pty.master;
		// Default termios has VEOF set.
		assert_eq!(pty.eof_char, 0x04);

		// With the slave open, writes to it surface on the master. The line
		// discipline's ONLCR turns \n into \r\n on the way out.
		let slave = pty.slave;
		nix::unistd::write(&slave, b"out\n").unwrap();
		let mut buf = [0u8; 16];
		let n = master.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"out\r\n");

		// Once the slave side is fully closed, the master reads EOF (EIO).
		drop(slave);
		let n = master.read(&mut buf).await.unwrap();
		assert_eq!(n, 0);
	}

	#[tokio::test]
	async fn resize_applies_winsize() {
		let pty = open(80, 24).unwrap();
		resize(pty.master.as_raw_fd(), 120, 40).unwrap();
		let mut ws = winsize(0, 0);
		let rc = unsafe { libc::ioctl(pty.master.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
		assert_eq!(rc, 0);
		assert_eq!(ws.ws_col, 120);
		assert_eq!(ws.ws_row, 40);
	}
}
