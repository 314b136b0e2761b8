use std::{ffi::CString, io, os::fd::RawFd};

use mio::{Interest, Registry, Token, unix::SourceFd};
use tracing::{debug, warn};

use crate::SocketError;

/// Raw non-blocking serial line.
///
/// Opened O_NONBLOCK in raw mode; registered with the poll via `SourceFd`
/// like any socket, and exposes the same read/write/disconnect surface.
pub struct SerialPort {
    fd: RawFd,
    path: String,
    token: Token,
    alive: bool,
}

impl SerialPort {
    pub fn open(path: &str, baud: u32) -> Result<Self, SocketError> {
        if path.is_empty() {
            return Err(SocketError::MissingConfig("serial device path"));
        }
        let c_path = CString::new(path)
            .map_err(|_| SocketError::MissingConfig("serial device path contains NUL"))?;

        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(SocketError::CreateFailure(io::Error::last_os_error()));
        }

        let speed = baud_to_speed(baud);
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::CreateFailure(err));
            }
            libc::cfmakeraw(&mut tio);
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::CreateFailure(err));
            }
        }

        Ok(Self { fd, path: path.to_string(), token: Token(usize::MAX), alive: true })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<(), SocketError> {
        registry
            .register(&mut SourceFd(&self.fd), token, Interest::READABLE)
            .map_err(SocketError::CreateFailure)?;
        self.token = token;
        Ok(())
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        if !self.alive {
            return 0;
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => {
                debug!(path = %self.path, "serial line closed");
                self.alive = false;
                0
            }
            n if n > 0 => n as usize,
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    0
                } else {
                    warn!(path = %self.path, %err, "serial read failed");
                    self.alive = false;
                    0
                }
            }
        }
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> bool {
        if !self.alive {
            return false;
        }
        let n = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
        if n == bytes.len() as isize {
            return true;
        }
        let err = io::Error::last_os_error();
        if n >= 0 || err.kind() == io::ErrorKind::WouldBlock {
            // the line is slower than the caller; drop with a trace rather
            // than buffer unboundedly against a fixed-rate link
            warn!(path = %self.path, "serial write short, bytes dropped");
            false
        } else {
            warn!(path = %self.path, %err, "serial write failed");
            self.alive = false;
            false
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut SourceFd(&self.fd));
        self.alive = false;
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn baud_to_speed(baud: u32) -> libc::speed_t {
    match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        other => {
            warn!(baud = other, "unsupported baud rate, using 9600");
            libc::B9600
        }
    }
}
