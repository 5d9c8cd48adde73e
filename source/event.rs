// Thin wrappers around poll(2) and a non-blocking connect(2). The
// application is strictly single-threaded: one poll call multiplexes stdin,
// the IMAP socket and whichever deadline expires first.

use anyhow::Context as _;
use std::{
  io, mem, net,
  os::unix::io::{FromRawFd as _, RawFd},
  time,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
  pub readable: bool,
  pub writable: bool,
}

impl Interest {
  pub const READABLE: Interest = Interest {
    readable: true,
    writable: false,
  };
  pub const WRITABLE: Interest = Interest {
    readable: false,
    writable: true,
  };

  pub fn union(self, other: Interest) -> Interest {
    Interest {
      readable: self.readable || other.readable,
      writable: self.writable || other.writable,
    }
  }

  pub fn is_empty(self) -> bool {
    !self.readable && !self.writable
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Ready {
  pub readable: bool,
  pub writable: bool,
  pub hangup: bool,
}

/// Wait for the given file descriptors; `ready` entries are filled in place.
/// Returns the number of descriptors with events, 0 on timeout.
pub fn wait(
  entries: &mut [(RawFd, Interest, Ready)],
  timeout: Option<time::Duration>,
) -> io::Result<usize> {
  let mut fds = entries
    .iter()
    .map(|(fd, interest, _)| {
      let mut events = 0;
      if interest.readable {
        events |= libc::POLLIN;
      }
      if interest.writable {
        events |= libc::POLLOUT;
      }
      libc::pollfd {
        fd: *fd,
        events,
        revents: 0,
      }
    })
    .collect::<Vec<_>>();
  let timeout = match timeout {
    // poll rounds down; make sure a pending deadline is never spun on.
    Some(duration) => i32::try_from(duration.as_millis().min(i32::max_value() as u128))
      .unwrap()
      .max(1),
    None => -1,
  };
  let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
  if result < 0 {
    let error = io::Error::last_os_error();
    if error.kind() == io::ErrorKind::Interrupted {
      return Ok(0);
    }
    return Err(error);
  }
  for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
    entry.2 = Ready {
      readable: fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
      writable: fd.revents & (libc::POLLOUT | libc::POLLERR) != 0,
      hangup: fd.revents & (libc::POLLHUP | libc::POLLERR) != 0,
    };
  }
  Ok(result as usize)
}

/// A set of pending deadlines keyed by a caller-chosen token. Folding timers
/// into the poll timeout keeps per-operation timeouts without a timer file
/// descriptor per operation.
#[derive(Debug)]
pub struct Deadlines<T> {
  deadlines: Vec<(time::Instant, T)>,
}

impl<T: Copy + PartialEq> Deadlines<T> {
  pub fn new() -> Self {
    Self {
      deadlines: Vec::new(),
    }
  }

  pub fn set(&mut self, token: T, deadline: time::Instant) {
    self.clear(token);
    self.deadlines.push((deadline, token));
  }

  pub fn clear(&mut self, token: T) {
    self.deadlines.retain(|(_, token_)| *token_ != token);
  }

  pub fn next(&self) -> Option<time::Instant> {
    self.deadlines.iter().map(|(at, _)| *at).min()
  }

  /// Remove and return every token whose deadline has passed.
  pub fn fire(&mut self, now: time::Instant) -> Vec<T> {
    let mut due = Vec::new();
    self.deadlines.retain(|(at, token)| {
      if *at <= now {
        due.push(*token);
        false
      } else {
        true
      }
    });
    due
  }

  pub fn is_empty(&self) -> bool {
    self.deadlines.is_empty()
  }
}

impl<T: Copy + PartialEq> Default for Deadlines<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Start a non-blocking TCP connection. The returned stream is not connected
/// yet: poll it for writability, then check `TcpStream::take_error` to learn
/// the outcome (the classic EINPROGRESS dance).
pub fn connect(address: &net::SocketAddr) -> anyhow::Result<net::TcpStream> {
  let domain = match address {
    net::SocketAddr::V4(_) => libc::AF_INET,
    net::SocketAddr::V6(_) => libc::AF_INET6,
  };
  let fd = unsafe {
    libc::socket(
      domain,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
    )
  };
  anyhow::ensure!(fd >= 0, "socket: {}", io::Error::last_os_error());
  // From now on the descriptor is owned; an early error must not leak it.
  let stream = unsafe { net::TcpStream::from_raw_fd(fd) };

  let (storage, length) = socket_address(address);
  let result = unsafe {
    libc::connect(
      fd,
      &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
      length,
    )
  };
  if result < 0 {
    let error = io::Error::last_os_error();
    if error.raw_os_error() != Some(libc::EINPROGRESS) {
      return Err(error).with_context(|| format!("couldn't connect to {address}"));
    }
  }
  Ok(stream)
}

fn socket_address(address: &net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  match address {
    net::SocketAddr::V4(v4) => {
      let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
          s_addr: u32::from_ne_bytes(v4.ip().octets()),
        },
        sin_zero: [0; 8],
      };
      unsafe {
        (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in).write(sin);
      }
      (
        storage,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
      )
    }
    net::SocketAddr::V6(v6) => {
      let sin6 = libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: v6.port().to_be(),
        sin6_flowinfo: v6.flowinfo(),
        sin6_addr: libc::in6_addr {
          s6_addr: v6.ip().octets(),
        },
        sin6_scope_id: v6.scope_id(),
      };
      unsafe {
        (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6).write(sin6);
      }
      (
        storage,
        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deadlines() {
    let mut deadlines = Deadlines::new();
    assert!(deadlines.is_empty());
    assert_eq!(None, deadlines.next());

    let now = time::Instant::now();
    deadlines.set(1, now + time::Duration::from_secs(10));
    deadlines.set(2, now + time::Duration::from_secs(5));
    assert_eq!(Some(now + time::Duration::from_secs(5)), deadlines.next());

    // Re-setting a token replaces its previous deadline.
    deadlines.set(2, now + time::Duration::from_secs(20));
    assert_eq!(Some(now + time::Duration::from_secs(10)), deadlines.next());

    assert_eq!(Vec::<i32>::new(), deadlines.fire(now));
    assert_eq!(vec![1], deadlines.fire(now + time::Duration::from_secs(15)));
    deadlines.clear(2);
    assert!(deadlines.is_empty());
  }
}
