//! Resolves the `--listen`/`--port` CLI arguments to a bound, non-blocking
//! [`mio::net::UdpSocket`] (§6 EXTERNAL INTERFACES).
//!
//! Three address forms are accepted: a literal IPv4/IPv6 address (the
//! common case), `stdin` (inherit an already-bound socket on fd 0, for
//! supervisors that bind the privileged port themselves), and `systemd`
//! (inherit the single socket passed via the `LISTEN_FDS`/`LISTEN_PID`
//! environment convention). Neither inheritance form involves the
//! `sd_notify` readiness/watchdog protocol -- that remains out of scope, so
//! there is nothing here to ping back.

use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::os::fd::FromRawFd;

use mio::net::UdpSocket;

use crate::error::Error;

/// fd 3 is `SD_LISTEN_FDS_START`: the first fd a service manager passes
/// after stdin/stdout/stderr, per the systemd socket-activation convention.
const SD_LISTEN_FDS_START: std::os::fd::RawFd = 3;

pub fn resolve_port(port: &str) -> Result<u16, Error> {
    if let Ok(n) = port.parse::<u16>() {
        return Ok(n);
    }
    match port.to_ascii_lowercase().as_str() {
        "tftp" => Ok(69),
        _ => Err(Error::UnknownPortForm(port.to_string())),
    }
}

/// Bind (or inherit) the main listening socket.
pub fn resolve(addr: &str, port: u16) -> Result<UdpSocket, Error> {
    match addr {
        "stdin" => from_inherited_fd(0, "stdin"),
        "systemd" => from_systemd(),
        literal => {
            let ip: IpAddr = literal
                .parse()
                .map_err(|_| Error::UnknownListenForm(literal.to_string()))?;
            let socket_addr = SocketAddr::new(ip, port);
            let std_socket = StdUdpSocket::bind(socket_addr).map_err(|source| Error::Bind {
                addr: socket_addr.to_string(),
                source,
            })?;
            std_socket.set_nonblocking(true).map_err(|source| Error::Bind {
                addr: socket_addr.to_string(),
                source,
            })?;
            Ok(UdpSocket::from_std(std_socket))
        }
    }
}

/// Inherit an already-bound, already-listening UDP socket from a raw fd,
/// validating it actually is one before handing it to `mio`.
fn from_inherited_fd(fd: std::os::fd::RawFd, via: &'static str) -> Result<UdpSocket, Error> {
    // Safety: the fd is owned by our process (either fd 0, which every
    // process has, or one passed via the systemd convention documented
    // below); we take exclusive ownership of it here and never touch the
    // raw fd again afterwards.
    let std_socket = unsafe { StdUdpSocket::from_raw_fd(fd) };
    std_socket
        .local_addr()
        .map_err(|_| Error::InheritedFdInvalid(via))?;
    std_socket
        .set_nonblocking(true)
        .map_err(|_| Error::InheritedFdInvalid(via))?;
    Ok(UdpSocket::from_std(std_socket))
}

/// Inherit the single socket passed by a service manager via
/// `LISTEN_PID`/`LISTEN_FDS`: `LISTEN_PID` must name this process (so a
/// child that merely inherited the environment doesn't also try to claim
/// the fd), and exactly one fd must have been passed.
fn from_systemd() -> Result<UdpSocket, Error> {
    let pid_matches = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);
    let fd_count = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    if !pid_matches || fd_count == 0 {
        return Err(Error::InheritedFdInvalid("systemd"));
    }
    from_inherited_fd(SD_LISTEN_FDS_START, "systemd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_port_parses_directly() {
        assert_eq!(resolve_port("69").unwrap(), 69);
        assert_eq!(resolve_port("1069").unwrap(), 1069);
    }

    #[test]
    fn tftp_service_name_resolves_to_69() {
        assert_eq!(resolve_port("tftp").unwrap(), 69);
        assert_eq!(resolve_port("TFTP").unwrap(), 69);
    }

    #[test]
    fn unknown_service_name_is_rejected() {
        assert!(resolve_port("bogus").is_err());
    }

    #[test]
    fn literal_loopback_binds_to_an_ephemeral_port() {
        let socket = resolve("127.0.0.1", 0).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn unknown_listen_form_is_rejected() {
        assert!(resolve("not-an-address", 0).is_err());
    }

    #[test]
    fn systemd_without_env_vars_is_rejected() {
        // SAFETY: this process-wide mutation is confined to a single test
        // that doesn't run concurrently with anything else reading these
        // two variables.
        unsafe {
            std::env::remove_var("LISTEN_PID");
            std::env::remove_var("LISTEN_FDS");
        }
        assert!(matches!(
            resolve("systemd", 0),
            Err(Error::InheritedFdInvalid("systemd"))
        ));
    }
}
