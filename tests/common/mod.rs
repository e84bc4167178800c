//! Common test utilities and fixtures
//!
//! Every command runs with HOME and the XDG config directory pointed at a
//! scratch directory, and with `XCP_*` variables cleared, so the developer's
//! own configuration never leaks into a test.

#![allow(dead_code)]

use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::path::{Path, PathBuf};

/// Environment variables read by the configuration loader
pub const XCP_ENV_VARS: &[&str] = &[
    "XCP_SESSION",
    "XCP_BIND",
    "XCP_PORT",
    "XCP_GROUP",
    "XCP_DISCOVERY_PORT",
    "XCP_DISCOVERY_TIMEOUT_MS",
    "XCP_INTERFACE",
    "XCP_SETTLE_CHECK",
    "XCP_SEND_TIMEOUT_MS",
    "XCP_LOG_LEVEL",
    "XCP_LOG_FILE",
    "XCP_LOG_JSON",
];

/// Path to the compiled xcp binary
pub fn xcp_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("xcp")
}

/// An assert_cmd command isolated in `home`
pub fn xcp_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("xcp").unwrap();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"));
    for var in XCP_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// A std command for long-running processes, isolated in `home`
pub fn xcp_process(home: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(xcp_bin());
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"));
    for var in XCP_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// A port currently free for both TCP and UDP on loopback
pub fn free_port() -> u16 {
    for _ in 0..20 {
        let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = tcp.local_addr().unwrap().port();
        if UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return port;
        }
    }
    panic!("no port free for both TCP and UDP");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_port(), 0);
    }
}
