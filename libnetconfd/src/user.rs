// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The peer identity collaborator. A session's username comes from the
//! socket peer credentials; the remote address and port come from scraping
//! the peer process environment for SSH_CLIENT, which is best-effort and
//! Linux specific.

use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::ptr;

use anyhow::{anyhow, Context};
use chrono::Utc;
use nix::unistd;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub username: String,
    pub rem_addr: String,
    pub rem_port: String,
    pub login_time: String,
}

impl Default for PeerInfo {
    fn default() -> Self {
        PeerInfo {
            username: String::from("unknown"),
            rem_addr: String::from("unknown"),
            rem_port: String::from("0"),
            login_time: login_time(),
        }
    }
}

fn login_time() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Read the peer identity off a connected stream. Failures to resolve any
/// one part degrade to the defaults rather than failing the session.
#[instrument(skip_all)]
pub fn peer_info(stream: &UnixStream) -> anyhow::Result<PeerInfo> {
    use nix::sys::socket;

    let mut info = PeerInfo::default();
    let peer_creds = socket::getsockopt(stream, socket::sockopt::PeerCredentials)
        .context("could not get peer creds from socket")?;

    match username_for_uid(unistd::Uid::from_raw(peer_creds.uid())) {
        Ok(name) => info.username = name,
        Err(err) => debug!("could not resolve peer username: {:?}", err),
    }

    if let Some((addr, port)) = ssh_client_for_pid(peer_creds.pid()) {
        info.rem_addr = addr;
        info.rem_port = port;
    }

    Ok(info)
}

/// Look a username up with getpwuid_r.
pub fn username_for_uid(uid: unistd::Uid) -> anyhow::Result<String> {
    let mut passwd_str_buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd = libc::passwd {
        pw_name: ptr::null_mut(),
        pw_passwd: ptr::null_mut(),
        pw_uid: 0,
        pw_gid: 0,
        pw_gecos: ptr::null_mut(),
        pw_dir: ptr::null_mut(),
        pw_shell: ptr::null_mut(),
    };
    let mut passwd_res_ptr: *mut libc::passwd = ptr::null_mut();
    unsafe {
        // Safety: pretty much pure ffi, passwd and passwd_str_buf correctly
        //         have memory backing them.
        let errno = libc::getpwuid_r(
            uid.as_raw(),
            &mut passwd,
            passwd_str_buf.as_mut_ptr(),
            passwd_str_buf.len(),
            &mut passwd_res_ptr as *mut *mut libc::passwd,
        );
        if passwd_res_ptr.is_null() {
            if errno == 0 {
                return Err(anyhow!("no passwd entry for uid {}", uid));
            } else {
                return Err(anyhow!(
                    "error resolving user info: {}",
                    io::Error::from_raw_os_error(errno)
                ));
            }
        }

        // Safety: pw_name is a cstring when getpwuid_r succeeds
        Ok(String::from(String::from_utf8_lossy(CStr::from_ptr(passwd.pw_name).to_bytes())))
    }
}

/// Pull SSH_CLIENT out of /proc/<pid>/environ. The value has the shape
/// "addr client-port server-port"; the first two parts are what we want.
fn ssh_client_for_pid(pid: libc::pid_t) -> Option<(String, String)> {
    let contents = fs::read(format!("/proc/{pid}/environ")).ok()?;
    for entry in contents.split(|&b| b == 0) {
        let entry = String::from_utf8_lossy(entry);
        if let Some(value) = entry.strip_prefix("SSH_CLIENT=") {
            let mut parts = value.split_whitespace();
            let addr = parts.next()?;
            let port = parts.next()?;
            return Some((addr.to_string(), port.to_string()));
        }
    }
    None
}
