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

use std::time;

/// NETCONF 1.0 end-of-message trailer, only used for the hello exchange.
pub const BASE_1_0_END: &[u8] = b"]]>]]>";
/// NETCONF 1.1 end-of-message marker for chunked framing.
pub const BASE_1_1_END: &[u8] = b"\n##\n";

pub const HELLO_RX_SIZE: usize = 1024;
pub const MAX_HELLO_RX_SIZE: usize = 16 * 1024;
pub const MAX_REQUEST_MESSAGE_SIZE: usize = 32 * 1024;
// \n#<chunk-size>\n with max chunk-size = 4294967295
pub const MAX_CHUNK_HEADER_SIZE: usize = 13;

pub const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(60);

pub const BASE_1_0_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
pub const BASE_1_1_CAP: &str = "urn:ietf:params:netconf:base:1.1";
pub const XPATH_CAP: &str = "urn:ietf:params:netconf:capability:xpath:1.0";
pub const WRITABLE_RUNNING_CAP: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
pub const WITH_DEFAULTS_CAP: &str =
    "urn:ietf:params:netconf:capability:with-defaults:1.0?basic-mode=explicit&also-supported=report-all,trim";

pub const STATE_SESSIONS_PATH: &str = "/netconf-state/sessions/session";
pub const STATE_STATISTICS_PATH: &str = "/netconf-state/statistics";
pub const SESSION_STATUS_PATH: &str = "/netconf-state/sessions/session/*/status";
pub const CONFIG_MAX_SESSIONS_PATH: &str = "/netconf/config/max-sessions";
pub const STATE_MAX_SESSIONS_PATH: &str = "/netconf/state/max-sessions";

// Bounds for the max-sessions knob, the maximum number of concurrent sessions.
pub const MAX_SESSIONS_MIN: u32 = 1;
pub const MAX_SESSIONS_MAX: u32 = 10;
pub const MAX_SESSIONS_DEFAULT: u32 = 4;
