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

//! NETCONF framing. The hello uses the 1.0 `]]>]]>` trailer; everything
//! after it is 1.1 chunked framing (`\n#<len>\n<bytes>` chunks ending with
//! `\n##\n`). Bytes read past the hello trailer are kept and replayed to
//! the chunk reader so a pipelining client loses nothing.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::consts;

/// Why receive gave up. `TooBig` is special cased by the caller, which
/// sends an rpc-error before dropping the session; everything else is a
/// plain framing failure.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// A chunk larger than the per-message bound arrived.
    TooBig,
    /// The shutdown flag cleared while we were reading.
    Shutdown,
    /// EOF, timeout, short read or a malformed header.
    Closed,
}

pub struct Framer<S> {
    stream: S,
    pending: VecDeque<u8>,
}

impl<S: Read + Write> Framer<S> {
    pub fn new(stream: S) -> Self {
        Framer { stream, pending: VecDeque::new() }
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(b);
        }
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_exact_buffered(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if let Some(b) = self.pending.pop_front() {
                out[filled] = b;
                filled += 1;
                continue;
            }
            self.stream.read_exact(&mut out[filled..])?;
            return Ok(());
        }
        Ok(())
    }

    /// Read up to the 1.0 trailer and return everything before it. A split
    /// trailer across reads is handled by scanning the accumulated buffer;
    /// anything after the trailer is kept for the chunk reader.
    pub fn recv_hello(&mut self, running: &AtomicBool) -> Result<Vec<u8>, RecvError> {
        let mut buf: Vec<u8> = Vec::with_capacity(consts::HELLO_RX_SIZE);
        let mut chunk = [0u8; consts::HELLO_RX_SIZE];
        while running.load(Ordering::SeqCst) {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(RecvError::Closed),
                Ok(n) => n,
                Err(_) => return Err(RecvError::Closed),
            };
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find(&buf, consts::BASE_1_0_END) {
                let rest = buf.split_off(pos + consts::BASE_1_0_END.len());
                self.pending.extend(rest);
                buf.truncate(pos);
                trace!("RX({}):\n{}", buf.len(), String::from_utf8_lossy(&buf));
                return Ok(buf);
            }
            if buf.len() >= consts::MAX_HELLO_RX_SIZE {
                debug!("hello exceeded {} bytes", consts::MAX_HELLO_RX_SIZE);
                return Err(RecvError::Closed);
            }
        }
        Err(RecvError::Shutdown)
    }

    /// Read one chunk header. `Ok(None)` is the end-of-message marker.
    fn read_chunk_size(&mut self) -> Result<Option<usize>, RecvError> {
        let mut header: Vec<u8> = Vec::with_capacity(consts::MAX_CHUNK_HEADER_SIZE);
        loop {
            if header.len() > consts::MAX_CHUNK_HEADER_SIZE {
                debug!("chunk header over {} bytes", consts::MAX_CHUNK_HEADER_SIZE);
                return Err(RecvError::Closed);
            }
            let b = self.read_byte().map_err(|_| RecvError::Closed)?;
            header.push(b);
            match header.as_slice() {
                [b'\n'] | [b'\n', b'#'] | [b'\n', b'#', b'#'] => continue,
                [b'\n', b'#', b'#', b'\n'] => return Ok(None),
                [b'\n', b'#', digits @ .., b'\n'] if !digits.is_empty() => {
                    let digits = std::str::from_utf8(digits).map_err(|_| RecvError::Closed)?;
                    let len = digits.parse::<usize>().map_err(|_| RecvError::Closed)?;
                    trace!("RX chunk header len={len}");
                    return Ok(Some(len));
                }
                [b'\n', b'#', middle @ ..] if middle.iter().all(|b| b.is_ascii_digit()) => {
                    continue
                }
                _ => {
                    debug!("malformed chunk header {:?}", header);
                    return Err(RecvError::Closed);
                }
            }
        }
    }

    /// Reassemble one chunked message.
    pub fn recv_message(&mut self, running: &AtomicBool) -> Result<Vec<u8>, RecvError> {
        let mut message: Vec<u8> = Vec::new();
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(RecvError::Shutdown);
            }
            let chunk_len = match self.read_chunk_size()? {
                None => break,
                Some(len) => len,
            };
            if !running.load(Ordering::SeqCst) {
                return Err(RecvError::Shutdown);
            }
            if chunk_len > consts::MAX_REQUEST_MESSAGE_SIZE {
                debug!("chunk of {} bytes over the message bound", chunk_len);
                return Err(RecvError::TooBig);
            }
            let start = message.len();
            message.resize(start + chunk_len, 0);
            self.read_exact_buffered(&mut message[start..]).map_err(|_| RecvError::Closed)?;
            trace!("RX({}):\n{}", chunk_len, String::from_utf8_lossy(&message[start..]));
        }
        Ok(message)
    }

    /// Send one reply: chunk header, payload, end-of-message marker. A
    /// short write at any step is fatal to the session.
    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let header = format!("\n#{}\n", payload.len());
        self.stream.write_all(header.as_bytes())?;
        self.stream.write_all(payload)?;
        self.stream.write_all(consts::BASE_1_1_END)?;
        self.stream.flush()?;
        trace!("TX({}):\n{}", payload.len(), String::from_utf8_lossy(payload));
        Ok(())
    }

    /// The hello goes out with the 1.0 trailer instead of chunking.
    pub fn send_hello(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(payload)?;
        self.stream.write_all(consts::BASE_1_0_END)?;
        self.stream.flush()?;
        trace!("TX hello ({} bytes)", payload.len());
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
