//! The worker's side of the wire protocol: read a line, act, reply.
//!
//! The loop is strictly synchronous. While an execute call is running the
//! loop is parked inside the interpreter, and the only traffic on the
//! connection is the sub-call round trip driven from `llm_query`.

use std::cell::RefCell;
use std::io::BufRead;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use delver_protocol::HostMessage;
use delver_protocol::WorkerMessage;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::interpreter::Interpreter;
use crate::interpreter::SubCallFailure;
use crate::interpreter::SubCallFn;

pub struct WireChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> WireChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    fn send(&mut self, msg: &WorkerMessage) -> std::io::Result<()> {
        let line = serde_json::to_string(msg).map_err(std::io::Error::other)?;
        debug!("worker -> host: {line}");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Read the next well-formed host message; `None` on EOF.
    fn recv(&mut self) -> std::io::Result<Option<HostMessage>> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(msg) => return Ok(Some(msg)),
                Err(err) => {
                    // The host is trusted; a malformed frame is a host bug.
                    // Dropping it beats answering out of turn.
                    error!("discarding malformed frame from host: {err}");
                }
            }
        }
    }

    /// Blocking sub-call round trip: emit the request, then wait for the
    /// host's response before letting the sandboxed code continue.
    fn sub_call(&mut self, instruction: &str, content: &str) -> Result<String, SubCallFailure> {
        let request = WorkerMessage::SubCallRequest {
            instruction: instruction.to_string(),
            content: content.to_string(),
        };
        self.send(&request)
            .map_err(|e| SubCallFailure::ConnectionLost(e.to_string()))?;
        loop {
            let msg = self
                .recv()
                .map_err(|e| SubCallFailure::ConnectionLost(e.to_string()))?;
            match msg {
                Some(HostMessage::SubCallResponse { result, error }) => {
                    return match error {
                        Some(message) => Err(SubCallFailure::Rejected(message)),
                        None => Ok(result.unwrap_or_default()),
                    };
                }
                Some(other) => {
                    // Only a sub-call response is legal while execution is
                    // suspended; anything else means the two sides have
                    // lost framing agreement.
                    return Err(SubCallFailure::ConnectionLost(format!(
                        "unexpected {other:?} while awaiting sub_call_response"
                    )));
                }
                None => {
                    return Err(SubCallFailure::ConnectionLost(
                        "host closed the connection".to_string(),
                    ));
                }
            }
        }
    }
}

/// Serve one connection until the host closes it.
pub fn serve<R, W>(reader: R, writer: W) -> anyhow::Result<()>
where
    R: BufRead + 'static,
    W: Write + 'static,
{
    let chan = Rc::new(RefCell::new(WireChannel::new(reader, writer)));
    let mut interpreter = Interpreter::new(Vec::new())?;

    loop {
        let msg = chan.borrow_mut().recv()?;
        let Some(msg) = msg else {
            debug!("host closed stdin, shutting down");
            return Ok(());
        };
        match msg {
            HostMessage::SetContext { documents } => {
                interpreter.set_documents(documents)?;
                chan.borrow_mut().send(&WorkerMessage::Ack)?;
            }
            HostMessage::Execute { code, timeout_ms } => {
                let bridge: SubCallFn = {
                    let chan = Rc::clone(&chan);
                    Box::new(move |instruction, content| {
                        chan.borrow_mut().sub_call(instruction, content)
                    })
                };
                let outcome =
                    interpreter.execute(&code, Duration::from_millis(timeout_ms), bridge);
                chan.borrow_mut()
                    .send(&WorkerMessage::ExecuteResult(outcome))?;
            }
            HostMessage::Reset => {
                interpreter.reset()?;
                chan.borrow_mut().send(&WorkerMessage::Ack)?;
            }
            HostMessage::Ping => {
                chan.borrow_mut().send(&WorkerMessage::Pong)?;
            }
            HostMessage::SubCallResponse { .. } => {
                warn!("sub_call_response received outside an execute call");
            }
        }
    }
}
