use std::io::Write;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::proto::command::Command;
use crate::proto::frame::{Fields, Response, encode_command};

/// Outcome of one executed command.
#[derive(Debug)]
pub enum CommandResult {
    /// Module answered with result 0x0000.
    Ok(Fields),
    /// Module answered with a non-zero result code.
    DeviceError(u16),
    /// No matching reply within the timeout budget, retries included.
    Timeout,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResult::Ok(_))
    }
}

/// Serializes command traffic: exactly one command outstanding at a time,
/// replies correlated by opcode, bounded by a timeout and retry budget.
/// Owns the transport write half; a reader thread feeds `responses`.
pub struct CommandEngine<W: Write> {
    writer: W,
    responses: Receiver<Response>,
    timeout: Duration,
    retries: u32,
    seq: u64,
}

impl<W: Write> CommandEngine<W> {
    pub fn new(writer: W, responses: Receiver<Response>, timeout: Duration, retries: u32) -> Self {
        Self {
            writer,
            responses,
            timeout,
            retries,
            seq: 0,
        }
    }

    /// Issue one command and wait for its reply. `Err` means the transport
    /// itself failed; protocol-level failures come back as `CommandResult`.
    pub fn execute(&mut self, cmd: &Command) -> Result<CommandResult> {
        self.seq += 1;
        let seq = self.seq;
        let line = encode_command(cmd);

        // A reply sitting in the channel while nothing is outstanding is a
        // protocol anomaly. Drop it here so it cannot satisfy this command.
        while let Ok(stale) = self.responses.try_recv() {
            warn!(
                "discarding stale {} response (result 0x{:04X})",
                stale.opcode, stale.result
            );
        }

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("#{} {}: retry {}/{}", seq, cmd.opcode(), attempt, self.retries);
            }
            self.writer
                .write_all(line.as_bytes())
                .and_then(|_| self.writer.flush())
                .with_context(|| format!("writing {} to transport", cmd.opcode()))?;

            if !cmd.expects_response() {
                return Ok(CommandResult::Ok(Fields::default()));
            }

            let deadline = Instant::now() + self.timeout;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match self.responses.recv_timeout(wait) {
                    Ok(resp) if resp.opcode == cmd.opcode() => {
                        if resp.is_ok() {
                            return Ok(CommandResult::Ok(resp.fields));
                        }
                        debug!("#{} {}: device error 0x{:04X}", seq, cmd.opcode(), resp.result);
                        return Ok(CommandResult::DeviceError(resp.result));
                    }
                    // Late answer to an earlier attempt or firmware chatter.
                    // Skip it without extending the deadline.
                    Ok(resp) => {
                        warn!("#{} {}: ignoring reply for {}", seq, cmd.opcode(), resp.opcode);
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        anyhow::bail!("transport reader is gone");
                    }
                }
            }
        }

        warn!(
            "#{} {}: no reply after {} attempts",
            seq,
            cmd.opcode(),
            self.retries + 1
        );
        Ok(CommandResult::Timeout)
    }
}
