//! Payload decoder capability.
//!
//! The extractor never parses marshal data itself. It opens a
//! [`DecodeSession`] over the input and asks, offset by offset, whether
//! `data[offset..]` decodes and what the decoded object looks like.

use std::io::{self, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::HostInterpreter;
use crate::sandbox::{isolate_group, ChildExt, EnvFilter};

/// Upper bound on the repr text returned per probe.
///
/// The marker check only ever sees this prefix of the decoded object's repr,
/// not the whole text. A code object's repr opens with its name, so the
/// module marker always falls inside the cap.
pub const DEFAULT_MAX_REPR_BYTES: usize = 4096;

/// Children spawned per session beyond the first.
const MAX_RESPAWNS: u32 = 3;

// Protocol (all integers little-endian):
//   -> u64 len, len bytes of input        (once per child)
//   -> u32 offset                          (per probe)
//   <- u8 status (1 decoded, 0 rejected), u32 len, len bytes of repr
const PROBE_SCRIPT: &str = r#"import marshal, sys
inp, out = sys.stdin.buffer, sys.stdout.buffer
limit = int(sys.argv[1])
def read_exact(n):
    buf = inp.read(n)
    if buf is None or len(buf) != n:
        raise SystemExit(0)
    return buf
view = memoryview(read_exact(int.from_bytes(read_exact(8), 'little')))
while True:
    offset = int.from_bytes(read_exact(4), 'little')
    try:
        text = repr(marshal.loads(view[offset:])).encode('utf-8', 'replace')[:limit]
        status = 1
    except Exception:
        text, status = b'', 0
    out.write(bytes([status]) + len(text).to_bytes(4, 'little') + text)
    out.flush()
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The slice decoded; `repr` is the decoded object's textual form.
    Decoded { repr: String },
    /// The slice is not a decodable object. A normal negative answer.
    Rejected,
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to start decoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("decoder died while probing offset {offset}: {source}")]
    Crashed {
        offset: usize,
        #[source]
        source: io::Error,
    },

    #[error("decoder crashed too often ({0} restarts), giving up")]
    RespawnLimit(u32),

    #[error("offset {0} does not fit the probe protocol")]
    OffsetOutOfRange(usize),
}

impl DecoderError {
    /// Whether the scan may move on to the next offset.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecoderError::Crashed { .. })
    }
}

pub trait DecodeSession {
    fn decode_at(&mut self, offset: usize) -> Result<DecodeOutcome, DecoderError>;
}

pub trait PayloadDecoder: Send + Sync {
    fn session<'a>(&'a self, data: &'a [u8]) -> Result<Box<dyn DecodeSession + 'a>, DecoderError>;
}

/// In-process decoder built from a closure over the candidate slice.
pub struct FnDecoder<F>(pub F);

impl<F> PayloadDecoder for FnDecoder<F>
where
    F: Fn(&[u8]) -> DecodeOutcome + Send + Sync,
{
    fn session<'a>(&'a self, data: &'a [u8]) -> Result<Box<dyn DecodeSession + 'a>, DecoderError> {
        Ok(Box::new(FnSession { f: &self.0, data }))
    }
}

struct FnSession<'a, F> {
    f: &'a F,
    data: &'a [u8],
}

impl<F> DecodeSession for FnSession<'_, F>
where
    F: Fn(&[u8]) -> DecodeOutcome,
{
    fn decode_at(&mut self, offset: usize) -> Result<DecodeOutcome, DecoderError> {
        Ok(match self.data.get(offset..) {
            Some(slice) => (self.f)(slice),
            None => DecodeOutcome::Rejected,
        })
    }
}

/// Decodes with the host interpreter's own `marshal` module.
///
/// One child per session: the input crosses the pipe once and every probe
/// decodes a zero-copy view of it, so a probe costs the same regardless of
/// how large the input is.
#[derive(Debug, Clone)]
pub struct InterpreterDecoder {
    interpreter: HostInterpreter,
    env: EnvFilter,
    max_repr_bytes: usize,
}

impl InterpreterDecoder {
    pub fn new(interpreter: HostInterpreter) -> Self {
        Self {
            interpreter,
            env: EnvFilter::scrub(),
            max_repr_bytes: DEFAULT_MAX_REPR_BYTES,
        }
    }

    pub fn with_env(mut self, env: EnvFilter) -> Self {
        self.env = env;
        self
    }

    pub fn with_max_repr_bytes(mut self, max: usize) -> Self {
        self.max_repr_bytes = max;
        self
    }

    fn spawn(&self, data: &[u8]) -> Result<ProbeChild, DecoderError> {
        let program = self.interpreter.program().display().to_string();
        let mut cmd = self.interpreter.command();
        cmd.args(["-c", PROBE_SCRIPT])
            .arg(self.max_repr_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        self.env.apply(&mut cmd);
        isolate_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| DecoderError::Spawn {
            program: program.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            child.terminate();
            return Err(DecoderError::Spawn {
                program,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "missing stdio pipes"),
            });
        };

        let mut probe = ProbeChild {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        probe
            .send_input(data)
            .map_err(|source| DecoderError::Spawn { program, source })?;
        Ok(probe)
    }
}

impl PayloadDecoder for InterpreterDecoder {
    fn session<'a>(&'a self, data: &'a [u8]) -> Result<Box<dyn DecodeSession + 'a>, DecoderError> {
        let child = self.spawn(data)?;
        Ok(Box::new(InterpreterSession {
            decoder: self,
            data,
            child: Some(child),
            respawns: 0,
        }))
    }
}

struct InterpreterSession<'a> {
    decoder: &'a InterpreterDecoder,
    data: &'a [u8],
    child: Option<ProbeChild>,
    respawns: u32,
}

impl InterpreterSession<'_> {
    fn respawn(&mut self) -> Result<ProbeChild, DecoderError> {
        if self.respawns >= MAX_RESPAWNS {
            return Err(DecoderError::RespawnLimit(self.respawns));
        }
        self.respawns += 1;
        debug!(respawns = self.respawns, "restarting decoder probe");
        self.decoder.spawn(self.data)
    }
}

impl DecodeSession for InterpreterSession<'_> {
    fn decode_at(&mut self, offset: usize) -> Result<DecodeOutcome, DecoderError> {
        if offset >= self.data.len() {
            return Ok(DecodeOutcome::Rejected);
        }
        let wire_offset =
            u32::try_from(offset).map_err(|_| DecoderError::OffsetOutOfRange(offset))?;

        let mut child = match self.child.take() {
            Some(child) => child,
            None => self.respawn()?,
        };
        match child.probe(wire_offset) {
            Ok(outcome) => {
                self.child = Some(child);
                Ok(outcome)
            }
            Err(source) => {
                // `child` drops here (kill + reap); the next probe respawns.
                warn!(offset, error = %source, "decoder probe died");
                Err(DecoderError::Crashed { offset, source })
            }
        }
    }
}

struct ProbeChild {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProbeChild {
    fn send_input(&mut self, data: &[u8]) -> io::Result<()> {
        let len = u64::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "input too large"))?;
        self.stdin.write_all(&len.to_le_bytes())?;
        self.stdin.write_all(data)?;
        self.stdin.flush()
    }

    fn probe(&mut self, offset: u32) -> io::Result<DecodeOutcome> {
        self.stdin.write_all(&offset.to_le_bytes())?;
        self.stdin.flush()?;

        let mut header = [0u8; 5];
        self.stdout.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut repr = vec![0u8; len];
        self.stdout.read_exact(&mut repr)?;

        Ok(match header[0] {
            1 => DecodeOutcome::Decoded {
                repr: String::from_utf8_lossy(&repr).into_owned(),
            },
            _ => DecodeOutcome::Rejected,
        })
    }
}

impl Drop for ProbeChild {
    fn drop(&mut self) {
        self.child.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_decoder_sees_suffix_slices() {
        let decoder = FnDecoder(|slice: &[u8]| {
            if slice.starts_with(b"ok") {
                DecodeOutcome::Decoded {
                    repr: String::from_utf8_lossy(slice).into_owned(),
                }
            } else {
                DecodeOutcome::Rejected
            }
        });
        let data = b"xxok!";
        let mut session = decoder.session(data).unwrap();

        assert_eq!(session.decode_at(1).unwrap(), DecodeOutcome::Rejected);
        assert_eq!(
            session.decode_at(2).unwrap(),
            DecodeOutcome::Decoded { repr: "ok!".into() }
        );
        assert_eq!(session.decode_at(99).unwrap(), DecodeOutcome::Rejected);
    }

    #[test]
    fn only_crashes_are_recoverable() {
        let crashed = DecoderError::Crashed {
            offset: 3,
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        assert!(crashed.is_recoverable());
        assert!(!DecoderError::RespawnLimit(3).is_recoverable());
    }

    #[cfg(unix)]
    #[test]
    fn missing_interpreter_fails_session() {
        let decoder = InterpreterDecoder::new(HostInterpreter::python("/nonexistent/python3"));
        assert!(matches!(
            decoder.session(b"abc"),
            Err(DecoderError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dead_probe_crashes_then_hits_respawn_limit() {
        // Swallows stdin and never answers: every probe reads EOF.
        let decoder = InterpreterDecoder::new(HostInterpreter::with_args(
            "/bin/sh",
            ["-c", "exec cat >/dev/null", "sh"],
        ));
        let data = vec![0u8; 64];
        let mut session = decoder.session(&data).unwrap();

        let mut crashes = 0;
        let mut gave_up = false;
        for offset in 1..10 {
            match session.decode_at(offset) {
                Err(e) if e.is_recoverable() => crashes += 1,
                Err(DecoderError::RespawnLimit(n)) => {
                    assert_eq!(n, MAX_RESPAWNS);
                    gave_up = true;
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(crashes, (MAX_RESPAWNS + 1) as usize);
        assert!(gave_up);
    }

    #[test]
    fn repr_is_cut_at_the_cap() {
        let have_python = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !have_python {
            eprintln!("python3 not found, skipping");
            return;
        }
        // marshal int 1234567890 behind one junk byte
        let data = b"\x00i\xd2\x02\x96\x49";
        let decoder = InterpreterDecoder::new(HostInterpreter::python("python3"))
            .with_max_repr_bytes(4);
        let mut session = decoder.session(data).unwrap();

        assert_eq!(
            session.decode_at(1).unwrap(),
            DecodeOutcome::Decoded { repr: "1234".into() }
        );
    }
}
