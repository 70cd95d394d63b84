// Outbound netascii encoding per RFC 764 line discipline: line feeds become
// CR LF on the wire and a bare carriage return becomes CR NUL. The server
// never decodes (it accepts no writes), so only the encoding direction
// exists here.

use std::io::{self, Read};

const CHUNK: usize = 4096;

/// Wraps a byte stream, yielding its netascii encoding. Each source byte
/// expands to at most two output bytes, so the encoder carries at most one
/// pending byte between reads.
pub struct Encoder<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    pending: Option<u8>,
    eof: bool,
}

impl<R: Read> Encoder<R> {
    pub fn new(inner: R) -> Encoder<R> {
        Encoder {
            inner,
            buf: Vec::new(),
            pos: 0,
            pending: None,
            eof: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.buf.resize(CHUNK, 0);
        let n = self.inner.read(&mut self.buf)?;
        self.buf.truncate(n);
        self.pos = 0;
        self.eof = n == 0;
        Ok(())
    }
}

impl<R: Read> Read for Encoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < out.len() {
            if let Some(b) = self.pending.take() {
                out[written] = b;
                written += 1;
                continue;
            }
            if self.pos >= self.buf.len() {
                if self.eof {
                    break;
                }
                self.fill()?;
                if self.eof {
                    break;
                }
            }
            let b = self.buf[self.pos];
            self.pos += 1;
            match b {
                b'\n' => {
                    out[written] = b'\r';
                    self.pending = Some(b'\n');
                }
                b'\r' => {
                    out[written] = b'\r';
                    self.pending = Some(b'\0');
                }
                other => out[written] = other,
            }
            written += 1;
        }
        Ok(written)
    }
}

/// Length of the netascii encoding of *source*, obtained by a full scan:
/// every LF and CR contributes one extra byte. Used to answer `tsize` on
/// netascii transfers.
pub fn encoded_len<R: Read>(mut source: R) -> io::Result<u64> {
    let mut buf = [0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        total += buf[..n]
            .iter()
            .filter(|&&b| b == b'\n' || b == b'\r')
            .count() as u64;
    }
}
