#![forbid(unsafe_code)]

use envrun_core::LogStream;
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};

/// Interleaves stdout and stderr of a child line by line, in arrival order.
pub(crate) struct ProcessLines {
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

impl ProcessLines {
    pub(crate) fn new(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(|out| BufReader::new(out).lines()),
            stderr: child.stderr.take().map(|err| BufReader::new(err).lines()),
        }
    }

    /// `Ok(None)` once both pipes reached EOF.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<(LogStream, String)>> {
        loop {
            let (stream, read) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => (LogStream::Stdout, out.next_line().await),
                (None, Some(err)) => (LogStream::Stderr, err.next_line().await),
                (Some(out), Some(err)) => tokio::select! {
                    line = out.next_line() => (LogStream::Stdout, line),
                    line = err.next_line() => (LogStream::Stderr, line),
                },
            };
            match read? {
                Some(line) => return Ok(Some((stream, line))),
                None => match stream {
                    LogStream::Stdout => self.stdout = None,
                    LogStream::Stderr => self.stderr = None,
                },
            }
        }
    }
}
