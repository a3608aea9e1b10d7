//! Byte-stream construction for connections.
//!
//! A connection only needs a `BufRead`/`Write` pair; this module provides
//! the two common sources. Anything else satisfying the same contract (a
//! named pipe, a socket wrapped in a `BufReader`) plugs in the same way.

use std::io::{self, BufReader, PipeReader, PipeWriter};

/// Locks stdin and stdout for a stdio-served connection.
///
/// Logging must go to stderr only once this is taken: stdout carries frames.
pub fn stdio() -> (io::StdinLock<'static>, io::StdoutLock<'static>) {
    (io::stdin().lock(), io::stdout().lock())
}

/// One endpoint of an in-process connection pair.
pub type PipeEnd = (BufReader<PipeReader>, PipeWriter);

/// Creates two cross-connected anonymous-pipe endpoints.
///
/// Everything written by the first endpoint is read by the second and vice
/// versa; used to wire two in-process connections together, primarily in
/// tests.
pub fn pipe_pair() -> io::Result<(PipeEnd, PipeEnd)> {
    let (second_read, first_write) = io::pipe()?;
    let (first_read, second_write) = io::pipe()?;
    Ok((
        (BufReader::new(first_read), first_write),
        (BufReader::new(second_read), second_write),
    ))
}

#[cfg(test)]
mod tests {
    use super::pipe_pair;
    use crate::msg::{read_frame, write_frame};

    #[test]
    fn pipe_ends_are_cross_connected() {
        let ((mut a_read, mut a_write), (mut b_read, mut b_write)) = pipe_pair().unwrap();

        write_frame(&mut a_write, "{\"from\":\"a\"}").unwrap();
        assert_eq!(read_frame(&mut b_read).unwrap().unwrap(), "{\"from\":\"a\"}");

        write_frame(&mut b_write, "{\"from\":\"b\"}").unwrap();
        assert_eq!(read_frame(&mut a_read).unwrap().unwrap(), "{\"from\":\"b\"}");

        // closing one writer is end-of-stream for the other reader
        drop(a_write);
        assert!(read_frame(&mut b_read).unwrap().is_none());
    }
}
