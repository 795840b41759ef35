//! Incremental command parser
//!
//! Bytes arrive from the pipe in whatever chunks the kernel hands back, so
//! a read may carry half a command, several commands, or the tail of one
//! and the head of the next. The parser keeps only the undelimited
//! trailing bytes between calls.

use malachi_core::protocol::{Command, ProtocolError, MAX_LINE_SIZE, TERMINATOR};

/// Default buffer capacity: room for two maximal lines
pub const DEFAULT_CAPACITY: usize = 2 * MAX_LINE_SIZE;

#[derive(Debug)]
pub struct Parser {
    buf: Vec<u8>,
    capacity: usize,
    /// Dropping input up to the next terminator after an overflow
    discarding: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Parser {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            discarding: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the buffer hits its bound
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append freshly read bytes.
    ///
    /// Fails without touching the buffer if the bytes do not fit. The caller
    /// is expected to [`resync`](Self::resync) and carry on.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let kept = if self.discarding {
            match bytes.iter().position(|&b| b == TERMINATOR) {
                Some(pos) => &bytes[pos + 1..],
                None => return Ok(()),
            }
        } else {
            bytes
        };

        if kept.len() > self.space() {
            return Err(ProtocolError::BufferFull {
                capacity: self.capacity,
            });
        }

        self.discarding = false;
        self.buf.extend_from_slice(kept);
        Ok(())
    }

    /// Decode the next complete command.
    ///
    /// Returns `None` when no terminator has arrived yet. A malformed
    /// record is consumed and reported, so it never stalls the stream.
    pub fn next_command(&mut self) -> Option<Result<Command, ProtocolError>> {
        loop {
            let pos = self.buf.iter().position(|&b| b == TERMINATOR)?;
            let record: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = record[..pos].trim_ascii();
            if line.is_empty() {
                continue;
            }
            return Some(Command::decode(line));
        }
    }

    /// Forget buffered bytes; used at generation boundaries
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Recover from an overflow: drop what is buffered and skip the rest of
    /// the oversized record, up to and including its terminator.
    pub fn resync(&mut self) {
        self.buf.clear();
        self.discarding = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn add(path: &str) -> Command {
        Command::Add {
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_partial_then_complete() {
        let mut parser = Parser::default();
        parser.feed(br#"{"op":"add","#).unwrap();
        assert!(parser.next_command().is_none());

        parser.feed(b"\"path\":\"/srv/a\"}\n").unwrap();
        assert_eq!(parser.next_command(), Some(Ok(add("/srv/a"))));
        assert!(parser.next_command().is_none());
        assert!(parser.is_empty());
    }

    #[test]
    fn test_several_commands_in_one_read() {
        let mut parser = Parser::default();
        let mut bytes = add("/srv/a").encode().unwrap();
        bytes.extend(add("/srv/b").encode().unwrap());
        bytes.extend(br#"{"op":"shut"#);
        parser.feed(&bytes).unwrap();

        assert_eq!(parser.next_command(), Some(Ok(add("/srv/a"))));
        assert_eq!(parser.next_command(), Some(Ok(add("/srv/b"))));
        assert!(parser.next_command().is_none());
        assert_eq!(parser.len(), br#"{"op":"shut"#.len());
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let mut parser = Parser::default();
        parser.feed(b"{not json}\n{\"op\":\"shutdown\"}\n").unwrap();

        assert!(matches!(
            parser.next_command(),
            Some(Err(ProtocolError::Malformed(_)))
        ));
        assert_eq!(parser.next_command(), Some(Ok(Command::Shutdown)));
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let mut parser = Parser::default();
        parser.feed(b"\n  \r\n{\"op\":\"shutdown\"}\r\n").unwrap();
        assert_eq!(parser.next_command(), Some(Ok(Command::Shutdown)));
        assert!(parser.next_command().is_none());
    }

    #[test]
    fn test_buffer_full_keeps_prior_commands() {
        let mut parser = Parser::new(64);
        parser.feed(b"{\"op\":\"shutdown\"}\n").unwrap();

        let oversized = vec![b'x'; 80];
        assert_eq!(
            parser.feed(&oversized),
            Err(ProtocolError::BufferFull { capacity: 64 })
        );
        assert_eq!(parser.next_command(), Some(Ok(Command::Shutdown)));
    }

    #[test]
    fn test_resync_skips_rest_of_oversized_record() {
        let mut parser = Parser::new(32);
        parser.feed(br#"{"op":"add","path":"/"#).unwrap();
        assert!(parser.feed(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").is_err());

        parser.resync();
        parser.feed(b"aaaa\"}\n{\"op\":\"shutdown\"}\n").unwrap();
        assert_eq!(parser.next_command(), Some(Ok(Command::Shutdown)));
        assert!(parser.next_command().is_none());
    }

    #[test]
    fn test_failed_feed_keeps_discarding() {
        let mut parser = Parser::new(32);
        parser.resync();

        let mut bytes = b"junk\n".to_vec();
        bytes.extend(vec![b'y'; 40]);
        assert!(parser.feed(&bytes).is_err());
        assert!(parser.is_empty());

        // Still skipping the first oversized record
        parser.feed(b"rest\n{\"op\":\"shutdown\"}\n").unwrap();
        assert_eq!(parser.next_command(), Some(Ok(Command::Shutdown)));
    }

    #[test]
    fn test_reset_drops_partial_record() {
        let mut parser = Parser::default();
        parser.feed(br#"{"op":"add","path":"/srv/abandon"#).unwrap();
        parser.reset();

        parser.feed(&add("/srv/b").encode().unwrap()).unwrap();
        assert_eq!(parser.next_command(), Some(Ok(add("/srv/b"))));
    }

    #[test]
    fn test_default_capacity_holds_two_lines() {
        let parser = Parser::default();
        assert_eq!(parser.capacity(), 2 * MAX_LINE_SIZE);
        assert_eq!(parser.space(), parser.capacity());
    }
}
