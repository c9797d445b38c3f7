/// The policy by which an endpoint cuts its byte stream into application
/// messages. Framing and the optional size limit are per-endpoint and
/// symmetric between reading and sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Reads up to the endpoint limit (or an internal cap) per read, until
    /// EOF. Message boundaries are whatever the socket delivers.
    Bulk,
    /// Messages are records terminated by a separator byte; delivered
    /// messages include the separator. Over-long lines go through the
    /// limit-exceedance hook and are dropped.
    Lines { separator: u8 },
    /// Fixed-size chunk reads. With a limit set, the connection closes once
    /// the limit is consumed; a limit smaller than one chunk refuses the
    /// connection at once.
    Chunked { chunksize: usize },
}

impl Framing {
    /// Line framing with the default LF separator.
    pub fn lines() -> Self {
        Framing::Lines { separator: b'\n' }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Bulk
    }
}
