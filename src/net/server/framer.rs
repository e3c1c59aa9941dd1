//! Reassembly of length prefixed DNS messages from a byte stream.
//!
//! DNS over TCP and DNS over TLS ([RFC 1035 section 4.2.2], [RFC 7858
//! section 3.3]) precede every message on the stream with its length as a
//! two octet big-endian integer. Reads from the transport do not respect
//! message boundaries: a single chunk of decrypted bytes may hold part of a
//! length prefix, part of a message, several whole messages or any mixture
//! thereof.
//!
//! [`Framer`] is a pure state machine that turns such chunks into complete
//! messages. It does no I/O and knows nothing about TLS, which keeps it easy
//! to test in isolation.
//!
//! [RFC 1035 section 4.2.2]:
//!     https://datatracker.ietf.org/doc/html/rfc1035#section-4.2.2
//! [RFC 7858 section 3.3]:
//!     https://datatracker.ietf.org/doc/html/rfc7858#section-3.3
use core::fmt;

use std::error;
use std::vec::Vec;

/// Size in octets of the length prefix preceding every message.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// The largest message a two octet length prefix can describe.
pub const MAX_MESSAGE_LEN: u16 = u16::MAX;

//------------ Phase ---------------------------------------------------------

/// Where in the stream the [`Framer`] currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for the most significant octet of the length prefix.
    AwaitingLengthHigh,

    /// Waiting for the least significant octet of the length prefix.
    AwaitingLengthLow,

    /// Collecting the octets of the message body.
    AwaitingBody,

    /// A complete message has been collected and is about to be emitted.
    ///
    /// This phase is never observable from outside [`Framer::feed_with`].
    MessageReady,

    /// The stream can no longer be parsed. All further input is discarded.
    Faulted,
}

//------------ Framer --------------------------------------------------------

/// The per-connection parse state of a length prefixed message stream.
///
/// A framer is owned by exactly one connection and is never shared.
///
/// Once the framer has entered [`Phase::Faulted`] there is no way back:
/// a desynchronized length prefix cannot be recovered from without
/// restarting the stream, so the owner of the framer is expected to close
/// the connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Framer {
    /// Current phase of the state machine.
    phase: Phase,

    /// The first octet of the length prefix.
    length_high: u8,

    /// The second octet of the length prefix.
    length_low: u8,

    /// Size of the message being collected.
    expected_len: usize,

    /// Number of message octets collected so far.
    accumulated_len: usize,

    /// Storage for the message being collected.
    ///
    /// Holds exactly `expected_len` octets while a message is collected and
    /// is empty otherwise.
    message: Vec<u8>,

    /// Messages announcing a larger size than this fault the framer.
    max_message_size: u16,

    /// Why the framer faulted, if it did.
    fault: Option<FrameError>,
}

impl Framer {
    /// Creates a framer accepting messages of any size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_LEN)
    }

    /// Creates a framer that faults on messages larger than `max`.
    #[must_use]
    pub fn with_max_message_size(max: u16) -> Self {
        Self {
            phase: Phase::AwaitingLengthHigh,
            length_high: 0,
            length_low: 0,
            expected_len: 0,
            accumulated_len: 0,
            message: Vec::new(),
            max_message_size: max,
            fault: None,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns whether the framer has faulted.
    pub fn is_faulted(&self) -> bool {
        self.phase == Phase::Faulted
    }

    /// Returns the reason the framer faulted, if it did.
    pub fn fault(&self) -> Option<&FrameError> {
        self.fault.as_ref()
    }

    /// Returns the size of the message currently being collected.
    ///
    /// Only meaningful once both octets of the length prefix were seen.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Returns how many octets of the current message were collected.
    pub fn accumulated_len(&self) -> usize {
        self.accumulated_len
    }

    /// Returns whether a message is partially received.
    ///
    /// This is true as soon as the first octet of a length prefix arrived
    /// and until the message it announces has been emitted.
    pub fn in_message(&self) -> bool {
        matches!(
            self.phase,
            Phase::AwaitingLengthLow | Phase::AwaitingBody
        )
    }

    /// Returns the configured message size ceiling.
    pub fn max_message_size(&self) -> u16 {
        self.max_message_size
    }

    /// Consumes a chunk and returns the messages it completed.
    ///
    /// See [`Self::feed_with`] for details.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        self.feed_with(chunk, |msg| messages.push(msg));
        messages
    }

    /// Consumes a chunk, handing every completed message to `emit`.
    ///
    /// The whole chunk is always consumed: bytes that do not complete a
    /// message are kept in the parse state and continue on the next call.
    /// Messages are emitted in the order in which they complete, and
    /// ownership of each message passes to `emit`.
    ///
    /// If the framer has faulted the chunk is discarded.
    pub fn feed_with<F>(&mut self, mut chunk: &[u8], mut emit: F)
    where
        F: FnMut(Vec<u8>),
    {
        loop {
            match self.phase {
                Phase::AwaitingLengthHigh => {
                    let Some((&octet, rest)) = chunk.split_first() else {
                        break;
                    };
                    self.length_high = octet;
                    chunk = rest;
                    self.phase = Phase::AwaitingLengthLow;
                }

                Phase::AwaitingLengthLow => {
                    let Some((&octet, rest)) = chunk.split_first() else {
                        break;
                    };
                    self.length_low = octet;
                    chunk = rest;
                    self.begin_message();
                }

                Phase::AwaitingBody => {
                    let needed = self.expected_len - self.accumulated_len;
                    if needed == 0 {
                        // Also reached directly for zero length messages.
                        self.phase = Phase::MessageReady;
                        continue;
                    }
                    if chunk.is_empty() {
                        break;
                    }
                    let n = needed.min(chunk.len());
                    let (head, rest) = chunk.split_at(n);
                    let start = self.accumulated_len;
                    self.message[start..start + n].copy_from_slice(head);
                    self.accumulated_len += n;
                    chunk = rest;
                }

                Phase::MessageReady => {
                    let message = core::mem::take(&mut self.message);
                    emit(message);
                    self.reset();
                }

                Phase::Faulted => break,
            }
        }
    }

    /// Forces the framer into the faulted phase.
    ///
    /// Used by the owner when the stream is known to be unusable for a
    /// reason the framer cannot see itself.
    pub fn set_faulted(&mut self, err: FrameError) {
        self.phase = Phase::Faulted;
        self.message = Vec::new();
        self.fault = Some(err);
    }

    /// Releases the message buffer.
    ///
    /// Any partially received message is lost. The phase is left alone.
    pub fn release(&mut self) {
        self.message = Vec::new();
    }

    /// Sizes the message buffer once the length prefix is complete.
    fn begin_message(&mut self) {
        let len = u16::from_be_bytes([self.length_high, self.length_low]);
        if len > self.max_message_size {
            self.set_faulted(FrameError::Oversized {
                len,
                max: self.max_message_size,
            });
            return;
        }

        let len = usize::from(len);
        let mut message = Vec::new();
        if message.try_reserve_exact(len).is_err() {
            self.set_faulted(FrameError::Alloc(len));
            return;
        }
        message.resize(len, 0);

        self.message = message;
        self.expected_len = len;
        self.accumulated_len = 0;
        self.phase = Phase::AwaitingBody;
    }

    /// Returns to the initial phase, ready for the next message.
    fn reset(&mut self) {
        self.phase = Phase::AwaitingLengthHigh;
        self.length_high = 0;
        self.length_low = 0;
        self.expected_len = 0;
        self.accumulated_len = 0;
        self.message = Vec::new();
    }
}

//--- Default

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

//------------ frame() -------------------------------------------------------

/// Prepends the two octet length prefix to an outgoing message.
///
/// The prefix and the message end up in one buffer so that they can be
/// handed to the transport in a single write, as [RFC 7858 section 3.4]
/// recommends.
///
/// [RFC 7858 section 3.4]:
///     https://datatracker.ietf.org/doc/html/rfc7858#section-3.4
pub fn frame(message: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(message.len())
        .map_err(|_| FrameError::ResponseTooLong(message.len()))?;
    let mut framed = Vec::new();
    framed
        .try_reserve_exact(LENGTH_PREFIX_LEN + message.len())
        .map_err(|_| FrameError::Alloc(LENGTH_PREFIX_LEN + message.len()))?;
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    Ok(framed)
}

//------------ FrameError ----------------------------------------------------

/// Errors that make a message stream unusable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// A length prefix announced a message above the configured ceiling.
    Oversized { len: u16, max: u16 },

    /// The buffer for a message of the given size could not be allocated.
    Alloc(usize),

    /// An outgoing message does not fit a two octet length prefix.
    ResponseTooLong(usize),
}

//--- Display and Error

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Oversized { len, max } => {
                write!(f, "message of {len} octets exceeds limit of {max}")
            }
            FrameError::Alloc(len) => {
                write!(f, "unable to allocate {len} octets for message")
            }
            FrameError::ResponseTooLong(len) => {
                write!(f, "response of {len} octets is too long to frame")
            }
        }
    }
}

impl error::Error for FrameError {}

//============ Testing =======================================================
