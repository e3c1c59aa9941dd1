//! The per-connection bridge between TLS and the framer.
//!
//! A [`Session`] owns everything a single connection needs apart from the
//! socket itself: the [`TlsSession`] handle, the [`Framer`] holding the
//! parse state, and the queue of ciphertext waiting to be written. It
//! performs no I/O; the connection driving it reads from and writes to the
//! socket and calls the `on_*` methods in between.
use core::fmt;

use std::error;
use std::sync::Arc;
use std::vec::Vec;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::framer::{frame, FrameError, Framer};
use super::tls::{TlsError, TlsInfo, TlsSession};

//------------ SessionState --------------------------------------------------

/// The life cycle of a connection.
///
/// ```text
/// Accepted -> Running -> Closing -> Terminated
///                    \-> Faulted -/
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Created for a freshly accepted connection, nothing read yet.
    Accepted,

    /// At least one read has been serviced.
    Running,

    /// The connection is being closed in an orderly way.
    ///
    /// Pending output may still be written, input is ignored.
    Closing,

    /// The connection failed and has to be torn down.
    ///
    /// Pending output may still be written, input is ignored.
    Faulted,

    /// All resources have been released.
    Terminated,
}

//------------ Session -------------------------------------------------------

/// The state of a single client connection.
pub struct Session<T> {
    /// The TLS handle. Only `None` once terminated.
    tls: Option<T>,

    /// The parse state of the incoming message stream.
    framer: Framer,

    /// Ciphertext ready to be written to the socket.
    outbound: BytesMut,

    /// The number of reads serviced so far.
    reads_serviced: u64,

    state: SessionState,

    /// Session details, cached once the handshake completed.
    tls_info: Option<Arc<TlsInfo>>,

    /// Whether a close notification has been queued.
    close_queued: bool,
}

impl<T: TlsSession> Session<T> {
    /// Creates a session for a newly accepted connection.
    pub fn new(tls: T, max_message_size: u16) -> Self {
        Self {
            tls: Some(tls),
            framer: Framer::with_max_message_size(max_message_size),
            outbound: BytesMut::new(),
            reads_serviced: 0,
            state: SessionState::Accepted,
            tls_info: None,
            close_queued: false,
        }
    }

    /// Handles ciphertext read from the socket.
    ///
    /// Returns the messages completed by this read, in stream order. Once
    /// the session is closing or faulted, input is discarded and no
    /// messages are returned.
    ///
    /// If the framer faults part way through, the messages completed
    /// before the fault are still returned and the session moves to
    /// [`SessionState::Faulted`]. A TLS failure faults the session and is
    /// returned as an error; any alert the TLS layer queued is left for
    /// [`Self::on_writable`]. Unlike with a framing fault, messages
    /// completed earlier in the same read are discarded, as the alert ends
    /// the TLS channel before any response to them could be sent.
    pub fn on_readable(
        &mut self,
        ciphertext: &[u8],
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        match self.state {
            SessionState::Terminated => return Err(SessionError::Terminated),
            SessionState::Closing | SessionState::Faulted => {
                trace!("Discarding {} octets of input", ciphertext.len());
                return Ok(Vec::new());
            }
            SessionState::Accepted | SessionState::Running => {}
        }

        self.state = SessionState::Running;
        self.reads_serviced += 1;

        let Some(tls) = self.tls.as_mut() else {
            return Err(SessionError::Terminated);
        };
        let framer = &mut self.framer;
        let mut messages = Vec::new();
        let res =
            tls.consume_ciphertext(ciphertext, &mut |plaintext: &[u8]| {
                framer.feed_with(plaintext, |msg| messages.push(msg))
            });

        if let Err(err) = res {
            debug!("TLS failure: {err}");
            self.state = SessionState::Faulted;
            self.framer.release();
            return Err(SessionError::Tls(err));
        }

        if let Some(err) = self.framer.fault() {
            warn!("Unable to frame incoming messages: {err}");
            self.state = SessionState::Faulted;
        } else if tls.peer_closed() {
            debug!("Client closed the TLS session");
            self.state = SessionState::Closing;
        }

        Ok(messages)
    }

    /// Frames a response message and queues it for encryption.
    pub fn queue_response(
        &mut self,
        response: &[u8],
    ) -> Result<(), SessionError> {
        let Some(tls) = self.tls.as_mut() else {
            return Err(SessionError::Terminated);
        };
        let framed = frame(response)?;
        tls.encrypt_for_send(&framed)?;
        Ok(())
    }

    /// Returns ciphertext that is ready to be written, if any.
    pub fn on_writable(&mut self) -> Result<Option<Bytes>, SessionError> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(None);
        };
        if let Err(err) = tls.drain_outbound(&mut self.outbound) {
            self.state = SessionState::Faulted;
            return Err(err.into());
        }
        if self.outbound.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.outbound.split().freeze()))
        }
    }

    /// Marks the session for teardown after an I/O error or a timeout.
    ///
    /// There is no attempt at recovery.
    pub fn on_error_or_timeout(&mut self) {
        if self.state != SessionState::Terminated {
            self.state = SessionState::Faulted;
        }
    }

    /// Starts an orderly close.
    ///
    /// A TLS close notification is queued, to be picked up by the next
    /// call to [`Self::on_writable`].
    pub fn close(&mut self) {
        if !matches!(
            self.state,
            SessionState::Accepted
                | SessionState::Running
                | SessionState::Closing
        ) {
            return;
        }
        if !self.close_queued {
            if let Some(tls) = self.tls.as_mut() {
                tls.close();
            }
            self.close_queued = true;
        }
        self.state = SessionState::Closing;
    }

    /// Returns details of the TLS session once the handshake completed.
    pub fn tls_info(&mut self) -> Option<Arc<TlsInfo>> {
        if self.tls_info.is_none() {
            let info = self.tls.as_ref()?.info()?;
            self.tls_info = Some(Arc::new(info));
        }
        self.tls_info.clone()
    }
}

impl<T> Session<T> {
    /// Returns the current life cycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns whether the session still accepts input.
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Accepted | SessionState::Running)
    }

    /// Returns the number of reads serviced.
    pub fn reads_serviced(&self) -> u64 {
        self.reads_serviced
    }

    /// Returns the parse state of the incoming message stream.
    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    /// Releases all resources held by the session.
    ///
    /// The TLS handle goes first, then the message buffer, then any queued
    /// output. Returns `false` if the session was already terminated.
    pub fn terminate(&mut self) -> bool {
        if self.state == SessionState::Terminated {
            return false;
        }
        self.tls = None;
        self.framer.release();
        self.outbound = BytesMut::new();
        self.state = SessionState::Terminated;
        true
    }
}

//--- Drop

impl<T> Drop for Session<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

//--- Debug

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("reads_serviced", &self.reads_serviced)
            .field("framer", &self.framer.phase())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

//------------ SessionError --------------------------------------------------

/// Errors raised while servicing a session.
#[derive(Debug)]
pub enum SessionError {
    /// The TLS layer failed.
    Tls(TlsError),

    /// A message could not be framed.
    Frame(FrameError),

    /// The session has already released its resources.
    Terminated,
}

//--- From

impl From<TlsError> for SessionError {
    fn from(err: TlsError) -> Self {
        SessionError::Tls(err)
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        SessionError::Frame(err)
    }
}

//--- Display and Error

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Tls(err) => err.fmt(f),
            SessionError::Frame(err) => err.fmt(f),
            SessionError::Terminated => write!(f, "session terminated"),
        }
    }
}

impl error::Error for SessionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            SessionError::Tls(err) => Some(err),
            SessionError::Frame(err) => Some(err),
            SessionError::Terminated => None,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::framer::Phase;
    use crate::net::server::tls::tests::{
        client, handshake, server_to_client, test_cert,
    };
    use crate::net::server::tls::{
        PlainContext, PlainSession, RustlsContext, SessionFactory,
    };
    use std::io::Write;

    fn plain() -> Session<PlainSession> {
        Session::new(PlainContext.create().unwrap(), u16::MAX)
    }

    #[test]
    fn messages_across_reads() {
        let mut session = plain();
        assert_eq!(session.state(), SessionState::Accepted);

        assert!(session.on_readable(&[0x00]).unwrap().is_empty());
        assert!(session.on_readable(&[0x03, b'a']).unwrap().is_empty());
        let out = session.on_readable(&[b'b', b'c', 0x00, 0x01, b'z']);
        assert_eq!(out.unwrap(), vec![b"abc".to_vec(), b"z".to_vec()]);

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.reads_serviced(), 3);
        assert_eq!(session.framer().phase(), Phase::AwaitingLengthHigh);
    }

    #[test]
    fn responses_are_length_prefixed() {
        let mut session = plain();
        assert!(session.on_writable().unwrap().is_none());

        session.queue_response(b"hello").unwrap();
        session.queue_response(b"").unwrap();
        let out = session.on_writable().unwrap().unwrap();
        assert_eq!(&out[..], b"\x00\x05hello\x00\x00");
        assert!(session.on_writable().unwrap().is_none());
    }

    #[test]
    fn oversized_response_is_rejected() {
        let mut session = plain();
        let err = session.queue_response(&vec![0; 70_000]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Frame(FrameError::ResponseTooLong(70_000))
        ));
        assert!(session.on_writable().unwrap().is_none());
    }

    #[test]
    fn framing_fault_faults_session() {
        let mut session =
            Session::new(PlainContext.create().unwrap(), 512);
        let out = session.on_readable(b"\x00\x01a\x10\x00rest").unwrap();
        assert_eq!(out, vec![b"a".to_vec()]);
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(!session.is_open());

        // Further input is ignored.
        let out = session.on_readable(b"\x00\x01b").unwrap();
        assert!(out.is_empty());
        assert_eq!(session.reads_serviced(), 1);
    }

    #[test]
    fn timeout_marks_for_teardown() {
        let mut session = plain();
        session.on_readable(&[0x00, 0x05, 1, 2]).unwrap();
        session.on_error_or_timeout();
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(session.on_readable(&[3, 4, 5]).unwrap().is_empty());
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut session = plain();
        session.on_readable(&[0x00, 0x05, 1, 2]).unwrap();
        assert!(session.terminate());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.terminate());
        assert!(matches!(
            session.on_readable(&[1]),
            Err(SessionError::Terminated)
        ));
        assert!(matches!(
            session.queue_response(b"x"),
            Err(SessionError::Terminated)
        ));
        assert!(session.on_writable().unwrap().is_none());
        session.on_error_or_timeout();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn close_stops_input() {
        let mut session = plain();
        session.close();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.on_readable(b"\x00\x01a").unwrap().is_empty());
        // A second close changes nothing.
        session.close();
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn sessions_are_isolated() {
        let mut a = plain();
        let mut b = plain();
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();

        out_a.extend(a.on_readable(&[0x00, 0x02, b'a']).unwrap());
        out_b.extend(b.on_readable(&[0x00]).unwrap());
        out_a.extend(a.on_readable(&[b'A', 0x00]).unwrap());
        out_b.extend(b.on_readable(&[0x01, b'b', 0x00, 0x00]).unwrap());
        out_a.extend(a.on_readable(&[0x01, b'!']).unwrap());

        assert_eq!(out_a, vec![b"aA".to_vec(), b"!".to_vec()]);
        assert_eq!(out_b, vec![b"b".to_vec(), Vec::new()]);
    }

    #[test]
    fn tls_round_trip() {
        let cert = test_cert();
        let ctx = RustlsContext::from_der(vec![cert.cert.clone()], cert.key)
            .unwrap();
        let mut client = client(&cert.cert);
        let mut session = Session::new(ctx.create().unwrap(), u16::MAX);
        assert!(session.tls_info().is_none());

        // Drive the handshake through the session the way a connection
        // does: everything the client sends goes through on_readable and
        // everything the server has to say comes out of on_writable.
        while client.is_handshaking() {
            let mut wire = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut wire).unwrap();
            }
            assert!(session.on_readable(&wire).unwrap().is_empty());
            if let Some(out) = session.on_writable().unwrap() {
                let mut out = &out[..];
                while !out.is_empty() {
                    client.read_tls(&mut out).unwrap();
                    client.process_new_packets().unwrap();
                }
            }
        }

        client.writer().write_all(b"\x00\x04ping\x00\x02").unwrap();
        let mut wire = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut wire).unwrap();
        }
        let out = session.on_readable(&wire).unwrap();
        assert_eq!(out, vec![b"ping".to_vec()]);
        assert!(session.framer().in_message());

        let info = session.tls_info().unwrap();
        assert_eq!(info.server_name.as_deref(), Some("localhost"));

        session.queue_response(b"pong").unwrap();
        let out = session.on_writable().unwrap().unwrap();
        let mut out = &out[..];
        while !out.is_empty() {
            client.read_tls(&mut out).unwrap();
            client.process_new_packets().unwrap();
        }
        let mut buf = [0u8; 16];
        let n = std::io::Read::read(&mut client.reader(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x00\x04pong");
    }

    #[test]
    fn tls_close_notify_closes_session() {
        let cert = test_cert();
        let ctx = RustlsContext::from_der(vec![cert.cert.clone()], cert.key)
            .unwrap();
        let mut client = client(&cert.cert);
        let mut tls = ctx.create().unwrap();
        handshake(&mut client, &mut tls);
        server_to_client(&mut tls, &mut client);

        let mut session = Session::new(tls, u16::MAX);
        client.send_close_notify();
        let mut wire = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut wire).unwrap();
        }
        assert!(session.on_readable(&wire).unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn tls_garbage_faults_session() {
        let cert = test_cert();
        let ctx = RustlsContext::from_der(vec![cert.cert.clone()], cert.key)
            .unwrap();
        let mut session = Session::new(ctx.create().unwrap(), u16::MAX);
        let err = session.on_readable(b"\x00\x05hello").unwrap_err();
        assert!(matches!(err, SessionError::Tls(_)));
        assert_eq!(session.state(), SessionState::Faulted);

        // Whatever alert the TLS layer queued can still be written.
        let _ = session.on_writable();
        assert!(session.on_readable(b"more").unwrap().is_empty());
    }

    #[test]
    fn tls_failure_discards_earlier_messages() {
        let cert = test_cert();
        let ctx = RustlsContext::from_der(vec![cert.cert.clone()], cert.key)
            .unwrap();
        let mut client = client(&cert.cert);
        let mut tls = ctx.create().unwrap();
        handshake(&mut client, &mut tls);
        server_to_client(&mut tls, &mut client);
        let mut session = Session::new(tls, u16::MAX);

        // A complete message followed by an application data record that
        // fails to decrypt, all in a single read.
        client.writer().write_all(b"\x00\x02ok").unwrap();
        let mut wire = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut wire).unwrap();
        }
        wire.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x20]);
        wire.extend_from_slice(&[0u8; 0x20]);

        let err = session.on_readable(&wire).unwrap_err();
        assert!(matches!(err, SessionError::Tls(_)));
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.reads_serviced(), 1);

        // The alert is left for the connection to write.
        assert!(session.on_writable().unwrap().is_some());
    }
}
